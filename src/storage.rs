use crate::models::{Conversation, Message, MessageMetadata, Role};
use anyhow::Context;
use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions, SqliteRow};
use sqlx::{Row, SqlitePool};
use std::path::Path;
use std::str::FromStr;

// Database schema, applied statement by statement with CREATE ... IF NOT EXISTS
const MIGRATIONS: &[&str] = &[
    "
    CREATE TABLE IF NOT EXISTS conversations (
        id TEXT PRIMARY KEY NOT NULL, -- server id, or local-<uuid> until synced
        user_id TEXT NOT NULL,
        title TEXT NOT NULL,
        created_at INTEGER NOT NULL, -- Unix Timestamp (milliseconds)
        updated_at INTEGER NOT NULL,
        last_message_at INTEGER,
        message_count INTEGER NOT NULL DEFAULT 0,
        synced INTEGER NOT NULL DEFAULT 0
    )",
    "CREATE INDEX IF NOT EXISTS idx_conversations_user_updated ON conversations(user_id, updated_at DESC)",
    "
    CREATE TABLE IF NOT EXISTS messages (
        local_id TEXT PRIMARY KEY NOT NULL, -- client-generated UUID
        server_id TEXT UNIQUE,
        conversation_id TEXT NOT NULL,
        role TEXT NOT NULL, -- 'user', 'assistant' or 'system'
        content TEXT NOT NULL,
        timestamp INTEGER NOT NULL, -- Unix Timestamp (milliseconds)
        metadata TEXT, -- Optional JSON blob
        synced INTEGER NOT NULL DEFAULT 0,
        optimistic INTEGER NOT NULL DEFAULT 0,
        FOREIGN KEY (conversation_id) REFERENCES conversations(id)
            ON DELETE CASCADE ON UPDATE CASCADE
    )",
    "CREATE INDEX IF NOT EXISTS idx_messages_conversation_ts ON messages(conversation_id, timestamp)",
    "CREATE INDEX IF NOT EXISTS idx_messages_unsynced ON messages(timestamp) WHERE synced = 0",
];

const MESSAGE_COLUMNS: &str =
    "local_id, server_id, conversation_id, role, content, timestamp, metadata, synced, optimistic";

const CONVERSATION_COLUMNS: &str =
    "id, user_id, title, created_at, updated_at, last_message_at, message_count, synced";

/// Local message store.
///
/// The pool serves concurrent readers and writers. All writes are single-row
/// upserts, last write wins, except reconciliation which only ever moves a
/// row from unsynced to synced.
#[derive(Debug, Clone)]
pub struct StorageManager {
    pool: SqlitePool,
}

impl StorageManager {
    /// Opens (creating if needed) the database file at `path` and runs migrations.
    pub async fn open(path: &Path) -> Result<Self, anyhow::Error> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .context("Failed to create database directory")?;
        }
        log::info!("Connecting to database: {}", path.display());

        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .foreign_keys(true);
        let pool = SqlitePoolOptions::new()
            .connect_with(options)
            .await
            .context("Failed to connect to SQLite database")?;

        Self::from_pool(pool).await
    }

    /// Single-connection in-memory store.
    pub async fn in_memory() -> Result<Self, anyhow::Error> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")
            .context("Invalid in-memory database URL")?
            .foreign_keys(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await
            .context("Failed to open in-memory SQLite database")?;
        Self::from_pool(pool).await
    }

    pub async fn from_pool(pool: SqlitePool) -> Result<Self, anyhow::Error> {
        Self::run_migrations(&pool).await?;
        Ok(Self { pool })
    }

    async fn run_migrations(pool: &SqlitePool) -> Result<(), anyhow::Error> {
        log::info!("Running database migrations...");
        for statement in MIGRATIONS {
            sqlx::query(statement)
                .execute(pool)
                .await
                .context("Failed to run database migrations")?;
        }
        log::info!("Database migrations completed.");
        Ok(())
    }

    // --- Conversations ---

    /// Creates or replaces a conversation.
    pub async fn save_conversation(&self, conv: &Conversation) -> Result<(), anyhow::Error> {
        log::debug!("Saving conversation {}", conv.id);
        sqlx::query(
            r#"
            INSERT INTO conversations (id, user_id, title, created_at, updated_at, last_message_at, message_count, synced)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(id) DO UPDATE SET
                user_id = excluded.user_id,
                title = excluded.title,
                updated_at = excluded.updated_at,
                last_message_at = excluded.last_message_at,
                message_count = excluded.message_count,
                synced = excluded.synced
            "#,
        )
        .bind(&conv.id)
        .bind(&conv.user_id)
        .bind(&conv.title)
        .bind(conv.created_at.timestamp_millis())
        .bind(conv.updated_at.timestamp_millis())
        .bind(conv.last_message_at.map(|t| t.timestamp_millis()))
        .bind(conv.message_count)
        .bind(conv.synced)
        .execute(&self.pool)
        .await
        .context("Failed to save conversation")?;
        Ok(())
    }

    pub async fn get_conversation(&self, conversation_id: &str) -> Result<Option<Conversation>, anyhow::Error> {
        let sql = format!("SELECT {} FROM conversations WHERE id = ?", CONVERSATION_COLUMNS);
        let row = sqlx::query(&sql)
            .bind(conversation_id)
            .fetch_optional(&self.pool)
            .await
            .context("Failed to fetch conversation from database")?;
        row.as_ref().map(conversation_from_row).transpose()
    }

    /// Conversations of one user, most recently updated first.
    pub async fn list_conversations(&self, user_id: &str) -> Result<Vec<Conversation>, anyhow::Error> {
        let sql = format!(
            "SELECT {} FROM conversations WHERE user_id = ? ORDER BY updated_at DESC, rowid DESC",
            CONVERSATION_COLUMNS
        );
        let rows = sqlx::query(&sql)
            .bind(user_id)
            .fetch_all(&self.pool)
            .await
            .context("Failed to fetch conversations from database")?;
        let conversations = rows
            .iter()
            .map(conversation_from_row)
            .collect::<Result<Vec<_>, _>>()?;
        log::debug!("Fetched {} conversations for {}", conversations.len(), user_id);
        Ok(conversations)
    }

    pub async fn list_unsynced_conversations(&self) -> Result<Vec<Conversation>, anyhow::Error> {
        let sql = format!(
            "SELECT {} FROM conversations WHERE synced = 0 ORDER BY created_at ASC, rowid ASC",
            CONVERSATION_COLUMNS
        );
        let rows = sqlx::query(&sql)
            .fetch_all(&self.pool)
            .await
            .context("Failed to fetch unsynced conversations")?;
        rows.iter().map(conversation_from_row).collect()
    }

    /// Moves a locally created conversation onto its server id. Messages
    /// follow through `ON UPDATE CASCADE`.
    pub async fn reconcile_conversation(&self, local_id: &str, server_id: &str) -> Result<(), anyhow::Error> {
        log::info!("Reconciling conversation {} -> {}", local_id, server_id);
        let result = sqlx::query("UPDATE conversations SET id = ?, synced = 1 WHERE id = ?")
            .bind(server_id)
            .bind(local_id)
            .execute(&self.pool)
            .await
            .context("Failed to reconcile conversation")?;
        if result.rows_affected() == 0 {
            return Err(anyhow::anyhow!("Conversation {} not found for reconciliation", local_id));
        }
        Ok(())
    }

    /// Deletes a conversation; its messages go with it.
    pub async fn delete_conversation(&self, conversation_id: &str) -> Result<(), anyhow::Error> {
        log::warn!("Deleting conversation with ID: {}", conversation_id);
        let result = sqlx::query("DELETE FROM conversations WHERE id = ?")
            .bind(conversation_id)
            .execute(&self.pool)
            .await
            .context("Failed to delete conversation from database")?;
        if result.rows_affected() == 0 {
            log::warn!("Attempted to delete non-existent conversation: {}", conversation_id);
        }
        Ok(())
    }

    // --- Messages ---

    /// Creates or replaces a message keyed by local id, then refreshes the
    /// conversation counters. A server id, once stored, is never replaced
    /// and `synced` never flips back.
    pub async fn save_message(&self, message: &Message) -> Result<(), anyhow::Error> {
        log::debug!("Saving message {} to conversation {}", message.local_id, message.conversation_id);
        let metadata = message
            .metadata
            .as_ref()
            .map(serde_json::to_string)
            .transpose()
            .context("Failed to serialize message metadata")?;

        let mut tx = self.pool.begin().await.context("Failed to begin transaction")?;
        sqlx::query(
            r#"
            INSERT INTO messages (local_id, server_id, conversation_id, role, content, timestamp, metadata, synced, optimistic)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(local_id) DO UPDATE SET
                server_id = COALESCE(messages.server_id, excluded.server_id),
                conversation_id = excluded.conversation_id,
                role = excluded.role,
                content = excluded.content,
                timestamp = excluded.timestamp,
                metadata = excluded.metadata,
                synced = MAX(messages.synced, excluded.synced),
                optimistic = CASE WHEN messages.synced = 1 THEN 0 ELSE excluded.optimistic END
            "#,
        )
        .bind(&message.local_id)
        .bind(&message.server_id)
        .bind(&message.conversation_id)
        .bind(message.role.as_str())
        .bind(&message.content)
        .bind(message.timestamp.timestamp_millis())
        .bind(metadata)
        .bind(message.synced)
        .bind(message.optimistic)
        .execute(&mut *tx)
        .await
        .context("Failed to insert message into database")?;

        sqlx::query(
            r#"
            UPDATE conversations SET
                message_count = (SELECT COUNT(*) FROM messages WHERE conversation_id = ?),
                last_message_at = (SELECT MAX(timestamp) FROM messages WHERE conversation_id = ?),
                updated_at = MAX(updated_at, ?)
            WHERE id = ?
            "#,
        )
        .bind(&message.conversation_id)
        .bind(&message.conversation_id)
        .bind(Utc::now().timestamp_millis())
        .bind(&message.conversation_id)
        .execute(&mut *tx)
        .await
        .context("Failed to update conversation counters")?;

        tx.commit().await.context("Failed to commit message")?;
        Ok(())
    }

    /// Latest `limit` messages of a conversation, oldest first.
    pub async fn get_conversation_messages(
        &self,
        conversation_id: &str,
        limit: u32,
    ) -> Result<Vec<Message>, anyhow::Error> {
        let sql = format!(
            r#"
            SELECT {cols} FROM (
                SELECT rowid AS seq, {cols} FROM messages
                WHERE conversation_id = ?
                ORDER BY timestamp DESC, rowid DESC
                LIMIT ?
            ) ORDER BY timestamp ASC, seq ASC
            "#,
            cols = MESSAGE_COLUMNS
        );
        let rows = sqlx::query(&sql)
            .bind(conversation_id)
            .bind(i64::from(limit))
            .fetch_all(&self.pool)
            .await
            .context("Failed to fetch messages from database")?;
        let messages = rows
            .iter()
            .map(message_from_row)
            .collect::<Result<Vec<_>, _>>()?;
        log::debug!("Fetched {} messages for conversation {}", messages.len(), conversation_id);
        Ok(messages)
    }

    /// Looks a message up by local id or by server id.
    pub async fn get_message(&self, id: &str) -> Result<Option<Message>, anyhow::Error> {
        let sql = format!(
            "SELECT {} FROM messages WHERE local_id = ? OR server_id = ? LIMIT 1",
            MESSAGE_COLUMNS
        );
        let row = sqlx::query(&sql)
            .bind(id)
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .context("Failed to fetch message from database")?;
        row.as_ref().map(message_from_row).transpose()
    }

    /// Every unsynced message, oldest first.
    pub async fn list_unsynced_messages(&self) -> Result<Vec<Message>, anyhow::Error> {
        let sql = format!(
            "SELECT {} FROM messages WHERE synced = 0 ORDER BY timestamp ASC, rowid ASC",
            MESSAGE_COLUMNS
        );
        let rows = sqlx::query(&sql)
            .fetch_all(&self.pool)
            .await
            .context("Failed to fetch unsynced messages")?;
        rows.iter().map(message_from_row).collect()
    }

    pub async fn count_unsynced_messages(&self) -> Result<i64, anyhow::Error> {
        let row = sqlx::query("SELECT COUNT(*) AS pending FROM messages WHERE synced = 0")
            .fetch_one(&self.pool)
            .await
            .context("Failed to count unsynced messages")?;
        Ok(row.try_get("pending")?)
    }

    pub async fn count_unsynced_in_conversation(&self, conversation_id: &str) -> Result<i64, anyhow::Error> {
        let row = sqlx::query(
            "SELECT COUNT(*) AS pending FROM messages WHERE conversation_id = ? AND synced = 0",
        )
        .bind(conversation_id)
        .fetch_one(&self.pool)
        .await
        .context("Failed to count unsynced messages for conversation")?;
        Ok(row.try_get("pending")?)
    }

    /// Attaches the server id and marks the message synced.
    ///
    /// The update is conditional on `synced = 0`, so a message is reconciled
    /// at most once. Returns `false` when it already was.
    pub async fn reconcile_message(&self, local_id: &str, server_id: &str) -> Result<bool, anyhow::Error> {
        let result = sqlx::query(
            "UPDATE messages SET server_id = ?, synced = 1, optimistic = 0 WHERE local_id = ? AND synced = 0",
        )
        .bind(server_id)
        .bind(local_id)
        .execute(&self.pool)
        .await
        .context("Failed to reconcile message")?;

        if result.rows_affected() == 1 {
            log::info!("Reconciled message {} -> {}", local_id, server_id);
            return Ok(true);
        }
        match self.get_message(local_id).await? {
            Some(existing) if existing.synced => {
                log::debug!("Message {} was already synced", local_id);
                Ok(false)
            }
            _ => Err(anyhow::anyhow!("Message {} not found for reconciliation", local_id)),
        }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

fn millis_to_datetime(ms: i64) -> Result<DateTime<Utc>, anyhow::Error> {
    DateTime::from_timestamp_millis(ms).context("Invalid timestamp")
}

fn conversation_from_row(row: &SqliteRow) -> Result<Conversation, anyhow::Error> {
    Ok(Conversation {
        id: row.try_get("id")?,
        user_id: row.try_get("user_id")?,
        title: row.try_get("title")?,
        created_at: millis_to_datetime(row.try_get("created_at")?)?,
        updated_at: millis_to_datetime(row.try_get("updated_at")?)?,
        last_message_at: row
            .try_get::<Option<i64>, _>("last_message_at")?
            .map(millis_to_datetime)
            .transpose()?,
        message_count: row.try_get("message_count")?,
        synced: row.try_get("synced")?,
    })
}

fn message_from_row(row: &SqliteRow) -> Result<Message, anyhow::Error> {
    let role: String = row.try_get("role")?;
    let metadata = row
        .try_get::<Option<String>, _>("metadata")?
        .map(|raw| serde_json::from_str::<MessageMetadata>(&raw))
        .transpose()
        .context("Failed to parse message metadata")?;
    Ok(Message {
        local_id: row.try_get("local_id")?,
        server_id: row.try_get("server_id")?,
        conversation_id: row.try_get("conversation_id")?,
        role: Role::from_str(&role)?,
        content: row.try_get("content")?,
        timestamp: millis_to_datetime(row.try_get("timestamp")?)?,
        metadata,
        synced: row.try_get("synced")?,
        optimistic: row.try_get("optimistic")?,
    })
}
