use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

// Prefix for conversation ids minted before the server has confirmed creation
pub const LOCAL_CONVERSATION_PREFIX: &str = "local-";

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
    System,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Assistant => "assistant",
            Role::System => "system",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Role {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "user" => Ok(Role::User),
            "assistant" => Ok(Role::Assistant),
            "system" => Ok(Role::System),
            other => Err(anyhow::anyhow!("Unknown message role: {}", other)),
        }
    }
}

// Token counters reported by the server when a response completes
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, Eq)]
pub struct TokenUsage {
    #[serde(default, alias = "prompt_tokens")]
    pub input_tokens: u64,
    #[serde(default, alias = "completion_tokens")]
    pub output_tokens: u64,
}

// Optional structured data attached to a message - stored as JSON string in DB
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
pub struct MessageMetadata {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recommendation: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub usage: Option<TokenUsage>,
}

/// A single message in a conversation.
///
/// `local_id` is minted on the client and never changes; `server_id` is
/// attached exactly once, when the server acknowledges the message, and
/// `synced` flips to true at the same moment.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct Message {
    pub local_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub server_id: Option<String>,
    pub conversation_id: String,
    pub role: Role,
    pub content: String,
    #[serde(default = "Utc::now")]
    pub timestamp: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<MessageMetadata>,
    pub synced: bool,
    pub optimistic: bool,
}

impl Message {
    /// A user message written locally before the server has seen it.
    pub fn optimistic_user(conversation_id: &str, content: &str) -> Self {
        Self {
            local_id: Uuid::new_v4().to_string(),
            server_id: None,
            conversation_id: conversation_id.to_string(),
            role: Role::User,
            content: content.to_string(),
            timestamp: Utc::now(),
            metadata: None,
            synced: false,
            optimistic: true,
        }
    }

    /// An assistant message that arrived complete from the stream.
    pub fn assistant_from_server(
        conversation_id: &str,
        server_id: Option<String>,
        content: String,
        metadata: Option<MessageMetadata>,
    ) -> Self {
        let local_id = Uuid::new_v4().to_string();
        // Server-originated rows are synced, so they always carry a server id
        let server_id = server_id.unwrap_or_else(|| local_id.clone());
        Self {
            local_id,
            server_id: Some(server_id),
            conversation_id: conversation_id.to_string(),
            role: Role::Assistant,
            content,
            timestamp: Utc::now(),
            metadata,
            synced: true,
            optimistic: false,
        }
    }
}

// Represents the metadata for a conversation thread
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct Conversation {
    pub id: String,
    pub user_id: String,
    pub title: String,
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
    #[serde(default = "Utc::now")]
    pub updated_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_message_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub message_count: i64,
    pub synced: bool,
}

impl Conversation {
    /// A conversation started before network confirmation, under a temporary id.
    pub fn new_local(user_id: &str, title: &str) -> Self {
        let now = Utc::now();
        Self {
            id: format!("{}{}", LOCAL_CONVERSATION_PREFIX, Uuid::new_v4()),
            user_id: user_id.to_string(),
            title: title.to_string(),
            created_at: now,
            updated_at: now,
            last_message_at: None,
            message_count: 0,
            synced: false,
        }
    }

    pub fn has_temporary_id(&self) -> bool {
        self.id.starts_with(LOCAL_CONVERSATION_PREFIX)
    }
}

/// The only stream vocabulary the rest of the crate sees.
#[derive(Serialize, Clone, Debug, PartialEq)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum NormalizedChunk {
    Content {
        text: String,
    },
    Done {
        text: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        message_id: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        usage: Option<TokenUsage>,
    },
    Error {
        message: String,
    },
    Heartbeat,
}

impl NormalizedChunk {
    pub fn content(text: impl Into<String>) -> Self {
        NormalizedChunk::Content { text: text.into() }
    }

    pub fn done(text: impl Into<String>) -> Self {
        NormalizedChunk::Done {
            text: text.into(),
            message_id: None,
            usage: None,
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        NormalizedChunk::Error {
            message: message.into(),
        }
    }

    /// `done` and `error` both end an assistant turn.
    pub fn is_terminal(&self) -> bool {
        matches!(self, NormalizedChunk::Done { .. } | NormalizedChunk::Error { .. })
    }
}
