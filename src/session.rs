//! The stateful surface a presentation layer talks to.
//!
//! [`ChatSession`] writes the user's message locally first, hands it to the
//! server, then follows the assistant's reply on a push stream until it
//! completes, fails, stalls or is stopped. Observers read the live status
//! through [`ChatSession::subscribe`].

use crate::api::{RemoteApi, StreamSource};
use crate::config::ClientConfig;
use crate::connection::{ConnectionState, ReconnectPolicy};
use crate::models::{Conversation, Message, MessageMetadata, NormalizedChunk};
use crate::state::ConnectionRegistry;
use crate::storage::StorageManager;
use crate::sync::{SyncReconciler, SyncReport};
use anyhow::{Context, Result};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

const CHUNK_BUFFER: usize = 64;

/// The slice of [`ClientConfig`] a session needs.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub user_id: String,
    pub reconnect: ReconnectPolicy,
    /// How long a turn may go without completing once its stream first
    /// connected. Before that the window is widened by the whole backoff
    /// budget of `reconnect`, so exhausted retries are reported as such;
    /// reconnects after the first connection count against the window.
    pub stall_timeout: Duration,
    pub page_size: u32,
}

impl From<&ClientConfig> for SessionConfig {
    fn from(config: &ClientConfig) -> Self {
        Self {
            user_id: config.user_id.clone(),
            reconnect: config.reconnect.clone(),
            stall_timeout: config.stall_timeout,
            page_size: config.page_size,
        }
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self::from(&ClientConfig::default())
    }
}

/// What the presentation layer renders.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SessionStatus {
    pub conversation_id: Option<String>,
    pub connection: ConnectionState,
    /// Assistant text received so far for the turn in flight.
    pub partial: String,
    pub error: Option<String>,
    /// Some user message is still waiting for the server.
    pub pending_sync: bool,
}

/// How a send ended.
#[derive(Debug, Clone, PartialEq)]
pub enum TurnOutcome {
    /// The assistant reply, as persisted.
    Completed(Message),
    /// The stream reported an error; nothing was persisted for the reply.
    Failed(String),
    TimedOut,
    Stopped,
    /// The user message could not reach the server and waits for sync.
    Queued(Message),
}

/// Notification points for embedding applications. Every method defaults to
/// doing nothing.
pub trait SessionHooks: Send + Sync {
    fn on_assistant_message(&self, _message: &Message) {}

    fn on_turn_failed(&self, _conversation_id: &str, _reason: &str) {}
}

struct NoopHooks;

impl SessionHooks for NoopHooks {}

#[derive(Clone)]
pub struct ChatSession {
    storage: Arc<StorageManager>,
    source: Arc<dyn StreamSource>,
    registry: ConnectionRegistry,
    reconciler: SyncReconciler,
    status: Arc<watch::Sender<SessionStatus>>,
    hooks: Arc<dyn SessionHooks>,
    config: Arc<SessionConfig>,
}

impl ChatSession {
    pub fn new(
        storage: Arc<StorageManager>,
        api: Arc<dyn RemoteApi>,
        source: Arc<dyn StreamSource>,
        config: SessionConfig,
    ) -> Self {
        let (status, _) = watch::channel(SessionStatus::default());
        Self {
            reconciler: SyncReconciler::new(storage.clone(), api),
            storage,
            source,
            registry: ConnectionRegistry::new(),
            status: Arc::new(status),
            hooks: Arc::new(NoopHooks),
            config: Arc::new(config),
        }
    }

    pub fn with_hooks(mut self, hooks: Arc<dyn SessionHooks>) -> Self {
        self.hooks = hooks;
        self
    }

    pub fn subscribe(&self) -> watch::Receiver<SessionStatus> {
        self.status.subscribe()
    }

    pub fn status(&self) -> SessionStatus {
        self.status.borrow().clone()
    }

    pub fn registry(&self) -> &ConnectionRegistry {
        &self.registry
    }

    pub fn set_active_conversation(&self, conversation_id: &str) {
        let id = conversation_id.to_string();
        self.status.send_modify(|s| s.conversation_id = Some(id));
    }

    // --- Queries ---

    pub async fn conversations(&self) -> Result<Vec<Conversation>> {
        self.storage.list_conversations(&self.config.user_id).await
    }

    /// The most recent page of a conversation, oldest first.
    pub async fn history(&self, conversation_id: &str) -> Result<Vec<Message>> {
        self.storage
            .get_conversation_messages(conversation_id, self.config.page_size)
            .await
    }

    // --- Conversations ---

    /// Creates the conversation locally, then tries to register it with the
    /// server. Offline, the local copy is returned and synced later.
    pub async fn start_conversation(&self, title: &str) -> Result<Conversation> {
        let conversation = Conversation::new_local(&self.config.user_id, title);
        self.storage.save_conversation(&conversation).await?;
        log::info!("Started conversation {}", conversation.id);

        let id = match self.reconciler.sync_conversation(&conversation).await {
            Ok(id) => id,
            Err(e) => {
                log::warn!(
                    "Conversation {} stays local until the next sync: {:#}",
                    conversation.id,
                    e
                );
                conversation.id.clone()
            }
        };
        self.set_active_conversation(&id);
        self.storage
            .get_conversation(&id)
            .await?
            .with_context(|| format!("Conversation {} vanished after creation", id))
    }

    /// Refuses while messages of the conversation still wait for the server.
    pub async fn delete_conversation(&self, conversation_id: &str) -> Result<()> {
        let pending = self
            .storage
            .count_unsynced_in_conversation(conversation_id)
            .await?;
        if pending > 0 {
            return Err(anyhow::anyhow!(
                "Conversation {} still has {} unsynced messages",
                conversation_id,
                pending
            ));
        }
        self.registry.close(conversation_id);
        self.storage.delete_conversation(conversation_id).await?;
        self.status.send_modify(|s| {
            if s.conversation_id.as_deref() == Some(conversation_id) {
                s.conversation_id = None;
            }
        });
        Ok(())
    }

    // --- Turns ---

    /// Persists the user message, delivers it and follows the reply.
    pub async fn send_message(&self, conversation_id: &str, content: &str) -> Result<TurnOutcome> {
        let conversation = self
            .storage
            .get_conversation(conversation_id)
            .await?
            .with_context(|| format!("Conversation {} not found", conversation_id))?;
        self.set_active_conversation(&conversation.id);

        let message = Message::optimistic_user(&conversation.id, content);
        self.storage.save_message(&message).await?;
        log::info!(
            "Saved optimistic message {} in conversation {}",
            message.local_id,
            conversation.id
        );

        let delivered = match self.reconciler.deliver(&conversation, &message).await {
            Ok(delivered) => delivered,
            Err(e) => {
                log::warn!("Message {} queued for sync: {:#}", message.local_id, e);
                self.status.send_modify(|s| s.pending_sync = true);
                return Ok(TurnOutcome::Queued(message));
            }
        };
        if delivered.conversation_id != conversation.id {
            self.set_active_conversation(&delivered.conversation_id);
        }
        self.refresh_pending().await;

        self.listen(&delivered.conversation_id).await
    }

    /// Follows the conversation's stream for one assistant reply.
    pub async fn listen(&self, conversation_id: &str) -> Result<TurnOutcome> {
        let (tx, mut rx) = mpsc::channel(CHUNK_BUFFER);
        let ticket = self.registry.create(
            conversation_id,
            self.source.clone(),
            self.config.reconnect.clone(),
            tx,
        );
        let mut state_rx = ticket.state;
        let mut watching_state = true;
        let mut previous = ConnectionState::Disconnected;
        let mut connected_once = false;
        self.status.send_modify(|s| {
            s.partial.clear();
            s.error = None;
        });

        let stall = tokio::time::sleep(self.config.stall_timeout + self.config.reconnect.total_backoff());
        tokio::pin!(stall);

        let outcome = loop {
            // State changes are seen before the chunks that follow them
            tokio::select! {
                biased;
                _ = &mut stall => {
                    log::warn!(
                        "No completion for conversation {} within {:?}",
                        conversation_id,
                        self.config.stall_timeout
                    );
                    break TurnOutcome::TimedOut;
                }
                changed = state_rx.changed(), if watching_state => {
                    if changed.is_err() {
                        watching_state = false;
                        continue;
                    }
                    let current = *state_rx.borrow_and_update();
                    self.status.send_modify(|s| {
                        s.connection = current;
                        // The reopened stream starts the reply over
                        if current == ConnectionState::Reconnecting {
                            s.partial.clear();
                        }
                    });
                    if current == ConnectionState::Connected && !connected_once {
                        connected_once = true;
                        stall
                            .as_mut()
                            .reset(tokio::time::Instant::now() + self.config.stall_timeout);
                    }
                    if previous == ConnectionState::Reconnecting && current == ConnectionState::Connected {
                        self.spawn_background_sync();
                    }
                    previous = current;
                }
                chunk = rx.recv() => match chunk {
                    Some(NormalizedChunk::Content { text }) => {
                        self.status.send_modify(|s| s.partial.push_str(&text));
                    }
                    // The connection completes an empty `done` from its own buffer
                    Some(NormalizedChunk::Done { text, message_id, usage }) => {
                        let metadata = usage.map(|usage| MessageMetadata {
                            usage: Some(usage),
                            ..Default::default()
                        });
                        break TurnOutcome::Completed(Message::assistant_from_server(
                            conversation_id,
                            message_id,
                            text,
                            metadata,
                        ));
                    }
                    Some(NormalizedChunk::Error { message }) => break TurnOutcome::Failed(message),
                    Some(NormalizedChunk::Heartbeat) => {}
                    None => break TurnOutcome::Stopped,
                }
            }
        };

        self.registry.release(conversation_id, ticket.id);
        self.finish_turn(conversation_id, outcome).await
    }

    async fn finish_turn(&self, conversation_id: &str, outcome: TurnOutcome) -> Result<TurnOutcome> {
        let mut save_error = None;
        let error = match &outcome {
            TurnOutcome::Completed(message) => match self.storage.save_message(message).await {
                Ok(()) => {
                    log::info!(
                        "Persisted assistant message {} ({} chars)",
                        message.local_id,
                        message.content.len()
                    );
                    self.hooks.on_assistant_message(message);
                    None
                }
                Err(e) => {
                    let reason = format!("Failed to save the reply: {:#}", e);
                    save_error = Some(e);
                    Some(reason)
                }
            },
            TurnOutcome::Failed(reason) => Some(reason.clone()),
            TurnOutcome::TimedOut => Some(format!(
                "Timed out after {:?} waiting for a response",
                self.config.stall_timeout
            )),
            TurnOutcome::Stopped | TurnOutcome::Queued(_) => None,
        };
        if let Some(reason) = &error {
            log::error!("Turn in conversation {} failed: {}", conversation_id, reason);
            self.hooks.on_turn_failed(conversation_id, reason);
        }
        self.status.send_modify(|s| {
            s.partial.clear();
            s.connection = ConnectionState::Disconnected;
            s.error = error;
        });
        match save_error {
            Some(e) => Err(e),
            None => Ok(outcome),
        }
    }

    /// Ends the turn in flight for the conversation, if any.
    pub fn stop(&self, conversation_id: &str) -> bool {
        log::warn!("Stop requested for conversation {}", conversation_id);
        self.registry.close(conversation_id)
    }

    // --- Sync ---

    pub async fn sync_pending(&self) -> Result<SyncReport> {
        let report = self.reconciler.run().await?;
        self.refresh_pending().await;
        Ok(report)
    }

    /// Runs a sync pass every `interval` until the handle is aborted.
    pub fn spawn_periodic_sync(&self, interval: Duration) -> JoinHandle<()> {
        let session = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                if let Err(e) = session.sync_pending().await {
                    log::error!("Periodic sync failed: {:#}", e);
                }
            }
        })
    }

    fn spawn_background_sync(&self) {
        log::info!("Stream recovered, replaying unsynced messages");
        let session = self.clone();
        tokio::spawn(async move {
            if let Err(e) = session.sync_pending().await {
                log::error!("Background sync failed: {:#}", e);
            }
        });
    }

    async fn refresh_pending(&self) {
        match self.storage.count_unsynced_messages().await {
            Ok(count) => self.status.send_modify(|s| s.pending_sync = count > 0),
            Err(e) => log::error!("Failed to count unsynced messages: {:#}", e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn session_config_follows_client_config() {
        let client = ClientConfig {
            user_id: "u9".into(),
            page_size: 7,
            stall_timeout: Duration::from_secs(3),
            ..Default::default()
        };
        let config = SessionConfig::from(&client);
        assert_eq!(config.user_id, "u9");
        assert_eq!(config.page_size, 7);
        assert_eq!(config.stall_timeout, Duration::from_secs(3));
        assert_eq!(config.reconnect, client.reconnect);
    }

    #[test]
    fn idle_status_is_disconnected_and_clean() {
        let status = SessionStatus::default();
        assert_eq!(status.connection, ConnectionState::Disconnected);
        assert!(status.partial.is_empty());
        assert!(status.error.is_none());
        assert!(!status.pending_sync);
    }
}
