use crate::api::RemoteApi;
use crate::models::{Conversation, Message};
use crate::storage::StorageManager;
use anyhow::Result;
use serde::Serialize;
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::Mutex;

/// Outcome of one replay pass.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SyncReport {
    pub conversations_synced: usize,
    pub attempted: usize,
    pub synced: usize,
    pub failed: usize,
}

impl SyncReport {
    pub fn is_clean(&self) -> bool {
        self.failed == 0
    }
}

/// Where a directly delivered message ended up.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivered {
    pub conversation_id: String,
    pub server_id: String,
}

/// Replays unsynced conversations and messages against the remote API.
///
/// Passes are serialized, so a message is never in flight twice. A failed
/// message stays unsynced for the next pass; nothing is ever deleted here.
#[derive(Clone)]
pub struct SyncReconciler {
    storage: Arc<StorageManager>,
    api: Arc<dyn RemoteApi>,
    pass: Arc<Mutex<()>>,
}

impl SyncReconciler {
    pub fn new(storage: Arc<StorageManager>, api: Arc<dyn RemoteApi>) -> Self {
        Self {
            storage,
            api,
            pass: Arc::new(Mutex::new(())),
        }
    }

    /// Creates a locally started conversation on the server and moves it
    /// onto the server id. Returns the id to use from now on.
    pub async fn sync_conversation(&self, conversation: &Conversation) -> Result<String> {
        let _guard = self.pass.lock().await;
        self.create_remote(conversation).await
    }

    /// Sends one message right away, under the same lock as a replay pass.
    pub async fn deliver(&self, conversation: &Conversation, message: &Message) -> Result<Delivered> {
        let _guard = self.pass.lock().await;
        let conversation_id = self.create_remote(conversation).await?;
        if let Some(Message {
            server_id: Some(server_id),
            synced: true,
            ..
        }) = self.storage.get_message(&message.local_id).await?
        {
            log::debug!("Message {} was replayed before delivery", message.local_id);
            return Ok(Delivered {
                conversation_id,
                server_id,
            });
        }
        let server_id = self.api.send_message(&conversation_id, message).await?;
        self.storage
            .reconcile_message(&message.local_id, &server_id)
            .await?;
        Ok(Delivered {
            conversation_id,
            server_id,
        })
    }

    async fn create_remote(&self, conversation: &Conversation) -> Result<String> {
        if conversation.synced {
            return Ok(conversation.id.clone());
        }
        // A concurrent pass may already have moved it onto its server id
        let current = self.storage.get_conversation(&conversation.id).await?;
        if current.is_none() {
            return Err(anyhow::anyhow!(
                "Conversation {} no longer exists locally",
                conversation.id
            ));
        }
        let server_id = self
            .api
            .create_conversation(&conversation.title, None)
            .await?;
        self.storage
            .reconcile_conversation(&conversation.id, &server_id)
            .await?;
        Ok(server_id)
    }

    /// One full pass: conversations first, then messages oldest first.
    ///
    /// Only a storage failure reading the pending set is returned as an
    /// error; every per-item failure is counted in the report.
    pub async fn run(&self) -> Result<SyncReport> {
        let _guard = self.pass.lock().await;
        let mut report = SyncReport::default();

        let mut failed_conversations = HashSet::new();
        for conversation in self.storage.list_unsynced_conversations().await? {
            match self.create_remote(&conversation).await {
                Ok(server_id) => {
                    log::info!("Synced conversation {} as {}", conversation.id, server_id);
                    report.conversations_synced += 1;
                }
                Err(e) => {
                    log::warn!("Failed to sync conversation {}: {:#}", conversation.id, e);
                    failed_conversations.insert(conversation.id);
                }
            }
        }

        let pending = self.storage.list_unsynced_messages().await?;
        if pending.is_empty() {
            return Ok(report);
        }
        log::info!("Replaying {} unsynced messages", pending.len());

        for message in pending {
            report.attempted += 1;
            if failed_conversations.contains(&message.conversation_id) {
                log::debug!(
                    "Skipping message {}: conversation {} is not on the server yet",
                    message.local_id,
                    message.conversation_id
                );
                report.failed += 1;
                continue;
            }

            let sent = self.api.send_message(&message.conversation_id, &message).await;
            let outcome = match sent {
                Ok(server_id) => self
                    .storage
                    .reconcile_message(&message.local_id, &server_id)
                    .await
                    .map(|_| ()),
                Err(e) => Err(e.into()),
            };
            match outcome {
                Ok(()) => report.synced += 1,
                Err(e) => {
                    log::warn!("Message {} stays unsynced: {:#}", message.local_id, e);
                    report.failed += 1;
                }
            }
        }

        log::info!(
            "Sync pass finished: {} synced, {} failed",
            report.synced,
            report.failed
        );
        Ok(report)
    }
}
