use crate::api::{HttpRemoteApi, RemoteApi, StreamSource, TokenProvider};
use crate::config::{ClientConfig, CredentialTokenProvider};
use crate::connection::{ConnectionState, ReconnectPolicy, StreamConnection};
use crate::models::NormalizedChunk;
use crate::session::{ChatSession, SessionConfig};
use crate::storage::StorageManager;
use anyhow::Result;
use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};

/// Live stream connections, at most one per conversation.
#[derive(Clone, Default)]
pub struct ConnectionRegistry {
    connections: Arc<DashMap<String, StreamConnection>>,
}

/// What a caller needs from a freshly created connection.
pub struct ConnectionTicket {
    pub id: u64,
    pub state: watch::Receiver<ConnectionState>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current state of the conversation's connection, if one is registered.
    pub fn get(&self, conversation_id: &str) -> Option<ConnectionState> {
        self.connections.get(conversation_id).map(|c| c.state())
    }

    pub fn is_live(&self, conversation_id: &str) -> bool {
        self.connections
            .get(conversation_id)
            .is_some_and(|c| c.is_live())
    }

    /// Opens a new connection, tearing down any existing one for the same
    /// conversation first.
    pub fn create(
        &self,
        conversation_id: &str,
        source: Arc<dyn StreamSource>,
        policy: ReconnectPolicy,
        subscriber: mpsc::Sender<NormalizedChunk>,
    ) -> ConnectionTicket {
        if let Some((_, previous)) = self.connections.remove(conversation_id) {
            log::info!("Replacing live stream for conversation {}", conversation_id);
            previous.disconnect();
        }
        let connection = StreamConnection::connect(conversation_id, source, policy, subscriber);
        let ticket = ConnectionTicket {
            id: connection.id(),
            state: connection.subscribe_state(),
        };
        self.connections.insert(conversation_id.to_string(), connection);
        ticket
    }

    /// Disconnects and forgets whatever connection the conversation has.
    pub fn close(&self, conversation_id: &str) -> bool {
        match self.connections.remove(conversation_id) {
            Some((_, connection)) => {
                connection.disconnect();
                true
            }
            None => false,
        }
    }

    /// Like `close`, but only if the registered connection is still `id`.
    pub fn release(&self, conversation_id: &str, id: u64) -> bool {
        match self.connections.remove_if(conversation_id, |_, c| c.id() == id) {
            Some((_, connection)) => {
                connection.disconnect();
                true
            }
            None => false,
        }
    }

    pub fn close_all(&self) {
        self.connections.retain(|_, connection| {
            connection.disconnect();
            false
        });
    }

    pub fn len(&self) -> usize {
        self.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }
}

// Core application state for the command surface
#[derive(Clone)]
pub struct AppState {
    pub config: ClientConfig,
    pub storage: Arc<StorageManager>,
    pub session: ChatSession,
}

impl AppState {
    pub async fn new(config: ClientConfig) -> Result<Self> {
        let storage = Arc::new(StorageManager::open(&config.database_path).await?);
        let tokens: Arc<dyn TokenProvider> =
            Arc::new(CredentialTokenProvider::new(&config.token_ref, &config.user_id));
        let http = Arc::new(HttpRemoteApi::new(&config.api_base_url, tokens));
        let api: Arc<dyn RemoteApi> = http.clone();
        let source: Arc<dyn StreamSource> = http;

        let session = ChatSession::new(
            storage.clone(),
            api,
            source,
            SessionConfig::from(&config),
        );
        Ok(Self {
            config,
            storage,
            session,
        })
    }
}
