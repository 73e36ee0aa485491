#![allow(dead_code)]

use async_trait::async_trait;
use bytes::Bytes;
use chatsync::api::{ByteStream, RemoteApi, StreamSource};
use chatsync::connection::ReconnectPolicy;
use chatsync::error::{ApiError, StreamError};
use chatsync::models::{Conversation, Message};
use chatsync::session::{ChatSession, SessionConfig};
use chatsync::storage::StorageManager;
use futures::{stream, StreamExt};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Remote API double that records every delivered message.
#[derive(Default)]
pub struct FakeApi {
    pub offline: AtomicBool,
    pub created: AtomicUsize,
    pub sent: Mutex<Vec<(String, String)>>,
}

impl FakeApi {
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    pub fn sent_contents(&self) -> Vec<String> {
        self.sent.lock().unwrap().iter().map(|(_, c)| c.clone()).collect()
    }

    fn check(&self) -> Result<(), ApiError> {
        if self.offline.load(Ordering::SeqCst) {
            return Err(ApiError::status(503, "offline"));
        }
        Ok(())
    }
}

#[async_trait]
impl RemoteApi for FakeApi {
    async fn create_conversation(&self, _title: &str, _initial: Option<&str>) -> Result<String, ApiError> {
        self.check()?;
        let n = self.created.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(format!("srv-conv-{}", n))
    }

    async fn send_message(&self, conversation_id: &str, message: &Message) -> Result<String, ApiError> {
        self.check()?;
        let mut sent = self.sent.lock().unwrap();
        sent.push((conversation_id.to_string(), message.content.clone()));
        Ok(format!("srv-msg-{}", sent.len()))
    }

    fn stream_url(&self, conversation_id: &str) -> String {
        format!("fake://{}/stream", conversation_id)
    }
}

pub enum Script {
    /// Opening the stream fails.
    Fail,
    /// The body is delivered, then the stream closes.
    Body(&'static str),
    /// The body is delivered, then the stream stays open forever.
    Hang(&'static str),
}

/// Stream source that plays one script per open.
pub struct ScriptedSource {
    scripts: Mutex<VecDeque<Script>>,
    opens: AtomicUsize,
}

impl ScriptedSource {
    pub fn new(scripts: Vec<Script>) -> Arc<Self> {
        Arc::new(Self {
            scripts: Mutex::new(scripts.into()),
            opens: AtomicUsize::new(0),
        })
    }

    pub fn opens(&self) -> usize {
        self.opens.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl StreamSource for ScriptedSource {
    async fn open(&self, _conversation_id: &str) -> Result<ByteStream, StreamError> {
        self.opens.fetch_add(1, Ordering::SeqCst);
        let script = self.scripts.lock().unwrap().pop_front();
        let body = |text: &'static str| stream::iter(vec![Ok::<_, ApiError>(Bytes::from_static(text.as_bytes()))]);
        match script {
            Some(Script::Body(text)) => Ok(Box::pin(body(text))),
            Some(Script::Hang(text)) => Ok(Box::pin(body(text).chain(stream::pending()))),
            Some(Script::Fail) | None => Err(StreamError::Open(ApiError::status(503, "unavailable"))),
        }
    }
}

pub fn fast_config() -> SessionConfig {
    SessionConfig {
        user_id: "u1".to_string(),
        reconnect: ReconnectPolicy {
            max_retries: 3,
            base_delay: Duration::from_millis(50),
            max_delay: Duration::from_millis(200),
        },
        stall_timeout: Duration::from_secs(5),
        page_size: 50,
    }
}

pub struct Harness {
    pub session: ChatSession,
    pub storage: Arc<StorageManager>,
    pub api: Arc<FakeApi>,
    pub source: Arc<ScriptedSource>,
}

impl Harness {
    pub async fn new(scripts: Vec<Script>) -> Self {
        Self::with_config(scripts, fast_config()).await
    }

    pub async fn with_config(scripts: Vec<Script>, config: SessionConfig) -> Self {
        let storage = Arc::new(StorageManager::in_memory().await.unwrap());
        let api = Arc::new(FakeApi::default());
        let source = ScriptedSource::new(scripts);
        let session = ChatSession::new(storage.clone(), api.clone(), source.clone(), config);
        Self {
            session,
            storage,
            api,
            source,
        }
    }

    /// A conversation the server already knows about.
    pub async fn synced_conversation(&self, id: &str) -> Conversation {
        let mut conv = Conversation::new_local("u1", "chat");
        conv.id = id.to_string();
        conv.synced = true;
        self.storage.save_conversation(&conv).await.unwrap();
        conv
    }
}

/// Polls until `check` holds, for at most two seconds.
pub async fn eventually<F, Fut>(mut check: F)
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    for _ in 0..200 {
        if check().await {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached in time");
}
