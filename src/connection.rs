//! Lifecycle of one push-stream connection.
//!
//! [`ReconnectMachine`] owns the state and the backoff bookkeeping and is
//! driven by discrete events, so it can be exercised without a network.
//! [`StreamConnection`] runs it against a [`StreamSource`] on a tokio task.

use crate::api::StreamSource;
use crate::error::StreamError;
use crate::models::NormalizedChunk;
use crate::normalize::normalize;
use crate::sse::frames;
use futures::StreamExt;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
}

/// Bounded exponential backoff.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconnectPolicy {
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            max_retries: 5,
            base_delay: Duration::from_millis(1000),
            max_delay: Duration::from_secs(30),
        }
    }
}

impl ReconnectPolicy {
    /// Sum of every wait before giving up.
    pub fn total_backoff(&self) -> Duration {
        (0..self.max_retries).map(|attempt| self.delay_for(attempt)).sum()
    }

    /// `base_delay * 2^attempt`, capped at `max_delay`.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 2u32.checked_pow(attempt).unwrap_or(u32::MAX);
        self.base_delay
            .checked_mul(factor)
            .map_or(self.max_delay, |d| d.min(self.max_delay))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionEvent {
    Connect,
    ConnectOk,
    ReadError,
    Completed,
    ManualStop,
    RetryTimerFired,
}

/// What the driver must do after a transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    Open,
    Wait(Duration),
    GiveUp { retries: u32 },
    Stop,
    Nothing,
}

#[derive(Debug, Clone)]
pub struct ReconnectMachine {
    state: ConnectionState,
    attempt: u32,
    policy: ReconnectPolicy,
    retry_hint: Option<Duration>,
}

impl ReconnectMachine {
    pub fn new(policy: ReconnectPolicy) -> Self {
        Self {
            state: ConnectionState::Disconnected,
            attempt: 0,
            policy,
            retry_hint: None,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    /// Server-advised reconnect delay; raises the floor of later backoffs.
    pub fn set_retry_hint(&mut self, hint: Duration) {
        self.retry_hint = Some(hint);
    }

    pub fn on(&mut self, event: ConnectionEvent) -> Action {
        use ConnectionEvent::*;
        use ConnectionState::*;

        match (self.state, event) {
            (_, ManualStop) => {
                self.state = Disconnected;
                self.attempt = 0;
                Action::Stop
            }
            (Disconnected, Connect) => {
                self.state = Connecting;
                self.attempt = 0;
                Action::Open
            }
            (Connecting | Reconnecting, ConnectOk) => {
                self.state = Connected;
                self.attempt = 0;
                Action::Nothing
            }
            (Connected, Completed) => {
                self.state = Disconnected;
                Action::Stop
            }
            (Connecting | Reconnecting | Connected, ReadError) => {
                if self.attempt < self.policy.max_retries {
                    let mut delay = self.policy.delay_for(self.attempt);
                    if let Some(hint) = self.retry_hint {
                        delay = delay.max(hint).min(self.policy.max_delay);
                    }
                    self.attempt += 1;
                    self.state = Reconnecting;
                    Action::Wait(delay)
                } else {
                    let retries = self.attempt;
                    self.state = Disconnected;
                    Action::GiveUp { retries }
                }
            }
            (Reconnecting, RetryTimerFired) => Action::Open,
            (state, event) => {
                log::debug!("Ignoring {:?} while {:?}", event, state);
                Action::Nothing
            }
        }
    }
}

enum ReadOutcome {
    Finished,
    Cancelled,
    Failed(StreamError),
}

/// A live push stream for one conversation.
///
/// Chunks go to the subscriber channel in wire order; heartbeats stay
/// inside. The sender is dropped when the connection ends, whatever the
/// reason.
pub struct StreamConnection {
    id: u64,
    conversation_id: String,
    state: watch::Receiver<ConnectionState>,
    cancel: CancellationToken,
    task: Option<JoinHandle<()>>,
}

impl StreamConnection {
    pub fn connect(
        conversation_id: &str,
        source: Arc<dyn StreamSource>,
        policy: ReconnectPolicy,
        subscriber: mpsc::Sender<NormalizedChunk>,
    ) -> Self {
        let id = NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed);
        let (state_tx, state_rx) = watch::channel(ConnectionState::Disconnected);
        let cancel = CancellationToken::new();

        let driver = Driver {
            conversation_id: conversation_id.to_string(),
            source,
            machine: ReconnectMachine::new(policy),
            subscriber,
            state_tx,
            cancel: cancel.clone(),
            buffer: String::new(),
        };
        let task = tokio::spawn(driver.run());

        Self {
            id,
            conversation_id: conversation_id.to_string(),
            state: state_rx,
            cancel,
            task: Some(task),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn conversation_id(&self) -> &str {
        &self.conversation_id
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.state.clone()
    }

    pub fn is_live(&self) -> bool {
        self.task.as_ref().is_some_and(|t| !t.is_finished())
    }

    /// Cancels the pending read. Safe to call repeatedly and before the
    /// connection ever opened.
    pub fn disconnect(&self) {
        if !self.cancel.is_cancelled() {
            log::info!("Disconnecting stream for conversation {}", self.conversation_id);
        }
        self.cancel.cancel();
    }

    /// Disconnects and waits for the driver task to exit.
    pub async fn shutdown(mut self) {
        self.disconnect();
        let Some(task) = self.task.take() else {
            return;
        };
        if let Err(e) = task.await {
            log::error!("Stream task for {} ended abnormally: {}", self.conversation_id, e);
        }
    }
}

impl Drop for StreamConnection {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

struct Driver {
    conversation_id: String,
    source: Arc<dyn StreamSource>,
    machine: ReconnectMachine,
    subscriber: mpsc::Sender<NormalizedChunk>,
    state_tx: watch::Sender<ConnectionState>,
    cancel: CancellationToken,
    // Text of the reply in flight, as delivered by the current stream
    buffer: String,
}

impl Driver {
    fn publish(&self) {
        self.state_tx.send_replace(self.machine.state());
    }

    async fn run(mut self) {
        let mut action = self.machine.on(ConnectionEvent::Connect);
        self.publish();
        let mut last_error: Option<StreamError> = None;

        loop {
            action = match action {
                Action::Open => match self.read_once().await {
                    ReadOutcome::Finished => self.machine.on(ConnectionEvent::Completed),
                    ReadOutcome::Cancelled => self.machine.on(ConnectionEvent::ManualStop),
                    ReadOutcome::Failed(e) => {
                        log::warn!("Stream for {} failed: {}", self.conversation_id, e);
                        last_error = Some(e);
                        self.machine.on(ConnectionEvent::ReadError)
                    }
                },
                Action::Wait(delay) => {
                    log::info!(
                        "Reconnecting stream for {} in {:?} (attempt {})",
                        self.conversation_id,
                        delay,
                        self.machine.attempt()
                    );
                    self.publish();
                    tokio::select! {
                        _ = self.cancel.cancelled() => self.machine.on(ConnectionEvent::ManualStop),
                        _ = tokio::time::sleep(delay) => self.machine.on(ConnectionEvent::RetryTimerFired),
                    }
                }
                Action::GiveUp { retries } => {
                    let reason = last_error
                        .take()
                        .map(|e| e.to_string())
                        .unwrap_or_else(|| "unknown error".to_string());
                    log::error!(
                        "Giving up on stream for {} after {} retries: {}",
                        self.conversation_id,
                        retries,
                        reason
                    );
                    let message = format!(
                        "Stream reconnection failed after {} retries: {}",
                        retries, reason
                    );
                    // Receiver may already be gone; nothing else to tell
                    let _ = self.subscriber.send(NormalizedChunk::error(message)).await;
                    break;
                }
                Action::Stop | Action::Nothing => break,
            };
            self.publish();
        }

        self.state_tx.send_replace(ConnectionState::Disconnected);
        log::debug!("Stream task for {} exited", self.conversation_id);
    }

    /// Accumulates content and completes an empty `done` from it.
    fn track(&mut self, chunk: NormalizedChunk) -> NormalizedChunk {
        match chunk {
            NormalizedChunk::Content { ref text } => {
                self.buffer.push_str(text);
                chunk
            }
            NormalizedChunk::Done {
                text,
                message_id,
                usage,
            } => {
                let buffered = std::mem::take(&mut self.buffer);
                NormalizedChunk::Done {
                    text: if text.is_empty() { buffered } else { text },
                    message_id,
                    usage,
                }
            }
            other => other,
        }
    }

    /// One connection attempt: open, then read until completion, failure or cancellation.
    async fn read_once(&mut self) -> ReadOutcome {
        let opened = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => return ReadOutcome::Cancelled,
            opened = self.source.open(&self.conversation_id) => opened,
        };
        let body = match opened {
            Ok(body) => body,
            Err(e) => return ReadOutcome::Failed(e),
        };

        self.machine.on(ConnectionEvent::ConnectOk);
        self.publish();
        // A reopened stream replays the turn from its start
        if !self.buffer.is_empty() {
            log::info!(
                "Discarding {} buffered chars for {} after reconnect",
                self.buffer.len(),
                self.conversation_id
            );
            self.buffer.clear();
        }
        log::info!("Stream connected for conversation {}", self.conversation_id);

        let mut frames = Box::pin(frames(body));
        loop {
            let next = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return ReadOutcome::Cancelled,
                next = frames.next() => next,
            };

            let frame = match next {
                Some(Ok(frame)) => frame,
                Some(Err(e)) if e.is_transport() => return ReadOutcome::Failed(e),
                Some(Err(e)) => {
                    log::warn!("Skipping frame on {}: {}", self.conversation_id, e);
                    continue;
                }
                None => return ReadOutcome::Failed(StreamError::UnexpectedEof),
            };

            if let Some(hint) = frame.retry {
                self.machine.set_retry_hint(hint);
            }

            let chunk = match normalize(&frame) {
                Ok(Some(chunk)) => chunk,
                Ok(None) => continue,
                Err(e) => {
                    log::warn!("Skipping frame on {}: {}", self.conversation_id, e);
                    continue;
                }
            };

            if chunk == NormalizedChunk::Heartbeat {
                log::debug!("Heartbeat on {}", self.conversation_id);
                continue;
            }

            let chunk = self.track(chunk);
            let terminal = chunk.is_terminal();
            if self.subscriber.send(chunk).await.is_err() {
                log::debug!("Subscriber for {} went away", self.conversation_id);
                return ReadOutcome::Cancelled;
            }
            // One assistant turn per stream; the next turn opens a fresh one
            if terminal {
                return ReadOutcome::Finished;
            }
        }
    }
}
