//! Wire frame parsing for the push stream.
//!
//! Frames are cut on blank lines by `eventsource-stream`, which keeps any
//! partial frame buffered across reads, so the frames produced never depend
//! on how the body was chunked by the network.

use crate::error::StreamError;
use eventsource_stream::{Event, EventStreamError, Eventsource};
use futures::{future, Stream, StreamExt};
use std::fmt;
use std::time::Duration;

// Event name the wire format implies when a frame has no `event:` line
pub const DEFAULT_EVENT: &str = "message";

/// One complete frame: `event`, concatenated `data`, optional `id` and `retry`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WireFrame {
    pub event: String,
    pub data: String,
    pub id: Option<String>,
    pub retry: Option<Duration>,
}

impl WireFrame {
    pub fn new(event: impl Into<String>, data: impl Into<String>) -> Self {
        Self {
            event: event.into(),
            data: data.into(),
            id: None,
            retry: None,
        }
    }
}

impl From<Event> for WireFrame {
    fn from(event: Event) -> Self {
        let name = if event.event.is_empty() {
            DEFAULT_EVENT.to_string()
        } else {
            event.event
        };
        Self {
            event: name,
            data: event.data,
            id: (!event.id.is_empty()).then_some(event.id),
            retry: event.retry,
        }
    }
}

/// Turns a response body into complete frames, in wire order.
///
/// Frames without data are dropped here. Transport failures surface as
/// `StreamError::Read`; anything the framer itself rejects is a
/// `StreamError::Protocol` and the stream keeps going.
pub fn frames<S, B, E>(body: S) -> impl Stream<Item = Result<WireFrame, StreamError>> + Send
where
    S: Stream<Item = Result<B, E>> + Send + 'static,
    B: AsRef<[u8]> + Send,
    E: fmt::Display + Send,
{
    body.eventsource().filter_map(|item| {
        let frame = match item {
            Ok(event) if event.data.trim().is_empty() => {
                log::debug!("Dropping frame '{}' without data", event.event);
                None
            }
            Ok(event) => Some(Ok(WireFrame::from(event))),
            Err(EventStreamError::Transport(e)) => Some(Err(StreamError::Read(e.to_string()))),
            Err(other) => Some(Err(StreamError::Protocol(other.to_string()))),
        };
        future::ready(frame)
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use futures::stream;
    use std::convert::Infallible;

    const BODY: &str = "event: connected\ndata: {\"status\":\"ok\"}\n\n\
                        : keep-alive comment\n\n\
                        event: llm_chunk\ndata: {\"content\":\"Hel\"}\n\n\
                        event: llm_chunk\ndata:{\"content\":\"lo\"}\n\n\
                        id: 42\nevent: llm_complete\ndata: {\"content\":\"Hello\"}\n\n";

    async fn collect(chunks: Vec<String>) -> Vec<WireFrame> {
        let body = stream::iter(
            chunks
                .into_iter()
                .map(|c| Ok::<_, Infallible>(Bytes::from(c))),
        );
        frames(body)
            .map(|f| f.expect("frame"))
            .collect::<Vec<_>>()
            .await
    }

    #[tokio::test]
    async fn parses_event_data_and_id() {
        let frames = collect(vec![BODY.to_string()]).await;
        assert_eq!(frames.len(), 4);
        assert_eq!(frames[0].event, "connected");
        assert_eq!(frames[1], WireFrame::new("llm_chunk", "{\"content\":\"Hel\"}"));
        assert_eq!(frames[2].data, "{\"content\":\"lo\"}");
        assert_eq!(frames[3].event, "llm_complete");
        assert_eq!(frames[3].id.as_deref(), Some("42"));
    }

    #[tokio::test]
    async fn frames_do_not_depend_on_read_boundaries() {
        let whole = collect(vec![BODY.to_string()]).await;

        for split in 1..BODY.len() {
            let (a, b) = BODY.split_at(split);
            let parts = collect(vec![a.to_string(), b.to_string()]).await;
            assert_eq!(parts, whole, "split at byte {}", split);
        }

        let byte_at_a_time = collect(BODY.chars().map(|c| c.to_string()).collect()).await;
        assert_eq!(byte_at_a_time, whole);
    }

    #[tokio::test]
    async fn multiple_data_lines_join_into_one_payload() {
        let frames = collect(vec!["data: {\"content\":\ndata: \"x\"}\n\n".to_string()]).await;
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].event, DEFAULT_EVENT);
        let value: serde_json::Value = serde_json::from_str(&frames[0].data).unwrap();
        assert_eq!(value["content"], "x");
    }

    #[tokio::test]
    async fn frames_without_data_are_discarded() {
        let frames = collect(vec!["event: ping\n\nevent: llm_chunk\ndata: {}\n\n".to_string()]).await;
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].event, "llm_chunk");
    }

    #[tokio::test]
    async fn retry_hint_is_parsed_as_milliseconds() {
        let frames = collect(vec!["retry: 1500\ndata: x\n\n".to_string()]).await;
        assert_eq!(frames[0].retry, Some(Duration::from_millis(1500)));
    }

    #[tokio::test]
    async fn transport_errors_surface_as_read_errors() {
        let body = stream::iter(vec![
            Ok(Bytes::from_static(b"data: a\n\n")),
            Err("connection reset"),
        ]);
        let items: Vec<_> = frames(body).collect().await;
        assert_eq!(items.len(), 2);
        assert!(items[0].is_ok());
        assert!(matches!(items[1], Err(StreamError::Read(ref m)) if m.contains("reset")));
    }
}
