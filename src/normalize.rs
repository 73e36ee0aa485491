//! Maps vendor event vocabularies onto [`NormalizedChunk`].
//!
//! This is the only place that knows vendor event names or payload field
//! names. Everything downstream matches on the four chunk kinds.

use crate::error::StreamError;
use crate::models::{NormalizedChunk, TokenUsage};
use crate::sse::{WireFrame, DEFAULT_EVENT};
use serde_json::{Map, Value};

// End-of-stream sentinel used by OpenAI-compatible servers
const DONE_SENTINEL: &str = "[DONE]";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum EventKind {
    Heartbeat,
    Content,
    Done,
    Error,
}

fn classify(name: &str) -> Option<EventKind> {
    match name.trim().to_ascii_lowercase().as_str() {
        "connected" | "connection_established" | "open" | "ping" | "heartbeat" | "keepalive"
        | "keep-alive" => Some(EventKind::Heartbeat),
        "llm_chunk" | "content" | "chunk" | "delta" | "text_delta" | "content_block_delta"
        | "message_delta" | "token" => Some(EventKind::Content),
        "llm_complete" | "complete" | "completed" | "done" | "message_complete"
        | "response_complete" | "end" => Some(EventKind::Done),
        "error" | "llm_error" | "stream_error" | "failed" => Some(EventKind::Error),
        _ => None,
    }
}

/// Normalizes one frame.
///
/// Returns `Ok(None)` for event types nobody consumes and
/// `Err(StreamError::Protocol)` when the payload is not JSON. The result
/// depends only on the frame.
pub fn normalize(frame: &WireFrame) -> Result<Option<NormalizedChunk>, StreamError> {
    let data = frame.data.trim();
    if data == DONE_SENTINEL {
        return Ok(Some(NormalizedChunk::done("")));
    }

    let named = if frame.event == DEFAULT_EVENT {
        None
    } else {
        classify(&frame.event)
    };
    // Keep-alives often carry a bare token instead of JSON
    if named == Some(EventKind::Heartbeat) {
        return Ok(Some(NormalizedChunk::Heartbeat));
    }

    let value: Value = serde_json::from_str(data).map_err(|e| {
        StreamError::Protocol(format!("event '{}' carries invalid JSON: {}", frame.event, e))
    })?;
    let payload = unwrap_envelope(value);

    let kind = named.or_else(|| {
        payload
            .get("type")
            .and_then(Value::as_str)
            .and_then(classify)
    });

    let chunk = match kind {
        Some(EventKind::Heartbeat) => Some(NormalizedChunk::Heartbeat),
        Some(EventKind::Content) => content_chunk(&payload),
        Some(EventKind::Done) => Some(NormalizedChunk::Done {
            text: extract_text(&payload).unwrap_or_default(),
            // The frame `id:` is a per-stream resume cursor, never a message id
            message_id: extract_message_id(&payload),
            usage: payload
                .get("usage")
                .and_then(|u| serde_json::from_value::<TokenUsage>(u.clone()).ok()),
        }),
        Some(EventKind::Error) => Some(NormalizedChunk::error(
            extract_error(&payload).unwrap_or_else(|| "Unknown stream error".to_string()),
        )),
        None => openai_delta(&payload).map(NormalizedChunk::content),
    };

    if chunk.is_none() {
        log::debug!("Ignoring unrecognized stream event '{}'", frame.event);
    }
    Ok(chunk)
}

/// Unwraps `{"data": {...}}` once, but only when the outer object has no
/// `type` of its own.
fn unwrap_envelope(value: Value) -> Value {
    match value {
        Value::Object(mut outer)
            if !outer.contains_key("type") && matches!(outer.get("data"), Some(Value::Object(_))) =>
        {
            outer.remove("data").unwrap_or(Value::Object(Map::new()))
        }
        other => other,
    }
}

fn content_chunk(payload: &Value) -> Option<NormalizedChunk> {
    match extract_text(payload) {
        Some(text) if !text.is_empty() => Some(NormalizedChunk::content(text)),
        _ => {
            log::debug!("Content event without text, skipping");
            None
        }
    }
}

fn extract_text(payload: &Value) -> Option<String> {
    if let Value::String(s) = payload {
        return Some(s.clone());
    }
    for key in ["content", "text", "delta", "chunk", "response"] {
        match payload.get(key) {
            Some(Value::String(s)) => return Some(s.clone()),
            Some(Value::Object(inner)) => {
                if let Some(Value::String(s)) = inner.get("text") {
                    return Some(s.clone());
                }
            }
            _ => {}
        }
    }
    None
}

fn extract_error(payload: &Value) -> Option<String> {
    if let Value::String(s) = payload {
        return Some(s.clone());
    }
    for key in ["message", "error", "detail"] {
        match payload.get(key) {
            Some(Value::String(s)) => return Some(s.clone()),
            Some(Value::Object(inner)) => {
                if let Some(Value::String(s)) = inner.get("message") {
                    return Some(s.clone());
                }
            }
            _ => {}
        }
    }
    None
}

fn extract_message_id(payload: &Value) -> Option<String> {
    for key in ["message_id", "id"] {
        match payload.get(key) {
            Some(Value::String(s)) if !s.is_empty() => return Some(s.clone()),
            Some(Value::Number(n)) => return Some(n.to_string()),
            _ => {}
        }
    }
    None
}

// Untyped chat-completion chunks: {"choices":[{"delta":{"content":"..."}}]}
fn openai_delta(payload: &Value) -> Option<String> {
    payload
        .get("choices")?
        .get(0)?
        .get("delta")?
        .get("content")?
        .as_str()
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}
