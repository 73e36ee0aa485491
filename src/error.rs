use thiserror::Error;

/// Failures of calls against the remote API.
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("Request failed: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("API request failed with status {status}: {body}")]
    Status { status: u16, body: String },

    #[error("Unauthorized after token refresh")]
    Unauthorized,

    #[error("Failed to obtain bearer token: {0}")]
    Credential(String),

    #[error("Unexpected response body: {0}")]
    Decode(String),
}

impl ApiError {
    pub fn status(status: u16, body: impl Into<String>) -> Self {
        ApiError::Status {
            status,
            body: body.into(),
        }
    }
}

/// Failures seen by a stream connection.
///
/// Transport failures feed the reconnect policy; protocol failures only
/// cost the offending frame.
#[derive(Debug, Error)]
pub enum StreamError {
    #[error("Failed to open stream: {0}")]
    Open(#[source] ApiError),

    #[error("Stream read interrupted: {0}")]
    Read(String),

    #[error("Stream closed before the response completed")]
    UnexpectedEof,

    #[error("Malformed frame: {0}")]
    Protocol(String),
}

impl StreamError {
    pub fn is_transport(&self) -> bool {
        !matches!(self, StreamError::Protocol(_))
    }
}
