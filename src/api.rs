use crate::error::{ApiError, StreamError};
use crate::models::Message;
use async_trait::async_trait;
use bytes::Bytes;
use futures::{Stream, TryStreamExt};
use reqwest::{header, Client, RequestBuilder, Response, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::pin::Pin;
use std::sync::Arc;

// Alias for the raw response body of a push stream
pub type ByteStream = Pin<Box<dyn Stream<Item = Result<Bytes, ApiError>> + Send>>;

/// Supplies bearer tokens. Owned by the authentication collaborator.
#[async_trait]
pub trait TokenProvider: Send + Sync {
    /// A currently valid token.
    async fn token(&self) -> Result<String, ApiError>;
    /// Forces a refresh and returns the new token.
    async fn refresh(&self) -> Result<String, ApiError>;
}

/// Request/response calls the core depends on.
#[async_trait]
pub trait RemoteApi: Send + Sync {
    /// Creates a conversation and returns its server id.
    async fn create_conversation(
        &self,
        title: &str,
        initial_message: Option<&str>,
    ) -> Result<String, ApiError>;

    /// Sends a message and returns the server id assigned to it.
    async fn send_message(&self, conversation_id: &str, message: &Message)
        -> Result<String, ApiError>;

    fn stream_url(&self, conversation_id: &str) -> String;
}

/// Opens the push stream of one conversation.
#[async_trait]
pub trait StreamSource: Send + Sync {
    async fn open(&self, conversation_id: &str) -> Result<ByteStream, StreamError>;
}

#[derive(Serialize, Debug)]
struct CreateConversationBody<'a> {
    title: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    initial_message: Option<&'a str>,
}

#[derive(Serialize, Debug)]
struct SendMessageBody<'a> {
    content: &'a str,
    role: &'a str,
    // Lets the backend deduplicate replays of the same local message
    client_message_id: &'a str,
}

// Servers answer with {"id": ...} or wrap it as {"data": {"id": ...}}
#[derive(Deserialize, Debug)]
struct IdResponse {
    #[serde(alias = "message_id", alias = "conversation_id")]
    id: Option<Value>,
    data: Option<Box<IdResponse>>,
}

impl IdResponse {
    fn into_id(self) -> Option<String> {
        match self.id {
            Some(Value::String(s)) if !s.is_empty() => Some(s),
            Some(Value::Number(n)) => Some(n.to_string()),
            _ => self.data.and_then(|inner| inner.into_id()),
        }
    }
}

pub struct HttpRemoteApi {
    client: Client,
    base_url: String,
    tokens: Arc<dyn TokenProvider>,
}

impl HttpRemoteApi {
    pub fn new(base_url: &str, tokens: Arc<dyn TokenProvider>) -> Self {
        Self {
            client: Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
            tokens,
        }
    }

    /// Sends an authorised request, refreshing the token and retrying once on 401.
    async fn send_authorized<F>(&self, build: F) -> Result<Response, ApiError>
    where
        F: Fn(&Client) -> RequestBuilder + Send + Sync,
    {
        let token = self.tokens.token().await?;
        let response = build(&self.client).bearer_auth(&token).send().await?;
        if response.status() != StatusCode::UNAUTHORIZED {
            return check_status(response).await;
        }

        log::warn!("Request rejected with 401, refreshing token and retrying once");
        let token = self.tokens.refresh().await?;
        let response = build(&self.client).bearer_auth(&token).send().await?;
        if response.status() == StatusCode::UNAUTHORIZED {
            log::error!("Request still unauthorized after token refresh");
            return Err(ApiError::Unauthorized);
        }
        check_status(response).await
    }

    async fn read_id(response: Response) -> Result<String, ApiError> {
        let body: IdResponse = response
            .json()
            .await
            .map_err(|e| ApiError::Decode(e.to_string()))?;
        body.into_id()
            .ok_or_else(|| ApiError::Decode("response carries no id".to_string()))
    }
}

async fn check_status(response: Response) -> Result<Response, ApiError> {
    if response.status().is_success() {
        return Ok(response);
    }
    let status = response.status();
    let error_body = response
        .text()
        .await
        .unwrap_or_else(|_| "<Failed to read error body>".to_string());
    log::error!("API request failed with status {}: {}", status, error_body);
    Err(ApiError::status(status.as_u16(), error_body))
}

#[async_trait]
impl RemoteApi for HttpRemoteApi {
    async fn create_conversation(
        &self,
        title: &str,
        initial_message: Option<&str>,
    ) -> Result<String, ApiError> {
        let url = format!("{}/conversations", self.base_url);
        let body = CreateConversationBody {
            title,
            initial_message,
        };
        log::info!("Creating remote conversation '{}'", title);
        let response = self
            .send_authorized(|client| client.post(&url).json(&body))
            .await?;
        Self::read_id(response).await
    }

    async fn send_message(
        &self,
        conversation_id: &str,
        message: &Message,
    ) -> Result<String, ApiError> {
        let url = format!("{}/conversations/{}/messages", self.base_url, conversation_id);
        let body = SendMessageBody {
            content: &message.content,
            role: message.role.as_str(),
            client_message_id: &message.local_id,
        };
        log::debug!("Sending message {} to conversation {}", message.local_id, conversation_id);
        let response = self
            .send_authorized(|client| client.post(&url).json(&body))
            .await?;
        Self::read_id(response).await
    }

    fn stream_url(&self, conversation_id: &str) -> String {
        format!("{}/conversations/{}/stream", self.base_url, conversation_id)
    }
}

#[async_trait]
impl StreamSource for HttpRemoteApi {
    async fn open(&self, conversation_id: &str) -> Result<ByteStream, StreamError> {
        let url = self.stream_url(conversation_id);
        log::info!("Opening push stream: {}", url);
        let response = self
            .send_authorized(|client| {
                client
                    .get(&url)
                    .header(header::ACCEPT, "text/event-stream")
                    .header(header::CACHE_CONTROL, "no-cache")
            })
            .await
            .map_err(StreamError::Open)?;

        let body = response.bytes_stream().map_err(ApiError::from);
        Ok(Box::pin(body))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id_of(json: &str) -> Option<String> {
        serde_json::from_str::<IdResponse>(json).unwrap().into_id()
    }

    #[test]
    fn ids_are_read_from_plain_and_enveloped_bodies() {
        assert_eq!(id_of("{\"id\":\"c-1\"}").as_deref(), Some("c-1"));
        assert_eq!(id_of("{\"message_id\":17}").as_deref(), Some("17"));
        assert_eq!(id_of("{\"data\":{\"id\":\"m-2\"}}").as_deref(), Some("m-2"));
        assert_eq!(id_of("{\"ok\":true}"), None);
    }

    struct NoTokens;

    #[async_trait]
    impl TokenProvider for NoTokens {
        async fn token(&self) -> Result<String, ApiError> {
            Ok("t".into())
        }
        async fn refresh(&self) -> Result<String, ApiError> {
            Ok("t2".into())
        }
    }

    #[test]
    fn stream_url_is_scoped_to_the_conversation() {
        let api = HttpRemoteApi::new("https://api.example.com/v1/", Arc::new(NoTokens));
        assert_eq!(
            api.stream_url("c-9"),
            "https://api.example.com/v1/conversations/c-9/stream"
        );
    }
}
