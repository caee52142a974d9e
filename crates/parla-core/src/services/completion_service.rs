use futures::StreamExt;
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use crate::models::conversation::{Message, MessageContent, Role};
use crate::repositories::BoxFuture;

/// Raw response body of a completion request.
pub type ByteStream = BoxStream<'static, Result<Vec<u8>, CompletionError>>;

#[derive(Debug, Error)]
pub enum CompletionError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Completion endpoint returned status {status}")]
    Status { status: u16 },

    #[error("Stream error: {0}")]
    Stream(String),
}

/// Backend behaviour for a turn. `Function` lets the backend invoke side-effecting tools.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChatMode {
    #[default]
    Chat,
    Function,
}

/// A history entry as it crosses the wire: role and content only.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WireMessage {
    pub role: Role,
    pub content: MessageContent,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CompletionRequest {
    pub messages: Vec<WireMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub system_prompt: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mode: Option<ChatMode>,
}

impl CompletionRequest {
    pub fn from_history(
        history: &[Message],
        system_prompt: Option<&str>,
        mode: Option<ChatMode>,
    ) -> Self {
        Self {
            messages: history
                .iter()
                .map(|message| WireMessage {
                    role: message.role,
                    content: message.content.clone(),
                })
                .collect(),
            system_prompt: system_prompt
                .map(str::trim)
                .filter(|prompt| !prompt.is_empty())
                .map(str::to_string),
            mode,
        }
    }
}

/// Opens a streamed completion for a request.
pub trait CompletionBackend: Send + Sync {
    fn open(&self, request: CompletionRequest) -> BoxFuture<'static, Result<ByteStream, CompletionError>>;
}

/// Completion backend speaking to an HTTP endpoint that streams `data:` frames.
#[derive(Clone)]
pub struct HttpCompletionBackend {
    client: reqwest::Client,
    endpoint: String,
}

impl HttpCompletionBackend {
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self::with_client(reqwest::Client::new(), endpoint)
    }

    pub fn with_client(client: reqwest::Client, endpoint: impl Into<String>) -> Self {
        Self {
            client,
            endpoint: endpoint.into(),
        }
    }
}

impl CompletionBackend for HttpCompletionBackend {
    fn open(&self, request: CompletionRequest) -> BoxFuture<'static, Result<ByteStream, CompletionError>> {
        let client = self.client.clone();
        let endpoint = self.endpoint.clone();

        Box::pin(async move {
            debug!(
                endpoint = %endpoint,
                messages = request.messages.len(),
                "Opening completion stream"
            );

            let response = client.post(&endpoint).json(&request).send().await?;

            let status = response.status();
            if !status.is_success() {
                return Err(CompletionError::Status {
                    status: status.as_u16(),
                });
            }

            let body: ByteStream = Box::pin(
                response
                    .bytes_stream()
                    .map(|chunk| chunk.map(|bytes| bytes.to_vec()).map_err(CompletionError::from)),
            );
            Ok(body)
        })
    }
}
