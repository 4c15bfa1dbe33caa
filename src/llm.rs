//! Chat model backend client.
//!
//! [`ChatBackend`] is the seam between the negotiation and synthesis loops
//! and the model server; tests substitute scripted backends. [`OllamaChat`]
//! speaks the Ollama-compatible `POST {url}/api/chat` protocol with
//! `stream = false`:
//!
//! ```text
//! request:  { "model": "...", "messages": [{ "role", "content" }], "stream": false }
//! response: { "message": { "role": "assistant", "content": "..." }, ... }
//! ```

use std::time::Duration;

use async_trait::async_trait;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, instrument};

use crate::config::ModelConfig;
use crate::models::ChatMessage;

/// Errors produced by a [`ChatBackend`].
#[derive(Debug, Error)]
pub enum ModelError {
    /// Connection or protocol failure before a response arrived.
    #[error("model transport error: {0}")]
    Transport(String),

    /// No response within the per-call timeout.
    #[error("model call timed out after {0:?}")]
    Timeout(Duration),

    /// Non-successful HTTP status from the backend.
    #[error("model backend returned HTTP {status}: {snippet}")]
    HttpStatus {
        status: StatusCode,
        /// First characters of the response body.
        snippet: String,
    },

    /// The response body was not the expected shape.
    #[error("failed to decode model response: {0}")]
    Decode(String),
}

impl ModelError {
    pub fn is_timeout(&self) -> bool {
        matches!(self, ModelError::Timeout(_))
    }
}

/// A chat-completion endpoint.
#[async_trait]
pub trait ChatBackend: Send + Sync {
    /// Sends the transcript and returns the assistant's reply text.
    async fn chat(&self, messages: &[ChatMessage]) -> Result<String, ModelError>;
}

/// Client for an Ollama-compatible `/api/chat` endpoint.
pub struct OllamaChat {
    client: reqwest::Client,
    model: String,
    url_chat: String,
    timeout: Duration,
}

impl OllamaChat {
    pub fn new(cfg: &ModelConfig) -> Result<Self, ModelError> {
        let timeout = cfg.call_timeout();
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| ModelError::Transport(e.to_string()))?;

        Ok(Self {
            client,
            model: cfg.model.clone(),
            url_chat: format!("{}/api/chat", cfg.url.trim().trim_end_matches('/')),
            timeout,
        })
    }

    fn map_send_error(&self, e: reqwest::Error) -> ModelError {
        if e.is_timeout() {
            ModelError::Timeout(self.timeout)
        } else {
            ModelError::Transport(e.to_string())
        }
    }
}

#[async_trait]
impl ChatBackend for OllamaChat {
    #[instrument(skip_all, fields(model = %self.model, messages = messages.len()))]
    async fn chat(&self, messages: &[ChatMessage]) -> Result<String, ModelError> {
        let body = ChatRequest {
            model: &self.model,
            messages,
            stream: false,
        };

        debug!("POST {}", self.url_chat);
        let resp = self
            .client
            .post(&self.url_chat)
            .json(&body)
            .send()
            .await
            .map_err(|e| self.map_send_error(e))?;

        let status = resp.status();
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            let snippet = text.chars().take(240).collect::<String>();
            return Err(ModelError::HttpStatus { status, snippet });
        }

        let out: ChatResponse = resp.json().await.map_err(|e| {
            if e.is_timeout() {
                ModelError::Timeout(self.timeout)
            } else {
                ModelError::Decode(format!(
                    "{e}; expected `{{ message: {{ role, content }} }}`"
                ))
            }
        })?;

        debug!(chars = out.message.content.len(), "model replied");
        Ok(out.message.content)
    }
}

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: &'a [ChatMessage],
    stream: bool,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    message: ResponseMessage,
}

#[derive(Debug, Deserialize)]
struct ResponseMessage {
    #[serde(default)]
    content: String,
}
