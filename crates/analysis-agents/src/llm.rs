//! OpenAI-compatible chat completion client.
//!
//! Every failure is mapped onto the pipeline's error taxonomy so the agent
//! runtime can decide between a self-retry and escalation.

use std::sync::Arc;

use async_trait::async_trait;
use coordination::{AgentError, ErrorType};
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use crate::config::AgentsConfig;

/// A model that turns a system + user prompt into text.
#[async_trait]
pub trait ChatModel: Send + Sync {
    async fn complete(&self, system: &str, user: &str) -> Result<String, AgentError>;
}

/// Shared reference to a chat model
pub type SharedChatModel = Arc<dyn ChatModel>;

#[derive(Debug, Error)]
pub enum ClientBuildError {
    #[error("failed to build HTTP client: {0}")]
    Http(#[from] reqwest::Error),
}

#[derive(Debug, Serialize)]
struct ChatMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage<'a>>,
    max_tokens: u32,
    temperature: f32,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    #[serde(default)]
    choices: Vec<Choice>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: ResponseMessage,
}

#[derive(Debug, Deserialize)]
struct ResponseMessage {
    #[serde(default)]
    content: Option<String>,
}

/// Chat client over `reqwest`.
pub struct OpenAiChat {
    http: reqwest::Client,
    url: String,
    model: String,
    api_key: Option<String>,
    max_tokens: u32,
    temperature: f32,
}

impl OpenAiChat {
    pub fn new(config: &AgentsConfig) -> Result<Self, ClientBuildError> {
        let http = reqwest::Client::builder()
            .timeout(config.request_timeout())
            .build()?;
        Ok(Self {
            http,
            url: config.completions_url(),
            model: config.model.clone(),
            api_key: config.api_key.clone(),
            max_tokens: config.max_tokens,
            temperature: config.temperature,
        })
    }

    pub fn shared(self) -> SharedChatModel {
        Arc::new(self)
    }
}

#[async_trait]
impl ChatModel for OpenAiChat {
    async fn complete(&self, system: &str, user: &str) -> Result<String, AgentError> {
        let body = ChatRequest {
            model: &self.model,
            messages: vec![
                ChatMessage {
                    role: "system",
                    content: system,
                },
                ChatMessage {
                    role: "user",
                    content: user,
                },
            ],
            max_tokens: self.max_tokens,
            temperature: self.temperature,
        };

        let mut request = self.http.post(&self.url).json(&body);
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }
        let response = request.send().await.map_err(transport_error)?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(AgentError::new(
                status_error_type(status, &text),
                format!("chat endpoint returned {status}: {}", truncate(&text, 300)),
            ));
        }

        let parsed: ChatResponse = response.json().await.map_err(|e| {
            AgentError::new(ErrorType::AiError, format!("malformed completion: {e}"))
        })?;
        let content = parsed
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .map(|c| c.trim().to_string())
            .unwrap_or_default();
        if content.is_empty() {
            return Err(AgentError::new(ErrorType::AiError, "empty completion"));
        }
        debug!(model = %self.model, chars = content.len(), "Completion received");
        Ok(content)
    }
}

fn transport_error(err: reqwest::Error) -> AgentError {
    if err.is_timeout() {
        return AgentError::timeout(format!("chat request timed out: {err}"));
    }
    AgentError::classified(format!("chat request failed: {err}"))
}

/// Map an HTTP failure status onto the taxonomy.
pub fn status_error_type(status: StatusCode, body: &str) -> ErrorType {
    match status {
        StatusCode::TOO_MANY_REQUESTS => ErrorType::RateLimit,
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => ErrorType::ApiKey,
        StatusCode::REQUEST_TIMEOUT | StatusCode::GATEWAY_TIMEOUT => ErrorType::Timeout,
        s if s.is_server_error() => match ErrorType::classify(body) {
            ErrorType::Other => ErrorType::AiError,
            classified => classified,
        },
        _ => ErrorType::classify(body),
    }
}

fn truncate(text: &str, max: usize) -> &str {
    match text.char_indices().nth(max) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}
