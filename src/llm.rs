use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

use crate::error::QueryBridgeError;

/// Highest temperature the client will send; extraction must stay near-deterministic.
pub const MAX_TEMPERATURE: f32 = 0.2;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: "system".to_string(),
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user".to_string(),
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: "assistant".to_string(),
            content: content.into(),
        }
    }
}

/// Explicit failure signals of a completion call.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum CompletionError {
    #[error("completion timed out: {0}")]
    Timeout(String),

    #[error("completion rate limited: {0}")]
    RateLimited(String),

    #[error("malformed completion response: {0}")]
    Malformed(String),

    #[error("completion request failed: {0}")]
    Transport(String),
}

impl From<CompletionError> for QueryBridgeError {
    fn from(err: CompletionError) -> Self {
        QueryBridgeError::Completion(err.to_string())
    }
}

/// Prompt in, text out.
#[async_trait]
pub trait CompletionService: Send + Sync {
    fn model(&self) -> &str;

    async fn complete(
        &self,
        messages: &[ChatMessage],
    ) -> std::result::Result<String, CompletionError>;
}

/// OpenAI-compatible chat-completions client.
pub struct LlmClient {
    http: reqwest::Client,
    api_key: String,
    base_url: String,
    model: String,
    temperature: f32,
    max_tokens: u32,
    timeout: Duration,
}

impl LlmClient {
    pub fn new(api_key: String) -> Self {
        Self {
            http: reqwest::Client::new(),
            api_key,
            base_url: "https://api.openai.com/v1".to_string(),
            model: "gpt-4o-mini".to_string(),
            temperature: 0.0,
            max_tokens: 1000,
            timeout: Duration::from_secs(60),
        }
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into().trim_end_matches('/').to_string();
        self
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = model.into();
        self
    }

    /// Clamped to `[0, MAX_TEMPERATURE]`.
    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = temperature.clamp(0.0, MAX_TEMPERATURE);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn temperature(&self) -> f32 {
        self.temperature
    }

    fn request_body(&self, messages: &[ChatMessage]) -> serde_json::Value {
        serde_json::json!({
            "model": self.model,
            "messages": messages,
            "temperature": self.temperature,
            "max_tokens": self.max_tokens,
            "response_format": {"type": "json_object"}
        })
    }
}

#[async_trait]
impl CompletionService for LlmClient {
    fn model(&self) -> &str {
        &self.model
    }

    async fn complete(
        &self,
        messages: &[ChatMessage],
    ) -> std::result::Result<String, CompletionError> {
        debug!("Calling {} with {} messages", self.model, messages.len());
        let response = self
            .http
            .post(format!("{}/chat/completions", self.base_url))
            .header("Authorization", format!("Bearer {}", self.api_key))
            .header("Content-Type", "application/json")
            .timeout(self.timeout)
            .json(&self.request_body(messages))
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    CompletionError::Timeout(e.to_string())
                } else {
                    CompletionError::Transport(e.to_string())
                }
            })?;

        let status = response.status();
        if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
            let body = response.text().await.unwrap_or_default();
            return Err(CompletionError::RateLimited(body));
        }
        if status == reqwest::StatusCode::REQUEST_TIMEOUT
            || status == reqwest::StatusCode::GATEWAY_TIMEOUT
        {
            return Err(CompletionError::Timeout(format!("HTTP {}", status)));
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(CompletionError::Transport(format!("HTTP {}: {}", status, body)));
        }

        let response_json: serde_json::Value = response
            .json()
            .await
            .map_err(|e| {
                CompletionError::Malformed(format!("Failed to parse LLM response: {}", e))
            })?;

        extract_content(&response_json)
    }
}

fn extract_content(
    response_json: &serde_json::Value,
) -> std::result::Result<String, CompletionError> {
    response_json["choices"][0]["message"]["content"]
        .as_str()
        .map(str::to_string)
        .ok_or_else(|| CompletionError::Malformed("No content in LLM response".to_string()))
}
