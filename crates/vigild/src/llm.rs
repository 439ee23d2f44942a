//! Language-model client.
//!
//! Talks to a chat-completions-compatible endpoint with a single user
//! message per request. Long timeout and a small retry budget: patch
//! generation on a local model can legitimately take minutes.

use serde::Deserialize;
use serde_json::json;
use std::future::Future;
use std::time::Duration;
use thiserror::Error;
use tracing::{info, warn};

use crate::secrets;

#[derive(Debug, Error)]
pub enum LlmError {
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("unexpected response shape: {0}")]
    BadResponse(String),
    #[error("all retries exhausted")]
    RetriesExhausted,
}

pub type Result<T> = std::result::Result<T, LlmError>;

/// Seam between the workflow engine and the model endpoint. Tests stub this.
pub trait ModelClient: Send + Sync {
    /// Send one user message and return the response text.
    fn complete(&self, prompt: &str) -> impl Future<Output = Result<String>> + Send;
}

/// Client configuration, derived from the daemon config.
#[derive(Debug, Clone)]
pub struct LlmConfig {
    pub base_url: String,
    pub model: String,
    pub max_tokens: u32,
    pub temperature: f64,
    pub timeout_sec: u32,
    pub retries: u32,
    pub retry_backoff_sec: u32,
}

impl LlmConfig {
    pub fn from_config(config: &vigil_core::Config) -> Self {
        Self {
            base_url: config.llm_base_url.clone(),
            model: config.llm_model.clone(),
            max_tokens: config.llm_max_tokens,
            temperature: config.llm_temperature,
            timeout_sec: config.llm_timeout_sec,
            retries: config.llm_retries,
            retry_backoff_sec: config.llm_retry_backoff_sec,
        }
    }
}

/// HTTP implementation over reqwest.
#[derive(Debug, Clone)]
pub struct HttpModelClient {
    client: reqwest::Client,
    config: LlmConfig,
    api_key: Option<String>,
}

#[derive(Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: ChatMessage,
}

#[derive(Deserialize)]
struct ChatMessage {
    content: String,
}

impl HttpModelClient {
    pub fn new(config: LlmConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(u64::from(config.timeout_sec)))
            .build()?;
        Ok(Self {
            client,
            config,
            api_key: secrets::llm_api_key(),
        })
    }

    async fn request_once(&self, prompt: &str) -> Result<String> {
        let body = json!({
            "model": self.config.model,
            "messages": [{"role": "user", "content": prompt}],
            "max_tokens": self.config.max_tokens,
            "temperature": self.config.temperature,
        });

        let mut request = self
            .client
            .post(format!("{}/chat/completions", self.config.base_url))
            .json(&body);
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key).header("X-API-Key", key);
        }

        let response = request.send().await?.error_for_status()?;
        let parsed: ChatResponse = response
            .json()
            .await
            .map_err(|e| LlmError::BadResponse(e.to_string()))?;

        parsed
            .choices
            .into_iter()
            .next()
            .map(|c| c.message.content)
            .ok_or_else(|| LlmError::BadResponse("empty choices".to_string()))
    }
}

impl ModelClient for HttpModelClient {
    async fn complete(&self, prompt: &str) -> Result<String> {
        let max_attempts = self.config.retries + 1;
        let mut last_error: Option<LlmError> = None;

        for attempt in 1..=max_attempts {
            match self.request_once(prompt).await {
                Ok(text) => {
                    info!(
                        attempt,
                        prompt_len = prompt.len(),
                        response_len = text.len(),
                        "model call completed"
                    );
                    return Ok(text);
                }
                Err(e) => {
                    warn!(attempt, max_attempts, error = %e, "model call failed");
                    last_error = Some(e);
                    if attempt < max_attempts {
                        tokio::time::sleep(Duration::from_secs(u64::from(
                            self.config.retry_backoff_sec,
                        )))
                        .await;
                    }
                }
            }
        }

        Err(last_error.unwrap_or(LlmError::RetriesExhausted))
    }
}
