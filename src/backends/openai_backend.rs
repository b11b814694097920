//! OpenAI-compatible HTTP backend
//!
//! Speaks the `/chat/completions` JSON dialect served by OpenAI, DashScope,
//! vLLM, and most self-hosted gateways. One instance per configured backend
//! id; ids pointing at the same base URL share an endpoint key for
//! admission control in the pool.

use serde::Deserialize;
use serde_json::json;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use super::traits::{
    BackendError, BackendErrorKind, GenerateRequest, GenerateResponse, ModelBackend,
};
use crate::config::BackendConfig;

pub struct OpenAiCompatBackend {
    id: String,
    endpoint: String,
    model: String,
    api_key: Option<String>,
    client: reqwest::Client,
}

impl OpenAiCompatBackend {
    /// Build a backend from its registration. A configured but unset API-key
    /// environment variable is a configuration error, caught before any
    /// sample is dispatched.
    pub fn new(config: &BackendConfig) -> anyhow::Result<Self> {
        let api_key = match &config.api_key_env {
            Some(var) => Some(std::env::var(var).map_err(|_| {
                anyhow::anyhow!("Backend '{}': environment variable {} is not set", config.id, var)
            })?),
            None => None,
        };
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()?;
        Ok(Self {
            id: config.id.clone(),
            endpoint: config.base_url.trim_end_matches('/').to_string(),
            model: config.model.clone(),
            api_key,
            client,
        })
    }

    fn classify(status: reqwest::StatusCode, body: &str) -> BackendError {
        let kind = if status.as_u16() == 429 {
            BackendErrorKind::RateLimited
        } else if status.as_u16() == 408 {
            BackendErrorKind::Timeout
        } else if status.is_server_error() {
            BackendErrorKind::Unavailable
        } else {
            BackendErrorKind::Malformed
        };
        let snippet: String = body.chars().take(200).collect();
        BackendError::new(kind, format!("HTTP {}: {}", status.as_u16(), snippet))
    }
}

#[derive(Debug, Deserialize)]
struct ChatCompletionResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatMessage,
}

#[derive(Debug, Deserialize)]
struct ChatMessage {
    content: Option<String>,
}

#[async_trait::async_trait]
impl ModelBackend for OpenAiCompatBackend {
    fn id(&self) -> &str {
        &self.id
    }

    fn endpoint(&self) -> &str {
        &self.endpoint
    }

    async fn generate(
        &self,
        request: &GenerateRequest,
        cancel: &CancellationToken,
    ) -> Result<GenerateResponse, BackendError> {
        let mut messages = Vec::with_capacity(2);
        if let Some(system) = &request.system {
            messages.push(json!({ "role": "system", "content": system }));
        }
        messages.push(json!({ "role": "user", "content": request.prompt }));

        let mut body = json!({
            "model": self.model,
            "messages": messages,
            "max_tokens": request.max_tokens,
            "temperature": request.temperature,
        });
        if let Some(seed) = request.seed {
            body["seed"] = json!(seed);
        }

        let mut http = self
            .client
            .post(format!("{}/chat/completions", self.endpoint))
            .json(&body);
        if let Some(key) = &self.api_key {
            http = http.bearer_auth(key);
        }

        let response = tokio::select! {
            result = http.send() => result.map_err(|e| {
                if e.is_timeout() {
                    BackendError::new(BackendErrorKind::Timeout, e.to_string())
                } else {
                    BackendError::new(BackendErrorKind::Unavailable, e.to_string())
                }
            })?,
            _ = cancel.cancelled() => {
                return Err(BackendError::new(BackendErrorKind::Timeout, "cancelled"));
            }
        };

        let status = response.status();
        if !status.is_success() {
            let retry_after = response
                .headers()
                .get("retry-after")
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.parse::<u64>().ok());
            let body = response.text().await.unwrap_or_default();
            let mut error = Self::classify(status, &body);
            error.retry_after_secs = retry_after;
            return Err(error);
        }

        let parsed: ChatCompletionResponse = response.json().await.map_err(|e| {
            BackendError::new(BackendErrorKind::Malformed, format!("Invalid completion body: {}", e))
        })?;
        let text = parsed
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .ok_or_else(|| {
                BackendError::new(BackendErrorKind::Malformed, "Completion had no content")
            })?;

        Ok(GenerateResponse::new(text))
    }
}
