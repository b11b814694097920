//! Backend capability trait
//!
//! Defines the single contract every inference backend implements. The
//! scheduler and judge are polymorphic over this trait and never branch on
//! a concrete backend type; a backend call is an opaque operation that can
//! succeed, fail, or time out.

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio_util::sync::CancellationToken;

/// One generation request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenerateRequest {
    /// Optional system message prepended to the prompt
    pub system: Option<String>,
    pub prompt: String,
    pub max_tokens: u32,
    pub temperature: f64,
    /// Request-level seed for backends that honor it
    pub seed: Option<u64>,
}

impl GenerateRequest {
    pub fn new(prompt: impl Into<String>) -> Self {
        Self {
            system: Some("You are a helpful assistant.".to_string()),
            prompt: prompt.into(),
            max_tokens: 8192,
            temperature: 0.1,
            seed: None,
        }
    }
}

/// One generation response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenerateResponse {
    pub text: String,
    /// Output tokens reported by the backend, when available
    pub output_tokens: Option<u32>,
    /// Calls spent producing this response, set by the retry layer
    #[serde(default = "default_attempts")]
    pub attempts: u32,
}

fn default_attempts() -> u32 {
    1
}

impl GenerateResponse {
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            output_tokens: None,
            attempts: 1,
        }
    }
}

/// Failure classes a backend call can end in.
///
/// All four are transient from the caller's perspective except that the
/// retry layer has already exhausted its attempt ceiling by the time one of
/// these is returned from [`crate::backends::BackendPool::submit`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendErrorKind {
    Timeout,
    RateLimited,
    Unavailable,
    /// The endpoint answered but the body was not a usable completion
    Malformed,
}

impl BackendErrorKind {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Timeout => "timeout",
            Self::RateLimited => "rate_limited",
            Self::Unavailable => "unavailable",
            Self::Malformed => "malformed",
        }
    }
}

/// Error returned by a backend call, carrying the attempts spent on it.
#[derive(Debug, Clone, Error)]
#[error("backend error ({kind:?} after {attempts} attempts): {message}")]
pub struct BackendError {
    pub kind: BackendErrorKind,
    pub attempts: u32,
    pub message: String,
    /// Server-provided retry-after hint, seconds (rate limiting only)
    pub retry_after_secs: Option<u64>,
}

impl BackendError {
    pub fn new(kind: BackendErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            attempts: 1,
            message: message.into(),
            retry_after_secs: None,
        }
    }
}

/// Unified trait for inference backends.
///
/// `generate` performs exactly one network call; retry policy and admission
/// control live in the pool, not in the backend.
#[async_trait::async_trait]
pub trait ModelBackend: Send + Sync {
    /// Logical backend id this instance was registered under.
    fn id(&self) -> &str;

    /// Physical endpoint key used for admission control. Backends sharing a
    /// key share an outstanding-request budget.
    fn endpoint(&self) -> &str;

    /// Issue a single generation call. Implementations must return promptly
    /// once `cancel` fires (the request is abandoned, not awaited out).
    async fn generate(
        &self,
        request: &GenerateRequest,
        cancel: &CancellationToken,
    ) -> Result<GenerateResponse, BackendError>;
}
