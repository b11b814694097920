//! Backend client pool
//!
//! Resolves logical backend ids to clients, enforces per-endpoint
//! outstanding-request ceilings, and wraps every call in the retry state
//! machine. Backend ids are resolved once at pass start, so a record
//! referencing an unknown id is a fatal configuration error rather than a
//! per-sample failure.

use anyhow::{bail, Result};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;

use super::mock_backend::MockBackend;
use super::openai_backend::OpenAiCompatBackend;
use super::retry::with_retry;
use super::traits::{BackendError, BackendErrorKind, GenerateRequest, GenerateResponse, ModelBackend};
use crate::config::{EvalConfig, RetryConfig};

struct Endpoint {
    limiter: Arc<Semaphore>,
    outstanding: Arc<AtomicUsize>,
}

struct Registration {
    backend: Arc<dyn ModelBackend>,
    retry: RetryConfig,
    endpoint_key: String,
}

/// Registry of configured backends with shared per-endpoint admission.
pub struct BackendPool {
    backends: HashMap<String, Registration>,
    endpoints: HashMap<String, Endpoint>,
}

impl BackendPool {
    pub fn new() -> Self {
        Self {
            backends: HashMap::new(),
            endpoints: HashMap::new(),
        }
    }

    /// Build the pool from configuration. Every `[[backends]]` entry becomes
    /// a client; entries sharing a base URL share one outstanding-request
    /// budget (the smallest configured ceiling wins).
    pub fn from_config(config: &EvalConfig) -> Result<Self> {
        let mut pool = Self::new();
        for backend_config in &config.backends {
            let backend: Arc<dyn ModelBackend> = match backend_config.kind.as_str() {
                "openai-compat" => Arc::new(OpenAiCompatBackend::new(backend_config)?),
                "mock" => Arc::new(MockBackend::new(backend_config.id.clone())),
                other => bail!(
                    "Backend '{}': unknown kind '{}' (expected openai-compat or mock)",
                    backend_config.id,
                    other
                ),
            };
            pool.register(backend, backend_config.retry.clone(), backend_config.max_outstanding);
        }
        Ok(pool)
    }

    /// Register a backend instance. Used by `from_config` and directly by
    /// tests that inject scripted backends.
    pub fn register(
        &mut self,
        backend: Arc<dyn ModelBackend>,
        retry: RetryConfig,
        max_outstanding: usize,
    ) {
        let endpoint_key = backend.endpoint().to_string();
        let max_outstanding = max_outstanding.max(1);
        let endpoint = self.endpoints.entry(endpoint_key.clone()).or_insert_with(|| Endpoint {
            limiter: Arc::new(Semaphore::new(max_outstanding)),
            outstanding: Arc::new(AtomicUsize::new(0)),
        });
        // Shrink the shared budget if this registration is stricter.
        let available = endpoint.limiter.available_permits();
        if max_outstanding < available {
            endpoint
                .limiter
                .forget_permits(available - max_outstanding);
        }
        self.backends.insert(
            backend.id().to_string(),
            Registration {
                backend,
                retry,
                endpoint_key,
            },
        );
    }

    /// Resolve a backend id to a submit handle. Unknown ids are a
    /// configuration error; callers resolve before dispatching any work.
    pub fn handle(&self, backend_id: &str) -> Result<BackendHandle> {
        let registration = self.backends.get(backend_id).ok_or_else(|| {
            anyhow::anyhow!(
                "Unknown backend id '{}' (configured: {:?})",
                backend_id,
                self.backends.keys().collect::<Vec<_>>()
            )
        })?;
        let endpoint = &self.endpoints[&registration.endpoint_key];
        Ok(BackendHandle {
            backend: Arc::clone(&registration.backend),
            retry: registration.retry.clone(),
            limiter: Arc::clone(&endpoint.limiter),
            outstanding: Arc::clone(&endpoint.outstanding),
        })
    }
}

impl Default for BackendPool {
    fn default() -> Self {
        Self::new()
    }
}

/// Resolved client for one backend id: admission + retry around the raw
/// backend call.
#[derive(Clone)]
pub struct BackendHandle {
    backend: Arc<dyn ModelBackend>,
    retry: RetryConfig,
    limiter: Arc<Semaphore>,
    outstanding: Arc<AtomicUsize>,
}

impl BackendHandle {
    pub fn id(&self) -> &str {
        self.backend.id()
    }

    /// Outstanding requests currently held against this handle's endpoint.
    pub fn outstanding(&self) -> usize {
        self.outstanding.load(Ordering::SeqCst)
    }

    /// Submit one request: acquire an endpoint permit per attempt, call the
    /// backend, and retry transient failures per policy. Returns the final
    /// error with total attempts once the ceiling is exhausted.
    pub async fn submit(
        &self,
        request: &GenerateRequest,
        cancel: &CancellationToken,
    ) -> Result<GenerateResponse, BackendError> {
        with_retry(&self.retry, cancel, || async {
            let permit = tokio::select! {
                permit = self.limiter.acquire() => permit.map_err(|_| {
                    BackendError::new(BackendErrorKind::Unavailable, "endpoint limiter closed")
                })?,
                _ = cancel.cancelled() => {
                    return Err(BackendError::new(BackendErrorKind::Timeout, "cancelled"));
                }
            };
            self.outstanding.fetch_add(1, Ordering::SeqCst);
            let result = self.backend.generate(request, cancel).await;
            self.outstanding.fetch_sub(1, Ordering::SeqCst);
            drop(permit);
            result
        })
        .await
    }
}
