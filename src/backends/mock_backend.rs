//! Scripted in-process backend
//!
//! Answers without a network: useful for smoke-testing a configuration
//! (`kind = "mock"`) and for exercising the orchestration engine in tests.
//! Outcomes can be scripted per call and per prompt substring, and every
//! call is counted.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Mutex;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use super::traits::{
    BackendError, BackendErrorKind, GenerateRequest, GenerateResponse, ModelBackend,
};

/// Outcome of one scripted call.
#[derive(Debug, Clone)]
pub enum MockOutcome {
    Succeed,
    Fail(BackendErrorKind),
}

pub struct MockBackend {
    id: String,
    endpoint: String,
    /// Consumed front-to-back, one entry per call; empty means succeed
    script: Mutex<VecDeque<MockOutcome>>,
    /// Prompts containing this substring always fail with the given kind
    poison: Option<(String, BackendErrorKind)>,
    /// Fixed reply text; defaults to echoing a prompt prefix
    reply: Option<String>,
    /// Simulated latency per call
    delay: Duration,
    calls: AtomicU32,
}

impl MockBackend {
    pub fn new(id: impl Into<String>) -> Self {
        let id = id.into();
        Self {
            endpoint: format!("mock://{}", id),
            id,
            script: Mutex::new(VecDeque::new()),
            poison: None,
            reply: None,
            delay: Duration::ZERO,
            calls: AtomicU32::new(0),
        }
    }

    /// Queue outcomes for the next calls, in order.
    pub fn with_script(self, outcomes: impl IntoIterator<Item = MockOutcome>) -> Self {
        self.script.lock().unwrap().extend(outcomes);
        self
    }

    /// Fail every call whose prompt contains `needle`.
    pub fn with_poison(mut self, needle: impl Into<String>, kind: BackendErrorKind) -> Self {
        self.poison = Some((needle.into(), kind));
        self
    }

    pub fn with_reply(mut self, text: impl Into<String>) -> Self {
        self.reply = Some(text.into());
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Total calls observed so far.
    pub fn call_count(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait::async_trait]
impl ModelBackend for MockBackend {
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
        self.calls.fetch_add(1, Ordering::SeqCst);
        if !self.delay.is_zero() {
            tokio::select! {
                _ = tokio::time::sleep(self.delay) => {}
                _ = cancel.cancelled() => {
                    return Err(BackendError::new(BackendErrorKind::Timeout, "cancelled"));
                }
            }
        }

        if let Some((needle, kind)) = &self.poison {
            if request.prompt.contains(needle.as_str()) {
                return Err(BackendError::new(*kind, format!("scripted {}", kind.name())));
            }
        }

        let outcome = self
            .script
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(MockOutcome::Succeed);
        match outcome {
            MockOutcome::Succeed => {
                let text = self.reply.clone().unwrap_or_else(|| {
                    let prefix: String = request.prompt.chars().take(32).collect();
                    format!("mock reply to: {}", prefix)
                });
                Ok(GenerateResponse::new(text))
            }
            MockOutcome::Fail(kind) => {
                Err(BackendError::new(kind, format!("scripted {}", kind.name())))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_script_consumed_in_order() {
        let backend = MockBackend::new("mock").with_script([
            MockOutcome::Fail(BackendErrorKind::Unavailable),
            MockOutcome::Succeed,
        ]);
        let cancel = CancellationToken::new();
        let req = GenerateRequest::new("hi");

        assert!(backend.generate(&req, &cancel).await.is_err());
        assert!(backend.generate(&req, &cancel).await.is_ok());
        // Script drained: subsequent calls succeed.
        assert!(backend.generate(&req, &cancel).await.is_ok());
        assert_eq!(backend.call_count(), 3);
    }

    #[tokio::test]
    async fn test_poisoned_prompt_always_fails() {
        let backend =
            MockBackend::new("mock").with_poison("sample_X", BackendErrorKind::Unavailable);
        let cancel = CancellationToken::new();

        let poisoned = GenerateRequest::new("this is sample_X payload");
        let err = backend.generate(&poisoned, &cancel).await.unwrap_err();
        assert_eq!(err.kind, BackendErrorKind::Unavailable);

        let clean = GenerateRequest::new("another sample");
        assert!(backend.generate(&clean, &cancel).await.is_ok());
    }
}
