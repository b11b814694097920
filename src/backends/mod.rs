//! Model backend abstraction
//!
//! Provides a unified capability trait for inference backends and the
//! client pool that routes, rate-caps, and retries calls against them:
//! - openai-compat (HTTP chat-completions dialect)
//! - mock (scripted, for config smoke tests and the test suite)

pub mod mock_backend;
pub mod openai_backend;
pub mod pool;
pub mod retry;
pub mod traits;

pub use mock_backend::{MockBackend, MockOutcome};
pub use openai_backend::OpenAiCompatBackend;
pub use pool::{BackendHandle, BackendPool};
pub use retry::{next_state, with_retry, RetryState};
pub use traits::{
    BackendError, BackendErrorKind, GenerateRequest, GenerateResponse, ModelBackend,
};
