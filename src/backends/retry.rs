//! Retry state machine for backend calls
//!
//! Each request moves through an explicit `Attempting -> Retrying(backoff)
//! -> Terminal` progression so the policy is testable without a network.
//! Backoff grows exponentially up to a cap; rate-limit errors respect the
//! server's retry-after hint when it is longer. All sleeps race the run's
//! cancellation token so shutdown never waits out a backoff timer.

use std::future::Future;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::backends::traits::{BackendError, BackendErrorKind};
use crate::config::RetryConfig;

/// Where a request currently stands in its retry progression.
#[derive(Debug, Clone, PartialEq)]
pub enum RetryState {
    /// About to issue attempt `attempt` (1-based)
    Attempting { attempt: u32 },
    /// Waiting out a backoff before the next attempt
    Retrying { attempt: u32, backoff: Duration },
    /// No further attempts will be made
    Terminal,
}

/// Pure transition function: given the policy, the attempt that just failed,
/// and its error, decide whether to retry and for how long to back off.
pub fn next_state(config: &RetryConfig, attempt: u32, error: &BackendError) -> RetryState {
    if attempt >= config.max_attempts {
        return RetryState::Terminal;
    }
    let backoff = compute_backoff(config, attempt, error);
    RetryState::Retrying {
        attempt: attempt + 1,
        backoff,
    }
}

/// Exponential backoff for the attempt that just failed (1-based), capped,
/// with the server's retry-after hint taken when larger.
fn compute_backoff(config: &RetryConfig, attempt: u32, error: &BackendError) -> Duration {
    let exp = config.initial_backoff_ms as f64
        * config.backoff_multiplier.powi(attempt.saturating_sub(1) as i32);
    let mut ms = exp.min(config.max_backoff_ms as f64) as u64;
    if error.kind == BackendErrorKind::RateLimited {
        if let Some(hint) = error.retry_after_secs {
            ms = ms.max(hint * 1000);
        }
    }
    Duration::from_millis(ms)
}

/// Drive an operation through the retry state machine.
///
/// All four [`BackendErrorKind`]s are transient here; the distinction
/// between transient and permanent failure is the attempt ceiling itself.
/// The returned error carries the total attempts spent. Cancellation during
/// a backoff ends the progression immediately with the last error.
pub async fn with_retry<F, Fut>(
    config: &RetryConfig,
    cancel: &CancellationToken,
    operation: F,
) -> Result<crate::backends::traits::GenerateResponse, BackendError>
where
    F: Fn() -> Fut,
    Fut: Future<Output = Result<crate::backends::traits::GenerateResponse, BackendError>>,
{
    let mut attempt = 1u32;
    loop {
        match operation().await {
            Ok(mut response) => {
                response.attempts = attempt;
                return Ok(response);
            }
            Err(mut error) => {
                error.attempts = attempt;
                match next_state(config, attempt, &error) {
                    RetryState::Terminal => return Err(error),
                    RetryState::Retrying { attempt: next, backoff } => {
                        tracing::warn!(
                            attempt,
                            max = config.max_attempts,
                            backoff_ms = backoff.as_millis() as u64,
                            kind = error.kind.name(),
                            "Retrying backend call after transient error"
                        );
                        tokio::select! {
                            _ = tokio::time::sleep(backoff) => {}
                            _ = cancel.cancelled() => return Err(error),
                        }
                        attempt = next;
                    }
                    RetryState::Attempting { .. } => unreachable!("next_state never yields Attempting"),
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backends::traits::GenerateResponse;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn config(max_attempts: u32) -> RetryConfig {
        RetryConfig {
            max_attempts,
            initial_backoff_ms: 1,
            backoff_multiplier: 2.0,
            max_backoff_ms: 8,
        }
    }

    fn unavailable() -> BackendError {
        BackendError::new(BackendErrorKind::Unavailable, "503")
    }

    #[test]
    fn test_backoff_grows_and_caps() {
        let cfg = config(10);
        let err = unavailable();
        let d1 = compute_backoff(&cfg, 1, &err);
        let d2 = compute_backoff(&cfg, 2, &err);
        let d5 = compute_backoff(&cfg, 5, &err);
        assert_eq!(d1, Duration::from_millis(1));
        assert_eq!(d2, Duration::from_millis(2));
        assert_eq!(d5, Duration::from_millis(8)); // capped
    }

    #[test]
    fn test_retry_after_hint_wins_when_longer() {
        let cfg = config(10);
        let mut err = BackendError::new(BackendErrorKind::RateLimited, "429");
        err.retry_after_secs = Some(2);
        assert_eq!(compute_backoff(&cfg, 1, &err), Duration::from_secs(2));
    }

    #[test]
    fn test_attempt_ceiling_is_terminal() {
        let cfg = config(3);
        assert!(matches!(
            next_state(&cfg, 2, &unavailable()),
            RetryState::Retrying { attempt: 3, .. }
        ));
        assert_eq!(next_state(&cfg, 3, &unavailable()), RetryState::Terminal);
    }

    #[tokio::test]
    async fn test_with_retry_recovers_after_transient_failures() {
        let cfg = config(5);
        let cancel = CancellationToken::new();
        let calls = AtomicU32::new(0);

        let result = with_retry(&cfg, &cancel, || {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if n < 2 {
                    Err(unavailable())
                } else {
                    Ok(GenerateResponse::new("ok"))
                }
            }
        })
        .await;

        assert_eq!(result.unwrap().text, "ok");
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_with_retry_exhaustion_reports_attempts() {
        let cfg = config(3);
        let cancel = CancellationToken::new();
        let calls = AtomicU32::new(0);

        let err = with_retry(&cfg, &cancel, || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err::<GenerateResponse, _>(unavailable()) }
        })
        .await
        .unwrap_err();

        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(err.attempts, 3);
        assert_eq!(err.kind, BackendErrorKind::Unavailable);
    }

    #[tokio::test]
    async fn test_cancellation_cuts_backoff_short() {
        let cfg = RetryConfig {
            max_attempts: 5,
            initial_backoff_ms: 60_000,
            backoff_multiplier: 2.0,
            max_backoff_ms: 60_000,
        };
        let cancel = CancellationToken::new();
        cancel.cancel();

        let start = std::time::Instant::now();
        let err = with_retry(&cfg, &cancel, || async {
            Err::<GenerateResponse, _>(unavailable())
        })
        .await
        .unwrap_err();

        assert!(start.elapsed() < Duration::from_secs(5));
        assert_eq!(err.attempts, 1);
    }
}
