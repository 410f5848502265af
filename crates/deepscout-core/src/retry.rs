//! Bounded retry with exponential backoff for external calls.

use std::future::Future;
use std::time::Duration;

use crate::config::RetryConfig;
use crate::error::PipelineError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Retries after the first attempt.
    pub max_retries: usize,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl RetryPolicy {
    /// Single attempt, no retries.
    pub fn none() -> Self {
        Self {
            max_retries: 0,
            initial_backoff: Duration::ZERO,
            max_backoff: Duration::ZERO,
        }
    }

    /// Delay before retry number `retry` (zero based).
    pub fn backoff_for(&self, retry: usize) -> Duration {
        let factor = 1u32.checked_shl(retry.min(31) as u32).unwrap_or(u32::MAX);
        self.initial_backoff
            .saturating_mul(factor)
            .min(self.max_backoff)
    }

    /// Run `operation` until it succeeds, fails terminally, or the retry
    /// budget is spent. The closure receives the zero based attempt number.
    pub async fn run<T, F, Fut>(&self, label: &str, mut operation: F) -> Attempted<T>
    where
        F: FnMut(usize) -> Fut,
        Fut: Future<Output = Result<T, PipelineError>>,
    {
        let mut attempt = 0;
        loop {
            match operation(attempt).await {
                Ok(value) => {
                    return Attempted {
                        result: Ok(value),
                        attempts: attempt + 1,
                    };
                }
                Err(err) if attempt < self.max_retries && err.is_retryable() => {
                    let backoff = self.backoff_for(attempt);
                    attempt += 1;
                    tracing::warn!(
                        operation = label,
                        error = %err,
                        attempt,
                        backoff_ms = backoff.as_millis() as u64,
                        "call failed, retrying"
                    );
                    tokio::time::sleep(backoff).await;
                }
                Err(err) => {
                    tracing::debug!(
                        operation = label,
                        error = %err,
                        attempt,
                        "call failed permanently"
                    );
                    return Attempted {
                        result: Err(err),
                        attempts: attempt + 1,
                    };
                }
            }
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from(&RetryConfig::default())
    }
}

impl From<&RetryConfig> for RetryPolicy {
    fn from(config: &RetryConfig) -> Self {
        Self {
            max_retries: config.max_retries,
            initial_backoff: Duration::from_millis(config.initial_backoff_ms),
            max_backoff: Duration::from_millis(config.max_backoff_ms),
        }
    }
}

/// Result of a retried call plus how many attempts it took.
#[derive(Debug)]
pub struct Attempted<T> {
    pub result: Result<T, PipelineError>,
    pub attempts: usize,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn fast(max_retries: usize) -> RetryPolicy {
        RetryPolicy {
            max_retries,
            initial_backoff: Duration::from_millis(1),
            max_backoff: Duration::from_millis(4),
        }
    }

    #[test]
    fn backoff_doubles_and_caps() {
        let policy = RetryPolicy {
            max_retries: 5,
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_millis(350),
        };
        assert_eq!(policy.backoff_for(0), Duration::from_millis(100));
        assert_eq!(policy.backoff_for(1), Duration::from_millis(200));
        assert_eq!(policy.backoff_for(2), Duration::from_millis(350));
        assert_eq!(policy.backoff_for(40), Duration::from_millis(350));
    }

    #[tokio::test]
    async fn retries_transient_failures_until_success() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let outcome = fast(3)
            .run("flaky", move |_| {
                let counter = counter.clone();
                async move {
                    if counter.fetch_add(1, Ordering::SeqCst) < 2 {
                        Err(PipelineError::search_unavailable("503", true))
                    } else {
                        Ok("done")
                    }
                }
            })
            .await;

        assert_eq!(outcome.result.unwrap(), "done");
        assert_eq!(outcome.attempts, 3);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn terminal_errors_are_not_retried() {
        let outcome = fast(3)
            .run("terminal", |_| async {
                Err::<(), _>(PipelineError::search_unavailable("401", false))
            })
            .await;
        assert!(outcome.result.is_err());
        assert_eq!(outcome.attempts, 1);
    }

    #[tokio::test]
    async fn exhausted_budget_returns_last_error() {
        let outcome = fast(2)
            .run("down", |attempt| async move {
                Err::<(), _>(PipelineError::fetch_failed(
                    "https://a.test",
                    format!("attempt {attempt}"),
                    true,
                ))
            })
            .await;
        assert_eq!(outcome.attempts, 3);
        assert!(outcome.result.unwrap_err().to_string().contains("attempt 2"));
    }

    #[tokio::test]
    async fn zero_retry_policy_makes_one_attempt() {
        let outcome = RetryPolicy::none()
            .run("once", |_| async {
                Err::<(), _>(PipelineError::search_unavailable("timeout", true))
            })
            .await;
        assert_eq!(outcome.attempts, 1);
    }
}
