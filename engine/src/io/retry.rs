//! One retry policy shared by every persistence call.

use std::sync::Arc;
use std::time::Duration;

use tracing::debug;

use crate::io::config::{LedgerConfig, RetryConfig};
use crate::io::repository::{RepoError, RepoResult};

/// Caller-supplied sink told about each failed attempt: `(attempt, error)`.
pub type RetrySink = Arc<dyn Fn(u32, &str) + Send + Sync>;

/// Bounded retry with linear backoff (`attempt * base_delay`).
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub retryable: fn(&RepoError) -> bool,
}

impl RetryPolicy {
    /// Retries transient storage errors.
    pub fn storage(cfg: &RetryConfig) -> Self {
        Self {
            max_attempts: cfg.max_attempts.max(1),
            base_delay: cfg.base_delay(),
            retryable: RepoError::is_retryable,
        }
    }

    /// Retries only write conflicts, used for ledger rows other writers may touch.
    pub fn conflicts(cfg: &LedgerConfig) -> Self {
        Self {
            max_attempts: cfg.conflict_attempts.max(1),
            base_delay: cfg.conflict_delay(),
            retryable: RepoError::is_conflict,
        }
    }

    /// Delay after the given 1-based failed attempt.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        self.base_delay.saturating_mul(attempt)
    }

    fn should_retry(&self, attempt: u32, err: &RepoError) -> bool {
        attempt < self.max_attempts && (self.retryable)(err)
    }

    /// Run `op` on the current thread, sleeping between attempts.
    pub fn run_blocking<T>(
        &self,
        mut op: impl FnMut() -> RepoResult<T>,
        sink: Option<&RetrySink>,
    ) -> RepoResult<T> {
        let mut attempt = 1;
        loop {
            match op() {
                Ok(value) => return Ok(value),
                Err(err) => {
                    if let Some(sink) = sink {
                        sink(attempt, &err.to_string());
                    }
                    if !self.should_retry(attempt, &err) {
                        return Err(err);
                    }
                    debug!(attempt, error = %err, "retrying blocking repository call");
                    std::thread::sleep(self.delay_for(attempt));
                    attempt += 1;
                }
            }
        }
    }

    /// Run `op` on the blocking pool per attempt; the backoff sleeps asynchronously.
    pub async fn run_async<T, F>(&self, op: F, sink: Option<&RetrySink>) -> RepoResult<T>
    where
        T: Send + 'static,
        F: Fn() -> RepoResult<T> + Send + Sync + 'static,
    {
        let op = Arc::new(op);
        let mut attempt = 1;
        loop {
            let call = Arc::clone(&op);
            let outcome = match tokio::task::spawn_blocking(move || call()).await {
                Ok(outcome) => outcome,
                Err(join) => Err(RepoError::Unavailable(format!("storage worker: {join}"))),
            };
            match outcome {
                Ok(value) => return Ok(value),
                Err(err) => {
                    if let Some(sink) = sink {
                        sink(attempt, &err.to_string());
                    }
                    if !self.should_retry(attempt, &err) {
                        return Err(err);
                    }
                    debug!(attempt, error = %err, "retrying repository call");
                    tokio::time::sleep(self.delay_for(attempt)).await;
                    attempt += 1;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn fast(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            base_delay: Duration::from_millis(1),
            retryable: RepoError::is_retryable,
        }
    }

    #[test]
    fn backoff_is_linear() {
        let policy = RetryPolicy {
            base_delay: Duration::from_millis(200),
            ..fast(3)
        };
        assert_eq!(policy.delay_for(1), Duration::from_millis(200));
        assert_eq!(policy.delay_for(3), Duration::from_millis(600));
    }

    #[test]
    fn blocking_retries_until_success_and_reports_attempts() {
        let calls = AtomicU32::new(0);
        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen_sink = Arc::clone(&seen);
        let sink: RetrySink = Arc::new(move |attempt: u32, _err: &str| {
            seen_sink.lock().expect("lock").push(attempt);
        });
        let got = fast(3).run_blocking(
            || {
                if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(RepoError::Unavailable("db".to_string()))
                } else {
                    Ok(7)
                }
            },
            Some(&sink),
        );
        assert_eq!(got.expect("ok"), 7);
        assert_eq!(*seen.lock().expect("lock"), vec![1, 2]);
    }

    #[test]
    fn non_retryable_errors_fail_fast() {
        let calls = AtomicU32::new(0);
        let got: RepoResult<()> = fast(5).run_blocking(
            || {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(RepoError::NotFound("run".to_string()))
            },
            None,
        );
        assert!(matches!(got, Err(RepoError::NotFound(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn async_gives_up_after_max_attempts() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&calls);
        let got: RepoResult<()> = fast(3)
            .run_async(
                move || {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Err(RepoError::Conflict("step".to_string()))
                },
                None,
            )
            .await;
        assert!(matches!(got, Err(RepoError::Conflict(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn conflict_policy_ignores_other_errors() {
        let policy = RetryPolicy::conflicts(&LedgerConfig::default());
        assert!((policy.retryable)(&RepoError::Conflict("x".to_string())));
        assert!(!(policy.retryable)(&RepoError::Unavailable("x".to_string())));
    }
}
