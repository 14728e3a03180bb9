//! Retry policy for Output sends.
//!
//! # Design Decisions
//! - Only errors that say so are retried (`Retryable`)
//! - Attempts are bounded; the caller counts what is finally dropped
//! - Delays come from [`calculate_backoff`], so they are jittered and capped

use std::future::Future;
use std::time::Duration;

use super::backoff::calculate_backoff;
use crate::config::schema::RetryConfig;
use crate::error::OutputError;

/// Errors that know whether another attempt could succeed.
pub trait Retryable {
    fn is_retryable(&self) -> bool;
}

impl Retryable for OutputError {
    fn is_retryable(&self) -> bool {
        OutputError::is_retryable(self)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total tries, including the first one.
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(2),
        }
    }
}

/// Result of a retried operation.
#[derive(Debug)]
pub struct RetryOutcome<T, E> {
    pub result: Result<T, E>,
    pub attempts: u32,
}

impl RetryPolicy {
    /// Policy from the `[retries]` section, optionally overriding the attempt count.
    pub fn from_config(config: &RetryConfig, max_attempts: Option<u32>) -> Self {
        Self {
            max_attempts: max_attempts.unwrap_or(config.max_attempts).max(1),
            base_delay: Duration::from_millis(config.base_delay_ms),
            max_delay: Duration::from_millis(config.max_delay_ms),
        }
    }

    /// A policy that never retries.
    pub fn once() -> Self {
        Self {
            max_attempts: 1,
            ..Self::default()
        }
    }

    pub fn delay(&self, attempt: u32) -> Duration {
        calculate_backoff(
            attempt,
            self.base_delay.as_millis() as u64,
            self.max_delay.as_millis() as u64,
        )
    }

    /// Run `op` until it succeeds, fails with a permanent error, or runs out of attempts.
    pub async fn run<T, E, F, Fut>(&self, mut op: F) -> RetryOutcome<T, E>
    where
        E: Retryable + std::fmt::Display,
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let mut attempt = 0;
        loop {
            let delay = self.delay(attempt);
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }

            match op(attempt).await {
                Ok(value) => {
                    return RetryOutcome {
                        result: Ok(value),
                        attempts: attempt + 1,
                    }
                }
                Err(e) if e.is_retryable() && attempt + 1 < self.max_attempts => {
                    tracing::debug!(attempt = attempt + 1, error = %e, "Retrying after failure");
                    attempt += 1;
                }
                Err(e) => {
                    return RetryOutcome {
                        result: Err(e),
                        attempts: attempt + 1,
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test(start_paused = true)]
    async fn retries_until_success() {
        let calls = AtomicU32::new(0);
        let calls = &calls;
        let policy = RetryPolicy::default();
        let outcome = policy
            .run(|_| async move {
                if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(OutputError::Unavailable("refused".into()))
                } else {
                    Ok(())
                }
            })
            .await;
        assert!(outcome.result.is_ok());
        assert_eq!(outcome.attempts, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn gives_up_after_max_attempts() {
        let policy = RetryPolicy {
            max_attempts: 2,
            ..RetryPolicy::default()
        };
        let outcome: RetryOutcome<(), _> = policy
            .run(|_| async { Err(OutputError::Unavailable("down".into())) })
            .await;
        assert!(outcome.result.is_err());
        assert_eq!(outcome.attempts, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn permanent_errors_are_not_retried() {
        let outcome: RetryOutcome<(), _> = RetryPolicy::default()
            .run(|_| async { Err(OutputError::Rejected("not http".into())) })
            .await;
        assert_eq!(outcome.attempts, 1);
    }
}
