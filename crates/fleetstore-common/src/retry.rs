//! Reusable retry policy
//!
//! One policy type drives every bounded retry in the system: fabric
//! connection attempts, NAT negotiation, per-block I/O and replication.
//! A policy is a maximum attempt count plus a backoff schedule; callers
//! supply the predicate deciding which errors are worth retrying.

use std::fmt;
use std::future::Future;
use std::time::Duration;
use tracing::debug;

/// Delay schedule between attempts
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Backoff {
    /// Retry immediately
    None,
    /// Same delay before every retry
    Fixed(Duration),
    /// Doubling delay, capped at `max`
    Exponential { initial: Duration, max: Duration },
}

impl Backoff {
    /// Delay to wait after the given (1-based) failed attempt
    #[must_use]
    pub fn delay(&self, attempt: u32) -> Duration {
        match self {
            Self::None => Duration::ZERO,
            Self::Fixed(d) => *d,
            Self::Exponential { initial, max } => {
                let factor = 1u32.checked_shl(attempt.saturating_sub(1)).unwrap_or(u32::MAX);
                initial.saturating_mul(factor).min(*max)
            }
        }
    }
}

/// Maximum attempts plus a backoff schedule
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts including the first one (at least 1)
    pub max_attempts: u32,
    pub backoff: Backoff,
}

/// Outcome of a retried operation that did not succeed
#[derive(Debug, thiserror::Error)]
pub enum RetryError<E> {
    /// Every allowed attempt failed with a retryable error
    #[error("{operation} failed after {attempts} attempts: {last}")]
    Exhausted {
        operation: &'static str,
        attempts: u32,
        last: E,
    },
    /// An attempt failed with an error the predicate refused to retry
    #[error("{operation} failed on attempt {attempts}: {last}")]
    Aborted {
        operation: &'static str,
        attempts: u32,
        last: E,
    },
}

impl<E> RetryError<E> {
    /// Number of attempts made
    pub const fn attempts(&self) -> u32 {
        match self {
            Self::Exhausted { attempts, .. } | Self::Aborted { attempts, .. } => *attempts,
        }
    }

    /// The error returned by the last attempt
    pub fn into_last(self) -> E {
        match self {
            Self::Exhausted { last, .. } | Self::Aborted { last, .. } => last,
        }
    }

    pub const fn is_exhausted(&self) -> bool {
        matches!(self, Self::Exhausted { .. })
    }
}

impl RetryPolicy {
    /// Policy with a fixed delay between attempts
    #[must_use]
    pub const fn fixed(max_attempts: u32, delay: Duration) -> Self {
        Self {
            max_attempts,
            backoff: Backoff::Fixed(delay),
        }
    }

    /// Policy allowing `retries` additional attempts after the first one
    #[must_use]
    pub const fn with_retries(retries: u32, backoff: Backoff) -> Self {
        Self {
            max_attempts: retries.saturating_add(1),
            backoff,
        }
    }

    /// Single attempt, no retry
    #[must_use]
    pub const fn once() -> Self {
        Self {
            max_attempts: 1,
            backoff: Backoff::None,
        }
    }

    /// Run `op` until it succeeds, fails with a non-retryable error, or
    /// the attempt budget is spent. `op` receives the 1-based attempt number.
    pub async fn run<T, E, F, Fut, P>(
        &self,
        operation: &'static str,
        retryable: P,
        mut op: F,
    ) -> Result<T, RetryError<E>>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        P: Fn(&E) -> bool,
        E: fmt::Display,
    {
        let max_attempts = self.max_attempts.max(1);
        let mut attempt = 0;
        loop {
            attempt += 1;
            let err = match op(attempt).await {
                Ok(value) => return Ok(value),
                Err(err) => err,
            };
            if !retryable(&err) {
                return Err(RetryError::Aborted {
                    operation,
                    attempts: attempt,
                    last: err,
                });
            }
            if attempt >= max_attempts {
                return Err(RetryError::Exhausted {
                    operation,
                    attempts: attempt,
                    last: err,
                });
            }
            let delay = self.backoff.delay(attempt);
            debug!(
                operation,
                attempt,
                max_attempts,
                delay_ms = delay.as_millis() as u64,
                error = %err,
                "retrying"
            );
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn test_exponential_backoff_caps() {
        let backoff = Backoff::Exponential {
            initial: Duration::from_millis(100),
            max: Duration::from_millis(500),
        };
        assert_eq!(backoff.delay(1), Duration::from_millis(100));
        assert_eq!(backoff.delay(2), Duration::from_millis(200));
        assert_eq!(backoff.delay(3), Duration::from_millis(400));
        assert_eq!(backoff.delay(4), Duration::from_millis(500));
        assert_eq!(backoff.delay(40), Duration::from_millis(500));
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_succeeds_after_failures() {
        let calls = AtomicU32::new(0);
        let policy = RetryPolicy::fixed(3, Duration::from_secs(5));
        let started = tokio::time::Instant::now();

        let result: Result<u32, RetryError<String>> = policy
            .run("flaky", |_| true, |attempt| {
                calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    if attempt < 3 {
                        Err(format!("attempt {attempt} failed"))
                    } else {
                        Ok(attempt)
                    }
                }
            })
            .await;

        assert_eq!(result.unwrap(), 3);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert!(started.elapsed() >= Duration::from_secs(10));
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_exhausts_budget() {
        let policy = RetryPolicy::with_retries(2, Backoff::None);
        let result: Result<(), RetryError<&str>> =
            policy.run("always-fails", |_| true, |_| async { Err("nope") }).await;

        let err = result.unwrap_err();
        assert!(err.is_exhausted());
        assert_eq!(err.attempts(), 3);
    }

    #[tokio::test]
    async fn test_retry_stops_on_non_retryable() {
        let policy = RetryPolicy::fixed(5, Duration::from_millis(1));
        let result: Result<(), RetryError<&str>> = policy
            .run("fatal", |e| *e != "fatal", |_| async { Err("fatal") })
            .await;

        let err = result.unwrap_err();
        assert!(!err.is_exhausted());
        assert_eq!(err.attempts(), 1);
    }
}
