//! Bounded retry policy for transient I/O on the reload path.
//!
//! The policy is data, not control flow: the delay is injected through it,
//! so tests run with a zero delay instead of mocking a clock. No timeout is
//! imposed on an individual attempt; slow removable media are tolerated and
//! the only bound is the attempt counter.

use std::future::Future;
use std::time::Duration;
use tracing::warn;

/// Bounded-attempt retry policy with a fixed inter-attempt delay
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Maximum number of attempts, including the first; clamped to at
    /// least one
    pub max_attempts: u32,
    /// Fixed delay between attempts
    pub delay: Duration,
}

impl RetryPolicy {
    /// Create a policy
    #[must_use]
    pub const fn new(max_attempts: u32, delay: Duration) -> Self {
        Self {
            max_attempts,
            delay,
        }
    }

    /// Policy that tries exactly once
    #[must_use]
    pub const fn once() -> Self {
        Self::new(1, Duration::ZERO)
    }

    /// Run `op` until it succeeds or the attempt budget is exhausted.
    ///
    /// Every error kind is retried; the budget is the only bound. The last
    /// error is returned when the budget runs out.
    ///
    /// # Errors
    ///
    /// Returns the final attempt's error once `max_attempts` is reached.
    pub async fn run<T, E, F, Fut>(&self, what: &str, mut op: F) -> Result<Retried<T>, E>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: std::fmt::Display,
    {
        let budget = self.max_attempts.max(1);
        let mut attempt = 0;
        loop {
            attempt += 1;
            match op().await {
                Ok(value) => {
                    return Ok(Retried {
                        value,
                        attempts: attempt,
                    })
                }
                Err(err) if attempt < budget => {
                    warn!("{what} failed (attempt {attempt}/{budget}): {err}; retrying");
                    if !self.delay.is_zero() {
                        tokio::time::sleep(self.delay).await;
                    }
                }
                Err(err) => return Err(err),
            }
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(
            crate::DEFAULT_RELOAD_ATTEMPTS,
            Duration::from_millis(crate::DEFAULT_RETRY_DELAY_MS),
        )
    }
}

/// A successful outcome plus the number of attempts it took
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Retried<T> {
    /// The operation's result
    pub value: T,
    /// Attempts consumed, starting at one
    pub attempts: u32,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn flaky(failures: u32) -> impl FnMut() -> std::future::Ready<Result<u32, String>> {
        let remaining = AtomicU32::new(failures);
        move || {
            if remaining
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
            {
                std::future::ready(Err("transient".to_string()))
            } else {
                std::future::ready(Ok(42))
            }
        }
    }

    #[tokio::test]
    async fn test_first_attempt_success() {
        let policy = RetryPolicy::new(5, Duration::ZERO);
        let outcome = policy.run("op", flaky(0)).await.expect("should succeed");
        assert_eq!(outcome.value, 42);
        assert_eq!(outcome.attempts, 1);
    }

    #[tokio::test]
    async fn test_success_after_transient_failures() {
        let policy = RetryPolicy::new(5, Duration::ZERO);
        let outcome = policy.run("op", flaky(3)).await.expect("should succeed");
        assert_eq!(outcome.attempts, 4);
    }

    #[tokio::test]
    async fn test_budget_exhaustion_returns_last_error() {
        let policy = RetryPolicy::new(3, Duration::ZERO);
        let err = policy.run("op", flaky(10)).await.expect_err("should fail");
        assert_eq!(err, "transient");
    }

    #[tokio::test]
    async fn test_zero_attempts_clamped_to_one() {
        let policy = RetryPolicy::new(0, Duration::ZERO);
        let outcome = policy.run("op", flaky(0)).await.expect("should succeed");
        assert_eq!(outcome.attempts, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_delay_applied_between_attempts() {
        let policy = RetryPolicy::new(3, Duration::from_millis(100));
        let start = tokio::time::Instant::now();
        let outcome = policy.run("op", flaky(2)).await.expect("should succeed");
        assert_eq!(outcome.attempts, 3);
        assert!(start.elapsed() >= Duration::from_millis(200));
    }
}
