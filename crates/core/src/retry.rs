//! Bounded exponential-backoff retries for transient store failures.
//!
//! Callers wrap a fallible async operation in [`retry`]; errors that report
//! [`Retryable::is_retryable`] as `false` (permission denied, invalid
//! argument, disabled account) are returned immediately, everything else is
//! retried until [`RetryPolicy::max_attempts`] is exhausted.

use std::future::Future;
use std::time::Duration;

/// Classification hook for error types passed through [`retry`].
pub trait Retryable {
    fn is_retryable(&self) -> bool;
}

/// Tunable parameters for the exponential-backoff strategy.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Total attempts including the first one.
    pub max_attempts: u32,
    /// Delay before the second attempt.
    pub initial_delay: Duration,
    /// Upper bound on the delay between attempts.
    pub max_delay: Duration,
    /// Factor by which the delay grows after each failure.
    pub multiplier: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 4,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(1),
            multiplier: 2.0,
        }
    }
}

impl RetryPolicy {
    /// A policy that never retries.
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            ..Default::default()
        }
    }
}

/// Calculate the next backoff delay from the current delay and policy.
///
/// The result is clamped to [`RetryPolicy::max_delay`].
pub fn next_delay(current: Duration, policy: &RetryPolicy) -> Duration {
    let next_ms = (current.as_millis() as f64 * policy.multiplier) as u64;
    Duration::from_millis(next_ms).min(policy.max_delay)
}

/// Run `op` until it succeeds, fails with a non-retryable error, or the
/// policy's attempts are exhausted. The last error is returned.
pub async fn retry<T, E, F, Fut>(policy: &RetryPolicy, operation: &str, mut op: F) -> Result<T, E>
where
    E: Retryable + std::fmt::Display,
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    let mut delay = policy.initial_delay;
    let mut attempt = 0u32;

    loop {
        attempt += 1;
        match op().await {
            Ok(value) => {
                if attempt > 1 {
                    tracing::debug!(operation, attempt, "Operation succeeded after retry");
                }
                return Ok(value);
            }
            Err(e) if !e.is_retryable() => {
                tracing::debug!(operation, error = %e, "Non-retryable failure");
                return Err(e);
            }
            Err(e) if attempt >= policy.max_attempts.max(1) => {
                tracing::error!(operation, attempt, error = %e, "Retries exhausted");
                return Err(e);
            }
            Err(e) => {
                tracing::warn!(
                    operation,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    error = %e,
                    "Transient failure, retrying",
                );
                tokio::time::sleep(delay).await;
                delay = next_delay(delay, policy);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::cell::Cell;

    use super::*;

    #[derive(Debug)]
    enum TestError {
        Transient,
        Fatal,
    }

    impl std::fmt::Display for TestError {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            write!(f, "{self:?}")
        }
    }

    impl Retryable for TestError {
        fn is_retryable(&self) -> bool {
            matches!(self, TestError::Transient)
        }
    }

    #[test]
    fn next_delay_doubles() {
        let policy = RetryPolicy::default();
        let d = next_delay(Duration::from_millis(100), &policy);
        assert_eq!(d, Duration::from_millis(200));
    }

    #[test]
    fn next_delay_clamps_at_max() {
        let policy = RetryPolicy::default();
        let d = next_delay(Duration::from_millis(800), &policy);
        assert_eq!(d, Duration::from_secs(1));
    }

    #[test]
    fn full_backoff_sequence() {
        let policy = RetryPolicy::default();
        let mut delay = policy.initial_delay;
        let expected = [100, 200, 400, 800, 1000, 1000];

        for &expected_ms in &expected {
            assert_eq!(delay.as_millis() as u64, expected_ms);
            delay = next_delay(delay, &policy);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn transient_errors_are_retried_until_success() {
        let calls = Cell::new(0u32);
        let result: Result<u32, TestError> = retry(&RetryPolicy::default(), "test", || {
            calls.set(calls.get() + 1);
            let n = calls.get();
            async move {
                if n < 3 {
                    Err(TestError::Transient)
                } else {
                    Ok(n)
                }
            }
        })
        .await;
        assert_eq!(result.unwrap(), 3);
        assert_eq!(calls.get(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn fatal_errors_are_not_retried() {
        let calls = Cell::new(0u32);
        let result: Result<(), TestError> = retry(&RetryPolicy::default(), "test", || {
            calls.set(calls.get() + 1);
            async { Err(TestError::Fatal) }
        })
        .await;
        assert!(matches!(result, Err(TestError::Fatal)));
        assert_eq!(calls.get(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn attempts_are_bounded() {
        let calls = Cell::new(0u32);
        let policy = RetryPolicy {
            max_attempts: 3,
            ..Default::default()
        };
        let result: Result<(), TestError> = retry(&policy, "test", || {
            calls.set(calls.get() + 1);
            async { Err(TestError::Transient) }
        })
        .await;
        assert!(result.is_err());
        assert_eq!(calls.get(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn no_retry_policy_makes_one_attempt() {
        let calls = Cell::new(0u32);
        let result: Result<(), TestError> = retry(&RetryPolicy::none(), "test", || {
            calls.set(calls.get() + 1);
            async { Err(TestError::Transient) }
        })
        .await;
        assert!(result.is_err());
        assert_eq!(calls.get(), 1);
    }
}
