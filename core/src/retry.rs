//! Exponential backoff for calls to flaky remote services.
//!
//! Only adapters retry. A caller decides per error whether another attempt
//! can help, so a business refusal (a declined card) is returned at once while
//! a dropped connection is tried again.
//!
//! ```rust
//! use std::time::Duration;
//! use ticketing_core::retry::{RetryPolicy, retry_if};
//!
//! # async fn example() -> Result<(), String> {
//! let policy = RetryPolicy::new(3).with_initial_delay(Duration::from_millis(50));
//! let value = retry_if(policy, || async { Ok::<_, String>(7) }, |err: &String| {
//!     err.starts_with("unavailable")
//! })
//! .await?;
//! assert_eq!(value, 7);
//! # Ok(())
//! # }
//! ```

use std::future::Future;
use std::time::Duration;

/// How often and how patiently to retry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Attempts after the first one
    pub max_retries: usize,
    /// Wait before the first retry
    pub initial_delay: Duration,
    /// Upper bound for any single wait
    pub max_delay: Duration,
    /// Growth factor between consecutive waits
    pub multiplier: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(3)
    }
}

impl RetryPolicy {
    /// `max_retries` retries starting at 100ms, doubling, capped at 30s.
    #[must_use]
    pub const fn new(max_retries: usize) -> Self {
        Self {
            max_retries,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(30),
            multiplier: 2,
        }
    }

    /// Single attempt, no waiting.
    #[must_use]
    pub const fn none() -> Self {
        Self {
            max_retries: 0,
            initial_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            multiplier: 1,
        }
    }

    /// Replace the first wait.
    #[must_use]
    pub const fn with_initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay = delay;
        self
    }

    /// Replace the cap.
    #[must_use]
    pub const fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    /// Replace the growth factor.
    #[must_use]
    pub const fn with_multiplier(mut self, multiplier: u32) -> Self {
        self.multiplier = multiplier;
        self
    }

    /// Wait before retry number `retry` (0-based).
    #[must_use]
    pub fn backoff(&self, retry: usize) -> Duration {
        let mut delay = self.initial_delay;
        for _ in 0..retry.min(64) {
            if delay >= self.max_delay {
                break;
            }
            delay = delay.saturating_mul(self.multiplier);
        }
        delay.min(self.max_delay)
    }
}

/// Run `operation` until it succeeds, fails with an error `should_retry`
/// rejects, or the policy's retries are spent.
///
/// # Errors
///
/// The last error returned by `operation`.
pub async fn retry_if<F, Fut, T, E, P>(
    policy: RetryPolicy,
    mut operation: F,
    should_retry: P,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
    P: Fn(&E) -> bool,
{
    let mut retry = 0;
    loop {
        let err = match operation().await {
            Ok(value) => {
                if retry > 0 {
                    tracing::info!(retries = retry, "Call succeeded after retrying");
                }
                return Ok(value);
            }
            Err(err) => err,
        };

        if !should_retry(&err) {
            return Err(err);
        }
        if retry >= policy.max_retries {
            tracing::warn!(retries = retry, error = %err, "Giving up");
            return Err(err);
        }

        let wait = policy.backoff(retry);
        tracing::debug!(retry, wait_ms = wait.as_millis(), error = %err, "Retrying");
        tokio::time::sleep(wait).await;
        retry += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn backoff_grows_and_caps() {
        let policy = RetryPolicy::new(5)
            .with_initial_delay(Duration::from_millis(100))
            .with_max_delay(Duration::from_millis(500));

        assert_eq!(policy.backoff(0), Duration::from_millis(100));
        assert_eq!(policy.backoff(1), Duration::from_millis(200));
        assert_eq!(policy.backoff(2), Duration::from_millis(400));
        assert_eq!(policy.backoff(3), Duration::from_millis(500));
        assert_eq!(policy.backoff(usize::MAX), Duration::from_millis(500));
        assert_eq!(RetryPolicy::none().backoff(4), Duration::ZERO);
    }

    #[tokio::test]
    async fn transient_errors_are_retried_until_success() {
        let calls = AtomicUsize::new(0);
        let policy = RetryPolicy::new(3).with_initial_delay(Duration::from_millis(1));

        let result = retry_if(
            policy,
            || {
                let call = calls.fetch_add(1, Ordering::SeqCst);
                async move { if call < 2 { Err("unavailable") } else { Ok(call) } }
            },
            |_: &&str| true,
        )
        .await;

        assert_eq!(result, Ok(2));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn retries_are_bounded() {
        let calls = AtomicUsize::new(0);
        let policy = RetryPolicy::new(2).with_initial_delay(Duration::from_millis(1));

        let result: Result<(), _> = retry_if(
            policy,
            || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err("unavailable") }
            },
            |_: &&str| true,
        )
        .await;

        assert_eq!(result, Err("unavailable"));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn rejected_errors_return_immediately() {
        let calls = AtomicUsize::new(0);

        let result: Result<(), _> = retry_if(
            RetryPolicy::default(),
            || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err("card declined") }
            },
            |err: &&str| err.starts_with("unavailable"),
        )
        .await;

        assert_eq!(result, Err("card declined"));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
