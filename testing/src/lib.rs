//! # Ticketing Testing
//!
//! Test doubles for the environment traits in `ticketing-core`.
//!
//! ## Example
//!
//! ```
//! use ticketing_testing::{MockClock, test_clock};
//! use ticketing_core::environment::Clock;
//! use chrono::Duration;
//!
//! let clock = MockClock::new(test_clock().now());
//! let start = clock.now();
//! clock.advance(Duration::minutes(5));
//! assert_eq!(clock.now() - start, Duration::minutes(5));
//! ```

#![forbid(unsafe_code)]

use chrono::{DateTime, Utc};
use ticketing_core::environment::Clock;

/// Mock implementations of Environment traits
pub mod mocks {
    use super::{Clock, DateTime, Utc};
    use chrono::Duration;
    use std::sync::{Arc, RwLock};

    /// Fixed clock for deterministic tests
    ///
    /// Always returns the same time, making tests reproducible.
    ///
    /// # Example
    ///
    /// ```
    /// use ticketing_testing::mocks::FixedClock;
    /// use ticketing_core::environment::Clock;
    /// use chrono::Utc;
    ///
    /// let clock = FixedClock::new(Utc::now());
    /// assert_eq!(clock.now(), clock.now());
    /// ```
    #[derive(Debug, Clone)]
    pub struct FixedClock {
        time: DateTime<Utc>,
    }

    impl FixedClock {
        /// Create a new fixed clock with the given time
        #[must_use]
        pub const fn new(time: DateTime<Utc>) -> Self {
            Self { time }
        }
    }

    impl Clock for FixedClock {
        fn now(&self) -> DateTime<Utc> {
            self.time
        }
    }

    /// A clock tests can move around.
    ///
    /// Clones share the same instant, so a test can keep one handle while the
    /// service under test holds another.
    #[derive(Debug, Clone)]
    pub struct MockClock {
        time: Arc<RwLock<DateTime<Utc>>>,
    }

    impl MockClock {
        /// Create a clock starting at `time`.
        #[must_use]
        pub fn new(time: DateTime<Utc>) -> Self {
            Self {
                time: Arc::new(RwLock::new(time)),
            }
        }

        /// Jump to an absolute instant.
        pub fn set(&self, time: DateTime<Utc>) {
            let mut guard = self
                .time
                .write()
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            *guard = time;
        }

        /// Move the clock forward (or backward, with a negative duration).
        pub fn advance(&self, by: Duration) {
            let mut guard = self
                .time
                .write()
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            *guard += by;
        }
    }

    impl Clock for MockClock {
        fn now(&self) -> DateTime<Utc> {
            *self
                .time
                .read()
                .unwrap_or_else(std::sync::PoisonError::into_inner)
        }
    }

    /// Create a default fixed clock for tests (2025-01-01 00:00:00 UTC)
    #[must_use]
    pub fn test_clock() -> FixedClock {
        FixedClock::new(DateTime::<Utc>::from_timestamp(1_735_689_600, 0).unwrap_or_default())
    }
}

/// Install a `tracing` subscriber that writes through the test harness.
///
/// Safe to call from every test; only the first call installs anything.
pub fn init_test_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "ticketing=debug".into()),
        )
        .with_test_writer()
        .try_init();
}

// Re-export commonly used items
pub use mocks::{FixedClock, MockClock, test_clock};

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn test_fixed_clock() {
        let clock = test_clock();
        assert_eq!(clock.now(), clock.now());
        assert_eq!(clock.now().to_rfc3339(), "2025-01-01T00:00:00+00:00");
    }

    #[test]
    fn test_mock_clock_shares_time_between_clones() {
        let clock = MockClock::new(test_clock().now());
        let handle = clock.clone();
        handle.advance(Duration::hours(2));
        assert_eq!(clock.now(), test_clock().now() + Duration::hours(2));

        clock.set(test_clock().now());
        assert_eq!(handle.now(), test_clock().now());
    }
}
