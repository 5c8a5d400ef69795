//! # Ticketing Core
//!
//! Shared building blocks for the ticketing workspace that carry no domain
//! knowledge of their own.
//!
//! - [`environment`]: injected dependencies (the [`Clock`](environment::Clock)
//!   used for every business cutoff)
//! - [`retry`]: exponential backoff for adapters that talk to flaky remote
//!   services
//!
//! Domain types, services and persistence live in the `ticketing` crate.

#![forbid(unsafe_code)]

pub mod environment;
pub mod retry;

// Re-export commonly used types
pub use chrono::{DateTime, Utc};
pub use environment::{Clock, SystemClock};
pub use retry::{RetryPolicy, retry_if};
