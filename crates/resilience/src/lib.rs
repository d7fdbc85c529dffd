//! In-process fault-tolerance primitives for calls to unreliable dependencies.
//!
//! Every component observes the outcome of a protected call, keeps a bounded
//! statistical or numeric state, and decides in O(1) whether the next call
//! may proceed:
//! - [`CircuitBreaker`]: six-state machine driven by a sliding outcome window
//! - [`SemaphoreBulkhead`] and [`ThreadPoolBulkhead`]: concurrency isolation
//! - [`RateLimiter`]: lock-free permit cycles with reservations
//! - [`AimdLimiter`] and [`AdaptiveBulkhead`]: AIMD concurrency control
//! - [`Retry`]: attempt counting with pluggable backoff
//! - [`TimeLimiter`]: deadline on how long a call may run
//!
//! Components publish [`ResilienceEvent`]s to synchronous listeners and are
//! shared by name through a [`Registry`].
//!
//! # Protected-call contract
//!
//! Callers that cannot use the `execute` helpers drive a component by hand:
//!
//! ```rust
//! use std::time::Instant;
//!
//! use resilience_core::CircuitBreaker;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let breaker = CircuitBreaker::new("inventory", CircuitBreaker::builder().build()?)?;
//!
//! if breaker.try_acquire_permission().is_ok() {
//!     let started = Instant::now();
//!     match std::fs::metadata("/") {
//!         Ok(_) => breaker.on_success(started.elapsed()),
//!         Err(e) => breaker.on_error(started.elapsed(), &e),
//!     }
//! }
//! # Ok(())
//! # }
//! ```

#![forbid(unsafe_code)]
#![warn(rust_2018_idioms)]
#![warn(clippy::all, clippy::perf, clippy::complexity, clippy::suspicious)]
#![cfg_attr(test, allow(clippy::unwrap_used, clippy::expect_used, clippy::panic))]
// Pedantic and nursery lints from the workspace table this API does not follow
#![allow(
    clippy::must_use_candidate,
    clippy::return_self_not_must_use,
    clippy::missing_errors_doc,
    clippy::missing_panics_doc,
    clippy::missing_const_for_fn,
    clippy::module_name_repetitions,
    clippy::cast_possible_truncation,
    clippy::cast_precision_loss,
    clippy::cast_sign_loss,
    clippy::significant_drop_tightening,
    clippy::option_if_let_else,
    clippy::redundant_pub_crate,
    clippy::future_not_send,
    clippy::doc_markdown
)]

// Foundations
// -----------------------------------------------------------------
pub mod clock;
pub mod error;
pub mod event;
pub mod interval;
pub mod window;

#[cfg(feature = "serde")]
pub mod duration_millis;

// Components
// -----------------------------------------------------------------
pub mod adaptive;
pub mod bulkhead;
pub mod circuit_breaker;
pub mod rate_limiter;
pub mod registry;
pub mod retry;
pub mod time_limiter;

// Re-export commonly used types and traits for convenience
// ------------------------
pub use adaptive::{
    AdaptiveBulkhead, AdaptiveBulkheadMetrics, AimdConfig, AimdLimiter, LimitAdjustment,
};
pub use bulkhead::{
    Bulkhead, BulkheadConfig, BulkheadMetrics, BulkheadPermit, SemaphoreBulkhead,
    ThreadPoolBulkhead, ThreadPoolBulkheadConfig, ThreadPoolBulkheadMetrics,
};
pub use circuit_breaker::{
    CircuitBreaker, CircuitBreakerConfig, CircuitBreakerConfigBuilder, CircuitBreakerMetrics,
    CircuitState,
};
pub use clock::{Clock, MockClock, SystemClock};
pub use error::{ConfigError, ConfigResult, RejectionReason, ResilienceError, ResilienceResult};
pub use event::{EventPublisher, ListenerId, ResilienceEvent};
pub use interval::IntervalFunction;
pub use rate_limiter::{RateLimiter, RateLimiterConfig, RateLimiterMetrics};
pub use registry::Registry;
pub use retry::{
    Retry, RetryConfig, RetryContext, RetryError, RetryMetrics, RetryOutcome, RetryResult,
};
pub use time_limiter::{TimeLimiter, TimeLimiterConfig, TimeLimiterMetrics};
pub use window::{Outcome, OutcomeWindow, SlidingWindowType, Snapshot, WindowConfig};
