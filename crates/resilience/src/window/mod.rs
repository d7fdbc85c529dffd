//! Sliding windows of call outcomes
//!
//! A window aggregates the most recent outcomes of a protected call and
//! hands back an immutable [`Snapshot`] after every write. Two shapes are
//! provided:
//!
//! - [`CountWindow`]: the last N outcomes, lock-free slot replacement
//! - [`TimeWindow`]: the outcomes of the last N seconds, one bucket per second
//!
//! Both keep running totals updated by delta so producing a snapshot never
//! walks the ring. Rates in a snapshot are the sentinel `-1.0` until the
//! window holds at least `minimum_number_of_calls` outcomes.

mod count;
mod time;

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

pub use count::CountWindow;
pub use time::TimeWindow;

use crate::clock::Clock;
use crate::error::{ConfigError, ConfigResult};

/// Rate reported while the window has too few calls to be meaningful
pub const NOT_ENOUGH_CALLS: f64 = -1.0;

/// Classification of one completed call
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum Outcome {
    /// Completed within the slow-call threshold
    Success,
    /// Completed, but slower than the threshold
    SlowSuccess,
    /// Failed within the slow-call threshold
    Error,
    /// Failed after exceeding the threshold
    SlowError,
}

impl Outcome {
    /// Combine a success flag with a slowness flag
    pub const fn classify(success: bool, slow: bool) -> Self {
        match (success, slow) {
            (true, false) => Self::Success,
            (true, true) => Self::SlowSuccess,
            (false, false) => Self::Error,
            (false, true) => Self::SlowError,
        }
    }

    /// Classify by comparing the call duration to a slow-call threshold
    pub fn from_duration(success: bool, duration: Duration, slow_threshold: Duration) -> Self {
        Self::classify(success, duration > slow_threshold)
    }

    /// `Error` or `SlowError`
    pub const fn is_error(self) -> bool {
        matches!(self, Self::Error | Self::SlowError)
    }

    /// `SlowSuccess` or `SlowError`
    pub const fn is_slow(self) -> bool {
        matches!(self, Self::SlowSuccess | Self::SlowError)
    }

    pub(crate) const fn code(self) -> u64 {
        match self {
            Self::Success => 0,
            Self::SlowSuccess => 1,
            Self::Error => 2,
            Self::SlowError => 3,
        }
    }

    pub(crate) const fn from_code(code: u64) -> Self {
        match code & 0b11 {
            0 => Self::Success,
            1 => Self::SlowSuccess,
            2 => Self::Error,
            _ => Self::SlowError,
        }
    }
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Success => write!(f, "SUCCESS"),
            Self::SlowSuccess => write!(f, "SLOW_SUCCESS"),
            Self::Error => write!(f, "ERROR"),
            Self::SlowError => write!(f, "SLOW_ERROR"),
        }
    }
}

/// Immutable aggregate over a window at one instant
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Snapshot {
    /// Calls currently held by the window
    pub total_calls: u64,
    /// Calls recorded as `Success` or `SlowSuccess`
    pub successful_calls: u64,
    /// Calls recorded as `Error` or `SlowError`
    pub failed_calls: u64,
    /// Calls slower than the threshold, whatever their result
    pub slow_calls: u64,
    /// Slow calls that succeeded
    pub slow_successful_calls: u64,
    /// Slow calls that failed
    pub slow_failed_calls: u64,
    /// Summed duration of the held calls
    pub total_duration: Duration,
    /// Failed calls as a percentage, or [`NOT_ENOUGH_CALLS`]
    pub failure_rate: f64,
    /// Slow calls as a percentage, or [`NOT_ENOUGH_CALLS`]
    pub slow_call_rate: f64,
}

impl Snapshot {
    pub(crate) fn from_totals(totals: &Totals, minimum_calls: u64) -> Self {
        let total = totals.total_calls();
        let failed = totals.error + totals.slow_error;
        let slow = totals.slow_success + totals.slow_error;
        let (failure_rate, slow_call_rate) = if total == 0 || total < minimum_calls {
            (NOT_ENOUGH_CALLS, NOT_ENOUGH_CALLS)
        } else {
            (percentage(failed, total), percentage(slow, total))
        };
        Self {
            total_calls: total,
            successful_calls: totals.success + totals.slow_success,
            failed_calls: failed,
            slow_calls: slow,
            slow_successful_calls: totals.slow_success,
            slow_failed_calls: totals.slow_error,
            total_duration: Duration::from_nanos(totals.duration_nanos),
            failure_rate,
            slow_call_rate,
        }
    }

    /// Mean duration of the calls in the window, zero when empty
    pub fn average_duration(&self) -> Duration {
        if self.total_calls == 0 {
            return Duration::ZERO;
        }
        let nanos = self.total_duration.as_nanos() / u128::from(self.total_calls);
        Duration::from_nanos(u64::try_from(nanos).unwrap_or(u64::MAX))
    }

    /// Whether the window has reached its minimum number of calls
    pub fn has_enough_calls(&self) -> bool {
        self.failure_rate >= 0.0
    }
}

#[allow(clippy::cast_precision_loss)]
fn percentage(part: u64, total: u64) -> f64 {
    part as f64 * 100.0 / total as f64
}

/// Per-kind counters shared by both window shapes
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub(crate) struct Totals {
    pub success: u64,
    pub slow_success: u64,
    pub error: u64,
    pub slow_error: u64,
    pub duration_nanos: u64,
}

impl Totals {
    pub fn total_calls(&self) -> u64 {
        self.success + self.slow_success + self.error + self.slow_error
    }

    pub fn add(&mut self, outcome: Outcome, duration_nanos: u64) {
        *self.counter_mut(outcome) += 1;
        self.duration_nanos = self.duration_nanos.saturating_add(duration_nanos);
    }

    pub fn subtract(&mut self, other: &Self) {
        self.success = self.success.saturating_sub(other.success);
        self.slow_success = self.slow_success.saturating_sub(other.slow_success);
        self.error = self.error.saturating_sub(other.error);
        self.slow_error = self.slow_error.saturating_sub(other.slow_error);
        self.duration_nanos = self.duration_nanos.saturating_sub(other.duration_nanos);
    }

    fn counter_mut(&mut self, outcome: Outcome) -> &mut u64 {
        match outcome {
            Outcome::Success => &mut self.success,
            Outcome::SlowSuccess => &mut self.slow_success,
            Outcome::Error => &mut self.error,
            Outcome::SlowError => &mut self.slow_error,
        }
    }
}

/// Aggregator of recent call outcomes
pub trait OutcomeWindow: Send + Sync + fmt::Debug {
    /// Record one outcome and return the aggregate including it
    fn record(&self, duration: Duration, outcome: Outcome) -> Snapshot;

    /// Read the current aggregate without changing the window
    fn snapshot(&self) -> Snapshot;

    /// Number of slots (calls or seconds) the window spans
    fn size(&self) -> usize;

    /// Calls required before rates stop reporting the sentinel
    fn minimum_number_of_calls(&self) -> u64;
}

/// Shape of a sliding window
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "SCREAMING_SNAKE_CASE"))]
pub enum SlidingWindowType {
    /// Last `size` calls
    #[default]
    CountBased,
    /// Calls from the last `size` seconds
    TimeBased,
}

/// Window settings shared by the circuit breaker and the AIMD limiter
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct WindowConfig {
    /// Count-based ring or time-based buckets
    pub sliding_window_type: SlidingWindowType,
    /// Calls (count-based) or seconds (time-based)
    pub sliding_window_size: usize,
    /// Calls required before rates are reported; capped at the size for count windows
    pub minimum_number_of_calls: u64,
}

impl Default for WindowConfig {
    fn default() -> Self {
        Self {
            sliding_window_type: SlidingWindowType::CountBased,
            sliding_window_size: 100,
            minimum_number_of_calls: 100,
        }
    }
}

impl WindowConfig {
    /// Validate the configuration
    pub fn validate(&self) -> ConfigResult<()> {
        if self.sliding_window_size == 0 {
            return Err(ConfigError::invalid("sliding_window_size must be greater than 0"));
        }
        if self.minimum_number_of_calls == 0 {
            return Err(ConfigError::invalid("minimum_number_of_calls must be greater than 0"));
        }
        Ok(())
    }

    /// Minimum calls actually enforced
    ///
    /// A count window can never hold more than its size, so the minimum is
    /// capped there.
    pub fn effective_minimum_calls(&self) -> u64 {
        match self.sliding_window_type {
            SlidingWindowType::CountBased => {
                let size = u64::try_from(self.sliding_window_size).unwrap_or(u64::MAX);
                self.minimum_number_of_calls.min(size)
            }
            SlidingWindowType::TimeBased => self.minimum_number_of_calls,
        }
    }

    /// Allocate a fresh, empty window with these settings
    pub fn build<C: Clock>(&self, clock: Arc<C>) -> ConfigResult<Box<dyn OutcomeWindow>> {
        self.validate()?;
        let minimum = self.effective_minimum_calls();
        Ok(match self.sliding_window_type {
            SlidingWindowType::CountBased => {
                Box::new(CountWindow::allocate(self.sliding_window_size, minimum))
            }
            SlidingWindowType::TimeBased => {
                Box::new(TimeWindow::allocate(self.sliding_window_size, minimum, clock))
            }
        })
    }

    /// Same as [`WindowConfig::build`] for configs validated up front
    pub(crate) fn allocate<C: Clock>(&self, clock: &Arc<C>) -> Arc<dyn OutcomeWindow> {
        let minimum = self.effective_minimum_calls();
        match self.sliding_window_type {
            SlidingWindowType::CountBased => {
                Arc::new(CountWindow::allocate(self.sliding_window_size, minimum))
            }
            SlidingWindowType::TimeBased => {
                Arc::new(TimeWindow::allocate(self.sliding_window_size, minimum, Arc::clone(clock)))
            }
        }
    }
}
