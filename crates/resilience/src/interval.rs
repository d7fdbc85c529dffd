//! Interval functions mapping an attempt number to a wait duration
//!
//! Used for the circuit breaker's wait in OPEN state (attempt = consecutive
//! OPEN periods) and for retry backoff (attempt = failed attempts so far).
//! Attempts are 1-based; the function is evaluated fresh every time, so
//! randomized variants produce a new value per call.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;

use crate::error::{ConfigError, ConfigResult};

/// Default first interval of the exponential variants
pub const DEFAULT_INITIAL_INTERVAL: Duration = Duration::from_millis(500);
/// Default growth factor of the exponential variants
pub const DEFAULT_MULTIPLIER: f64 = 1.5;
/// Default spread of the randomized variants (±50%)
pub const DEFAULT_RANDOMIZATION_FACTOR: f64 = 0.5;

/// Custom attempt-to-duration function
pub type IntervalFn = Arc<dyn Fn(u32) -> Duration + Send + Sync>;

/// Strategy for computing the wait before the next attempt
#[derive(Clone)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(tag = "type", rename_all = "snake_case"))]
pub enum IntervalFunction {
    /// Same wait every attempt
    Fixed {
        /// Base wait
        #[cfg_attr(feature = "serde", serde(with = "crate::duration_millis"))]
        interval: Duration,
    },
    /// `initial * multiplier^(attempt - 1)`, optionally capped
    Exponential {
        /// Wait before the second attempt
        #[cfg_attr(feature = "serde", serde(with = "crate::duration_millis"))]
        initial: Duration,
        /// Growth factor per attempt
        multiplier: f64,
        /// Upper bound on any wait
        #[cfg_attr(feature = "serde", serde(default, with = "crate::duration_millis::option"))]
        max: Option<Duration>,
    },
    /// `interval ± interval * randomization_factor`, uniformly drawn
    Randomized {
        /// Base wait
        #[cfg_attr(feature = "serde", serde(with = "crate::duration_millis"))]
        interval: Duration,
        /// Fraction of the wait drawn at random, in `[0, 1)`
        randomization_factor: f64,
    },
    /// Exponential growth with each value randomized, the cap applied first
    ExponentialRandomized {
        /// Wait before the second attempt
        #[cfg_attr(feature = "serde", serde(with = "crate::duration_millis"))]
        initial: Duration,
        /// Growth factor per attempt
        multiplier: f64,
        /// Fraction of the wait drawn at random, in `[0, 1)`
        randomization_factor: f64,
        /// Upper bound on any wait
        #[cfg_attr(feature = "serde", serde(default, with = "crate::duration_millis::option"))]
        max: Option<Duration>,
    },
    /// Caller-supplied function
    #[cfg_attr(feature = "serde", serde(skip))]
    Custom(IntervalFn),
}

impl IntervalFunction {
    /// Same wait before every retry
    pub const fn fixed(interval: Duration) -> Self {
        Self::Fixed { interval }
    }

    /// `initial * multiplier^(attempt - 1)`, uncapped
    pub const fn exponential(initial: Duration, multiplier: f64) -> Self {
        Self::Exponential { initial, multiplier, max: None }
    }

    /// Exponential growth capped at `max`
    pub const fn exponential_capped(initial: Duration, multiplier: f64, max: Duration) -> Self {
        Self::Exponential { initial, multiplier, max: Some(max) }
    }

    /// `interval` jittered by the default randomization factor
    pub const fn randomized(interval: Duration) -> Self {
        Self::Randomized { interval, randomization_factor: DEFAULT_RANDOMIZATION_FACTOR }
    }

    /// Exponential growth jittered by the default randomization factor
    pub const fn exponential_randomized(initial: Duration, multiplier: f64) -> Self {
        Self::ExponentialRandomized {
            initial,
            multiplier,
            randomization_factor: DEFAULT_RANDOMIZATION_FACTOR,
            max: None,
        }
    }

    /// Wrap an arbitrary `attempt -> wait` function
    pub fn custom<F>(function: F) -> Self
    where
        F: Fn(u32) -> Duration + Send + Sync + 'static,
    {
        Self::Custom(Arc::new(function))
    }

    /// Wait before attempt `attempt + 1`, where `attempt >= 1`
    pub fn apply(&self, attempt: u32) -> Duration {
        let attempt = attempt.max(1);
        match self {
            Self::Fixed { interval } => *interval,
            Self::Exponential { initial, multiplier, max } => {
                cap(grow(*initial, *multiplier, attempt), *max)
            }
            Self::Randomized { interval, randomization_factor } => {
                randomize(*interval, *randomization_factor)
            }
            Self::ExponentialRandomized { initial, multiplier, randomization_factor, max } => {
                randomize(cap(grow(*initial, *multiplier, attempt), *max), *randomization_factor)
            }
            Self::Custom(function) => function(attempt),
        }
    }

    /// Validate the parameters
    pub fn validate(&self) -> ConfigResult<()> {
        match self {
            Self::Fixed { .. } | Self::Custom(_) => Ok(()),
            Self::Exponential { initial, multiplier, .. } => {
                validate_exponential(*initial, *multiplier)
            }
            Self::Randomized { interval, randomization_factor } => {
                if interval.is_zero() {
                    return Err(ConfigError::invalid("randomized interval must be non-zero"));
                }
                validate_factor(*randomization_factor)
            }
            Self::ExponentialRandomized { initial, multiplier, randomization_factor, .. } => {
                validate_exponential(*initial, *multiplier)?;
                validate_factor(*randomization_factor)
            }
        }
    }
}

impl Default for IntervalFunction {
    fn default() -> Self {
        Self::fixed(DEFAULT_INITIAL_INTERVAL)
    }
}

impl fmt::Debug for IntervalFunction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Fixed { interval } => f.debug_struct("Fixed").field("interval", interval).finish(),
            Self::Exponential { initial, multiplier, max } => f
                .debug_struct("Exponential")
                .field("initial", initial)
                .field("multiplier", multiplier)
                .field("max", max)
                .finish(),
            Self::Randomized { interval, randomization_factor } => f
                .debug_struct("Randomized")
                .field("interval", interval)
                .field("randomization_factor", randomization_factor)
                .finish(),
            Self::ExponentialRandomized { initial, multiplier, randomization_factor, max } => f
                .debug_struct("ExponentialRandomized")
                .field("initial", initial)
                .field("multiplier", multiplier)
                .field("randomization_factor", randomization_factor)
                .field("max", max)
                .finish(),
            Self::Custom(_) => f.write_str("Custom(..)"),
        }
    }
}

fn validate_exponential(initial: Duration, multiplier: f64) -> ConfigResult<()> {
    if initial.is_zero() {
        return Err(ConfigError::invalid("initial interval must be non-zero"));
    }
    if !multiplier.is_finite() || multiplier < 1.0 {
        return Err(ConfigError::invalid("multiplier must be a finite value >= 1.0"));
    }
    Ok(())
}

fn validate_factor(factor: f64) -> ConfigResult<()> {
    if !(0.0..1.0).contains(&factor) {
        return Err(ConfigError::invalid("randomization_factor must be in [0.0, 1.0)"));
    }
    Ok(())
}

#[allow(clippy::cast_precision_loss, clippy::cast_possible_truncation, clippy::cast_sign_loss)]
fn grow(initial: Duration, multiplier: f64, attempt: u32) -> Duration {
    let exponent = i32::try_from(attempt - 1).unwrap_or(i32::MAX);
    let nanos = initial.as_nanos() as f64 * multiplier.powi(exponent);
    // float-to-int casts saturate
    Duration::from_nanos(nanos.round() as u64)
}

fn cap(interval: Duration, max: Option<Duration>) -> Duration {
    max.map_or(interval, |max| interval.min(max))
}

#[allow(clippy::cast_precision_loss, clippy::cast_possible_truncation, clippy::cast_sign_loss)]
fn randomize(interval: Duration, factor: f64) -> Duration {
    if factor <= 0.0 || interval.is_zero() {
        return interval;
    }
    let nanos = interval.as_nanos() as f64;
    let delta = nanos * factor;
    let drawn = rand::thread_rng().gen_range((nanos - delta)..=(nanos + delta));
    Duration::from_nanos(drawn.round() as u64)
}
