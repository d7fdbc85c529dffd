use std::error::Error as StdError;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use super::{CircuitBreaker, CircuitState};
use crate::clock::Clock;
use crate::error::{ConfigError, ConfigResult};
use crate::interval::IntervalFunction;
use crate::window::{SlidingWindowType, WindowConfig};

/// Predicate deciding how a failed call is treated
pub type ErrorPredicate = Arc<dyn Fn(&(dyn StdError + 'static)) -> bool + Send + Sync>;

/// Configuration for circuit breaker behavior
#[derive(Clone)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct CircuitBreakerConfig {
    /// Window used in CLOSED and METRICS_ONLY
    pub window: WindowConfig,
    /// Failure percentage at or above which the circuit opens
    pub failure_rate_threshold: f64,
    /// Slow-call percentage at or above which the circuit opens
    pub slow_call_rate_threshold: f64,
    /// Calls slower than this are classified as slow
    #[cfg_attr(feature = "serde", serde(with = "crate::duration_millis"))]
    pub slow_call_duration_threshold: Duration,
    /// Wait in OPEN, evaluated per consecutive OPEN period
    pub wait_interval_in_open_state: IntervalFunction,
    /// Trial calls allowed in HALF_OPEN, also the HALF_OPEN window size
    pub permitted_number_of_calls_in_half_open_state: u32,
    /// Longest stay in HALF_OPEN before falling back; zero waits forever
    #[cfg_attr(feature = "serde", serde(with = "crate::duration_millis"))]
    pub max_wait_duration_in_half_open_state: Duration,
    /// Where HALF_OPEN goes when the maximum wait runs out: OPEN or CLOSED
    pub transition_on_half_open_timeout: CircuitState,
    /// Move OPEN to HALF_OPEN on a timer instead of on the next call
    pub automatic_transition_from_open_to_half_open_enabled: bool,
    /// Errors counted as failures; every error when unset
    #[cfg_attr(feature = "serde", serde(skip))]
    pub record_error: Option<ErrorPredicate>,
    /// Errors passed through uncounted; checked before `record_error`
    #[cfg_attr(feature = "serde", serde(skip))]
    pub ignore_error: Option<ErrorPredicate>,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            window: WindowConfig::default(),
            failure_rate_threshold: 50.0,
            slow_call_rate_threshold: 100.0,
            slow_call_duration_threshold: Duration::from_secs(60),
            wait_interval_in_open_state: IntervalFunction::fixed(Duration::from_secs(60)),
            permitted_number_of_calls_in_half_open_state: 10,
            max_wait_duration_in_half_open_state: Duration::ZERO,
            transition_on_half_open_timeout: CircuitState::Open,
            automatic_transition_from_open_to_half_open_enabled: false,
            record_error: None,
            ignore_error: None,
        }
    }
}

impl fmt::Debug for CircuitBreakerConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CircuitBreakerConfig")
            .field("window", &self.window)
            .field("failure_rate_threshold", &self.failure_rate_threshold)
            .field("slow_call_rate_threshold", &self.slow_call_rate_threshold)
            .field("slow_call_duration_threshold", &self.slow_call_duration_threshold)
            .field("wait_interval_in_open_state", &self.wait_interval_in_open_state)
            .field(
                "permitted_number_of_calls_in_half_open_state",
                &self.permitted_number_of_calls_in_half_open_state,
            )
            .field("max_wait_duration_in_half_open_state", &self.max_wait_duration_in_half_open_state)
            .field("transition_on_half_open_timeout", &self.transition_on_half_open_timeout)
            .field(
                "automatic_transition_from_open_to_half_open_enabled",
                &self.automatic_transition_from_open_to_half_open_enabled,
            )
            .field("record_error", &self.record_error.is_some())
            .field("ignore_error", &self.ignore_error.is_some())
            .finish()
    }
}

impl CircuitBreakerConfig {
    /// Create a configuration builder
    pub fn builder() -> CircuitBreakerConfigBuilder {
        CircuitBreakerConfigBuilder::new()
    }

    /// Validate the configuration
    pub fn validate(&self) -> ConfigResult<()> {
        self.window.validate()?;
        validate_rate("failure_rate_threshold", self.failure_rate_threshold)?;
        validate_rate("slow_call_rate_threshold", self.slow_call_rate_threshold)?;
        if self.slow_call_duration_threshold.is_zero() {
            return Err(ConfigError::invalid("slow_call_duration_threshold must be non-zero"));
        }
        if self.permitted_number_of_calls_in_half_open_state == 0 {
            return Err(ConfigError::invalid(
                "permitted_number_of_calls_in_half_open_state must be greater than 0",
            ));
        }
        if !matches!(self.transition_on_half_open_timeout, CircuitState::Open | CircuitState::Closed)
        {
            return Err(ConfigError::invalid(
                "transition_on_half_open_timeout must be OPEN or CLOSED",
            ));
        }
        self.wait_interval_in_open_state.validate()
    }

    pub(crate) fn half_open_window(&self) -> WindowConfig {
        let trials = self.permitted_number_of_calls_in_half_open_state;
        WindowConfig {
            sliding_window_type: SlidingWindowType::CountBased,
            sliding_window_size: usize::try_from(trials).unwrap_or(usize::MAX),
            minimum_number_of_calls: u64::from(trials),
        }
    }

    /// How a failed call is treated
    pub(crate) fn classify_error(&self, error: &(dyn StdError + 'static)) -> ErrorDisposition {
        if self.ignore_error.as_ref().is_some_and(|ignore| ignore(error)) {
            return ErrorDisposition::Ignore;
        }
        match &self.record_error {
            Some(record) if !record(error) => ErrorDisposition::Ignore,
            _ => ErrorDisposition::Record,
        }
    }

    /// Whether a snapshot's rates reach either threshold
    pub(crate) fn thresholds_exceeded(&self, failure_rate: f64, slow_call_rate: f64) -> bool {
        failure_rate >= self.failure_rate_threshold || slow_call_rate >= self.slow_call_rate_threshold
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ErrorDisposition {
    Record,
    Ignore,
}

fn validate_rate(field: &str, value: f64) -> ConfigResult<()> {
    if value.is_nan() || value <= 0.0 || value > 100.0 {
        return Err(ConfigError::invalid(format!("{field} must be in (0, 100]")));
    }
    Ok(())
}

/// Builder for `CircuitBreakerConfig`
#[derive(Debug, Default)]
pub struct CircuitBreakerConfigBuilder {
    config: CircuitBreakerConfig,
}

impl CircuitBreakerConfigBuilder {
    /// Create a builder starting from the defaults
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the window shape
    pub fn sliding_window_type(mut self, window_type: SlidingWindowType) -> Self {
        self.config.window.sliding_window_type = window_type;
        self
    }

    /// Set the window size in calls or seconds
    pub fn sliding_window_size(mut self, size: usize) -> Self {
        self.config.window.sliding_window_size = size;
        self
    }

    /// Shorthand for type, size and minimum calls at once
    pub fn sliding_window(
        self,
        size: usize,
        minimum_number_of_calls: u64,
        window_type: SlidingWindowType,
    ) -> Self {
        self.sliding_window_size(size)
            .minimum_number_of_calls(minimum_number_of_calls)
            .sliding_window_type(window_type)
    }

    /// Set the calls required before rates are evaluated
    pub fn minimum_number_of_calls(mut self, calls: u64) -> Self {
        self.config.window.minimum_number_of_calls = calls;
        self
    }

    /// Set the failure percentage that opens the circuit
    pub fn failure_rate_threshold(mut self, percentage: f64) -> Self {
        self.config.failure_rate_threshold = percentage;
        self
    }

    /// Set the slow-call percentage that opens the circuit
    pub fn slow_call_rate_threshold(mut self, percentage: f64) -> Self {
        self.config.slow_call_rate_threshold = percentage;
        self
    }

    /// Set the duration above which a call counts as slow
    pub fn slow_call_duration_threshold(mut self, threshold: Duration) -> Self {
        self.config.slow_call_duration_threshold = threshold;
        self
    }

    /// Fixed wait in OPEN
    pub fn wait_duration_in_open_state(mut self, wait: Duration) -> Self {
        self.config.wait_interval_in_open_state = IntervalFunction::fixed(wait);
        self
    }

    /// Exponential, randomized or custom wait in OPEN
    pub fn wait_interval_in_open_state(mut self, function: IntervalFunction) -> Self {
        self.config.wait_interval_in_open_state = function;
        self
    }

    /// Set the number of HALF_OPEN trial calls
    pub fn permitted_number_of_calls_in_half_open_state(mut self, calls: u32) -> Self {
        self.config.permitted_number_of_calls_in_half_open_state = calls;
        self
    }

    /// Bound the time spent in HALF_OPEN; zero waits for the trials
    pub fn max_wait_duration_in_half_open_state(mut self, wait: Duration) -> Self {
        self.config.max_wait_duration_in_half_open_state = wait;
        self
    }

    /// Set the state entered when the HALF_OPEN bound elapses
    pub fn transition_on_half_open_timeout(mut self, target: CircuitState) -> Self {
        self.config.transition_on_half_open_timeout = target;
        self
    }

    /// Leave OPEN on a timer instead of on the next call
    pub fn automatic_transition_from_open_to_half_open_enabled(mut self, enabled: bool) -> Self {
        self.config.automatic_transition_from_open_to_half_open_enabled = enabled;
        self
    }

    /// Count only errors matching `predicate` as failures
    pub fn record_error<F>(mut self, predicate: F) -> Self
    where
        F: Fn(&(dyn StdError + 'static)) -> bool + Send + Sync + 'static,
    {
        self.config.record_error = Some(Arc::new(predicate));
        self
    }

    /// Pass errors matching `predicate` through without counting them
    pub fn ignore_error<F>(mut self, predicate: F) -> Self
    where
        F: Fn(&(dyn StdError + 'static)) -> bool + Send + Sync + 'static,
    {
        self.config.ignore_error = Some(Arc::new(predicate));
        self
    }

    /// Build a breaker with a custom clock instead of a bare config
    pub fn clock<C: Clock>(self, clock: C) -> CircuitBreakerBuilderWithClock<C> {
        CircuitBreakerBuilderWithClock { builder: self, clock }
    }

    /// Validate and return the configuration
    pub fn build(self) -> ConfigResult<CircuitBreakerConfig> {
        self.config.validate()?;
        Ok(self.config)
    }
}

/// Builder with custom clock that builds a `CircuitBreaker` directly
pub struct CircuitBreakerBuilderWithClock<C: Clock> {
    builder: CircuitBreakerConfigBuilder,
    clock: C,
}

impl<C: Clock> CircuitBreakerBuilderWithClock<C> {
    /// Adjust the configuration before building
    pub fn configure<F>(mut self, f: F) -> Self
    where
        F: FnOnce(CircuitBreakerConfigBuilder) -> CircuitBreakerConfigBuilder,
    {
        self.builder = f(self.builder);
        self
    }

    /// Validate and create a breaker named `name`
    pub fn build(self, name: &str) -> ConfigResult<CircuitBreaker<C>> {
        CircuitBreaker::with_clock(name, self.builder.build()?, self.clock)
    }
}

#[cfg(test)]
mod tests {
    use std::io;

    use super::*;

    /// Validates `CircuitBreakerConfig::default` values.
    ///
    /// Assertions:
    /// - Confirms window, thresholds and waits match the documented defaults.
    #[test]
    fn test_config_defaults() {
        let config = CircuitBreakerConfig::default();
        assert_eq!(config.window.sliding_window_size, 100);
        assert_eq!(config.window.minimum_number_of_calls, 100);
        assert_eq!(config.window.sliding_window_type, SlidingWindowType::CountBased);
        assert!((config.failure_rate_threshold - 50.0).abs() < f64::EPSILON);
        assert!((config.slow_call_rate_threshold - 100.0).abs() < f64::EPSILON);
        assert_eq!(config.slow_call_duration_threshold, Duration::from_secs(60));
        assert_eq!(config.wait_interval_in_open_state.apply(1), Duration::from_secs(60));
        assert_eq!(config.permitted_number_of_calls_in_half_open_state, 10);
        assert_eq!(config.max_wait_duration_in_half_open_state, Duration::ZERO);
        assert_eq!(config.transition_on_half_open_timeout, CircuitState::Open);
        assert!(!config.automatic_transition_from_open_to_half_open_enabled);
        assert!(config.validate().is_ok());
    }

    /// Validates that invalid settings are refused at build time.
    ///
    /// Assertions:
    /// - Ensures out-of-range thresholds fail.
    /// - Ensures zero half-open calls fail.
    /// - Ensures a HALF_OPEN timeout target other than OPEN/CLOSED fails.
    #[test]
    fn test_config_validation() {
        assert!(CircuitBreakerConfig::builder().failure_rate_threshold(0.0).build().is_err());
        assert!(CircuitBreakerConfig::builder().failure_rate_threshold(100.5).build().is_err());
        assert!(CircuitBreakerConfig::builder().slow_call_rate_threshold(-1.0).build().is_err());
        assert!(CircuitBreakerConfig::builder()
            .permitted_number_of_calls_in_half_open_state(0)
            .build()
            .is_err());
        assert!(CircuitBreakerConfig::builder().sliding_window_size(0).build().is_err());
        assert!(CircuitBreakerConfig::builder()
            .transition_on_half_open_timeout(CircuitState::ForcedOpen)
            .build()
            .is_err());
        assert!(CircuitBreakerConfig::builder()
            .wait_interval_in_open_state(IntervalFunction::exponential(Duration::from_secs(1), 0.1))
            .build()
            .is_err());
    }

    /// Validates the builder's fluent setters.
    ///
    /// Assertions:
    /// - Confirms every setter lands in the built config.
    #[test]
    fn test_config_builder() {
        let config = CircuitBreakerConfig::builder()
            .sliding_window(20, 10, SlidingWindowType::TimeBased)
            .failure_rate_threshold(25.0)
            .slow_call_rate_threshold(80.0)
            .slow_call_duration_threshold(Duration::from_millis(250))
            .wait_duration_in_open_state(Duration::from_secs(5))
            .permitted_number_of_calls_in_half_open_state(3)
            .max_wait_duration_in_half_open_state(Duration::from_secs(2))
            .transition_on_half_open_timeout(CircuitState::Closed)
            .automatic_transition_from_open_to_half_open_enabled(true)
            .build()
            .unwrap();

        assert_eq!(config.window.sliding_window_size, 20);
        assert_eq!(config.window.minimum_number_of_calls, 10);
        assert_eq!(config.window.sliding_window_type, SlidingWindowType::TimeBased);
        assert_eq!(config.slow_call_duration_threshold, Duration::from_millis(250));
        assert_eq!(config.wait_interval_in_open_state.apply(3), Duration::from_secs(5));
        assert_eq!(config.half_open_window().sliding_window_size, 3);
        assert_eq!(config.half_open_window().minimum_number_of_calls, 3);
        assert_eq!(config.transition_on_half_open_timeout, CircuitState::Closed);
        assert!(config.automatic_transition_from_open_to_half_open_enabled);
    }

    /// Validates error classification with record and ignore predicates.
    ///
    /// Assertions:
    /// - Confirms every error is recorded with no predicates.
    /// - Confirms the ignore predicate wins over the record predicate.
    /// - Confirms errors outside the record predicate are ignored.
    #[test]
    fn test_error_classification() {
        let timeout = io::Error::new(io::ErrorKind::TimedOut, "slow");
        let refused = io::Error::new(io::ErrorKind::ConnectionRefused, "down");
        let not_found = io::Error::new(io::ErrorKind::NotFound, "missing");

        let config = CircuitBreakerConfig::default();
        assert_eq!(config.classify_error(&not_found), ErrorDisposition::Record);

        let config = CircuitBreakerConfig::builder()
            .record_error(|e| e.downcast_ref::<io::Error>().is_some())
            .ignore_error(|e| {
                e.downcast_ref::<io::Error>().is_some_and(|e| e.kind() == io::ErrorKind::NotFound)
            })
            .build()
            .unwrap();
        assert_eq!(config.classify_error(&timeout), ErrorDisposition::Record);
        assert_eq!(config.classify_error(&not_found), ErrorDisposition::Ignore);

        let config = CircuitBreakerConfig::builder()
            .record_error(|e| {
                e.downcast_ref::<io::Error>().is_some_and(|e| e.kind() == io::ErrorKind::TimedOut)
            })
            .build()
            .unwrap();
        assert_eq!(config.classify_error(&timeout), ErrorDisposition::Record);
        assert_eq!(config.classify_error(&refused), ErrorDisposition::Ignore);
    }
}
