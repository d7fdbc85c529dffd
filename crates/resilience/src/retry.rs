//! Retry with pluggable backoff and retry conditions
//!
//! A [`Retry`] instance holds the configuration and aggregate metrics; each
//! protected call gets its own [`RetryContext`] tracking the attempt count.
//! Attempts are 1-based: the first call is attempt 1, and `max_attempts`
//! includes it.

use std::any::Any;
use std::error::Error as StdError;
use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use thiserror::Error;
use tracing::{debug, instrument, warn};

use crate::circuit_breaker::ErrorPredicate;
use crate::error::{ConfigError, ConfigResult};
use crate::event::{EventPublisher, ListenerId, ResilienceEvent};
pub use crate::interval::IntervalFunction;

/// Predicate over a successful value, type-erased so configs stay non-generic
pub type ResultPredicate = Arc<dyn Fn(&dyn Any) -> bool + Send + Sync>;

/// Errors returned once retrying stops
#[derive(Debug, Error)]
pub enum RetryError<E>
where
    E: StdError + 'static,
{
    /// Every attempt failed with a retryable error
    #[error("All {attempts} attempts failed, last error: {source}")]
    AttemptsExhausted {
        /// Attempts made, including the first call
        attempts: u32,
        /// Error from the last attempt
        #[source]
        source: E,
    },

    /// The operation failed with an error the retry conditions exclude
    #[error("Operation failed with non-retryable error: {source}")]
    NonRetryable {
        /// Error that stopped the retries
        #[source]
        source: E,
    },
}

impl<E> RetryError<E>
where
    E: StdError + 'static,
{
    /// The operation's last error
    pub fn into_inner(self) -> E {
        match self {
            Self::AttemptsExhausted { source, .. } | Self::NonRetryable { source } => source,
        }
    }
}

/// Result type for retry operations
pub type RetryResult<T, E> = Result<T, RetryError<E>>;

/// Outcome of a retry execution including result and summary statistics
#[derive(Debug)]
pub struct RetryOutcome<T, E>
where
    E: StdError + 'static,
{
    /// Final result of the call
    pub result: RetryResult<T, E>,
    /// Attempts made, including the first
    pub attempts: u32,
    /// Time spent sleeping between attempts
    pub total_delay: Duration,
    /// When the first attempt started
    pub first_attempt_time: Instant,
}

impl<T, E> RetryOutcome<T, E>
where
    E: StdError + 'static,
{
    /// Consume the outcome and return only the result
    pub fn into_result(self) -> RetryResult<T, E> {
        self.result
    }

    /// Total elapsed time from first attempt to now
    pub fn total_elapsed(&self) -> Duration {
        self.first_attempt_time.elapsed()
    }

    /// Average delay between attempts (excludes operation execution time)
    pub fn average_delay(&self) -> Duration {
        if self.attempts <= 1 {
            return Duration::ZERO;
        }
        self.total_delay / (self.attempts - 1)
    }
}

/// Configuration for retry behavior
#[derive(Clone)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct RetryConfig {
    /// Total attempts including the first call
    pub max_attempts: u32,
    /// Wait before each further attempt
    pub interval_function: IntervalFunction,
    /// Errors worth retrying; every error when unset
    #[cfg_attr(feature = "serde", serde(skip))]
    pub retry_on_error: Option<ErrorPredicate>,
    /// Successful values that should still be retried; none when unset
    #[cfg_attr(feature = "serde", serde(skip))]
    pub retry_on_result: Option<ResultPredicate>,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            interval_function: IntervalFunction::default(),
            retry_on_error: None,
            retry_on_result: None,
        }
    }
}

impl fmt::Debug for RetryConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RetryConfig")
            .field("max_attempts", &self.max_attempts)
            .field("interval_function", &self.interval_function)
            .field("retry_on_error", &self.retry_on_error.is_some())
            .field("retry_on_result", &self.retry_on_result.is_some())
            .finish()
    }
}

impl RetryConfig {
    /// Create a new configuration builder
    pub fn builder() -> RetryConfigBuilder {
        RetryConfigBuilder::new()
    }

    /// Validate the configuration
    pub fn validate(&self) -> ConfigResult<()> {
        if self.max_attempts == 0 {
            return Err(ConfigError::invalid("max_attempts must be at least 1"));
        }
        self.interval_function.validate()
    }
}

/// Builder for RetryConfig
#[derive(Debug, Default)]
pub struct RetryConfigBuilder {
    config: RetryConfig,
}

impl RetryConfigBuilder {
    /// Create a builder starting from the defaults
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the attempt limit, including the first call
    pub fn max_attempts(mut self, attempts: u32) -> Self {
        self.config.max_attempts = attempts;
        self
    }

    /// Wait the same duration before every further attempt
    pub fn wait_duration(mut self, wait: Duration) -> Self {
        self.config.interval_function = IntervalFunction::fixed(wait);
        self
    }

    /// Set the backoff between attempts
    pub fn interval_function(mut self, function: IntervalFunction) -> Self {
        self.config.interval_function = function;
        self
    }

    /// Retry only errors matching `predicate`
    pub fn retry_on_error<F>(mut self, predicate: F) -> Self
    where
        F: Fn(&(dyn StdError + 'static)) -> bool + Send + Sync + 'static,
    {
        self.config.retry_on_error = Some(Arc::new(predicate));
        self
    }

    /// Retry successful values of type `T` matching `predicate`
    pub fn retry_on_result<T, F>(mut self, predicate: F) -> Self
    where
        T: 'static,
        F: Fn(&T) -> bool + Send + Sync + 'static,
    {
        self.config.retry_on_result = Some(Arc::new(move |value: &dyn Any| {
            value.downcast_ref::<T>().is_some_and(&predicate)
        }));
        self
    }

    /// Validate and return the configuration
    pub fn build(self) -> ConfigResult<RetryConfig> {
        self.config.validate()?;
        Ok(self.config)
    }
}

/// Aggregate retry metrics
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RetryMetrics {
    /// Calls that succeeded on the first attempt
    pub successful_calls_without_retry: u64,
    /// Calls that succeeded after at least one retry
    pub successful_calls_with_retry: u64,
    /// Calls that failed without being retried
    pub failed_calls_without_retry: u64,
    /// Calls that failed after exhausting their retries
    pub failed_calls_with_retry: u64,
}

impl RetryMetrics {
    /// Completed calls of every kind
    pub fn total_calls(&self) -> u64 {
        self.successful_calls_without_retry
            + self.successful_calls_with_retry
            + self.failed_calls_without_retry
            + self.failed_calls_with_retry
    }

    /// Get a human-readable status message
    pub fn status_message(&self) -> String {
        format!(
            "Retry: {} succeeded first time, {} succeeded after retry, {} failed without retry, {} failed after retry",
            self.successful_calls_without_retry,
            self.successful_calls_with_retry,
            self.failed_calls_without_retry,
            self.failed_calls_with_retry
        )
    }
}

#[derive(Debug, Default)]
struct Counters {
    successful_without_retry: AtomicU64,
    successful_with_retry: AtomicU64,
    failed_without_retry: AtomicU64,
    failed_with_retry: AtomicU64,
}

struct Inner {
    name: Arc<str>,
    config: RetryConfig,
    counters: Counters,
    events: EventPublisher,
}

/// Named retry policy shared by many calls
///
/// # Examples
///
/// ```rust
/// use std::time::Duration;
///
/// use resilience_core::retry::{Retry, RetryConfig};
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let config = RetryConfig::builder()
///     .max_attempts(3)
///     .wait_duration(Duration::from_millis(10))
///     .build()?;
/// let retry = Retry::new("payments", config)?;
///
/// let receipt = retry.execute(|| async { Ok::<_, std::io::Error>("ok") }).await?;
/// assert_eq!(receipt, "ok");
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct Retry {
    inner: Arc<Inner>,
}

impl Retry {
    /// Create a retry after validating `config`
    pub fn new(name: &str, config: RetryConfig) -> ConfigResult<Self> {
        config.validate()?;
        Ok(Self {
            inner: Arc::new(Inner {
                name: Arc::from(name),
                config,
                counters: Counters::default(),
                events: EventPublisher::new(),
            }),
        })
    }

    /// Get the retry name
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Get the configuration
    pub fn config(&self) -> &RetryConfig {
        &self.inner.config
    }

    /// Register an event listener
    pub fn subscribe<F>(&self, listener: F) -> ListenerId
    where
        F: Fn(&ResilienceEvent) + Send + Sync + 'static,
    {
        self.inner.events.subscribe(listener)
    }

    /// Whether attempt number `attempt` should be followed by another
    pub fn should_retry<T, E>(&self, attempt: u32, outcome: &Result<T, E>) -> bool
    where
        T: 'static,
        E: StdError + 'static,
    {
        if attempt >= self.inner.config.max_attempts {
            return false;
        }
        self.is_retryable(outcome)
    }

    /// Wait before the attempt following attempt number `attempt`
    pub fn next_backoff(&self, attempt: u32) -> Duration {
        self.inner.config.interval_function.apply(attempt)
    }

    /// Start tracking one protected call
    pub fn context(&self) -> RetryContext<'_> {
        RetryContext { retry: self, attempt: 1, unwanted_result: false }
    }

    /// Execute an operation, retrying per the configuration
    #[instrument(
        skip(self, operation),
        fields(retry = %self.inner.name, max_attempts = self.inner.config.max_attempts)
    )]
    pub async fn execute<F, Fut, T, E>(&self, operation: F) -> RetryResult<T, E>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        T: 'static,
        E: StdError + 'static,
    {
        self.execute_with_outcome(operation).await.into_result()
    }

    /// Execute an operation and return outcome statistics as well
    pub async fn execute_with_outcome<F, Fut, T, E>(&self, mut operation: F) -> RetryOutcome<T, E>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        T: 'static,
        E: StdError + 'static,
    {
        let first_attempt_time = Instant::now();
        let mut context = self.context();
        let mut total_delay = Duration::ZERO;

        loop {
            let attempt = context.attempt();
            debug!(retry = %self.inner.name, attempt, "Executing operation");

            let outcome = operation().await;
            let wait = match &outcome {
                Ok(value) => context.on_result(value),
                Err(error) => context.on_error(error),
            };

            let Some(wait) = wait else {
                let retryable = self.is_retryable(&outcome);
                let result = match outcome {
                    Ok(value) => {
                        context.on_complete();
                        Ok(value)
                    }
                    Err(source) if retryable => {
                        Err(RetryError::AttemptsExhausted { attempts: attempt, source })
                    }
                    Err(source) => Err(RetryError::NonRetryable { source }),
                };
                return RetryOutcome { result, attempts: attempt, total_delay, first_attempt_time };
            };

            tokio::time::sleep(wait).await;
            total_delay += wait;
        }
    }

    /// Get current metrics
    pub fn metrics(&self) -> RetryMetrics {
        let counters = &self.inner.counters;
        RetryMetrics {
            successful_calls_without_retry: counters
                .successful_without_retry
                .load(Ordering::Relaxed),
            successful_calls_with_retry: counters.successful_with_retry.load(Ordering::Relaxed),
            failed_calls_without_retry: counters.failed_without_retry.load(Ordering::Relaxed),
            failed_calls_with_retry: counters.failed_with_retry.load(Ordering::Relaxed),
        }
    }

    fn is_retryable<T, E>(&self, outcome: &Result<T, E>) -> bool
    where
        T: 'static,
        E: StdError + 'static,
    {
        let config = &self.inner.config;
        match outcome {
            Ok(value) => config.retry_on_result.as_ref().is_some_and(|retry| retry(value)),
            Err(error) => config.retry_on_error.as_ref().map_or(true, |retry| retry(error)),
        }
    }
}

impl fmt::Debug for Retry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Retry")
            .field("name", &self.inner.name)
            .field("config", &self.inner.config)
            .field("metrics", &self.metrics())
            .finish()
    }
}

/// Attempt bookkeeping for one protected call
///
/// Report each attempt through [`on_result`](Self::on_result) or
/// [`on_error`](Self::on_error); `Some(wait)` means sleep that long and try
/// again, `None` means stop. Call [`on_complete`](Self::on_complete) when the
/// final value is accepted.
#[derive(Debug)]
pub struct RetryContext<'a> {
    retry: &'a Retry,
    attempt: u32,
    unwanted_result: bool,
}

impl RetryContext<'_> {
    /// Number of the attempt currently being made
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    /// Whether the last attempt used up the allowance
    pub fn exhausted(&self) -> bool {
        self.attempt >= self.retry.inner.config.max_attempts
    }

    /// Report a successful value
    pub fn on_result<T: 'static>(&mut self, value: &T) -> Option<Duration> {
        self.unwanted_result =
            self.retry.inner.config.retry_on_result.as_ref().is_some_and(|retry| retry(value));
        if self.unwanted_result && !self.exhausted() {
            return Some(self.schedule_next());
        }
        None
    }

    /// Report a failure
    pub fn on_error<E>(&mut self, error: &E) -> Option<Duration>
    where
        E: StdError + 'static,
    {
        let counters = &self.retry.inner.counters;
        let retryable =
            self.retry.inner.config.retry_on_error.as_ref().map_or(true, |retry| retry(error));

        if retryable && !self.exhausted() {
            return Some(self.schedule_next());
        }

        if self.attempt > 1 {
            counters.failed_with_retry.fetch_add(1, Ordering::Relaxed);
        } else {
            counters.failed_without_retry.fetch_add(1, Ordering::Relaxed);
        }
        if retryable {
            warn!(
                retry = %self.retry.inner.name,
                attempts = self.attempt,
                %error,
                "Retry attempts exhausted"
            );
        } else {
            debug!(retry = %self.retry.inner.name, %error, "Error is not retryable");
        }
        None
    }

    /// Record the call as finished with an accepted value
    pub fn on_complete(&self) {
        let counters = &self.retry.inner.counters;
        let counter = match (self.attempt > 1, self.unwanted_result) {
            (false, false) => &counters.successful_without_retry,
            (true, false) => &counters.successful_with_retry,
            (false, true) => &counters.failed_without_retry,
            (true, true) => &counters.failed_with_retry,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    fn schedule_next(&mut self) -> Duration {
        let inner = &self.retry.inner;
        let wait = self.retry.next_backoff(self.attempt);
        debug!(retry = %inner.name, attempt = self.attempt, ?wait, "Retrying after backoff");
        inner.events.publish_with(|| ResilienceEvent::RetryAttempt {
            name: Arc::clone(&inner.name),
            attempt: self.attempt,
            wait,
        });
        self.attempt += 1;
        wait
    }
}
