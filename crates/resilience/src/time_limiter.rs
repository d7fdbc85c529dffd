//! Upper bound on how long a protected call may run
//!
//! [`TimeLimiter::execute`] races the call against `timeout_duration` and
//! drops it when the deadline wins. [`TimeLimiter::execute_spawned`] runs the
//! call as its own task instead; on timeout it is aborted, or left to finish
//! in the background when `cancel_running_future` is off.

use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{debug, instrument, warn};

use crate::error::{ConfigError, ConfigResult, ResilienceError, ResilienceResult};
use crate::event::{EventPublisher, ListenerId, ResilienceEvent};
use crate::window::Outcome;

/// Configuration for a time limiter
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct TimeLimiterConfig {
    /// Longest a call may run
    #[cfg_attr(feature = "serde", serde(with = "crate::duration_millis"))]
    pub timeout_duration: Duration,
    /// Abort a spawned call that missed its deadline
    pub cancel_running_future: bool,
}

impl Default for TimeLimiterConfig {
    fn default() -> Self {
        Self { timeout_duration: Duration::from_secs(1), cancel_running_future: true }
    }
}

impl TimeLimiterConfig {
    /// Create a new configuration builder
    pub fn builder() -> TimeLimiterConfigBuilder {
        TimeLimiterConfigBuilder::new()
    }

    /// Validate the configuration
    pub fn validate(&self) -> ConfigResult<()> {
        if self.timeout_duration.is_zero() {
            return Err(ConfigError::invalid("timeout_duration must be greater than 0"));
        }
        Ok(())
    }
}

/// Builder for TimeLimiterConfig
#[derive(Debug, Default)]
pub struct TimeLimiterConfigBuilder {
    config: TimeLimiterConfig,
}

impl TimeLimiterConfigBuilder {
    /// Create a builder starting from the defaults
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the deadline for each call
    pub fn timeout_duration(mut self, timeout: Duration) -> Self {
        self.config.timeout_duration = timeout;
        self
    }

    /// Choose whether a late spawned call is aborted or left running
    pub fn cancel_running_future(mut self, cancel: bool) -> Self {
        self.config.cancel_running_future = cancel;
        self
    }

    /// Validate and return the configuration
    pub fn build(self) -> ConfigResult<TimeLimiterConfig> {
        self.config.validate()?;
        Ok(self.config)
    }
}

/// Point-in-time counters of a time limiter
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TimeLimiterMetrics {
    /// Calls that returned `Ok` in time
    pub successful_calls: u64,
    /// Calls that returned `Err` in time
    pub failed_calls: u64,
    /// Calls that missed the deadline
    pub timed_out_calls: u64,
}

impl TimeLimiterMetrics {
    /// Calls finished or abandoned since creation
    pub fn total_calls(&self) -> u64 {
        self.successful_calls + self.failed_calls + self.timed_out_calls
    }

    /// Get a human-readable status message
    pub fn status_message(&self) -> String {
        format!(
            "Time limiter: {} succeeded, {} failed, {} timed out",
            self.successful_calls, self.failed_calls, self.timed_out_calls
        )
    }
}

#[derive(Default)]
struct Counters {
    successful: AtomicU64,
    failed: AtomicU64,
    timed_out: AtomicU64,
}

struct Inner {
    name: Arc<str>,
    config: TimeLimiterConfig,
    counters: Counters,
    events: EventPublisher,
}

/// Deadline enforcement for async calls
///
/// # Examples
///
/// ```rust
/// use std::time::Duration;
///
/// use resilience_core::time_limiter::{TimeLimiter, TimeLimiterConfig};
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let config = TimeLimiterConfig::builder().timeout_duration(Duration::from_millis(250)).build()?;
/// let limiter = TimeLimiter::new("pricing", config)?;
///
/// let price = limiter.execute(|| async { Ok::<_, std::io::Error>(42) }).await?;
/// assert_eq!(price, 42);
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct TimeLimiter {
    inner: Arc<Inner>,
}

impl TimeLimiter {
    /// Create a time limiter after validating `config`
    pub fn new(name: &str, config: TimeLimiterConfig) -> ConfigResult<Self> {
        config.validate()?;
        Ok(Self::from_config(name, config))
    }

    /// Create a time limiter with the default one-second deadline
    pub fn with_defaults(name: &str) -> Self {
        Self::from_config(name, TimeLimiterConfig::default())
    }

    fn from_config(name: &str, config: TimeLimiterConfig) -> Self {
        Self {
            inner: Arc::new(Inner {
                name: Arc::from(name),
                config,
                counters: Counters::default(),
                events: EventPublisher::new(),
            }),
        }
    }

    /// Get the time limiter name
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Get the configuration
    pub fn config(&self) -> &TimeLimiterConfig {
        &self.inner.config
    }

    /// Register an event listener
    pub fn subscribe<F>(&self, listener: F) -> ListenerId
    where
        F: Fn(&ResilienceEvent) + Send + Sync + 'static,
    {
        self.inner.events.subscribe(listener)
    }

    /// Remove a listener registered with [`subscribe`](Self::subscribe)
    pub fn unsubscribe(&self, id: ListenerId) -> bool {
        self.inner.events.unsubscribe(id)
    }

    /// Run `operation`, dropping it if it outlives the deadline
    ///
    /// The call is polled in place, so a late call is always cancelled
    /// regardless of `cancel_running_future`.
    #[instrument(skip(self, operation), fields(limiter = %self.inner.name))]
    pub async fn execute<F, Fut, T, E>(&self, operation: F) -> ResilienceResult<T, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: std::error::Error + Send + Sync + 'static,
    {
        let timeout = self.inner.config.timeout_duration;
        let started = Instant::now();
        match tokio::time::timeout(timeout, operation()).await {
            Ok(result) => self.on_completed(result, started.elapsed()),
            Err(_) => Err(self.on_timeout()),
        }
    }

    /// Run `operation` as a separate task bounded by the deadline
    ///
    /// A late task is aborted when `cancel_running_future` is set and
    /// detached otherwise. A task that panics yields
    /// [`ResilienceError::WorkerLost`].
    #[instrument(skip(self, operation), fields(limiter = %self.inner.name))]
    pub async fn execute_spawned<F, Fut, T, E>(&self, operation: F) -> ResilienceResult<T, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
        T: Send + 'static,
        E: std::error::Error + Send + Sync + 'static,
    {
        let timeout = self.inner.config.timeout_duration;
        let started = Instant::now();
        let mut task = tokio::spawn(operation());

        match tokio::time::timeout(timeout, &mut task).await {
            Ok(Ok(result)) => self.on_completed(result, started.elapsed()),
            Ok(Err(join_error)) => {
                warn!(limiter = %self.inner.name, %join_error, "Time-limited task did not complete");
                self.inner.counters.failed.fetch_add(1, Ordering::Relaxed);
                Err(ResilienceError::WorkerLost)
            }
            Err(_) => {
                if self.inner.config.cancel_running_future {
                    task.abort();
                } else {
                    debug!(limiter = %self.inner.name, "Late task left running");
                }
                Err(self.on_timeout())
            }
        }
    }

    /// Get current metrics
    pub fn metrics(&self) -> TimeLimiterMetrics {
        let counters = &self.inner.counters;
        TimeLimiterMetrics {
            successful_calls: counters.successful.load(Ordering::Relaxed),
            failed_calls: counters.failed.load(Ordering::Relaxed),
            timed_out_calls: counters.timed_out.load(Ordering::Relaxed),
        }
    }

    fn on_completed<T, E>(&self, result: Result<T, E>, duration: Duration) -> ResilienceResult<T, E>
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        let inner = &self.inner;
        let (counter, outcome) = match &result {
            Ok(_) => (&inner.counters.successful, Outcome::Success),
            Err(_) => (&inner.counters.failed, Outcome::Error),
        };
        counter.fetch_add(1, Ordering::Relaxed);
        inner.events.publish_with(|| ResilienceEvent::CallRecorded {
            name: Arc::clone(&inner.name),
            outcome,
            duration,
        });
        result.map_err(|source| ResilienceError::OperationFailed { source })
    }

    fn on_timeout<E>(&self) -> ResilienceError<E>
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        let inner = &self.inner;
        let timeout = inner.config.timeout_duration;
        inner.counters.timed_out.fetch_add(1, Ordering::Relaxed);
        debug!(limiter = %inner.name, ?timeout, "Call timed out");
        inner.events.publish_with(|| ResilienceEvent::CallTimedOut {
            name: Arc::clone(&inner.name),
            timeout,
        });
        ResilienceError::timed_out(&inner.name, timeout)
    }
}

impl fmt::Debug for TimeLimiter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TimeLimiter")
            .field("name", &self.inner.name)
            .field("config", &self.inner.config)
            .field("metrics", &self.metrics())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::io;
    use std::sync::atomic::AtomicBool;

    use parking_lot::Mutex;

    use super::*;

    fn limiter(timeout: Duration, cancel: bool) -> TimeLimiter {
        let config = TimeLimiterConfig::builder()
            .timeout_duration(timeout)
            .cancel_running_future(cancel)
            .build()
            .unwrap();
        TimeLimiter::new("pricing", config).unwrap()
    }

    // ========================================================================
    // Configuration
    // ========================================================================

    /// Validates `TimeLimiterConfig` defaults and validation.
    ///
    /// Assertions:
    /// - Confirms the default is a one-second deadline that cancels late calls.
    /// - Ensures a zero deadline is rejected.
    #[test]
    fn test_config_validation() {
        let config = TimeLimiterConfig::default();
        assert_eq!(config.timeout_duration, Duration::from_secs(1));
        assert!(config.cancel_running_future);
        assert!(config.validate().is_ok());

        let zero = TimeLimiterConfig::builder().timeout_duration(Duration::ZERO).build();
        assert!(matches!(zero, Err(ConfigError::Invalid { .. })));
        assert_eq!(TimeLimiter::with_defaults("defaults").config(), &config);
    }

    // ========================================================================
    // Execution
    // ========================================================================

    /// Validates calls that finish before the deadline.
    ///
    /// Assertions:
    /// - Confirms values pass through and errors keep their source.
    /// - Confirms success and failure counters and recorded events.
    #[tokio::test(start_paused = true)]
    async fn test_execute_within_deadline() {
        let limiter = limiter(Duration::from_secs(1), true);
        let events = Arc::new(Mutex::new(Vec::new()));
        {
            let events = Arc::clone(&events);
            limiter.subscribe(move |event| events.lock().push(event.clone()));
        }

        let value = limiter
            .execute(|| async {
                tokio::time::sleep(Duration::from_millis(500)).await;
                Ok::<_, io::Error>(42)
            })
            .await;
        assert_eq!(value.unwrap(), 42);

        let failed = limiter.execute(|| async { Err::<(), _>(io::Error::other("declined")) }).await;
        assert_eq!(failed.unwrap_err().into_source().unwrap().to_string(), "declined");

        let metrics = limiter.metrics();
        assert_eq!(metrics.successful_calls, 1);
        assert_eq!(metrics.failed_calls, 1);
        assert_eq!(metrics.timed_out_calls, 0);

        let events = events.lock();
        assert!(matches!(
            events[0],
            ResilienceEvent::CallRecorded { outcome: Outcome::Success, .. }
        ));
        assert!(matches!(events[1], ResilienceEvent::CallRecorded { outcome: Outcome::Error, .. }));
    }

    /// Validates a call that outlives its deadline.
    ///
    /// Assertions:
    /// - Confirms the caller gets `TimedOut` naming the limiter and deadline.
    /// - Confirms the late call is dropped before it can finish.
    /// - Confirms the timeout is counted and published.
    #[tokio::test(start_paused = true)]
    async fn test_execute_times_out() {
        let limiter = limiter(Duration::from_millis(300), true);
        let finished = AtomicBool::new(false);
        let timeouts = Arc::new(Mutex::new(Vec::new()));
        {
            let timeouts = Arc::clone(&timeouts);
            limiter.subscribe(move |event| {
                if let ResilienceEvent::CallTimedOut { timeout, .. } = event {
                    timeouts.lock().push(*timeout);
                }
            });
        }

        let result = limiter
            .execute(|| async {
                tokio::time::sleep(Duration::from_millis(500)).await;
                finished.store(true, Ordering::SeqCst);
                Ok::<_, io::Error>(0)
            })
            .await;

        let error = result.unwrap_err();
        assert!(matches!(error, ResilienceError::TimedOut { .. }));
        assert!(!error.is_rejection());
        assert_eq!(error.to_string(), "Call to 'pricing' timed out after 300ms");

        tokio::time::sleep(Duration::from_secs(1)).await;
        assert!(!finished.load(Ordering::SeqCst));
        assert_eq!(limiter.metrics().timed_out_calls, 1);
        assert_eq!(*timeouts.lock(), vec![Duration::from_millis(300)]);
    }

    /// Validates `cancel_running_future` on spawned calls.
    ///
    /// Assertions:
    /// - Confirms a late task is aborted when cancellation is on.
    /// - Confirms a late task runs to completion when cancellation is off.
    /// - Confirms both callers see `TimedOut` at the deadline.
    #[tokio::test(start_paused = true)]
    async fn test_execute_spawned_cancel_running_future() {
        for (cancel, expect_finished) in [(true, false), (false, true)] {
            let limiter = limiter(Duration::from_millis(100), cancel);
            let finished = Arc::new(AtomicBool::new(false));

            let result = limiter
                .execute_spawned({
                    let finished = Arc::clone(&finished);
                    || async move {
                        tokio::time::sleep(Duration::from_millis(250)).await;
                        finished.store(true, Ordering::SeqCst);
                        Ok::<_, io::Error>(())
                    }
                })
                .await;
            assert!(matches!(result, Err(ResilienceError::TimedOut { .. })));

            tokio::time::sleep(Duration::from_millis(500)).await;
            assert_eq!(finished.load(Ordering::SeqCst), expect_finished, "cancel = {cancel}");
        }
    }

    /// Validates spawned calls that finish or panic before the deadline.
    ///
    /// Assertions:
    /// - Confirms a value comes back from the task.
    /// - Confirms a panicking task yields `WorkerLost` and counts as failed.
    #[tokio::test]
    async fn test_execute_spawned_completes() {
        let limiter = limiter(Duration::from_secs(5), true);

        let value = limiter.execute_spawned(|| async { Ok::<_, io::Error>("quote") }).await;
        assert_eq!(value.unwrap(), "quote");

        let lost = limiter
            .execute_spawned(|| async {
                Result::<&str, io::Error>::Err(panic!("pricing task panicked"))
            })
            .await;
        assert!(matches!(lost, Err(ResilienceError::WorkerLost)));
        assert_eq!(limiter.metrics().total_calls(), 2);
        assert_eq!(limiter.metrics().failed_calls, 1);
    }
}
