use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument};

use super::Bulkhead;
use crate::error::{ConfigError, ConfigResult, RejectionReason, ResilienceError, ResilienceResult};
use crate::event::{EventPublisher, ListenerId, ResilienceEvent};

/// Configuration for bulkhead behavior
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct BulkheadConfig {
    /// Maximum number of concurrent operations allowed
    pub max_concurrent_calls: usize,
    /// Longest a caller waits for a permit; zero fails immediately when full
    #[cfg_attr(feature = "serde", serde(with = "crate::duration_millis"))]
    pub max_wait_duration: Duration,
}

impl Default for BulkheadConfig {
    fn default() -> Self {
        Self { max_concurrent_calls: 25, max_wait_duration: Duration::ZERO }
    }
}

impl BulkheadConfig {
    /// Create a new configuration builder
    pub fn builder() -> BulkheadConfigBuilder {
        BulkheadConfigBuilder::new()
    }

    /// Validate the configuration
    pub fn validate(&self) -> ConfigResult<()> {
        if self.max_concurrent_calls == 0 {
            return Err(ConfigError::invalid("max_concurrent_calls must be greater than 0"));
        }
        Ok(())
    }
}

/// Builder for BulkheadConfig
#[derive(Debug, Default)]
pub struct BulkheadConfigBuilder {
    config: BulkheadConfig,
}

impl BulkheadConfigBuilder {
    /// Create a builder starting from the defaults
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the concurrency cap
    pub fn max_concurrent_calls(mut self, max: usize) -> Self {
        self.config.max_concurrent_calls = max;
        self
    }

    /// Set how long a caller may wait for a permit
    pub fn max_wait_duration(mut self, wait: Duration) -> Self {
        self.config.max_wait_duration = wait;
        self
    }

    /// Validate and return the configuration
    pub fn build(self) -> ConfigResult<BulkheadConfig> {
        self.config.validate()?;
        Ok(self.config)
    }
}

/// Metrics for bulkhead monitoring
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BulkheadMetrics {
    /// Permits granted since creation
    pub total_operations: u64,
    /// Requests refused because the bulkhead was full
    pub rejected_operations: u64,
    /// Requests that gave up after waiting the maximum duration
    pub timeout_count: u64,
    /// Permits currently in use
    pub current_concurrent: usize,
    /// Current cap on concurrent permits
    pub max_concurrent: usize,
}

impl BulkheadMetrics {
    /// Calculate the current utilization as a fraction (0.0 to 1.0, above 1.0
    /// right after the cap shrinks)
    pub fn utilization(&self) -> f64 {
        if self.max_concurrent == 0 {
            return 0.0;
        }
        self.current_concurrent as f64 / self.max_concurrent as f64
    }

    /// Calculate the rejection rate as a fraction (0.0 to 1.0)
    pub fn rejection_rate(&self) -> f64 {
        let refused = self.rejected_operations + self.timeout_count;
        let total = self.total_operations + refused;
        if total == 0 {
            return 0.0;
        }
        refused as f64 / total as f64
    }

    /// Permits still free at the time of the snapshot
    pub fn available_calls(&self) -> usize {
        self.max_concurrent.saturating_sub(self.current_concurrent)
    }

    /// Check if the bulkhead is at capacity
    pub fn is_at_capacity(&self) -> bool {
        self.current_concurrent >= self.max_concurrent
    }

    /// Get a human-readable status message
    pub fn status_message(&self) -> String {
        format!(
            "Bulkhead: {}/{} concurrent ({:.1}% utilized), {} rejected, {} timeouts",
            self.current_concurrent,
            self.max_concurrent,
            self.utilization() * 100.0,
            self.rejected_operations,
            self.timeout_count
        )
    }
}

/// How a wait for a permit ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Acquisition {
    Acquired,
    Full,
    TimedOut(Duration),
    Cancelled,
}

struct Inner {
    name: Arc<str>,
    acquired: AtomicUsize,
    max_concurrent: AtomicUsize,
    max_wait_nanos: AtomicU64,
    released: Notify,
    total_operations: AtomicU64,
    rejected_operations: AtomicU64,
    timeout_count: AtomicU64,
    events: EventPublisher,
}

impl Inner {
    fn try_acquire_slot(&self) -> bool {
        let max = self.max_concurrent.load(Ordering::Acquire);
        let mut current = self.acquired.load(Ordering::Acquire);
        loop {
            if current >= max {
                return false;
            }
            match self.acquired.compare_exchange_weak(
                current,
                current + 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return true,
                Err(actual) => current = actual,
            }
        }
    }

    /// Give a permit back; releasing with none in use is a no-op
    fn release_slot(&self) {
        let mut current = self.acquired.load(Ordering::Acquire);
        while current > 0 {
            match self.acquired.compare_exchange_weak(
                current,
                current - 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => {
                    self.released.notify_waiters();
                    return;
                }
                Err(actual) => current = actual,
            }
        }
    }
}

/// Permit that returns itself to the bulkhead when dropped
#[must_use = "the permit is released as soon as it is dropped"]
pub struct BulkheadPermit {
    inner: Arc<Inner>,
}

impl Drop for BulkheadPermit {
    fn drop(&mut self) {
        self.inner.release_slot();
    }
}

impl fmt::Debug for BulkheadPermit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BulkheadPermit").field("bulkhead", &self.inner.name).finish()
    }
}

/// Bulkhead for limiting concurrent operations
///
/// Callers beyond the cap wait up to `max_wait_duration` for a permit and are
/// then refused. Waiters are woken in no particular order.
///
/// # Examples
///
/// ```rust
/// use std::time::Duration;
///
/// use resilience_core::bulkhead::{BulkheadConfig, SemaphoreBulkhead};
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let config = BulkheadConfig::builder()
///     .max_concurrent_calls(5)
///     .max_wait_duration(Duration::from_millis(100))
///     .build()?;
/// let bulkhead = SemaphoreBulkhead::new("db-pool", config)?;
///
/// let rows = bulkhead.execute(|| async { Ok::<_, std::io::Error>(3) }).await?;
/// assert_eq!(rows, 3);
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct SemaphoreBulkhead {
    inner: Arc<Inner>,
}

impl SemaphoreBulkhead {
    /// Create a new bulkhead with the given configuration
    pub fn new(name: &str, config: BulkheadConfig) -> ConfigResult<Self> {
        config.validate()?;
        Ok(Self {
            inner: Arc::new(Inner {
                name: Arc::from(name),
                acquired: AtomicUsize::new(0),
                max_concurrent: AtomicUsize::new(config.max_concurrent_calls),
                max_wait_nanos: AtomicU64::new(duration_nanos(config.max_wait_duration)),
                released: Notify::new(),
                total_operations: AtomicU64::new(0),
                rejected_operations: AtomicU64::new(0),
                timeout_count: AtomicU64::new(0),
                events: EventPublisher::new(),
            }),
        })
    }

    /// Create a bulkhead with default configuration
    pub fn with_defaults(name: &str) -> ConfigResult<Self> {
        Self::new(name, BulkheadConfig::default())
    }

    /// Current concurrency cap
    pub fn max_concurrent_calls(&self) -> usize {
        self.inner.max_concurrent.load(Ordering::Acquire)
    }

    /// Current permit wait
    pub fn max_wait_duration(&self) -> Duration {
        Duration::from_nanos(self.inner.max_wait_nanos.load(Ordering::Acquire))
    }

    /// Permits currently held
    pub fn concurrent_calls(&self) -> usize {
        self.inner.acquired.load(Ordering::Acquire)
    }

    /// Change the cap on concurrent permits
    ///
    /// Growing wakes waiters. Shrinking never revokes permits already held;
    /// new acquisitions are refused until enough of them are released.
    pub fn change_max_concurrent_calls(&self, max: usize) -> ConfigResult<()> {
        if max == 0 {
            return Err(ConfigError::invalid("max_concurrent_calls must be greater than 0"));
        }
        let previous = self.inner.max_concurrent.swap(max, Ordering::AcqRel);
        if max > previous {
            self.inner.released.notify_waiters();
        }
        debug!(bulkhead = %self.inner.name, previous, max, "Changed max concurrent calls");
        Ok(())
    }

    /// Change the permit wait for later callers
    pub fn change_max_wait_duration(&self, wait: Duration) {
        self.inner.max_wait_nanos.store(duration_nanos(wait), Ordering::Release);
    }

    /// Register an event listener
    pub fn subscribe<F>(&self, listener: F) -> ListenerId
    where
        F: Fn(&ResilienceEvent) + Send + Sync + 'static,
    {
        self.inner.events.subscribe(listener)
    }

    /// Take a permit guard if one is free, without waiting
    pub fn try_acquire(&self) -> Option<BulkheadPermit> {
        self.try_acquire_permission().then(|| self.permit())
    }

    /// Wait up to `max_wait_duration` for a permit, then refuse
    pub async fn acquire_permission(&self) -> bool {
        self.acquire_slot(None).await == Acquisition::Acquired
    }

    /// Like [`acquire_permission`](Self::acquire_permission), but gives up as
    /// soon as `cancel` fires
    pub async fn acquire_permission_cancellable(&self, cancel: &CancellationToken) -> bool {
        self.acquire_slot(Some(cancel)).await == Acquisition::Acquired
    }

    /// Wait for a permit guard, returning the refusal as an error
    pub async fn acquire<E>(&self) -> ResilienceResult<BulkheadPermit, E>
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        match self.acquire_slot(None).await {
            Acquisition::Acquired => Ok(self.permit()),
            Acquisition::TimedOut(timeout) => Err(ResilienceError::Timeout { timeout }),
            Acquisition::Full | Acquisition::Cancelled => {
                Err(ResilienceError::rejected(&self.inner.name, RejectionReason::BulkheadFull))
            }
        }
    }

    /// Execute an operation with bulkhead protection
    ///
    /// Acquires a permit (waiting if necessary up to the configured maximum),
    /// executes the operation, and releases the permit when done, including
    /// when the returned future is dropped early.
    #[instrument(skip(self, operation), fields(bulkhead = %self.inner.name, concurrent = self.concurrent_calls()))]
    pub async fn execute<F, Fut, T, E>(&self, operation: F) -> ResilienceResult<T, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: std::error::Error + Send + Sync + 'static,
    {
        let _permit = self.acquire::<E>().await?;
        operation().await.map_err(|source| ResilienceError::OperationFailed { source })
    }

    /// Get bulkhead metrics
    pub fn metrics(&self) -> BulkheadMetrics {
        let inner = &self.inner;
        BulkheadMetrics {
            total_operations: inner.total_operations.load(Ordering::Acquire),
            rejected_operations: inner.rejected_operations.load(Ordering::Acquire),
            timeout_count: inner.timeout_count.load(Ordering::Acquire),
            current_concurrent: self.concurrent_calls(),
            max_concurrent: self.max_concurrent_calls(),
        }
    }

    /// Reset metrics counters
    pub fn reset_metrics(&self) {
        self.inner.total_operations.store(0, Ordering::Release);
        self.inner.rejected_operations.store(0, Ordering::Release);
        self.inner.timeout_count.store(0, Ordering::Release);
    }

    pub(crate) async fn acquire_slot(&self, cancel: Option<&CancellationToken>) -> Acquisition {
        let outcome = self.wait_for_slot(cancel).await;
        self.record(outcome);
        outcome
    }

    fn permit(&self) -> BulkheadPermit {
        BulkheadPermit { inner: Arc::clone(&self.inner) }
    }

    async fn wait_for_slot(&self, cancel: Option<&CancellationToken>) -> Acquisition {
        let inner = &self.inner;
        if inner.try_acquire_slot() {
            return Acquisition::Acquired;
        }
        let max_wait = self.max_wait_duration();
        if max_wait.is_zero() {
            return Acquisition::Full;
        }

        let deadline = tokio::time::Instant::now() + max_wait;
        let cancelled = async {
            match cancel {
                Some(token) => token.cancelled().await,
                None => std::future::pending().await,
            }
        };
        tokio::pin!(cancelled);

        loop {
            let notified = inner.released.notified();
            tokio::pin!(notified);
            // Register before re-checking so a release in between is not lost
            notified.as_mut().enable();
            if inner.try_acquire_slot() {
                return Acquisition::Acquired;
            }

            tokio::select! {
                () = &mut notified => {}
                () = tokio::time::sleep_until(deadline) => {
                    return if inner.try_acquire_slot() {
                        Acquisition::Acquired
                    } else {
                        Acquisition::TimedOut(max_wait)
                    };
                }
                () = &mut cancelled => return Acquisition::Cancelled,
            }
        }
    }

    fn record(&self, outcome: Acquisition) {
        let inner = &self.inner;
        match outcome {
            Acquisition::Acquired => {
                inner.total_operations.fetch_add(1, Ordering::Relaxed);
                inner
                    .events
                    .publish_with(|| ResilienceEvent::PermissionAcquired { name: Arc::clone(&inner.name) });
                return;
            }
            Acquisition::TimedOut(_) => {
                inner.timeout_count.fetch_add(1, Ordering::Relaxed);
            }
            Acquisition::Full | Acquisition::Cancelled => {
                inner.rejected_operations.fetch_add(1, Ordering::Relaxed);
            }
        }
        debug!(bulkhead = %inner.name, ?outcome, "Bulkhead refused call");
        inner.events.publish_with(|| ResilienceEvent::CallNotPermitted {
            name: Arc::clone(&inner.name),
            reason: RejectionReason::BulkheadFull,
        });
    }
}

impl Bulkhead for SemaphoreBulkhead {
    fn name(&self) -> &str {
        &self.inner.name
    }

    fn try_acquire_permission(&self) -> bool {
        let outcome =
            if self.inner.try_acquire_slot() { Acquisition::Acquired } else { Acquisition::Full };
        self.record(outcome);
        outcome == Acquisition::Acquired
    }

    fn release(&self) {
        self.inner.release_slot();
    }

    fn available_calls(&self) -> usize {
        self.max_concurrent_calls().saturating_sub(self.concurrent_calls())
    }
}

impl fmt::Debug for SemaphoreBulkhead {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SemaphoreBulkhead")
            .field("name", &self.inner.name)
            .field("max_concurrent_calls", &self.max_concurrent_calls())
            .field("max_wait_duration", &self.max_wait_duration())
            .field("concurrent_calls", &self.concurrent_calls())
            .finish()
    }
}

fn duration_nanos(duration: Duration) -> u64 {
    u64::try_from(duration.as_nanos()).unwrap_or(u64::MAX)
}
