//! Additive-increase / multiplicative-decrease concurrency limiting
//!
//! [`AimdLimiter`] watches call outcomes through an outcome window and moves
//! a concurrency limit between `min_limit` and `max_limit`: it grows by one
//! while callers keep the current limit busy and shrinks by a multiplier as
//! soon as the failure or slow-call rate crosses its threshold.
//! [`AdaptiveBulkhead`] applies that limit to a [`SemaphoreBulkhead`].

use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, instrument, warn};

use crate::bulkhead::{Bulkhead, BulkheadConfig, BulkheadMetrics, SemaphoreBulkhead};
use crate::clock::{Clock, SystemClock};
use crate::error::{ConfigError, ConfigResult, ResilienceError, ResilienceResult};
use crate::event::{EventPublisher, ListenerId, ResilienceEvent};
use crate::window::{Outcome, OutcomeWindow, SlidingWindowType, Snapshot, WindowConfig};

/// Substituted for a drop multiplier outside `0.5..=1.0`
pub const DEFAULT_DROP_MULTIPLIER: f64 = 0.85;

/// Configuration for the AIMD limiter
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct AimdConfig {
    /// Window the limiter reads its rates from
    pub window: WindowConfig,
    /// Lowest limit, also the starting limit
    pub min_limit: u32,
    /// Highest limit
    pub max_limit: u32,
    /// Factor applied on a drop; values outside `0.5..=1.0` use
    /// [`DEFAULT_DROP_MULTIPLIER`]
    pub concurrency_drop_multiplier: f64,
    /// The limit grows when `in_flight * factor >= limit`
    pub limit_increment_inflight_factor: f64,
    /// Calls slower than this count as slow
    #[cfg_attr(feature = "serde", serde(with = "crate::duration_millis"))]
    pub desirable_latency: Duration,
    /// Failure percentage that triggers a drop
    pub failure_rate_threshold: f64,
    /// Slow-call percentage that triggers a drop
    pub slow_call_rate_threshold: f64,
}

impl Default for AimdConfig {
    fn default() -> Self {
        Self {
            window: WindowConfig::default(),
            min_limit: 2,
            max_limit: 25,
            concurrency_drop_multiplier: DEFAULT_DROP_MULTIPLIER,
            limit_increment_inflight_factor: 1.0,
            desirable_latency: Duration::from_secs(5),
            failure_rate_threshold: 50.0,
            slow_call_rate_threshold: 50.0,
        }
    }
}

impl AimdConfig {
    /// Create a new configuration builder
    pub fn builder() -> AimdConfigBuilder {
        AimdConfigBuilder::new()
    }

    /// Validate the configuration
    pub fn validate(&self) -> ConfigResult<()> {
        self.window.validate()?;
        if self.min_limit == 0 {
            return Err(ConfigError::invalid("min_limit must be greater than 0"));
        }
        if self.max_limit < self.min_limit {
            return Err(ConfigError::invalid(format!(
                "max_limit ({}) must be >= min_limit ({})",
                self.max_limit, self.min_limit
            )));
        }
        if !self.limit_increment_inflight_factor.is_finite()
            || self.limit_increment_inflight_factor <= 0.0
        {
            return Err(ConfigError::invalid("limit_increment_inflight_factor must be positive"));
        }
        if self.desirable_latency.is_zero() {
            return Err(ConfigError::invalid("desirable_latency must be non-zero"));
        }
        for (field, rate) in [
            ("failure_rate_threshold", self.failure_rate_threshold),
            ("slow_call_rate_threshold", self.slow_call_rate_threshold),
        ] {
            if !(rate > 0.0 && rate <= 100.0) {
                return Err(ConfigError::invalid(format!("{field} must be in (0, 100], got {rate}")));
            }
        }
        Ok(())
    }

    /// Drop multiplier actually applied
    pub fn effective_drop_multiplier(&self) -> f64 {
        if (0.5..=1.0).contains(&self.concurrency_drop_multiplier) {
            self.concurrency_drop_multiplier
        } else {
            DEFAULT_DROP_MULTIPLIER
        }
    }
}

/// Builder for AimdConfig
#[derive(Debug, Default)]
pub struct AimdConfigBuilder {
    config: AimdConfig,
}

impl AimdConfigBuilder {
    /// Create a builder starting from the defaults
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the window shape, size and minimum calls
    pub fn sliding_window(
        mut self,
        size: usize,
        minimum_number_of_calls: u64,
        window_type: SlidingWindowType,
    ) -> Self {
        self.config.window = WindowConfig {
            sliding_window_type: window_type,
            sliding_window_size: size,
            minimum_number_of_calls,
        };
        self
    }

    /// Set the lowest (and starting) limit
    pub fn min_limit(mut self, limit: u32) -> Self {
        self.config.min_limit = limit;
        self
    }

    /// Set the highest limit
    pub fn max_limit(mut self, limit: u32) -> Self {
        self.config.max_limit = limit;
        self
    }

    /// Out-of-range values fall back to [`DEFAULT_DROP_MULTIPLIER`]
    pub fn concurrency_drop_multiplier(mut self, multiplier: f64) -> Self {
        self.config.concurrency_drop_multiplier = multiplier;
        self.config.concurrency_drop_multiplier = self.config.effective_drop_multiplier();
        self
    }

    /// Set the in-flight factor gating additive increase
    pub fn limit_increment_inflight_factor(mut self, factor: f64) -> Self {
        self.config.limit_increment_inflight_factor = factor;
        self
    }

    /// Set the latency above which calls count as slow
    pub fn desirable_latency(mut self, latency: Duration) -> Self {
        self.config.desirable_latency = latency;
        self
    }

    /// Set the failure percentage that triggers a drop
    pub fn failure_rate_threshold(mut self, percentage: f64) -> Self {
        self.config.failure_rate_threshold = percentage;
        self
    }

    /// Set the slow-call percentage that triggers a drop
    pub fn slow_call_rate_threshold(mut self, percentage: f64) -> Self {
        self.config.slow_call_rate_threshold = percentage;
        self
    }

    /// Validate and return the configuration
    pub fn build(self) -> ConfigResult<AimdConfig> {
        self.config.validate()?;
        Ok(self.config)
    }
}

/// Result of feeding one outcome to the limiter
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LimitAdjustment {
    /// Limit before the outcome was applied
    pub previous_limit: u32,
    /// Limit after the outcome was applied
    pub new_limit: u32,
    /// Back-pressure hint after a drop; zero otherwise
    pub suggested_wait: Duration,
}

impl LimitAdjustment {
    /// Whether the limit moved
    pub fn changed(&self) -> bool {
        self.previous_limit != self.new_limit
    }
}

/// Limit change decided from one snapshot
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Decision {
    Hold,
    Drop,
    Increase,
}

struct Inner<C: Clock> {
    name: Arc<str>,
    config: AimdConfig,
    limit: AtomicU32,
    window: Arc<dyn OutcomeWindow>,
    events: EventPublisher,
    clock: Arc<C>,
}

/// AIMD concurrency limiter
///
/// # Examples
///
/// ```rust
/// use std::time::Duration;
///
/// use resilience_core::adaptive::{AimdConfig, AimdLimiter};
///
/// # fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let limiter = AimdLimiter::new("ingest", AimdConfig::default())?;
/// let adjustment = limiter.on_result(Duration::from_millis(20), true, 2);
/// assert_eq!(adjustment.new_limit, limiter.limit());
/// # Ok(())
/// # }
/// ```
pub struct AimdLimiter<C: Clock = SystemClock> {
    inner: Arc<Inner<C>>,
}

impl<C: Clock> Clone for AimdLimiter<C> {
    fn clone(&self) -> Self {
        Self { inner: Arc::clone(&self.inner) }
    }
}

impl<C: Clock> fmt::Debug for AimdLimiter<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AimdLimiter")
            .field("name", &self.inner.name)
            .field("limit", &self.limit())
            .field("config", &self.inner.config)
            .finish()
    }
}

impl AimdLimiter<SystemClock> {
    /// Create a limiter on the system clock
    pub fn new(name: &str, config: AimdConfig) -> ConfigResult<Self> {
        Self::with_clock(name, config, SystemClock)
    }
}

impl<C: Clock> AimdLimiter<C> {
    /// Create a limiter with a custom clock (useful for time-based windows
    /// in tests)
    pub fn with_clock(name: &str, config: AimdConfig, clock: C) -> ConfigResult<Self> {
        config.validate()?;
        let clock = Arc::new(clock);
        Ok(Self {
            inner: Arc::new(Inner {
                name: Arc::from(name),
                limit: AtomicU32::new(config.min_limit),
                window: config.window.allocate(&clock),
                config,
                events: EventPublisher::new(),
                clock,
            }),
        })
    }

    /// Get the limiter name
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Get the configuration
    pub fn config(&self) -> &AimdConfig {
        &self.inner.config
    }

    /// Current concurrency limit
    pub fn limit(&self) -> u32 {
        self.inner.limit.load(Ordering::Acquire)
    }

    /// Aggregate of the limiter's window
    pub fn snapshot(&self) -> Snapshot {
        self.inner.window.snapshot()
    }

    /// Register an event listener
    pub fn subscribe<F>(&self, listener: F) -> ListenerId
    where
        F: Fn(&ResilienceEvent) + Send + Sync + 'static,
    {
        self.inner.events.subscribe(listener)
    }

    /// Record one finished call and adapt the limit
    ///
    /// `in_flight` is the number of calls running when this one finished,
    /// including itself.
    pub fn on_result(&self, call_time: Duration, success: bool, in_flight: u32) -> LimitAdjustment {
        let inner = &self.inner;
        let config = &inner.config;
        let outcome = Outcome::from_duration(success, call_time, config.desirable_latency);
        let snapshot = inner.window.record(call_time, outcome);
        let decision = self.decide(&snapshot);

        let suggested_wait = match decision {
            Decision::Drop => config.desirable_latency.saturating_sub(snapshot.average_duration()),
            Decision::Hold | Decision::Increase => Duration::ZERO,
        };

        let previous = match inner.limit.fetch_update(Ordering::AcqRel, Ordering::Acquire, |limit| {
            Some(self.next_limit(limit, decision, in_flight))
        }) {
            Ok(previous) | Err(previous) => previous,
        };
        let new_limit = self.next_limit(previous, decision, in_flight);

        if new_limit != previous {
            debug!(
                limiter = %inner.name,
                previous,
                new_limit,
                failure_rate = snapshot.failure_rate,
                slow_call_rate = snapshot.slow_call_rate,
                "Adjusted concurrency limit"
            );
            let name = Arc::clone(&inner.name);
            inner.events.publish_with(|| {
                if new_limit > previous {
                    ResilienceEvent::LimitIncreased { name, new_limit }
                } else {
                    ResilienceEvent::LimitDecreased { name, new_limit }
                }
            });
        }

        LimitAdjustment { previous_limit: previous, new_limit, suggested_wait }
    }

    fn decide(&self, snapshot: &Snapshot) -> Decision {
        let config = &self.inner.config;
        if !snapshot.has_enough_calls() {
            return Decision::Hold;
        }
        if snapshot.failure_rate >= config.failure_rate_threshold
            || snapshot.slow_call_rate >= config.slow_call_rate_threshold
        {
            Decision::Drop
        } else {
            Decision::Increase
        }
    }

    /// Apply one decision, then halve above the maximum and clamp
    fn next_limit(&self, limit: u32, decision: Decision, in_flight: u32) -> u32 {
        let config = &self.inner.config;
        let mut next = match decision {
            Decision::Hold => limit,
            Decision::Drop => {
                let dropped = (f64::from(limit) * config.effective_drop_multiplier()).floor();
                #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
                let dropped = dropped as u32;
                dropped.max(1)
            }
            Decision::Increase => {
                let pressure = f64::from(in_flight) * config.limit_increment_inflight_factor;
                if pressure >= f64::from(limit) {
                    limit.saturating_add(1)
                } else {
                    limit
                }
            }
        };
        if next > config.max_limit {
            next /= 2;
        }
        next.clamp(config.min_limit, config.max_limit)
    }
}

/// Metrics for an adaptive bulkhead
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AdaptiveBulkheadMetrics {
    /// Metrics of the underlying semaphore bulkhead
    pub bulkhead: BulkheadMetrics,
    /// Current AIMD limit
    pub limit: u32,
    /// Limiter window aggregate
    pub snapshot: Snapshot,
}

impl AdaptiveBulkheadMetrics {
    /// Get a human-readable status message
    pub fn status_message(&self) -> String {
        format!(
            "Adaptive bulkhead: limit {}, {}/{} concurrent, failure rate {:.1}%, slow call rate {:.1}%",
            self.limit,
            self.bulkhead.current_concurrent,
            self.bulkhead.max_concurrent,
            self.snapshot.failure_rate,
            self.snapshot.slow_call_rate
        )
    }
}

/// Semaphore bulkhead whose cap follows an [`AimdLimiter`]
///
/// Every permit must be settled with [`on_success`](Self::on_success) or
/// [`on_error`](Self::on_error), which release it and feed the limiter.
pub struct AdaptiveBulkhead<C: Clock = SystemClock> {
    bulkhead: SemaphoreBulkhead,
    limiter: AimdLimiter<C>,
}

impl<C: Clock> Clone for AdaptiveBulkhead<C> {
    fn clone(&self) -> Self {
        Self { bulkhead: self.bulkhead.clone(), limiter: self.limiter.clone() }
    }
}

impl<C: Clock> fmt::Debug for AdaptiveBulkhead<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AdaptiveBulkhead")
            .field("bulkhead", &self.bulkhead)
            .field("limiter", &self.limiter)
            .finish()
    }
}

impl AdaptiveBulkhead<SystemClock> {
    /// Create an adaptive bulkhead on the system clock
    pub fn new(name: &str, config: AimdConfig) -> ConfigResult<Self> {
        Self::with_clock(name, config, SystemClock)
    }
}

impl<C: Clock> AdaptiveBulkhead<C> {
    /// Create an adaptive bulkhead reading time from `clock`
    pub fn with_clock(name: &str, config: AimdConfig, clock: C) -> ConfigResult<Self> {
        let initial = usize::try_from(config.min_limit).unwrap_or(usize::MAX);
        let limiter = AimdLimiter::with_clock(name, config, clock)?;
        let bulkhead = SemaphoreBulkhead::new(
            name,
            BulkheadConfig { max_concurrent_calls: initial, max_wait_duration: Duration::ZERO },
        )?;
        Ok(Self { bulkhead, limiter })
    }

    /// The limiter driving this bulkhead
    pub fn limiter(&self) -> &AimdLimiter<C> {
        &self.limiter
    }

    /// Register a listener for both permit and limit events
    pub fn subscribe<F>(&self, listener: F) -> (ListenerId, ListenerId)
    where
        F: Fn(&ResilienceEvent) + Send + Sync + 'static,
    {
        let listener = Arc::new(listener);
        let for_limits = Arc::clone(&listener);
        (
            self.bulkhead.subscribe(move |event| listener(event)),
            self.limiter.subscribe(move |event| for_limits(event)),
        )
    }

    /// Wait for a permit up to the current suggested wait
    pub async fn acquire_permission(&self) -> bool {
        self.bulkhead.acquire_permission().await
    }

    /// Settle a successful call
    pub fn on_success(&self, duration: Duration) -> LimitAdjustment {
        self.on_result(duration, true)
    }

    /// Settle a failed call
    pub fn on_error(&self, duration: Duration) -> LimitAdjustment {
        self.on_result(duration, false)
    }

    /// Execute an operation within the adaptive limit
    #[instrument(skip(self, operation), fields(bulkhead = %self.bulkhead.name(), limit = self.limiter.limit()))]
    pub async fn execute<F, Fut, T, E>(&self, operation: F) -> ResilienceResult<T, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: std::error::Error + Send + Sync + 'static,
    {
        let permit = self.bulkhead.acquire::<E>().await?;
        let clock = &self.limiter.inner.clock;
        let start = clock.now();
        let result = operation().await;
        let elapsed = clock.now().saturating_duration_since(start);

        // Settle while the permit still counts toward in-flight calls
        self.adapt(elapsed, result.is_ok());
        drop(permit);
        result.map_err(|source| ResilienceError::OperationFailed { source })
    }

    /// Get current metrics
    pub fn metrics(&self) -> AdaptiveBulkheadMetrics {
        AdaptiveBulkheadMetrics {
            bulkhead: self.bulkhead.metrics(),
            limit: self.limiter.limit(),
            snapshot: self.limiter.snapshot(),
        }
    }

    fn on_result(&self, duration: Duration, success: bool) -> LimitAdjustment {
        let adjustment = self.adapt(duration, success);
        self.bulkhead.release();
        adjustment
    }

    /// Feed the limiter and push its decision into the bulkhead
    fn adapt(&self, duration: Duration, success: bool) -> LimitAdjustment {
        let in_flight = u32::try_from(self.bulkhead.concurrent_calls()).unwrap_or(u32::MAX);
        let adjustment = self.limiter.on_result(duration, success, in_flight);
        let cap = usize::try_from(adjustment.new_limit).unwrap_or(usize::MAX);
        if cap != self.bulkhead.max_concurrent_calls() {
            if let Err(error) = self.bulkhead.change_max_concurrent_calls(cap) {
                warn!(
                    bulkhead = %self.bulkhead.name(),
                    limit = adjustment.new_limit,
                    %error,
                    "Failed to apply adaptive limit"
                );
            }
        }
        self.bulkhead.change_max_wait_duration(adjustment.suggested_wait);
        adjustment
    }
}

impl<C: Clock> Bulkhead for AdaptiveBulkhead<C> {
    fn name(&self) -> &str {
        self.bulkhead.name()
    }

    fn try_acquire_permission(&self) -> bool {
        self.bulkhead.try_acquire_permission()
    }

    /// Give the permit back without feeding the limiter
    fn release(&self) {
        self.bulkhead.release();
    }

    fn available_calls(&self) -> usize {
        self.bulkhead.available_calls()
    }
}
