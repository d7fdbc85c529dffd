//! Lock-free rate limiter that hands out permits per refresh cycle
//!
//! Time is divided into cycles of `limit_refresh_period`. Each cycle makes
//! `limit_for_period` permits available; unused permits never carry over
//! beyond a single period. A caller willing to wait may reserve a permit from
//! a future cycle, which drives the available count below zero until the
//! debt is repaid by later cycles.
//!
//! The whole limiter state (active cycle plus available permits) lives in a
//! single `AtomicU64` and is advanced with a compare-and-swap loop, so the
//! hot path takes no locks.

use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument};

use crate::clock::{Clock, SystemClock};
use crate::error::{ConfigError, ConfigResult, RejectionReason, ResilienceError, ResilienceResult};
use crate::event::{EventPublisher, ListenerId, ResilienceEvent};

/// Returned by [`RateLimiter::reserve_permission`] when no permit fits the
/// caller's timeout
pub const RESERVATION_REJECTED: i64 = -1;

/// Configuration for rate limiter behavior
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct RateLimiterConfig {
    /// Permits available in each refresh cycle
    pub limit_for_period: u32,
    /// Length of one cycle
    #[cfg_attr(feature = "serde", serde(with = "crate::duration_millis"))]
    pub limit_refresh_period: Duration,
    /// Longest a caller waits for a permit by default
    #[cfg_attr(feature = "serde", serde(with = "crate::duration_millis"))]
    pub timeout_duration: Duration,
}

impl Default for RateLimiterConfig {
    fn default() -> Self {
        Self {
            limit_for_period: 50,
            limit_refresh_period: Duration::from_nanos(500),
            timeout_duration: Duration::from_secs(5),
        }
    }
}

impl RateLimiterConfig {
    /// Create a new configuration builder
    pub fn builder() -> RateLimiterConfigBuilder {
        RateLimiterConfigBuilder::new()
    }

    /// Validate the configuration
    pub fn validate(&self) -> ConfigResult<()> {
        validate_limit(self.limit_for_period)?;
        if self.limit_refresh_period < Duration::from_nanos(1) {
            return Err(ConfigError::invalid("limit_refresh_period must be at least 1ns"));
        }
        Ok(())
    }
}

fn validate_limit(limit: u32) -> ConfigResult<()> {
    if limit == 0 || i32::try_from(limit).is_err() {
        return Err(ConfigError::invalid(format!(
            "limit_for_period must be between 1 and {}, got {limit}",
            i32::MAX
        )));
    }
    Ok(())
}

/// Builder for RateLimiterConfig
#[derive(Debug, Default)]
pub struct RateLimiterConfigBuilder {
    config: RateLimiterConfig,
}

impl RateLimiterConfigBuilder {
    /// Create a builder starting from the defaults
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the permits granted per refresh period
    pub fn limit_for_period(mut self, limit: u32) -> Self {
        self.config.limit_for_period = limit;
        self
    }

    /// Set the length of one permit cycle
    pub fn limit_refresh_period(mut self, period: Duration) -> Self {
        self.config.limit_refresh_period = period;
        self
    }

    /// Set the default wait for a permit
    pub fn timeout_duration(mut self, timeout: Duration) -> Self {
        self.config.timeout_duration = timeout;
        self
    }

    /// Validate and return the configuration
    pub fn build(self) -> ConfigResult<RateLimiterConfig> {
        self.config.validate()?;
        Ok(self.config)
    }
}

/// Point-in-time view of a rate limiter
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimiterMetrics {
    /// Permits left in the current cycle; negative while reservations are
    /// outstanding
    pub available_permissions: i64,
    /// How long a caller asking now would wait for a permit
    pub nanos_to_wait: u64,
    /// Callers currently parked on a reservation
    pub number_of_waiting_threads: usize,
    /// Permits granted per cycle
    pub limit_for_period: u32,
    /// Permits granted since creation
    pub permitted_calls: u64,
    /// Requests refused since creation
    pub rejected_calls: u64,
}

impl RateLimiterMetrics {
    /// Get a human-readable status message
    pub fn status_message(&self) -> String {
        format!(
            "Rate limiter: {}/{} permits available, {} waiting, {} permitted, {} rejected",
            self.available_permissions,
            self.limit_for_period,
            self.number_of_waiting_threads,
            self.permitted_calls,
            self.rejected_calls
        )
    }
}

/// Cycle and permit count packed into one word
///
/// The upper half holds the active cycle, wrapping at `u32::MAX`; the lower
/// half holds the available permits as an `i32`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct CycleState {
    cycle: u32,
    permits: i32,
}

impl CycleState {
    fn pack(self) -> u64 {
        (u64::from(self.cycle) << 32) | u64::from(self.permits as u32)
    }

    #[allow(clippy::cast_possible_truncation)]
    fn unpack(word: u64) -> Self {
        Self { cycle: (word >> 32) as u32, permits: word as u32 as i32 }
    }
}

/// Result of evaluating one request against the current state
#[derive(Debug, Clone, Copy)]
struct Evaluation {
    next: CycleState,
    nanos_to_wait: u64,
    reserved: bool,
}

struct Inner<C: Clock> {
    name: Arc<str>,
    state: AtomicU64,
    limit_for_period: AtomicU32,
    /// Default wait budget for `acquire_permission`, in nanos
    timeout_nanos: AtomicU64,
    cycle_period_nanos: u64,
    origin: Instant,
    waiting: AtomicUsize,
    permitted: AtomicU64,
    rejected: AtomicU64,
    events: EventPublisher,
    clock: Arc<C>,
}

/// Lock-free rate limiter
///
/// # Examples
///
/// ```rust
/// use std::time::Duration;
///
/// use resilience_core::rate_limiter::{RateLimiter, RateLimiterConfig};
///
/// # fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let config = RateLimiterConfig::builder()
///     .limit_for_period(10)
///     .limit_refresh_period(Duration::from_secs(1))
///     .timeout_duration(Duration::ZERO)
///     .build()?;
/// let limiter = RateLimiter::new("search-api", config)?;
///
/// if limiter.try_acquire_permission() {
///     println!("Request allowed");
/// }
/// # Ok(())
/// # }
/// ```
pub struct RateLimiter<C: Clock = SystemClock> {
    inner: Arc<Inner<C>>,
}

impl<C: Clock> Clone for RateLimiter<C> {
    fn clone(&self) -> Self {
        Self { inner: Arc::clone(&self.inner) }
    }
}

impl<C: Clock> fmt::Debug for RateLimiter<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RateLimiter")
            .field("name", &self.inner.name)
            .field("limit_for_period", &self.limit_for_period())
            .field("cycle_period", &Duration::from_nanos(self.inner.cycle_period_nanos))
            .field("timeout", &self.timeout_duration())
            .finish()
    }
}

impl RateLimiter<SystemClock> {
    /// Create a rate limiter on the system clock
    pub fn new(name: &str, config: RateLimiterConfig) -> ConfigResult<Self> {
        Self::with_clock(name, config, SystemClock)
    }
}

impl<C: Clock> RateLimiter<C> {
    /// Create a rate limiter with a custom clock (useful for testing)
    pub fn with_clock(name: &str, config: RateLimiterConfig, clock: C) -> ConfigResult<Self> {
        config.validate()?;
        let clock = Arc::new(clock);
        let initial = CycleState {
            cycle: 0,
            permits: i32::try_from(config.limit_for_period).unwrap_or(i32::MAX),
        };
        Ok(Self {
            inner: Arc::new(Inner {
                name: Arc::from(name),
                state: AtomicU64::new(initial.pack()),
                limit_for_period: AtomicU32::new(config.limit_for_period),
                timeout_nanos: AtomicU64::new(duration_nanos(config.timeout_duration)),
                cycle_period_nanos: duration_nanos(config.limit_refresh_period).max(1),
                origin: clock.now(),
                waiting: AtomicUsize::new(0),
                permitted: AtomicU64::new(0),
                rejected: AtomicU64::new(0),
                events: EventPublisher::new(),
                clock,
            }),
        })
    }

    /// Get the rate limiter name
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Current permits per cycle
    pub fn limit_for_period(&self) -> u32 {
        self.inner.limit_for_period.load(Ordering::Acquire)
    }

    /// Current default wait for a permit
    pub fn timeout_duration(&self) -> Duration {
        Duration::from_nanos(self.inner.timeout_nanos.load(Ordering::Acquire))
    }

    /// Change the permits per cycle; takes effect from the next refresh
    pub fn change_limit_for_period(&self, limit: u32) -> ConfigResult<()> {
        validate_limit(limit)?;
        let previous = self.inner.limit_for_period.swap(limit, Ordering::AcqRel);
        debug!(limiter = %self.inner.name, previous, limit, "Changed limit for period");
        Ok(())
    }

    /// Change the default wait budget of [`acquire_permission`](Self::acquire_permission)
    pub fn change_timeout_duration(&self, timeout: Duration) {
        self.inner.timeout_nanos.store(duration_nanos(timeout), Ordering::Release);
    }

    /// Register an event listener
    pub fn subscribe<F>(&self, listener: F) -> ListenerId
    where
        F: Fn(&ResilienceEvent) + Send + Sync + 'static,
    {
        self.inner.events.subscribe(listener)
    }

    // =========================================================================
    // Permission API
    // =========================================================================

    /// Take a permit from the current cycle without waiting
    pub fn try_acquire_permission(&self) -> bool {
        let granted = self.update_state(Some(0)).reserved;
        self.publish_outcome(granted);
        granted
    }

    /// Reserve a permit, returning how long to wait before using it
    ///
    /// Returns `0` for an immediate permit, the wait in nanoseconds for a
    /// permit from a later cycle, or [`RESERVATION_REJECTED`] when that wait
    /// would exceed `timeout`. A rejected reservation leaves the permit count
    /// untouched.
    pub fn reserve_permission(&self, timeout: Duration) -> i64 {
        let evaluation = self.update_state(Some(duration_nanos(timeout)));
        self.publish_outcome(evaluation.reserved);
        if evaluation.reserved {
            i64::try_from(evaluation.nanos_to_wait).unwrap_or(i64::MAX)
        } else {
            RESERVATION_REJECTED
        }
    }

    /// Acquire a permit, waiting at most the configured timeout
    pub async fn acquire_permission(&self) -> bool {
        self.acquire_permission_within(self.timeout_duration(), None).await
    }

    /// Acquire a permit, giving up if `cancel` fires while waiting
    ///
    /// The reserved permit is consumed even when the wait is cancelled.
    /// The token is left cancelled for the caller to observe.
    pub async fn acquire_permission_cancellable(&self, cancel: &CancellationToken) -> bool {
        self.acquire_permission_within(self.timeout_duration(), Some(cancel)).await
    }

    /// Acquire a permit, waiting at most `timeout`
    pub async fn acquire_permission_with_timeout(&self, timeout: Duration) -> bool {
        self.acquire_permission_within(timeout, None).await
    }

    async fn acquire_permission_within(
        &self,
        timeout: Duration,
        cancel: Option<&CancellationToken>,
    ) -> bool {
        if cancel.is_some_and(CancellationToken::is_cancelled) {
            return false;
        }
        let wait = self.reserve_permission(timeout);
        match wait {
            RESERVATION_REJECTED => false,
            0 => true,
            nanos => self.wait_for_reservation(nanos.unsigned_abs(), cancel).await,
        }
    }

    /// Park until a reserved permit becomes usable on the limiter's clock
    async fn wait_for_reservation(&self, nanos: u64, cancel: Option<&CancellationToken>) -> bool {
        let clock = &self.inner.clock;
        let started = clock.now();
        self.inner.waiting.fetch_add(1, Ordering::AcqRel);
        let _waiting = WaitingGuard(&self.inner.waiting);

        loop {
            let remaining = nanos.saturating_sub(clock.nanos_since(started));
            if remaining == 0 {
                return true;
            }
            let sleep = clock.sleep(Duration::from_nanos(remaining));
            match cancel {
                Some(token) => {
                    tokio::select! {
                        () = sleep => {}
                        () = token.cancelled() => {
                            debug!(limiter = %self.inner.name, "Wait for permit cancelled");
                            return false;
                        }
                    }
                }
                None => sleep.await,
            }
        }
    }

    /// Consume every permit left in the current cycle
    ///
    /// Outstanding reservations (a negative count) are kept.
    pub fn drain_permissions(&self) {
        let inner = &self.inner;
        let mut current = inner.state.load(Ordering::Acquire);
        loop {
            let rolled = self.evaluate(CycleState::unpack(current), None).next;
            let drained = CycleState { permits: rolled.permits.min(0), ..rolled };
            match inner.state.compare_exchange_weak(
                current,
                drained.pack(),
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => {
                    debug!(limiter = %inner.name, drained = rolled.permits.max(0), "Drained permits");
                    return;
                }
                Err(actual) => current = actual,
            }
        }
    }

    /// Execute an operation once a permit is available
    ///
    /// Waits at most the configured timeout for the permit.
    #[instrument(skip(self, operation), fields(limiter = %self.inner.name))]
    pub async fn execute<F, Fut, T, E>(&self, operation: F) -> ResilienceResult<T, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: std::error::Error + Send + Sync + 'static,
    {
        if !self.acquire_permission().await {
            return Err(ResilienceError::rejected(&self.inner.name, RejectionReason::RateLimited));
        }
        operation().await.map_err(|source| ResilienceError::OperationFailed { source })
    }

    /// Get rate limiter metrics without consuming permits
    pub fn metrics(&self) -> RateLimiterMetrics {
        let inner = &self.inner;
        let estimate = self.evaluate(CycleState::unpack(inner.state.load(Ordering::Acquire)), None);
        RateLimiterMetrics {
            available_permissions: i64::from(estimate.next.permits),
            nanos_to_wait: estimate.nanos_to_wait,
            number_of_waiting_threads: inner.waiting.load(Ordering::Acquire),
            limit_for_period: self.limit_for_period(),
            permitted_calls: inner.permitted.load(Ordering::Relaxed),
            rejected_calls: inner.rejected.load(Ordering::Relaxed),
        }
    }

    // =========================================================================
    // Internals
    // =========================================================================

    /// Run the CAS loop for one permit, committing the reservation only if
    /// its wait fits within `timeout_nanos`
    fn update_state(&self, timeout_nanos: Option<u64>) -> Evaluation {
        let state = &self.inner.state;
        let mut current = state.load(Ordering::Acquire);
        loop {
            let evaluation = self.evaluate(CycleState::unpack(current), timeout_nanos);
            match state.compare_exchange_weak(
                current,
                evaluation.next.pack(),
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return evaluation,
                Err(actual) => current = actual,
            }
        }
    }

    /// Roll `state` forward to the current cycle and price one permit
    ///
    /// With `timeout_nanos` unset nothing is reserved, which is how the
    /// metrics estimate the state without changing it.
    fn evaluate(&self, state: CycleState, timeout_nanos: Option<u64>) -> Evaluation {
        let inner = &self.inner;
        let period = inner.cycle_period_nanos;
        let limit = i64::from(inner.limit_for_period.load(Ordering::Acquire));

        let now_nanos = inner.clock.nanos_since(inner.origin);
        let current_cycle = now_nanos / period;
        #[allow(clippy::cast_possible_truncation)]
        let cycle = current_cycle as u32;

        let mut permits = i64::from(state.permits);
        if cycle != state.cycle {
            let elapsed_cycles = i64::from(cycle.wrapping_sub(state.cycle));
            permits = permits.saturating_add(elapsed_cycles.saturating_mul(limit)).min(limit);
        }

        let nanos_to_wait = if permits >= 1 {
            0
        } else {
            let next_cycle_start = current_cycle.saturating_add(1).saturating_mul(period);
            let until_next_cycle = next_cycle_start.saturating_sub(now_nanos);
            // Permits still owed once the next cycle has refreshed
            let shortfall = (1 - (permits + limit)).max(0);
            let full_cycles = u64::try_from((shortfall + limit - 1) / limit).unwrap_or_default();
            full_cycles.saturating_mul(period).saturating_add(until_next_cycle)
        };

        let reserved = timeout_nanos.is_some_and(|timeout| timeout >= nanos_to_wait);
        if reserved {
            permits -= 1;
        }

        let permits = i32::try_from(permits.max(i64::from(i32::MIN))).unwrap_or(i32::MIN);
        Evaluation { next: CycleState { cycle, permits }, nanos_to_wait, reserved }
    }

    fn publish_outcome(&self, granted: bool) {
        let inner = &self.inner;
        if granted {
            inner.permitted.fetch_add(1, Ordering::Relaxed);
            inner
                .events
                .publish_with(|| ResilienceEvent::PermissionAcquired { name: Arc::clone(&inner.name) });
        } else {
            inner.rejected.fetch_add(1, Ordering::Relaxed);
            debug!(limiter = %inner.name, "Rate limit exceeded");
            inner.events.publish_with(|| ResilienceEvent::CallNotPermitted {
                name: Arc::clone(&inner.name),
                reason: RejectionReason::RateLimited,
            });
        }
    }
}

struct WaitingGuard<'a>(&'a AtomicUsize);

impl Drop for WaitingGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::AcqRel);
    }
}

fn duration_nanos(duration: Duration) -> u64 {
    u64::try_from(duration.as_nanos()).unwrap_or(u64::MAX)
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicU32;

    use super::*;
    use crate::clock::MockClock;

    fn limiter(limit: u32, period: Duration) -> (RateLimiter<MockClock>, MockClock) {
        let clock = MockClock::new();
        let config = RateLimiterConfig::builder()
            .limit_for_period(limit)
            .limit_refresh_period(period)
            .timeout_duration(Duration::ZERO)
            .build()
            .unwrap();
        let limiter = RateLimiter::with_clock("test", config, clock.clone()).unwrap();
        (limiter, clock)
    }

    /// Validates `RateLimiterConfig` validation.
    ///
    /// Assertions:
    /// - Confirms a zero limit is rejected.
    /// - Confirms a limit beyond `i32::MAX` is rejected.
    /// - Confirms a zero period is rejected.
    #[test]
    fn test_config_validation() {
        assert!(RateLimiterConfig::builder().limit_for_period(0).build().is_err());
        assert!(RateLimiterConfig::builder().limit_for_period(u32::MAX).build().is_err());
        assert!(RateLimiterConfig::builder().limit_refresh_period(Duration::ZERO).build().is_err());
        assert!(RateLimiterConfig::default().validate().is_ok());
    }

    /// Validates the packed cycle state.
    ///
    /// Assertions:
    /// - Confirms negative permit counts and high cycles survive packing.
    #[test]
    fn test_cycle_state_packing() {
        for state in [
            CycleState { cycle: 0, permits: 0 },
            CycleState { cycle: u32::MAX, permits: -7 },
            CycleState { cycle: 42, permits: i32::MAX },
            CycleState { cycle: 1, permits: i32::MIN },
        ] {
            assert_eq!(CycleState::unpack(state.pack()), state);
        }
    }

    /// Validates the single-permit 500ms cycle scenario.
    ///
    /// Assertions:
    /// - Confirms the first permit in a cycle succeeds and the second fails.
    /// - Confirms a permit is available again after exactly one cycle.
    /// - Ensures a reservation longer than its timeout is rejected without
    ///   consuming the permit.
    #[test]
    fn test_one_permit_per_cycle() {
        let (limiter, clock) = limiter(1, Duration::from_millis(500));

        assert!(limiter.try_acquire_permission());
        assert!(!limiter.try_acquire_permission());

        clock.advance_millis(500);
        assert!(limiter.try_acquire_permission());

        clock.advance_millis(100);
        assert_eq!(limiter.reserve_permission(Duration::from_millis(100)), RESERVATION_REJECTED);
        assert_eq!(limiter.metrics().available_permissions, 0);

        clock.advance_millis(400);
        assert_eq!(limiter.metrics().available_permissions, 1);
        assert!(limiter.try_acquire_permission());
    }

    /// Validates reservations from future cycles.
    ///
    /// Assertions:
    /// - Confirms the returned wait runs to the start of the next cycle.
    /// - Confirms the debt shows up as negative availability.
    /// - Confirms the next cycle repays the debt instead of adding a permit.
    #[test]
    fn test_reservation_repaid_by_next_cycle() {
        let (limiter, clock) = limiter(1, Duration::from_millis(500));
        assert!(limiter.try_acquire_permission());

        clock.advance_millis(200);
        let wait = limiter.reserve_permission(Duration::from_secs(1));
        assert_eq!(wait, 300_000_000);
        assert_eq!(limiter.metrics().available_permissions, -1);

        let wait = limiter.reserve_permission(Duration::from_secs(1));
        assert_eq!(wait, 800_000_000, "second reservation waits one more full cycle");

        clock.advance_millis(300);
        assert_eq!(limiter.metrics().available_permissions, -1);
        clock.advance_millis(500);
        assert_eq!(limiter.metrics().available_permissions, 0);
        clock.advance_millis(500);
        assert_eq!(limiter.metrics().available_permissions, 1);
    }

    /// Validates that idle cycles never bank more than one period of permits.
    ///
    /// Assertions:
    /// - Confirms availability caps at the limit after many idle cycles.
    #[test]
    fn test_unused_permits_do_not_accumulate() {
        let (limiter, clock) = limiter(3, Duration::from_millis(100));
        clock.advance(Duration::from_secs(60));
        assert_eq!(limiter.metrics().available_permissions, 3);
        for _ in 0..3 {
            assert!(limiter.try_acquire_permission());
        }
        assert!(!limiter.try_acquire_permission());
    }

    /// Validates `drain_permissions`.
    ///
    /// Assertions:
    /// - Confirms remaining permits are removed for the current cycle.
    /// - Confirms the next cycle refreshes normally.
    #[test]
    fn test_drain_permissions() {
        let (limiter, clock) = limiter(5, Duration::from_secs(1));
        assert!(limiter.try_acquire_permission());
        limiter.drain_permissions();
        assert_eq!(limiter.metrics().available_permissions, 0);
        assert!(!limiter.try_acquire_permission());

        clock.advance(Duration::from_secs(1));
        assert_eq!(limiter.metrics().available_permissions, 5);
    }

    /// Validates live limit and timeout changes.
    ///
    /// Assertions:
    /// - Confirms a raised limit applies from the next cycle.
    /// - Confirms an invalid limit is rejected and the old one kept.
    /// - Confirms the timeout is replaced.
    #[test]
    fn test_change_limit_and_timeout() {
        let (limiter, clock) = limiter(1, Duration::from_secs(1));
        assert!(limiter.try_acquire_permission());

        limiter.change_limit_for_period(4).unwrap();
        clock.advance(Duration::from_secs(1));
        assert_eq!(limiter.metrics().available_permissions, 4);

        assert!(limiter.change_limit_for_period(0).is_err());
        assert_eq!(limiter.limit_for_period(), 4);

        limiter.change_timeout_duration(Duration::from_millis(250));
        assert_eq!(limiter.timeout_duration(), Duration::from_millis(250));
    }

    /// Validates metrics counters and events.
    ///
    /// Assertions:
    /// - Confirms granted and refused requests are counted and published.
    #[test]
    fn test_metrics_and_events() {
        let (limiter, _clock) = limiter(2, Duration::from_secs(1));
        let acquired = Arc::new(AtomicU32::new(0));
        let refused = Arc::new(AtomicU32::new(0));
        {
            let acquired = Arc::clone(&acquired);
            let refused = Arc::clone(&refused);
            limiter.subscribe(move |event| match event {
                ResilienceEvent::PermissionAcquired { .. } => {
                    acquired.fetch_add(1, Ordering::SeqCst);
                }
                ResilienceEvent::CallNotPermitted { reason: RejectionReason::RateLimited, .. } => {
                    refused.fetch_add(1, Ordering::SeqCst);
                }
                _ => {}
            });
        }

        for _ in 0..5 {
            limiter.try_acquire_permission();
        }

        let metrics = limiter.metrics();
        assert_eq!(metrics.permitted_calls, 2);
        assert_eq!(metrics.rejected_calls, 3);
        assert!(metrics.nanos_to_wait > 0);
        assert_eq!(acquired.load(Ordering::SeqCst), 2);
        assert_eq!(refused.load(Ordering::SeqCst), 3);
        assert!(metrics.status_message().contains("0/2 permits"));
    }

    /// Validates that concurrent callers never exceed the per-cycle limit.
    ///
    /// Assertions:
    /// - Confirms exactly `limit` permits are granted across 8 threads.
    #[test]
    fn test_concurrent_try_acquire() {
        let (limiter, _clock) = limiter(100, Duration::from_secs(1));
        let granted = Arc::new(AtomicU32::new(0));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let limiter = limiter.clone();
                let granted = Arc::clone(&granted);
                std::thread::spawn(move || {
                    for _ in 0..50 {
                        if limiter.try_acquire_permission() {
                            granted.fetch_add(1, Ordering::SeqCst);
                        }
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(granted.load(Ordering::SeqCst), 100);
        assert_eq!(limiter.metrics().available_permissions, 0);
    }

    /// Validates waiting for a reserved permit on the system clock.
    ///
    /// Assertions:
    /// - Confirms a caller with enough timeout waits and succeeds.
    /// - Confirms the waiting-thread gauge returns to zero.
    #[tokio::test]
    async fn test_acquire_waits_for_next_cycle() {
        let config = RateLimiterConfig::builder()
            .limit_for_period(1)
            .limit_refresh_period(Duration::from_millis(50))
            .timeout_duration(Duration::from_millis(200))
            .build()
            .unwrap();
        let limiter = RateLimiter::new("waiting", config).unwrap();

        assert!(limiter.acquire_permission().await);
        let started = Instant::now();
        assert!(limiter.acquire_permission().await);
        assert!(started.elapsed() > Duration::ZERO);
        assert_eq!(limiter.metrics().number_of_waiting_threads, 0);
    }

    /// Validates that a reservation wait follows the limiter's clock.
    ///
    /// Assertions:
    /// - Ensures the waiter stays parked while the mock clock is short of the
    ///   next cycle, however long the test runs.
    /// - Confirms advancing the clock into the next cycle releases it with a
    ///   permit.
    #[tokio::test]
    async fn test_wait_follows_mock_clock() {
        let (limiter, clock) = limiter(1, Duration::from_secs(10));
        assert!(limiter.try_acquire_permission());

        let waiter = tokio::spawn({
            let limiter = limiter.clone();
            async move { limiter.acquire_permission_with_timeout(Duration::from_secs(20)).await }
        });
        tokio::task::yield_now().await;
        assert_eq!(limiter.metrics().number_of_waiting_threads, 1);

        clock.advance(Duration::from_secs(4));
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        clock.advance(Duration::from_secs(6));
        let granted = tokio::time::timeout(Duration::from_secs(5), waiter).await.unwrap().unwrap();
        assert!(granted);
        assert_eq!(limiter.metrics().number_of_waiting_threads, 0);
    }

    /// Validates cancellation while waiting.
    ///
    /// Assertions:
    /// - Confirms cancellation yields no permit.
    /// - Confirms the token stays cancelled.
    #[tokio::test]
    async fn test_acquire_cancelled() {
        let config = RateLimiterConfig::builder()
            .limit_for_period(1)
            .limit_refresh_period(Duration::from_secs(10))
            .timeout_duration(Duration::from_secs(20))
            .build()
            .unwrap();
        let limiter = RateLimiter::new("cancel", config).unwrap();
        assert!(limiter.try_acquire_permission());

        let token = CancellationToken::new();
        let canceller = token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            canceller.cancel();
        });

        assert!(!limiter.acquire_permission_cancellable(&token).await);
        assert!(token.is_cancelled());
    }

    /// Validates `execute` rejection.
    ///
    /// Assertions:
    /// - Confirms an exhausted limiter rejects with `RateLimited`.
    #[tokio::test]
    async fn test_execute_rejects_when_exhausted() {
        let (limiter, _clock) = limiter(1, Duration::from_secs(1));
        let first = limiter.execute(|| async { Ok::<_, std::io::Error>(1) }).await;
        assert_eq!(first.unwrap(), 1);

        let second = limiter.execute(|| async { Ok::<_, std::io::Error>(2) }).await;
        assert_eq!(second.unwrap_err().rejection_reason(), Some(RejectionReason::RateLimited));
    }
}
