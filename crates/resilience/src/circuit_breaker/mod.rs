//! Circuit breaker state machine
//!
//! The breaker holds its current state as an immutable [`Period`] behind a
//! pointer. Entering CLOSED, HALF_OPEN or METRICS_ONLY allocates a fresh
//! outcome window, so nothing recorded in one period can leak into the
//! threshold evaluation of the next. Transitions compare the pointer they
//! started from before swapping, which makes concurrent transitions race-free:
//! the loser sees the winner's period and retries against it.
//!
//! ```text
//! CLOSED --thresholds exceeded--> OPEN --wait elapsed--> HALF_OPEN
//!    ^                              ^                       |
//!    +--------- trials pass --------+---- trials fail ------+
//! ```
//!
//! DISABLED, FORCED_OPEN and METRICS_ONLY are only entered and left through
//! the explicit `transition_to_*` methods.

mod config;
mod state;

use std::error::Error as StdError;
use std::fmt;
use std::future::Future;
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

pub use config::{
    CircuitBreakerBuilderWithClock, CircuitBreakerConfig, CircuitBreakerConfigBuilder,
    ErrorPredicate,
};
use config::ErrorDisposition;
use parking_lot::RwLock;
use state::Period;
pub use state::CircuitState;
use tracing::{debug, info, instrument, warn};

use crate::clock::{Clock, SystemClock};
use crate::error::{ConfigResult, RejectionReason, ResilienceError, ResilienceResult};
use crate::event::{EventPublisher, ListenerId, ResilienceEvent};
use crate::window::{Outcome, Snapshot};

/// Circuit breaker metrics for monitoring
#[derive(Debug, Clone, Copy)]
pub struct CircuitBreakerMetrics {
    /// State of the current period
    pub state: CircuitState,
    /// Aggregate of the current period's window
    pub snapshot: Snapshot,
    /// Calls refused since the current period began
    pub not_permitted_calls: u64,
    /// HALF_OPEN trial slots still available
    pub trials_remaining: u32,
    /// When the current period began
    pub state_entered_at: Instant,
}

impl CircuitBreakerMetrics {
    /// Failure percentage of the current window
    pub fn failure_rate(&self) -> f64 {
        self.snapshot.failure_rate
    }

    /// Slow-call percentage of the current window
    pub fn slow_call_rate(&self) -> f64 {
        self.snapshot.slow_call_rate
    }

    /// Calls currently held in the window
    pub fn buffered_calls(&self) -> u64 {
        self.snapshot.total_calls
    }

    /// Get a human-readable status message
    pub fn status_message(&self) -> String {
        format!(
            "Circuit {}: {} buffered calls, failure rate {:.1}%, slow call rate {:.1}%, {} not permitted",
            self.state,
            self.snapshot.total_calls,
            self.snapshot.failure_rate,
            self.snapshot.slow_call_rate,
            self.not_permitted_calls
        )
    }
}

struct Inner<C: Clock> {
    name: Arc<str>,
    config: CircuitBreakerConfig,
    period: RwLock<Arc<Period>>,
    events: EventPublisher,
    clock: Arc<C>,
}

/// Count- or time-windowed circuit breaker
///
/// Cloning is cheap; clones share state, listeners and clock.
///
/// # Examples
///
/// ```rust
/// use std::time::Duration;
///
/// use resilience_core::circuit_breaker::{CircuitBreaker, CircuitBreakerConfig};
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let config = CircuitBreakerConfig::builder()
///     .sliding_window_size(20)
///     .minimum_number_of_calls(10)
///     .failure_rate_threshold(50.0)
///     .wait_duration_in_open_state(Duration::from_secs(30))
///     .build()?;
/// let breaker = CircuitBreaker::new("inventory", config)?;
///
/// let stock = breaker.execute(|| async { Ok::<_, std::io::Error>(42) }).await?;
/// assert_eq!(stock, 42);
/// # Ok(())
/// # }
/// ```
pub struct CircuitBreaker<C: Clock = SystemClock> {
    inner: Arc<Inner<C>>,
}

impl<C: Clock> Clone for CircuitBreaker<C> {
    fn clone(&self) -> Self {
        Self { inner: Arc::clone(&self.inner) }
    }
}

impl<C: Clock> fmt::Debug for CircuitBreaker<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CircuitBreaker")
            .field("name", &self.inner.name)
            .field("state", &self.state())
            .field("config", &self.inner.config)
            .finish()
    }
}

impl CircuitBreaker<SystemClock> {
    /// Create a circuit breaker on the system clock
    pub fn new(name: &str, config: CircuitBreakerConfig) -> ConfigResult<Self> {
        Self::with_clock(name, config, SystemClock)
    }

    /// Create a circuit breaker using the builder pattern
    pub fn builder() -> CircuitBreakerConfigBuilder {
        CircuitBreakerConfigBuilder::new()
    }
}

impl<C: Clock> CircuitBreaker<C> {
    /// Create a circuit breaker with a custom clock (useful for testing)
    pub fn with_clock(name: &str, config: CircuitBreakerConfig, clock: C) -> ConfigResult<Self> {
        config.validate()?;
        let clock = Arc::new(clock);
        let initial = Period::new(
            CircuitState::Closed,
            config.window.allocate(&clock),
            clock.now(),
        );
        Ok(Self {
            inner: Arc::new(Inner {
                name: Arc::from(name),
                config,
                period: RwLock::new(Arc::new(initial)),
                events: EventPublisher::new(),
                clock,
            }),
        })
    }

    /// Get the circuit breaker name
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Get the configuration
    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.inner.config
    }

    /// Get the current state of the circuit breaker
    pub fn state(&self) -> CircuitState {
        self.current().state
    }

    /// Get circuit breaker metrics without changing any state
    pub fn metrics(&self) -> CircuitBreakerMetrics {
        let period = self.current();
        let trials = period.trials_remaining.load(std::sync::atomic::Ordering::Acquire);
        CircuitBreakerMetrics {
            state: period.state,
            snapshot: period.snapshot(),
            not_permitted_calls: period.not_permitted_calls.load(std::sync::atomic::Ordering::Acquire),
            trials_remaining: u32::try_from(trials.max(0)).unwrap_or(u32::MAX),
            state_entered_at: period.entered_at,
        }
    }

    /// Register an event listener
    pub fn subscribe<F>(&self, listener: F) -> ListenerId
    where
        F: Fn(&ResilienceEvent) + Send + Sync + 'static,
    {
        self.inner.events.subscribe(listener)
    }

    /// Publisher for this breaker's events
    pub fn events(&self) -> &EventPublisher {
        &self.inner.events
    }

    // =========================================================================
    // Protected-call contract
    // =========================================================================

    /// Ask whether one call may proceed
    ///
    /// Side effects are limited to the OPEN to HALF_OPEN move once the wait
    /// has elapsed, the HALF_OPEN timeout fallback, and claiming a HALF_OPEN
    /// trial slot. A granted HALF_OPEN slot must be settled through
    /// [`on_success`](Self::on_success), [`on_error`](Self::on_error) or
    /// [`release_permission`](Self::release_permission).
    pub fn try_acquire_permission(&self) -> Result<(), RejectionReason> {
        loop {
            let period = self.current();
            let now = self.inner.clock.now();

            let permitted = match period.state {
                CircuitState::Closed | CircuitState::Disabled | CircuitState::MetricsOnly => true,
                CircuitState::ForcedOpen => false,
                CircuitState::Open => {
                    if period.has_lasted(period.open_wait, now) {
                        self.swap_period(Some(&period), self.half_open_period(&period));
                        continue;
                    }
                    false
                }
                CircuitState::HalfOpen => {
                    if self.half_open_timed_out(&period, now) {
                        self.swap_period(Some(&period), self.half_open_fallback(&period));
                        continue;
                    }
                    period.try_claim_trial()
                }
            };

            if permitted {
                return Ok(());
            }

            period.not_permitted_calls.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
            debug!(circuit = %self.inner.name, state = %period.state, "Call not permitted");
            self.inner.events.publish_with(|| ResilienceEvent::CallNotPermitted {
                name: Arc::clone(&self.inner.name),
                reason: RejectionReason::CircuitOpen,
            });
            return Err(RejectionReason::CircuitOpen);
        }
    }

    /// Give back a permission that ended without an outcome
    pub fn release_permission(&self) {
        let period = self.current();
        if period.state == CircuitState::HalfOpen {
            period.release_trial(self.inner.config.permitted_number_of_calls_in_half_open_state);
        }
    }

    /// Report a successful call
    pub fn on_success(&self, duration: Duration) {
        self.record(duration, true);
    }

    /// Report a failed call
    ///
    /// Errors matching the ignore predicate, or not matching the record
    /// predicate, are not counted and give their permission back.
    pub fn on_error<E>(&self, duration: Duration, error: &E)
    where
        E: StdError + 'static,
    {
        match self.inner.config.classify_error(error) {
            ErrorDisposition::Record => self.record(duration, false),
            ErrorDisposition::Ignore => {
                self.release_permission();
                debug!(circuit = %self.inner.name, %error, "Ignoring error");
                self.inner.events.publish_with(|| ResilienceEvent::CallIgnored {
                    name: Arc::clone(&self.inner.name),
                    duration,
                });
            }
        }
    }

    /// Execute an operation with circuit breaker protection
    #[instrument(skip(self, operation), fields(circuit = %self.inner.name, state = %self.state()))]
    pub async fn execute<F, Fut, T, E>(&self, operation: F) -> ResilienceResult<T, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: StdError + Send + Sync + 'static,
    {
        let mut guard = self.acquire_guard::<E>()?;
        let start = self.inner.clock.now();
        let result = operation().await;
        guard.settled = true;
        self.settle(start, result)
    }

    /// Execute a synchronous operation with circuit breaker protection
    #[instrument(skip(self, operation), fields(circuit = %self.inner.name, state = %self.state()))]
    pub fn call<F, T, E>(&self, operation: F) -> ResilienceResult<T, E>
    where
        F: FnOnce() -> Result<T, E>,
        E: StdError + Send + Sync + 'static,
    {
        let mut guard = self.acquire_guard::<E>()?;
        let start = self.inner.clock.now();
        let result = operation();
        guard.settled = true;
        self.settle(start, result)
    }

    fn acquire_guard<E>(&self) -> ResilienceResult<PermissionGuard<'_, C>, E>
    where
        E: StdError + Send + Sync + 'static,
    {
        self.try_acquire_permission()
            .map_err(|reason| ResilienceError::rejected(&self.inner.name, reason))?;
        Ok(PermissionGuard { breaker: self, settled: false })
    }

    fn settle<T, E>(&self, start: Instant, result: Result<T, E>) -> ResilienceResult<T, E>
    where
        E: StdError + Send + Sync + 'static,
    {
        let elapsed = self.inner.clock.now().saturating_duration_since(start);
        match result {
            Ok(value) => {
                self.on_success(elapsed);
                Ok(value)
            }
            Err(error) => {
                self.on_error(elapsed, &error);
                Err(ResilienceError::OperationFailed { source: error })
            }
        }
    }

    // =========================================================================
    // Manual transitions
    // =========================================================================

    /// Return to a fresh CLOSED state and publish a reset event
    pub fn reset(&self) {
        self.swap_period(None, self.closed_period());
        info!(circuit = %self.inner.name, "Circuit breaker reset");
        self.inner
            .events
            .publish_with(|| ResilienceEvent::Reset { name: Arc::clone(&self.inner.name) });
    }

    /// Force CLOSED with a fresh window
    pub fn transition_to_closed_state(&self) {
        self.swap_period(None, self.closed_period());
    }

    /// Force OPEN, keeping the current window for metrics
    pub fn transition_to_open_state(&self) {
        let current = self.current();
        self.swap_period(None, self.open_period(&current));
    }

    /// Force HALF_OPEN with a full set of trial slots
    pub fn transition_to_half_open_state(&self) {
        let current = self.current();
        self.swap_period(None, self.half_open_period(&current));
    }

    /// Permit every call and record nothing
    pub fn transition_to_disabled_state(&self) {
        self.swap_period(None, self.manual_period(CircuitState::Disabled));
    }

    /// Refuse every call until another manual transition
    pub fn transition_to_forced_open_state(&self) {
        self.swap_period(None, self.manual_period(CircuitState::ForcedOpen));
    }

    /// Permit every call and keep recording, but never trip
    pub fn transition_to_metrics_only_state(&self) {
        self.swap_period(None, self.manual_period(CircuitState::MetricsOnly));
    }

    // =========================================================================
    // Internals
    // =========================================================================

    fn current(&self) -> Arc<Period> {
        Arc::clone(&self.inner.period.read())
    }

    fn record(&self, duration: Duration, success: bool) {
        let period = self.current();
        let config = &self.inner.config;
        let outcome =
            Outcome::from_duration(success, duration, config.slow_call_duration_threshold);

        match period.state {
            CircuitState::Closed | CircuitState::HalfOpen | CircuitState::MetricsOnly => {}
            // Late results of calls permitted before the circuit opened or
            // was overridden are not counted.
            CircuitState::Open | CircuitState::ForcedOpen | CircuitState::Disabled => return,
        }

        let snapshot = period.window.record(duration, outcome);
        self.inner.events.publish_with(|| ResilienceEvent::CallRecorded {
            name: Arc::clone(&self.inner.name),
            outcome,
            duration,
        });

        if !period.state.evaluates_thresholds() || !snapshot.has_enough_calls() {
            return;
        }
        let exceeded = config.thresholds_exceeded(snapshot.failure_rate, snapshot.slow_call_rate);

        match (period.state, exceeded) {
            (CircuitState::Closed | CircuitState::HalfOpen, true) => {
                warn!(
                    circuit = %self.inner.name,
                    from = %period.state,
                    failure_rate = snapshot.failure_rate,
                    slow_call_rate = snapshot.slow_call_rate,
                    "Thresholds exceeded, opening circuit"
                );
                self.swap_period(Some(&period), self.open_period(&period));
            }
            (CircuitState::HalfOpen, false) => {
                info!(
                    circuit = %self.inner.name,
                    failure_rate = snapshot.failure_rate,
                    slow_call_rate = snapshot.slow_call_rate,
                    "Trial calls passed, closing circuit"
                );
                self.swap_period(Some(&period), self.closed_period());
            }
            _ => {}
        }
    }

    fn closed_period(&self) -> Period {
        let clock = &self.inner.clock;
        Period::new(CircuitState::Closed, self.inner.config.window.allocate(clock), clock.now())
    }

    fn open_period(&self, from: &Period) -> Period {
        let attempts = from.open_attempts.saturating_add(1);
        let wait = self.inner.config.wait_interval_in_open_state.apply(attempts);
        Period::new(CircuitState::Open, Arc::clone(&from.window), self.inner.clock.now())
            .with_open_wait(wait, attempts)
    }

    fn half_open_period(&self, from: &Period) -> Period {
        let clock = &self.inner.clock;
        let config = &self.inner.config;
        Period::new(CircuitState::HalfOpen, config.half_open_window().allocate(clock), clock.now())
            .with_trials(config.permitted_number_of_calls_in_half_open_state, from.open_attempts)
    }

    fn manual_period(&self, state: CircuitState) -> Period {
        let clock = &self.inner.clock;
        Period::new(state, self.inner.config.window.allocate(clock), clock.now())
    }

    fn half_open_timed_out(&self, period: &Period, now: Instant) -> bool {
        let max_wait = self.inner.config.max_wait_duration_in_half_open_state;
        !max_wait.is_zero() && period.has_lasted(max_wait, now)
    }

    fn half_open_fallback(&self, period: &Period) -> Period {
        match self.inner.config.transition_on_half_open_timeout {
            CircuitState::Closed => self.closed_period(),
            _ => self.open_period(period),
        }
    }

    /// Replace the current period
    ///
    /// With `expected` set, the swap only happens if the current period is
    /// still that exact instance. Returns whether the swap happened.
    fn swap_period(&self, expected: Option<&Arc<Period>>, next: Period) -> bool {
        let next = Arc::new(next);
        let previous = {
            let mut current = self.inner.period.write();
            if expected.is_some_and(|expected| !Arc::ptr_eq(&current, expected)) {
                return false;
            }
            std::mem::replace(&mut *current, Arc::clone(&next))
        };

        let (from, to) = (previous.state, next.state);
        if from != to {
            info!(circuit = %self.inner.name, %from, %to, "Circuit breaker state transition");
            self.inner.events.publish_with(|| ResilienceEvent::StateTransition {
                name: Arc::clone(&self.inner.name),
                from,
                to,
                timestamp: self.inner.clock.system_time(),
            });
        }
        if to == CircuitState::Open {
            self.schedule_half_open(&next);
        }
        true
    }

    /// Spawn the OPEN to HALF_OPEN timer when enabled and a runtime exists
    fn schedule_half_open(&self, period: &Arc<Period>) {
        if !self.inner.config.automatic_transition_from_open_to_half_open_enabled {
            return;
        }
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            debug!(
                circuit = %self.inner.name,
                "No tokio runtime; OPEN to HALF_OPEN will happen on the next call"
            );
            return;
        };

        let inner: Weak<Inner<C>> = Arc::downgrade(&self.inner);
        let clock = Arc::clone(&self.inner.clock);
        let period = Arc::clone(period);
        handle.spawn(async move {
            clock.sleep(period.open_wait).await;
            if let Some(inner) = inner.upgrade() {
                let breaker = CircuitBreaker { inner };
                breaker.swap_period(Some(&period), breaker.half_open_period(&period));
            }
        });
    }
}

/// Hands a HALF_OPEN trial slot back if the call never reports an outcome,
/// for instance when the `execute` future is dropped mid-flight
struct PermissionGuard<'a, C: Clock> {
    breaker: &'a CircuitBreaker<C>,
    settled: bool,
}

impl<C: Clock> Drop for PermissionGuard<'_, C> {
    fn drop(&mut self) {
        if !self.settled {
            self.breaker.release_permission();
        }
    }
}
