use std::fmt;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::window::{OutcomeWindow, Snapshot};

/// Circuit breaker states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "SCREAMING_SNAKE_CASE"))]
pub enum CircuitState {
    /// Calls flow and outcomes are evaluated against the thresholds
    Closed,
    /// Calls are rejected until the wait duration elapses
    Open,
    /// A limited number of trial calls decide between CLOSED and OPEN
    HalfOpen,
    /// Calls always flow, nothing is recorded
    Disabled,
    /// Calls are always rejected
    ForcedOpen,
    /// Calls always flow and are recorded, thresholds are not enforced
    MetricsOnly,
}

impl CircuitState {
    /// Whether the state is only entered and left by an explicit transition
    pub const fn is_manual(self) -> bool {
        matches!(self, Self::Disabled | Self::ForcedOpen | Self::MetricsOnly)
    }

    /// Whether thresholds are evaluated after each recorded outcome
    pub const fn evaluates_thresholds(self) -> bool {
        matches!(self, Self::Closed | Self::HalfOpen)
    }
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Closed => write!(f, "CLOSED"),
            Self::Open => write!(f, "OPEN"),
            Self::HalfOpen => write!(f, "HALF_OPEN"),
            Self::Disabled => write!(f, "DISABLED"),
            Self::ForcedOpen => write!(f, "FORCED_OPEN"),
            Self::MetricsOnly => write!(f, "METRICS_ONLY"),
        }
    }
}

/// One stay in a state
///
/// A period is immutable apart from its own counters. Transitions replace the
/// whole period, so a window is never shared between two periods that both
/// write to it.
#[derive(Debug)]
pub(crate) struct Period {
    pub state: CircuitState,
    /// Written only in CLOSED, HALF_OPEN and METRICS_ONLY. OPEN keeps the
    /// CLOSED or HALF_OPEN window it tripped on, read-only, for metrics.
    pub window: Arc<dyn OutcomeWindow>,
    pub entered_at: Instant,
    /// OPEN only: how long after `entered_at` HALF_OPEN trials may begin
    pub open_wait: Duration,
    /// Consecutive OPEN periods since the breaker was last CLOSED
    pub open_attempts: u32,
    /// HALF_OPEN only: trial slots not yet handed out
    pub trials_remaining: AtomicI64,
    pub not_permitted_calls: AtomicU64,
}

impl Period {
    pub fn new(state: CircuitState, window: Arc<dyn OutcomeWindow>, entered_at: Instant) -> Self {
        Self {
            state,
            window,
            entered_at,
            open_wait: Duration::ZERO,
            open_attempts: 0,
            trials_remaining: AtomicI64::new(0),
            not_permitted_calls: AtomicU64::new(0),
        }
    }

    pub fn with_open_wait(mut self, wait: Duration, open_attempts: u32) -> Self {
        self.open_wait = wait;
        self.open_attempts = open_attempts;
        self
    }

    /// Whether at least `wait` has passed since the period began
    pub fn has_lasted(&self, wait: Duration, now: Instant) -> bool {
        now.saturating_duration_since(self.entered_at) >= wait
    }

    pub fn with_trials(self, trials: u32, open_attempts: u32) -> Self {
        self.trials_remaining.store(i64::from(trials), Ordering::Release);
        Self { open_attempts, ..self }
    }

    /// Claim one HALF_OPEN trial slot
    pub fn try_claim_trial(&self) -> bool {
        let mut current = self.trials_remaining.load(Ordering::Acquire);
        loop {
            if current <= 0 {
                return false;
            }
            match self.trials_remaining.compare_exchange_weak(
                current,
                current - 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return true,
                Err(actual) => current = actual,
            }
        }
    }

    /// Hand a trial slot back, never above `limit`
    pub fn release_trial(&self, limit: u32) {
        let limit = i64::from(limit);
        let mut current = self.trials_remaining.load(Ordering::Acquire);
        while current < limit {
            match self.trials_remaining.compare_exchange_weak(
                current,
                current + 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return,
                Err(actual) => current = actual,
            }
        }
    }

    pub fn snapshot(&self) -> Snapshot {
        self.window.snapshot()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::window::CountWindow;

    fn period(state: CircuitState) -> Period {
        Period::new(state, Arc::new(CountWindow::new(2, 2).unwrap()), Instant::now())
    }

    /// Validates `CircuitState` display names.
    ///
    /// Assertions:
    /// - Confirms each state renders in upper snake case.
    #[test]
    fn test_circuit_state_display() {
        assert_eq!(CircuitState::Closed.to_string(), "CLOSED");
        assert_eq!(CircuitState::Open.to_string(), "OPEN");
        assert_eq!(CircuitState::HalfOpen.to_string(), "HALF_OPEN");
        assert_eq!(CircuitState::Disabled.to_string(), "DISABLED");
        assert_eq!(CircuitState::ForcedOpen.to_string(), "FORCED_OPEN");
        assert_eq!(CircuitState::MetricsOnly.to_string(), "METRICS_ONLY");
    }

    /// Validates the trial slot accounting of a HALF_OPEN period.
    ///
    /// Assertions:
    /// - Confirms exactly `trials` claims succeed.
    /// - Confirms a release makes one more claim possible.
    /// - Confirms releases never exceed the limit.
    #[test]
    fn test_trial_slots() {
        let period = period(CircuitState::HalfOpen).with_trials(2, 1);
        assert!(period.try_claim_trial());
        assert!(period.try_claim_trial());
        assert!(!period.try_claim_trial());

        period.release_trial(2);
        assert!(period.try_claim_trial());

        period.release_trial(2);
        period.release_trial(2);
        period.release_trial(2);
        assert_eq!(period.trials_remaining.load(Ordering::Acquire), 2);
    }

    /// Validates which states are manual and which evaluate thresholds.
    ///
    /// Assertions:
    /// - Confirms only CLOSED and HALF_OPEN evaluate thresholds.
    #[test]
    fn test_state_classification() {
        assert!(CircuitState::Closed.evaluates_thresholds());
        assert!(CircuitState::HalfOpen.evaluates_thresholds());
        assert!(!CircuitState::MetricsOnly.evaluates_thresholds());
        assert!(CircuitState::ForcedOpen.is_manual());
        assert!(!CircuitState::Open.is_manual());
    }

    /// Validates the OPEN wait bookkeeping.
    ///
    /// Assertions:
    /// - Ensures the wait has not lasted just before it ends.
    /// - Ensures it has lasted exactly at the end.
    #[test]
    fn test_open_wait_elapsed() {
        let period = period(CircuitState::Open).with_open_wait(Duration::from_secs(1), 1);
        let start = period.entered_at;
        assert!(!period.has_lasted(period.open_wait, start + Duration::from_millis(999)));
        assert!(period.has_lasted(period.open_wait, start + Duration::from_secs(1)));
        assert_eq!(period.open_attempts, 1);
    }
}
