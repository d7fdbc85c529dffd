//! Time-based window: one bucket per second over the last N seconds

use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use super::{Outcome, OutcomeWindow, Snapshot, Totals};
use crate::clock::Clock;
use crate::error::{ConfigError, ConfigResult};

const NANOS_PER_SECOND: u64 = 1_000_000_000;

#[derive(Debug)]
struct Ring {
    buckets: Box<[Totals]>,
    /// Second (relative to the window origin) of the newest bucket
    head_second: u64,
    totals: Totals,
}

impl Ring {
    fn index(&self, second: u64) -> usize {
        let len = self.buckets.len() as u64;
        usize::try_from(second % len).unwrap_or_default()
    }

    /// Number of buckets that have aged out by `now_second`
    fn stale_buckets(&self, now_second: u64) -> u64 {
        now_second.saturating_sub(self.head_second).min(self.buckets.len() as u64)
    }

    /// Zero the buckets skipped since the last write and move the head
    fn advance(&mut self, now_second: u64) {
        let stale = self.stale_buckets(now_second);
        for offset in 1..=stale {
            let idx = self.index(self.head_second + offset);
            let expired = std::mem::take(&mut self.buckets[idx]);
            self.totals.subtract(&expired);
        }
        if now_second > self.head_second {
            self.head_second = now_second;
        }
    }

    /// Totals as they would be at `now_second`, without touching the ring
    fn totals_at(&self, now_second: u64) -> Totals {
        let mut totals = self.totals;
        for offset in 1..=self.stale_buckets(now_second) {
            totals.subtract(&self.buckets[self.index(self.head_second + offset)]);
        }
        totals
    }
}

/// Ring of per-second buckets covering the last `size` seconds
///
/// Buckets that fall out of the window are zeroed lazily by the next write,
/// costing at most one pass over the skipped buckets. There is no background
/// sweeper; [`OutcomeWindow::snapshot`] discounts aged-out buckets on the fly
/// instead of clearing them.
pub struct TimeWindow<C: Clock> {
    ring: Mutex<Ring>,
    origin: Instant,
    minimum_calls: u64,
    clock: Arc<C>,
}

impl<C: Clock> TimeWindow<C> {
    /// Create an empty window spanning `size` seconds
    pub fn new(size: usize, minimum_calls: u64, clock: Arc<C>) -> ConfigResult<Self> {
        if size == 0 {
            return Err(ConfigError::invalid("time window size must be greater than 0"));
        }
        Ok(Self::allocate(size, minimum_calls, clock))
    }

    /// Infallible constructor for validated sizes; zero is raised to one
    pub(crate) fn allocate(size: usize, minimum_calls: u64, clock: Arc<C>) -> Self {
        Self {
            ring: Mutex::new(Ring {
                buckets: vec![Totals::default(); size.max(1)].into_boxed_slice(),
                head_second: 0,
                totals: Totals::default(),
            }),
            origin: clock.now(),
            minimum_calls,
            clock,
        }
    }

    fn current_second(&self) -> u64 {
        self.clock.nanos_since(self.origin) / NANOS_PER_SECOND
    }
}

impl<C: Clock> OutcomeWindow for TimeWindow<C> {
    fn record(&self, duration: Duration, outcome: Outcome) -> Snapshot {
        let now_second = self.current_second();
        let nanos = u64::try_from(duration.as_nanos()).unwrap_or(u64::MAX);

        let mut ring = self.ring.lock();
        ring.advance(now_second);
        let idx = ring.index(ring.head_second);
        ring.buckets[idx].add(outcome, nanos);
        ring.totals.add(outcome, nanos);
        Snapshot::from_totals(&ring.totals, self.minimum_calls)
    }

    fn snapshot(&self) -> Snapshot {
        let now_second = self.current_second();
        let ring = self.ring.lock();
        Snapshot::from_totals(&ring.totals_at(now_second), self.minimum_calls)
    }

    fn size(&self) -> usize {
        self.ring.lock().buckets.len()
    }

    fn minimum_number_of_calls(&self) -> u64 {
        self.minimum_calls
    }
}

impl<C: Clock> fmt::Debug for TimeWindow<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let ring = self.ring.lock();
        f.debug_struct("TimeWindow")
            .field("size", &ring.buckets.len())
            .field("minimum_calls", &self.minimum_calls)
            .field("head_second", &ring.head_second)
            .field("totals", &ring.totals)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::MockClock;
    use crate::window::NOT_ENOUGH_CALLS;

    fn window(size: usize, minimum: u64) -> (TimeWindow<MockClock>, MockClock) {
        let clock = MockClock::new();
        let window = TimeWindow::new(size, minimum, Arc::new(clock.clone())).unwrap();
        (window, clock)
    }

    /// Validates that outcomes in the same second accumulate in one bucket.
    ///
    /// Assertions:
    /// - Confirms the sentinel below the minimum.
    /// - Confirms counts and rates after the minimum is reached.
    #[test]
    fn test_records_within_one_second() {
        let (window, clock) = window(5, 3);

        let snapshot = window.record(Duration::from_millis(10), Outcome::Error);
        assert_eq!(snapshot.failure_rate, NOT_ENOUGH_CALLS);

        clock.advance_millis(300);
        window.record(Duration::from_millis(10), Outcome::Success);
        let snapshot = window.record(Duration::from_millis(10), Outcome::SlowSuccess);

        assert_eq!(snapshot.total_calls, 3);
        assert_eq!(snapshot.failed_calls, 1);
        assert_eq!(snapshot.slow_calls, 1);
        assert!((snapshot.failure_rate - 100.0 / 3.0).abs() < 1e-9);
    }

    /// Validates that buckets older than the window age out on the next write.
    ///
    /// Assertions:
    /// - Confirms calls from second 0 still count at second 4.
    /// - Confirms they are dropped at second 5.
    #[test]
    fn test_buckets_age_out() {
        let (window, clock) = window(5, 1);

        window.record(Duration::from_millis(1), Outcome::Error);
        window.record(Duration::from_millis(1), Outcome::Error);

        clock.advance(Duration::from_secs(4));
        let snapshot = window.record(Duration::from_millis(1), Outcome::Success);
        assert_eq!(snapshot.total_calls, 3);

        clock.advance(Duration::from_secs(1));
        let snapshot = window.record(Duration::from_millis(1), Outcome::Success);
        assert_eq!(snapshot.total_calls, 2);
        assert_eq!(snapshot.failed_calls, 0);
    }

    /// Validates a jump longer than the whole window clears everything once.
    ///
    /// Assertions:
    /// - Confirms only the newest call remains after a long idle period.
    #[test]
    fn test_long_gap_clears_window() {
        let (window, clock) = window(3, 1);
        for _ in 0..10 {
            window.record(Duration::from_millis(1), Outcome::SlowError);
            clock.advance_millis(500);
        }

        clock.advance(Duration::from_secs(3_600));
        let snapshot = window.record(Duration::from_millis(2), Outcome::Success);
        assert_eq!(snapshot.total_calls, 1);
        assert_eq!(snapshot.total_duration, Duration::from_millis(2));
    }

    /// Validates that `snapshot()` discounts stale buckets without mutating.
    ///
    /// Assertions:
    /// - Confirms the read-only view drops aged-out calls.
    /// - Confirms repeated reads are identical.
    /// - Confirms the ring itself was not advanced by reading.
    #[test]
    fn test_snapshot_is_read_only() {
        let (window, clock) = window(2, 1);
        window.record(Duration::from_millis(1), Outcome::Error);
        clock.advance(Duration::from_secs(1));
        window.record(Duration::from_millis(1), Outcome::Success);

        clock.advance(Duration::from_secs(1));
        let first = window.snapshot();
        assert_eq!(first.total_calls, 1);
        assert_eq!(first.failed_calls, 0);
        for _ in 0..10 {
            assert_eq!(window.snapshot(), first);
        }
        assert_eq!(window.ring.lock().head_second, 1);
        assert_eq!(window.ring.lock().totals.total_calls(), 2);
    }
}
