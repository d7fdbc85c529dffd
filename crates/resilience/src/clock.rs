//! Time source shared by windows, breaker periods and rate-limiter cycles
//!
//! Time-based windows age their buckets, the circuit breaker stamps each
//! period and times its OPEN wait, and the rate limiter numbers its permit
//! cycles, all from one [`Clock`]. Waits go through [`Clock::sleep`] as well,
//! so a component built on a [`MockClock`] wakes when the test advances it
//! rather than when wall time passes.

use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use parking_lot::Mutex;
use tokio::sync::Notify;

/// Source of monotonic and wall-clock time for a component
pub trait Clock: Send + Sync + 'static {
    /// Monotonic reading used for windows, periods and cycles
    fn now(&self) -> Instant;

    /// Wall-clock reading stamped on published events
    fn system_time(&self) -> SystemTime;

    /// Event timestamp in epoch milliseconds
    fn millis_since_epoch(&self) -> u64 {
        let millis = self.system_time().duration_since(UNIX_EPOCH).unwrap_or_default().as_millis();
        u64::try_from(millis).unwrap_or(u64::MAX)
    }

    /// Nanoseconds elapsed since `origin`, saturating at `u64::MAX`
    fn nanos_since(&self, origin: Instant) -> u64 {
        let nanos = self.now().saturating_duration_since(origin).as_nanos();
        u64::try_from(nanos).unwrap_or(u64::MAX)
    }

    /// Complete once `duration` has passed on this clock
    fn sleep(&self, duration: Duration) -> impl Future<Output = ()> + Send {
        tokio::time::sleep(duration)
    }
}

/// Monotonic system time; waits use the tokio timer
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }

    fn system_time(&self) -> SystemTime {
        SystemTime::now()
    }
}

impl<T: Clock> Clock for Arc<T> {
    fn now(&self) -> Instant {
        (**self).now()
    }

    fn system_time(&self) -> SystemTime {
        (**self).system_time()
    }

    fn sleep(&self, duration: Duration) -> impl Future<Output = ()> + Send {
        (**self).sleep(duration)
    }
}

/// Hand-driven clock for components under test
///
/// Clones share one elapsed counter: give a clone to the limiter or breaker
/// and keep another to move time. Pending [`Clock::sleep`] futures are woken
/// by every `advance` and `set_elapsed`, and finish once the counter reaches
/// their deadline.
#[derive(Debug, Clone)]
pub struct MockClock {
    start: Instant,
    elapsed: Arc<Mutex<Duration>>,
    moved: Arc<Notify>,
}

impl MockClock {
    /// Start at the current instant with nothing elapsed
    pub fn new() -> Self {
        Self {
            start: Instant::now(),
            elapsed: Arc::new(Mutex::new(Duration::ZERO)),
            moved: Arc::new(Notify::new()),
        }
    }

    /// Move time forward by `duration`
    pub fn advance(&self, duration: Duration) {
        *self.elapsed.lock() += duration;
        self.moved.notify_waiters();
    }

    /// Move time forward by `millis` milliseconds
    pub fn advance_millis(&self, millis: u64) {
        self.advance(Duration::from_millis(millis));
    }

    /// Jump to an absolute offset from the start
    pub fn set_elapsed(&self, duration: Duration) {
        *self.elapsed.lock() = duration;
        self.moved.notify_waiters();
    }

    /// Time moved so far
    pub fn elapsed(&self) -> Duration {
        *self.elapsed.lock()
    }
}

impl Default for MockClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for MockClock {
    fn now(&self) -> Instant {
        self.start + self.elapsed()
    }

    fn system_time(&self) -> SystemTime {
        UNIX_EPOCH + self.elapsed()
    }

    fn sleep(&self, duration: Duration) -> impl Future<Output = ()> + Send {
        let deadline = self.elapsed().saturating_add(duration);
        let clock = self.clone();
        async move {
            loop {
                // Registered before the check so an advance in between is not lost
                let moved = clock.moved.notified();
                if clock.elapsed() >= deadline {
                    return;
                }
                moved.await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Validates that clones of a mock clock move together.
    ///
    /// Assertions:
    /// - Confirms `advance` on either clone shows up in both.
    /// - Confirms `nanos_since` measures from an earlier reading.
    #[test]
    fn test_mock_clock_clones_share_time() {
        let clock = MockClock::new();
        let origin = clock.now();
        clock.advance(Duration::from_secs(10));

        let handle = clock.clone();
        handle.advance_millis(5_000);

        assert_eq!(clock.elapsed(), Duration::from_secs(15));
        assert_eq!(clock.now().duration_since(origin), Duration::from_secs(15));
        assert_eq!(clock.nanos_since(origin), 15_000_000_000);
    }

    /// Validates the wall-clock view used for event timestamps.
    ///
    /// Assertions:
    /// - Confirms `set_elapsed` jumps to an absolute offset.
    /// - Confirms `millis_since_epoch` follows it.
    /// - Confirms `nanos_since` saturates to zero for a later origin.
    #[test]
    fn test_mock_clock_epoch_view() {
        let clock = MockClock::new();
        clock.set_elapsed(Duration::from_millis(5000));

        assert_eq!(clock.elapsed(), Duration::from_millis(5000));
        assert_eq!(clock.millis_since_epoch(), 5000);

        let later = clock.now() + Duration::from_secs(1);
        assert_eq!(clock.nanos_since(later), 0);
        assert!(SystemClock.millis_since_epoch() > 0);
    }

    /// Validates that mock sleeps finish on advances, not on wall time.
    ///
    /// Assertions:
    /// - Ensures a pending sleep stays pending while time is short of the deadline.
    /// - Confirms it completes once another task advances past the deadline.
    /// - Confirms a zero sleep completes immediately.
    #[tokio::test]
    async fn test_mock_clock_sleep_follows_advances() {
        let clock = MockClock::new();
        let sleeper = tokio::spawn({
            let clock = clock.clone();
            async move { clock.sleep(Duration::from_secs(30)).await }
        });

        tokio::task::yield_now().await;
        clock.advance(Duration::from_secs(10));
        tokio::task::yield_now().await;
        assert!(!sleeper.is_finished());

        clock.advance(Duration::from_secs(20));
        tokio::time::timeout(Duration::from_secs(5), sleeper)
            .await
            .expect("sleep woke on advance")
            .unwrap();

        clock.sleep(Duration::ZERO).await;
    }

    /// Validates the system clock sleep against the tokio timer.
    ///
    /// Assertions:
    /// - Confirms the sleep completes once paused tokio time is moved past it.
    #[tokio::test(start_paused = true)]
    async fn test_system_clock_sleep_uses_tokio_timer() {
        let clock = Arc::new(SystemClock);
        let before = tokio::time::Instant::now();
        clock.sleep(Duration::from_secs(3)).await;
        assert!(tokio::time::Instant::now() - before >= Duration::from_secs(3));
    }
}
