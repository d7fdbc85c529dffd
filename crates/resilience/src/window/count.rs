//! Count-based window: the last N outcomes

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use super::{Outcome, OutcomeWindow, Snapshot, Totals};
use crate::error::{ConfigError, ConfigResult};

// Slot layout: bit 63 = occupied, bits 61..=62 = outcome code, bits 0..=60 = nanos.
const OCCUPIED: u64 = 1 << 63;
const OUTCOME_SHIFT: u32 = 61;
const DURATION_MASK: u64 = (1 << OUTCOME_SHIFT) - 1;

fn pack(outcome: Outcome, duration: Duration) -> u64 {
    let nanos = u64::try_from(duration.as_nanos()).unwrap_or(u64::MAX).min(DURATION_MASK);
    OCCUPIED | (outcome.code() << OUTCOME_SHIFT) | nanos
}

fn unpack(slot: u64) -> Option<(Outcome, u64)> {
    if slot & OCCUPIED == 0 {
        return None;
    }
    Some((Outcome::from_code(slot >> OUTCOME_SHIFT), slot & DURATION_MASK))
}

/// Ring of the most recent `size` outcomes
///
/// Each slot is a single atomic word, so replacing the oldest outcome is one
/// swap. A writer adds its outcome to the totals before publishing it into a
/// slot and subtracts whatever it evicted afterwards, which keeps every
/// counter non-negative under concurrent writers. While writers are in
/// flight a snapshot may briefly count up to one extra call per writer.
pub struct CountWindow {
    slots: Box<[AtomicU64]>,
    cursor: AtomicU64,
    counts: [AtomicU64; 4],
    duration_nanos: AtomicU64,
    minimum_calls: u64,
}

impl CountWindow {
    /// Create an empty window of `size` slots
    pub fn new(size: usize, minimum_calls: u64) -> ConfigResult<Self> {
        if size == 0 {
            return Err(ConfigError::invalid("count window size must be greater than 0"));
        }
        Ok(Self::allocate(size, minimum_calls))
    }

    /// Infallible constructor for validated sizes; zero is raised to one
    pub(crate) fn allocate(size: usize, minimum_calls: u64) -> Self {
        Self {
            slots: (0..size.max(1)).map(|_| AtomicU64::new(0)).collect(),
            cursor: AtomicU64::new(0),
            counts: Default::default(),
            duration_nanos: AtomicU64::new(0),
            minimum_calls,
        }
    }

    fn slot_index(&self) -> usize {
        let position = self.cursor.fetch_add(1, Ordering::Relaxed);
        let len = self.slots.len() as u64;
        usize::try_from(position % len).unwrap_or_default()
    }

    fn load_totals(&self) -> Totals {
        Totals {
            success: self.counts[0].load(Ordering::Acquire),
            slow_success: self.counts[1].load(Ordering::Acquire),
            error: self.counts[2].load(Ordering::Acquire),
            slow_error: self.counts[3].load(Ordering::Acquire),
            duration_nanos: self.duration_nanos.load(Ordering::Acquire),
        }
    }

    fn counter(&self, outcome: Outcome) -> &AtomicU64 {
        &self.counts[usize::try_from(outcome.code()).unwrap_or_default()]
    }
}

impl OutcomeWindow for CountWindow {
    fn record(&self, duration: Duration, outcome: Outcome) -> Snapshot {
        let packed = pack(outcome, duration);

        self.counter(outcome).fetch_add(1, Ordering::AcqRel);
        self.duration_nanos.fetch_add(packed & DURATION_MASK, Ordering::AcqRel);

        let evicted = self.slots[self.slot_index()].swap(packed, Ordering::AcqRel);
        if let Some((old_outcome, old_nanos)) = unpack(evicted) {
            self.counter(old_outcome).fetch_sub(1, Ordering::AcqRel);
            self.duration_nanos.fetch_sub(old_nanos, Ordering::AcqRel);
        }

        self.snapshot()
    }

    fn snapshot(&self) -> Snapshot {
        Snapshot::from_totals(&self.load_totals(), self.minimum_calls)
    }

    fn size(&self) -> usize {
        self.slots.len()
    }

    fn minimum_number_of_calls(&self) -> u64 {
        self.minimum_calls
    }
}

impl fmt::Debug for CountWindow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CountWindow")
            .field("size", &self.slots.len())
            .field("minimum_calls", &self.minimum_calls)
            .field("totals", &self.load_totals())
            .finish()
    }
}
