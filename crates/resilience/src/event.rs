//! Typed event stream shared by all components
//!
//! Each component owns an [`EventPublisher`]. Listeners are called
//! synchronously on the thread that caused the event. A panicking listener is
//! caught and logged; it never reaches the caller or the other listeners.

use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use parking_lot::RwLock;
use tracing::warn;

use crate::circuit_breaker::CircuitState;
use crate::error::RejectionReason;
use crate::window::Outcome;

/// Something observable that happened inside a component
#[derive(Debug, Clone, PartialEq)]
pub enum ResilienceEvent {
    /// The circuit breaker moved between states
    StateTransition {
        /// Component that emitted the event
        name: Arc<str>,
        /// State before the transition
        from: CircuitState,
        /// State after the transition
        to: CircuitState,
        /// Wall-clock time of the transition
        timestamp: SystemTime,
    },
    /// A call was refused before running
    CallNotPermitted {
        /// Component that emitted the event
        name: Arc<str>,
        /// Why the call was refused
        reason: RejectionReason,
    },
    /// A completed call was counted in the window
    CallRecorded {
        /// Component that emitted the event
        name: Arc<str>,
        /// Classification of the call
        outcome: Outcome,
        /// How long the call ran
        duration: Duration,
    },
    /// A failed call matched the ignore rules and was not counted
    CallIgnored {
        /// Component that emitted the event
        name: Arc<str>,
        /// How long the call ran
        duration: Duration,
    },
    /// The circuit breaker was reset to a fresh CLOSED state
    Reset {
        /// Component that emitted the event
        name: Arc<str>,
    },
    /// The adaptive limiter raised its concurrency limit
    LimitIncreased {
        /// Component that emitted the event
        name: Arc<str>,
        /// Limit after the adjustment
        new_limit: u32,
    },
    /// The adaptive limiter lowered its concurrency limit
    LimitDecreased {
        /// Component that emitted the event
        name: Arc<str>,
        /// Limit after the adjustment
        new_limit: u32,
    },
    /// A rate limiter or bulkhead granted a permit
    PermissionAcquired {
        /// Component that emitted the event
        name: Arc<str>,
    },
    /// The retry controller is about to wait and try again
    RetryAttempt {
        /// Component that emitted the event
        name: Arc<str>,
        /// Attempt that just failed, starting at 1
        attempt: u32,
        /// Backoff before the next attempt
        wait: Duration,
    },
    /// A time-limited call missed its deadline
    CallTimedOut {
        /// Component that emitted the event
        name: Arc<str>,
        /// Deadline the call exceeded
        timeout: Duration,
    },
}

impl ResilienceEvent {
    /// Name of the component instance that emitted the event
    pub fn name(&self) -> &str {
        match self {
            Self::StateTransition { name, .. }
            | Self::CallNotPermitted { name, .. }
            | Self::CallRecorded { name, .. }
            | Self::CallIgnored { name, .. }
            | Self::Reset { name }
            | Self::LimitIncreased { name, .. }
            | Self::LimitDecreased { name, .. }
            | Self::PermissionAcquired { name }
            | Self::RetryAttempt { name, .. }
            | Self::CallTimedOut { name, .. } => name,
        }
    }
}

/// Callback invoked for every published event
pub type EventListener = Arc<dyn Fn(&ResilienceEvent) + Send + Sync>;

/// Handle returned by [`EventPublisher::subscribe`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

/// Registry of listeners owned by one component instance
///
/// Clones share the same listener list.
#[derive(Clone, Default)]
pub struct EventPublisher {
    listeners: Arc<RwLock<Vec<(ListenerId, EventListener)>>>,
    next_id: Arc<AtomicU64>,
}

impl EventPublisher {
    /// Create a publisher with no listeners
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a listener; it receives every event published from now on
    pub fn subscribe<F>(&self, listener: F) -> ListenerId
    where
        F: Fn(&ResilienceEvent) + Send + Sync + 'static,
    {
        let id = ListenerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.listeners.write().push((id, Arc::new(listener)));
        id
    }

    /// Remove a listener, returning whether it was registered
    pub fn unsubscribe(&self, id: ListenerId) -> bool {
        let mut listeners = self.listeners.write();
        let before = listeners.len();
        listeners.retain(|(existing, _)| *existing != id);
        listeners.len() != before
    }

    /// Number of registered listeners
    pub fn listener_count(&self) -> usize {
        self.listeners.read().len()
    }

    /// Whether any listener is registered
    pub fn has_listeners(&self) -> bool {
        !self.listeners.read().is_empty()
    }

    /// Deliver an event built lazily, skipping construction with no listeners
    pub fn publish_with<F>(&self, build: F)
    where
        F: FnOnce() -> ResilienceEvent,
    {
        if self.has_listeners() {
            self.publish(&build());
        }
    }

    /// Deliver an event to every listener in subscription order
    pub fn publish(&self, event: &ResilienceEvent) {
        // Listeners may subscribe from inside a callback, so never call out
        // while holding the lock.
        let listeners: Vec<EventListener> =
            self.listeners.read().iter().map(|(_, listener)| Arc::clone(listener)).collect();

        for listener in listeners {
            let delivered = panic::catch_unwind(AssertUnwindSafe(|| listener(event)));
            if delivered.is_err() {
                warn!(component = event.name(), ?event, "Event listener panicked; event dropped");
            }
        }
    }
}

impl fmt::Debug for EventPublisher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventPublisher").field("listeners", &self.listener_count()).finish()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use parking_lot::Mutex;

    use super::*;

    fn name() -> Arc<str> {
        Arc::from("backend")
    }

    /// Validates delivery order and unsubscription.
    ///
    /// Assertions:
    /// - Confirms both listeners see the event in subscription order.
    /// - Confirms an unsubscribed listener no longer receives events.
    #[test]
    fn test_publish_and_unsubscribe() {
        let publisher = EventPublisher::new();
        let seen = Arc::new(Mutex::new(Vec::new()));

        let first = {
            let seen = Arc::clone(&seen);
            publisher.subscribe(move |_| seen.lock().push("first"))
        };
        {
            let seen = Arc::clone(&seen);
            publisher.subscribe(move |_| seen.lock().push("second"));
        }

        publisher.publish(&ResilienceEvent::Reset { name: name() });
        assert_eq!(*seen.lock(), vec!["first", "second"]);

        assert!(publisher.unsubscribe(first));
        assert!(!publisher.unsubscribe(first));
        publisher.publish(&ResilienceEvent::Reset { name: name() });
        assert_eq!(*seen.lock(), vec!["first", "second", "second"]);
        assert_eq!(publisher.listener_count(), 1);
    }

    /// Validates that a panicking listener is isolated.
    ///
    /// Assertions:
    /// - Confirms `publish` returns normally.
    /// - Confirms the listener after the panicking one still runs.
    #[test]
    fn test_panicking_listener_is_isolated() {
        let publisher = EventPublisher::new();
        let delivered = Arc::new(AtomicUsize::new(0));

        publisher.subscribe(|_| panic!("listener failure"));
        {
            let delivered = Arc::clone(&delivered);
            publisher.subscribe(move |_| {
                delivered.fetch_add(1, Ordering::SeqCst);
            });
        }

        publisher.publish(&ResilienceEvent::LimitIncreased { name: name(), new_limit: 3 });
        assert_eq!(delivered.load(Ordering::SeqCst), 1);
    }

    /// Validates that `publish_with` skips building events with no listeners.
    ///
    /// Assertions:
    /// - Ensures the builder closure is never invoked.
    #[test]
    fn test_publish_with_is_lazy() {
        let publisher = EventPublisher::new();
        let built = AtomicUsize::new(0);
        publisher.publish_with(|| {
            built.fetch_add(1, Ordering::SeqCst);
            ResilienceEvent::PermissionAcquired { name: name() }
        });
        assert_eq!(built.load(Ordering::SeqCst), 0);
    }

    /// Validates `ResilienceEvent::name` across variants.
    ///
    /// Assertions:
    /// - Confirms the emitting component name is returned.
    #[test]
    fn test_event_name() {
        let event = ResilienceEvent::CallNotPermitted {
            name: name(),
            reason: RejectionReason::BulkheadFull,
        };
        assert_eq!(event.name(), "backend");
    }
}
