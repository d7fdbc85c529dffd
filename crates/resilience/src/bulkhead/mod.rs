//! Bulkhead pattern for limiting concurrent operations
//!
//! Two isolation strategies are provided:
//! - [`SemaphoreBulkhead`]: callers run on their own task or thread, and a
//!   live-resizable permit count caps how many run at once.
//! - [`ThreadPoolBulkhead`]: work is handed to a bounded pool of dedicated
//!   worker threads behind a bounded queue.

mod semaphore;
mod thread_pool;

pub use semaphore::{
    BulkheadConfig, BulkheadConfigBuilder, BulkheadMetrics, BulkheadPermit, SemaphoreBulkhead,
};
pub use thread_pool::{
    ThreadPoolBulkhead, ThreadPoolBulkheadConfig, ThreadPoolBulkheadConfigBuilder,
    ThreadPoolBulkheadMetrics,
};

/// Permit-based concurrency limit shared by the semaphore and adaptive
/// bulkheads
pub trait Bulkhead: Send + Sync {
    fn name(&self) -> &str;

    /// Take a permit if one is free, without waiting
    fn try_acquire_permission(&self) -> bool;

    /// Return a permit taken through [`try_acquire_permission`](Self::try_acquire_permission)
    fn release(&self);

    /// Permits that could be handed out right now
    fn available_calls(&self) -> usize;
}
