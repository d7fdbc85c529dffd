use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender, TrySendError};
use tokio::sync::oneshot;
use tracing::{debug, instrument, warn};

use crate::error::{ConfigError, ConfigResult, RejectionReason, ResilienceError, ResilienceResult};
use crate::event::{EventPublisher, ListenerId, ResilienceEvent};

type Task = Box<dyn FnOnce() + Send + 'static>;

/// Configuration for a thread-pool bulkhead
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct ThreadPoolBulkheadConfig {
    /// Workers kept alive while idle
    pub core_thread_pool_size: usize,
    /// Upper bound on workers; extra workers start only when the queue is full
    pub max_thread_pool_size: usize,
    /// Tasks that may wait for a worker
    pub queue_capacity: usize,
    /// How long a worker above the core size idles before exiting
    #[cfg_attr(feature = "serde", serde(with = "crate::duration_millis"))]
    pub keep_alive_duration: Duration,
}

impl Default for ThreadPoolBulkheadConfig {
    fn default() -> Self {
        let cpus = thread::available_parallelism().map_or(1, usize::from);
        Self {
            core_thread_pool_size: cpus.saturating_sub(1).max(1),
            max_thread_pool_size: cpus,
            queue_capacity: 100,
            keep_alive_duration: Duration::from_millis(20),
        }
    }
}

impl ThreadPoolBulkheadConfig {
    /// Create a new configuration builder
    pub fn builder() -> ThreadPoolBulkheadConfigBuilder {
        ThreadPoolBulkheadConfigBuilder::new()
    }

    /// Validate the configuration
    pub fn validate(&self) -> ConfigResult<()> {
        if self.core_thread_pool_size == 0 {
            return Err(ConfigError::invalid("core_thread_pool_size must be greater than 0"));
        }
        if self.max_thread_pool_size == 0 {
            return Err(ConfigError::invalid("max_thread_pool_size must be greater than 0"));
        }
        if self.core_thread_pool_size > self.max_thread_pool_size {
            return Err(ConfigError::invalid(format!(
                "core_thread_pool_size ({}) must not exceed max_thread_pool_size ({})",
                self.core_thread_pool_size, self.max_thread_pool_size
            )));
        }
        if self.queue_capacity == 0 {
            return Err(ConfigError::invalid("queue_capacity must be greater than 0"));
        }
        Ok(())
    }
}

/// Builder for ThreadPoolBulkheadConfig
#[derive(Debug, Default)]
pub struct ThreadPoolBulkheadConfigBuilder {
    config: ThreadPoolBulkheadConfig,
}

impl ThreadPoolBulkheadConfigBuilder {
    /// Create a builder starting from the defaults
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the number of workers kept alive while idle
    pub fn core_thread_pool_size(mut self, size: usize) -> Self {
        self.config.core_thread_pool_size = size;
        self
    }

    /// Set the worker ceiling
    pub fn max_thread_pool_size(mut self, size: usize) -> Self {
        self.config.max_thread_pool_size = size;
        self
    }

    /// Set the bounded queue length
    pub fn queue_capacity(mut self, capacity: usize) -> Self {
        self.config.queue_capacity = capacity;
        self
    }

    /// Set how long an overflow worker idles before exiting
    pub fn keep_alive_duration(mut self, keep_alive: Duration) -> Self {
        self.config.keep_alive_duration = keep_alive;
        self
    }

    /// Validate and return the configuration
    pub fn build(self) -> ConfigResult<ThreadPoolBulkheadConfig> {
        self.config.validate()?;
        Ok(self.config)
    }
}

/// Metrics for thread-pool bulkhead monitoring
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ThreadPoolBulkheadMetrics {
    /// Workers kept alive while idle
    pub core_thread_pool_size: usize,
    /// Worker ceiling
    pub max_thread_pool_size: usize,
    /// Live worker threads
    pub thread_pool_size: usize,
    /// Tasks waiting for a worker
    pub queue_depth: usize,
    /// Bounded queue length
    pub queue_capacity: usize,
    /// Tasks accepted since creation
    pub submitted_tasks: u64,
    /// Tasks refused because the queue and pool were full
    pub rejected_tasks: u64,
}

impl ThreadPoolBulkheadMetrics {
    /// Free queue slots at the time of the snapshot
    pub fn remaining_queue_capacity(&self) -> usize {
        self.queue_capacity.saturating_sub(self.queue_depth)
    }

    /// Queue fill level as a fraction (0.0 to 1.0)
    pub fn utilization(&self) -> f64 {
        self.queue_depth as f64 / self.queue_capacity.max(1) as f64
    }

    /// Get a human-readable status message
    pub fn status_message(&self) -> String {
        format!(
            "Thread pool bulkhead: {}/{} threads, queue {}/{}, {} submitted, {} rejected",
            self.thread_pool_size,
            self.max_thread_pool_size,
            self.queue_depth,
            self.queue_capacity,
            self.submitted_tasks,
            self.rejected_tasks
        )
    }
}

/// State shared with the worker threads
///
/// Workers never hold the sending half of the queue, so dropping the last
/// bulkhead handle disconnects the queue and lets them exit once it drains.
struct Pool {
    name: Arc<str>,
    config: ThreadPoolBulkheadConfig,
    live_workers: AtomicUsize,
}

impl Pool {
    /// Reserve a worker slot while fewer than `limit` workers are live
    fn reserve_worker(&self, limit: usize) -> bool {
        let mut current = self.live_workers.load(Ordering::Acquire);
        loop {
            if current >= limit {
                return false;
            }
            match self.live_workers.compare_exchange_weak(
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

    /// Retire an idle worker unless that would drop below the core size
    fn retire_idle_worker(&self) -> bool {
        let core = self.config.core_thread_pool_size;
        let mut current = self.live_workers.load(Ordering::Acquire);
        loop {
            if current <= core {
                return false;
            }
            match self.live_workers.compare_exchange_weak(
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
}

struct Inner {
    pool: Arc<Pool>,
    sender: Sender<Task>,
    receiver: Receiver<Task>,
    submitted: AtomicU64,
    rejected: AtomicU64,
    events: EventPublisher,
}

/// Bulkhead that runs work on a bounded pool of dedicated threads
///
/// Submission follows the classic executor order: start a worker while below
/// the core size, otherwise queue, otherwise start a worker up to the maximum
/// size, otherwise reject with [`RejectionReason::QueueFull`].
///
/// # Examples
///
/// ```rust
/// use resilience_core::bulkhead::{ThreadPoolBulkhead, ThreadPoolBulkheadConfig};
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let config = ThreadPoolBulkheadConfig::builder()
///     .core_thread_pool_size(1)
///     .max_thread_pool_size(2)
///     .queue_capacity(10)
///     .build()?;
/// let bulkhead = ThreadPoolBulkhead::new("report-renderer", config)?;
///
/// let pages = bulkhead.execute(|| Ok::<_, std::io::Error>(12)).await?;
/// assert_eq!(pages, 12);
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct ThreadPoolBulkhead {
    inner: Arc<Inner>,
}

impl ThreadPoolBulkhead {
    /// Create a pool after validating `config`; workers start lazily
    pub fn new(name: &str, config: ThreadPoolBulkheadConfig) -> ConfigResult<Self> {
        config.validate()?;
        let (sender, receiver) = bounded(config.queue_capacity);
        Ok(Self {
            inner: Arc::new(Inner {
                pool: Arc::new(Pool {
                    name: Arc::from(name),
                    config,
                    live_workers: AtomicUsize::new(0),
                }),
                sender,
                receiver,
                submitted: AtomicU64::new(0),
                rejected: AtomicU64::new(0),
                events: EventPublisher::new(),
            }),
        })
    }

    /// Get the bulkhead name
    pub fn name(&self) -> &str {
        &self.inner.pool.name
    }

    /// Get the configuration
    pub fn config(&self) -> &ThreadPoolBulkheadConfig {
        &self.inner.pool.config
    }

    /// Remaining queue capacity
    pub fn available_calls(&self) -> usize {
        self.config().queue_capacity.saturating_sub(self.inner.receiver.len())
    }

    /// Register an event listener
    pub fn subscribe<F>(&self, listener: F) -> ListenerId
    where
        F: Fn(&ResilienceEvent) + Send + Sync + 'static,
    {
        self.inner.events.subscribe(listener)
    }

    /// Hand a task to the pool
    ///
    /// The returned receiver yields the task's value; it reports an error
    /// instead if the task panicked.
    pub fn submit<F, T>(&self, task: F) -> Result<oneshot::Receiver<T>, RejectionReason>
    where
        F: FnOnce() -> T + Send + 'static,
        T: Send + 'static,
    {
        let (result_tx, result_rx) = oneshot::channel();
        let job: Task = Box::new(move || {
            // The caller may have stopped waiting
            let _ = result_tx.send(task());
        });

        match self.dispatch(job) {
            Ok(()) => {
                self.inner.submitted.fetch_add(1, Ordering::Relaxed);
                Ok(result_rx)
            }
            Err(reason) => {
                self.inner.rejected.fetch_add(1, Ordering::Relaxed);
                debug!(bulkhead = %self.name(), "Thread pool bulkhead full");
                self.inner.events.publish_with(|| ResilienceEvent::CallNotPermitted {
                    name: Arc::clone(&self.inner.pool.name),
                    reason,
                });
                Err(reason)
            }
        }
    }

    /// Run a fallible task on the pool and await its result
    #[instrument(skip(self, task), fields(bulkhead = %self.name()))]
    pub async fn execute<F, T, E>(&self, task: F) -> ResilienceResult<T, E>
    where
        F: FnOnce() -> Result<T, E> + Send + 'static,
        T: Send + 'static,
        E: std::error::Error + Send + Sync + 'static,
    {
        let receiver =
            self.submit(task).map_err(|reason| ResilienceError::rejected(self.name(), reason))?;
        match receiver.await {
            Ok(result) => result.map_err(|source| ResilienceError::OperationFailed { source }),
            Err(_) => Err(ResilienceError::WorkerLost),
        }
    }

    /// Get current metrics
    pub fn metrics(&self) -> ThreadPoolBulkheadMetrics {
        let config = self.config();
        ThreadPoolBulkheadMetrics {
            core_thread_pool_size: config.core_thread_pool_size,
            max_thread_pool_size: config.max_thread_pool_size,
            thread_pool_size: self.inner.pool.live_workers.load(Ordering::Acquire),
            queue_depth: self.inner.receiver.len(),
            queue_capacity: config.queue_capacity,
            submitted_tasks: self.inner.submitted.load(Ordering::Relaxed),
            rejected_tasks: self.inner.rejected.load(Ordering::Relaxed),
        }
    }

    fn dispatch(&self, job: Task) -> Result<(), RejectionReason> {
        let pool = &self.inner.pool;
        if pool.reserve_worker(pool.config.core_thread_pool_size) {
            return self.start_worker(job);
        }
        match self.inner.sender.try_send(job) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(job)) => {
                if pool.reserve_worker(pool.config.max_thread_pool_size) {
                    self.start_worker(job)
                } else {
                    Err(RejectionReason::QueueFull)
                }
            }
            // Unreachable while `self` holds the sender
            Err(TrySendError::Disconnected(_)) => Err(RejectionReason::QueueFull),
        }
    }

    /// Start a worker whose slot was already reserved
    fn start_worker(&self, first: Task) -> Result<(), RejectionReason> {
        let pool = Arc::clone(&self.inner.pool);
        let receiver = self.inner.receiver.clone();
        let index = pool.live_workers.load(Ordering::Relaxed);
        let spawned = thread::Builder::new()
            .name(format!("{}-{index}", pool.name))
            .spawn(move || run_worker(&pool, &receiver, first));

        match spawned {
            Ok(_) => Ok(()),
            Err(error) => {
                warn!(bulkhead = %self.name(), %error, "Failed to start bulkhead worker");
                self.inner.pool.live_workers.fetch_sub(1, Ordering::AcqRel);
                Err(RejectionReason::QueueFull)
            }
        }
    }
}

fn run_worker(pool: &Pool, receiver: &Receiver<Task>, first: Task) {
    run_task(pool, first);
    loop {
        match receiver.recv_timeout(pool.config.keep_alive_duration) {
            Ok(task) => run_task(pool, task),
            Err(RecvTimeoutError::Timeout) => {
                if pool.retire_idle_worker() {
                    debug!(bulkhead = %pool.name, "Idle worker retired");
                    return;
                }
            }
            Err(RecvTimeoutError::Disconnected) => {
                pool.live_workers.fetch_sub(1, Ordering::AcqRel);
                return;
            }
        }
    }
}

fn run_task(pool: &Pool, task: Task) {
    if panic::catch_unwind(AssertUnwindSafe(task)).is_err() {
        warn!(bulkhead = %pool.name, "Bulkhead task panicked");
    }
}

impl fmt::Debug for ThreadPoolBulkhead {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ThreadPoolBulkhead")
            .field("name", &self.name())
            .field("config", self.config())
            .field("metrics", &self.metrics())
            .finish()
    }
}
