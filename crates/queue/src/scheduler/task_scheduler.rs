//! Concurrency-controlled task scheduler
//!
//! Admission is counted, execution is gated. A task is admitted when its
//! scope (the global scope, or its work group) has room; admitted tasks then
//! wait for one of the scope's execution slots.

use std::any::Any;
use std::collections::HashMap;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

use super::work_group::{Capacity, Room, WorkGroup};
use crate::config::{duration_millis, ConfigError};

/// Scheduler configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SchedulerConfig {
    /// Ungrouped tasks running at once
    pub max_threads: usize,

    /// Ungrouped tasks admitted beyond `max_threads`, waiting for a slot
    pub max_queue_size: usize,

    /// How long `dispose` waits for in-flight tasks before aborting them
    #[serde(with = "duration_millis")]
    pub wait_for_drain: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_threads: std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(8),
            max_queue_size: 0,
            wait_for_drain: Duration::from_secs(30),
        }
    }
}

impl SchedulerConfig {
    pub fn new(max_threads: usize) -> Self {
        Self {
            max_threads,
            ..Default::default()
        }
    }

    pub fn with_max_threads(mut self, max_threads: usize) -> Self {
        self.max_threads = max_threads;
        self
    }

    pub fn with_max_queue_size(mut self, max_queue_size: usize) -> Self {
        self.max_queue_size = max_queue_size;
        self
    }

    pub fn with_wait_for_drain(mut self, timeout: Duration) -> Self {
        self.wait_for_drain = timeout;
        self
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_threads == 0 {
            return Err(ConfigError::invalid(
                "scheduler.max_threads",
                "must be at least 1",
            ));
        }
        Ok(())
    }
}

/// Scheduler errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SchedulerError {
    #[error("scheduler already started")]
    AlreadyStarted,

    #[error("scheduler not started")]
    NotStarted,

    #[error("invalid work group '{name}': {reason}")]
    InvalidWorkGroup { name: String, reason: String },

    #[error("scheduler disposed")]
    Disposed,

    /// Scope is at capacity (only from [`TaskScheduler::add_task`])
    #[error("no room for task")]
    NoRoom,
}

/// How a scheduled task ended
#[derive(Debug)]
pub enum TaskOutcome<T, E> {
    Completed(T),

    /// The task returned an error
    Failed(E),

    /// The task panicked; the panic was contained
    Panicked(String),

    /// The task was aborted before finishing
    Canceled,
}

impl<T, E> TaskOutcome<T, E> {
    pub fn is_completed(&self) -> bool {
        matches!(self, Self::Completed(_))
    }
}

/// Handle to an admitted task
#[derive(Debug)]
pub struct TaskHandle<T, E> {
    handle: JoinHandle<TaskOutcome<T, E>>,
}

impl<T, E> TaskHandle<T, E> {
    /// Wait for the task to end
    pub async fn join(self) -> TaskOutcome<T, E> {
        match self.handle.await {
            Ok(outcome) => outcome,
            Err(e) if e.is_panic() => TaskOutcome::Panicked(panic_message(&e.into_panic())),
            Err(_) => TaskOutcome::Canceled,
        }
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }
}

/// Counter reservation; releases the scope when dropped
pub(crate) struct SlotGuard {
    capacity: Arc<Capacity>,
}

impl Drop for SlotGuard {
    fn drop(&mut self) {
        self.capacity.release();
    }
}

pub(crate) fn panic_message(panic: &Box<dyn Any + Send>) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "task panicked".to_string()
    }
}

struct Inner {
    config: SchedulerConfig,
    global: Arc<Capacity>,
    groups: RwLock<HashMap<String, WorkGroup>>,

    /// Narrow lock around check-then-increment
    admission: Mutex<()>,
    started: AtomicBool,
    disposed: AtomicBool,
    subscribers: AtomicUsize,

    /// Cancelled when the scheduler stops admitting
    closing: CancellationToken,

    /// Cancelled when the drain deadline passes
    abort: CancellationToken,
    tracker: TaskTracker,
}

/// Bounded task scheduler with global and per work-group capacity
///
/// Ungrouped tasks count against the global scope (`max_threads` running,
/// `max_queue_size` waiting). Grouped tasks count only against their group.
/// Counters are decremented when a task ends however it ends.
///
/// # Example
///
/// ```
/// use durable_queue::scheduler::{SchedulerConfig, TaskScheduler};
///
/// # tokio_test::block_on(async {
/// let scheduler = TaskScheduler::new(SchedulerConfig::new(4)).unwrap();
/// scheduler.start().unwrap();
///
/// let images = scheduler.add_work_group("images", 2, 1).unwrap();
/// assert_eq!(images.concurrency_level(), 2);
///
/// scheduler.dispose().await;
/// # });
/// ```
#[derive(Clone)]
pub struct TaskScheduler {
    inner: Arc<Inner>,
}

impl TaskScheduler {
    pub fn new(config: SchedulerConfig) -> Result<Self, ConfigError> {
        config.validate()?;

        Ok(Self {
            inner: Arc::new(Inner {
                global: Arc::new(Capacity::new(config.max_threads, config.max_queue_size)),
                config,
                groups: RwLock::new(HashMap::new()),
                admission: Mutex::new(()),
                started: AtomicBool::new(false),
                disposed: AtomicBool::new(false),
                subscribers: AtomicUsize::new(0),
                closing: CancellationToken::new(),
                abort: CancellationToken::new(),
                tracker: TaskTracker::new(),
            }),
        })
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.inner.config
    }

    pub fn start(&self) -> Result<(), SchedulerError> {
        if self.inner.disposed.load(Ordering::SeqCst) {
            return Err(SchedulerError::Disposed);
        }
        if self.inner.started.swap(true, Ordering::SeqCst) {
            return Err(SchedulerError::AlreadyStarted);
        }
        info!(
            max_threads = self.inner.config.max_threads,
            max_queue_size = self.inner.config.max_queue_size,
            "scheduler started"
        );
        Ok(())
    }

    pub fn is_running(&self) -> bool {
        self.inner.started.load(Ordering::SeqCst) && !self.inner.disposed.load(Ordering::SeqCst)
    }

    fn ensure_running(&self) -> Result<(), SchedulerError> {
        if self.inner.disposed.load(Ordering::SeqCst) {
            return Err(SchedulerError::Disposed);
        }
        if !self.inner.started.load(Ordering::SeqCst) {
            return Err(SchedulerError::NotStarted);
        }
        Ok(())
    }

    /// Register a work group, or return the one already registered under `name`
    pub fn add_work_group(
        &self,
        name: &str,
        concurrency_level: usize,
        max_queue_size: usize,
    ) -> Result<WorkGroup, SchedulerError> {
        self.ensure_running()?;

        if concurrency_level == 0 {
            return Err(SchedulerError::InvalidWorkGroup {
                name: name.to_string(),
                reason: "concurrency level must be at least 1".to_string(),
            });
        }

        let mut groups = self.inner.groups.write();
        if let Some(existing) = groups.get(name) {
            if existing.concurrency_level() != concurrency_level
                || existing.max_queue_size() != max_queue_size
            {
                debug!(
                    group = name,
                    "work group already registered with different limits, keeping existing"
                );
            }
            return Ok(existing.clone());
        }

        let group = WorkGroup::new(name, concurrency_level, max_queue_size);
        groups.insert(name.to_string(), group.clone());
        debug!(group = name, concurrency_level, max_queue_size, "work group added");
        Ok(group)
    }

    pub fn work_group(&self, name: &str) -> Option<WorkGroup> {
        self.inner.groups.read().get(name).cloned()
    }

    /// Room in the global scope
    pub fn room_for_task(&self) -> Room {
        if !self.is_running() {
            return Room::No;
        }
        self.inner.global.room()
    }

    /// Room in a work group
    pub fn room_for_group_task(&self, group: &WorkGroup) -> Room {
        if !self.is_running() {
            return Room::No;
        }
        group.capacity.room()
    }

    fn room(&self, group: Option<&WorkGroup>) -> Room {
        match group {
            Some(group) => self.room_for_group_task(group),
            None => self.room_for_task(),
        }
    }

    fn capacity_for(&self, group: Option<&WorkGroup>) -> Arc<Capacity> {
        match group {
            Some(group) => group.capacity.clone(),
            None => self.inner.global.clone(),
        }
    }

    /// Ungrouped tasks currently admitted
    pub fn in_flight(&self) -> usize {
        self.inner.global.in_flight()
    }

    /// Upper bound on ungrouped admitted tasks
    pub fn capacity(&self) -> usize {
        self.inner.global.limit()
    }

    /// Reserve a counter slot: lock-free check, then check-and-increment under the lock
    pub(crate) fn reserve(
        &self,
        group: Option<&WorkGroup>,
    ) -> Result<Option<SlotGuard>, SchedulerError> {
        self.ensure_running()?;
        if !self.room(group).is_admissible() {
            return Ok(None);
        }

        let capacity = self.capacity_for(group);
        let _lock = self.inner.admission.lock();
        self.ensure_running()?;
        if !capacity.room().is_admissible() {
            return Ok(None);
        }
        capacity.increment();
        Ok(Some(SlotGuard { capacity }))
    }

    /// Spawn a task whose counter slot is already reserved
    pub(crate) fn spawn_reserved<F, Fut, T, E>(&self, guard: SlotGuard, work: F) -> TaskHandle<T, E>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
        T: Send + 'static,
        E: Send + 'static,
    {
        let permits = guard.capacity.permits();
        let abort = self.inner.abort.clone();

        let handle = self.inner.tracker.spawn(async move {
            // Dropped last: the permit is back before waiters are woken
            let _guard = guard;

            let _permit = tokio::select! {
                biased;
                _ = abort.cancelled() => return TaskOutcome::Canceled,
                permit = permits.acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => return TaskOutcome::Canceled,
                },
            };

            tokio::select! {
                biased;
                _ = abort.cancelled() => TaskOutcome::Canceled,
                result = AssertUnwindSafe(work()).catch_unwind() => match result {
                    Ok(Ok(value)) => TaskOutcome::Completed(value),
                    Ok(Err(err)) => TaskOutcome::Failed(err),
                    Err(panic) => {
                        let message = panic_message(&panic);
                        warn!(panic = %message, "scheduled task panicked");
                        TaskOutcome::Panicked(message)
                    }
                },
            }
        });

        TaskHandle { handle }
    }

    /// Admit and spawn a task, failing with `NoRoom` when the scope is full
    pub fn add_task<F, Fut, T, E>(
        &self,
        work: F,
        group: Option<&WorkGroup>,
    ) -> Result<TaskHandle<T, E>, SchedulerError>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
        T: Send + 'static,
        E: Send + 'static,
    {
        let guard = self.reserve(group)?.ok_or(SchedulerError::NoRoom)?;
        Ok(self.spawn_reserved(guard, work))
    }

    /// Wait until the scope may have room or the scheduler stops admitting
    ///
    /// Registers for the free-capacity signal before re-checking, so a
    /// release between the check and the wait is never missed.
    pub async fn wait_for_room(&self, group: Option<&WorkGroup>) {
        let capacity = self.capacity_for(group);
        loop {
            let notified = capacity.freed().notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if self.room(group).is_admissible() || self.inner.closing.is_cancelled() {
                return;
            }

            tokio::select! {
                _ = &mut notified => {}
                _ = self.inner.closing.cancelled() => return,
            }
        }
    }

    /// Token cancelled once the scheduler stops admitting
    pub fn closing_token(&self) -> CancellationToken {
        self.inner.closing.clone()
    }

    /// Attach a consumer loop, returning the new subscriber count
    pub fn subscribe(&self) -> usize {
        self.inner.subscribers.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Detach a consumer loop, returning the new subscriber count
    pub fn unsubscribe(&self) -> usize {
        let previous = self
            .inner
            .subscribers
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| {
                Some(n.saturating_sub(1))
            })
            .unwrap_or(0);
        previous.saturating_sub(1)
    }

    pub fn subscribers(&self) -> usize {
        self.inner.subscribers.load(Ordering::SeqCst)
    }

    /// Stop admitting, drain in-flight tasks, abort what is left at the deadline
    pub async fn dispose(&self) {
        if self.inner.disposed.swap(true, Ordering::SeqCst) {
            return;
        }

        info!(in_flight = self.inner.tracker.len(), "disposing scheduler");
        self.inner.closing.cancel();
        self.inner.tracker.close();

        let drained = tokio::time::timeout(self.inner.config.wait_for_drain, self.inner.tracker.wait())
            .await
            .is_ok();

        if !drained {
            warn!(
                remaining = self.inner.tracker.len(),
                "drain deadline passed, aborting in-flight tasks"
            );
            self.inner.abort.cancel();
            self.inner.tracker.wait().await;
        }

        info!("scheduler disposed");
    }
}
