//! Work groups and the capacity scopes behind them

use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use tokio::sync::{Notify, Semaphore};

/// Result of a room check
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Room {
    /// A slot is free; the task runs immediately
    ForTask,

    /// All slots are busy but the queue has room; the task waits for a slot
    InQueue,

    /// No capacity, or the scheduler is not running
    No,
}

impl Room {
    /// Whether a task may be admitted
    pub fn is_admissible(self) -> bool {
        !matches!(self, Self::No)
    }
}

/// Counters, execution slots and the free-capacity signal of one scope
///
/// A scope is either the scheduler's global scope or one work group.
pub(crate) struct Capacity {
    in_flight: AtomicUsize,
    slots: usize,
    queue: usize,
    permits: Arc<Semaphore>,
    freed: Notify,
}

impl Capacity {
    pub(crate) fn new(slots: usize, queue: usize) -> Self {
        Self {
            in_flight: AtomicUsize::new(0),
            slots,
            queue,
            permits: Arc::new(Semaphore::new(slots)),
            freed: Notify::new(),
        }
    }

    pub(crate) fn room(&self) -> Room {
        let current = self.in_flight.load(Ordering::Acquire);
        if current < self.slots {
            Room::ForTask
        } else if current < self.slots + self.queue {
            Room::InQueue
        } else {
            Room::No
        }
    }

    pub(crate) fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::Acquire)
    }

    pub(crate) fn limit(&self) -> usize {
        self.slots + self.queue
    }

    pub(crate) fn increment(&self) {
        self.in_flight.fetch_add(1, Ordering::AcqRel);
    }

    /// Decrement and wake everyone waiting for capacity
    pub(crate) fn release(&self) {
        self.in_flight.fetch_sub(1, Ordering::AcqRel);
        self.freed.notify_waiters();
    }

    pub(crate) fn permits(&self) -> Arc<Semaphore> {
        self.permits.clone()
    }

    pub(crate) fn freed(&self) -> &Notify {
        &self.freed
    }
}

/// A named capacity partition
///
/// Tasks submitted with a work group count only against that group: at most
/// `concurrency_level` run at once and up to `max_queue_size` more wait for a
/// slot. Two groups are equal when their names are equal.
#[derive(Clone)]
pub struct WorkGroup {
    name: Arc<str>,
    concurrency_level: usize,
    max_queue_size: usize,
    pub(crate) capacity: Arc<Capacity>,
}

impl WorkGroup {
    pub(crate) fn new(name: &str, concurrency_level: usize, max_queue_size: usize) -> Self {
        Self {
            name: Arc::from(name),
            concurrency_level,
            max_queue_size,
            capacity: Arc::new(Capacity::new(concurrency_level, max_queue_size)),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn concurrency_level(&self) -> usize {
        self.concurrency_level
    }

    pub fn max_queue_size(&self) -> usize {
        self.max_queue_size
    }

    /// Tasks of this group currently admitted (running or waiting for a slot)
    pub fn in_flight(&self) -> usize {
        self.capacity.in_flight()
    }
}

impl std::fmt::Debug for WorkGroup {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkGroup")
            .field("name", &self.name)
            .field("concurrency_level", &self.concurrency_level)
            .field("max_queue_size", &self.max_queue_size)
            .field("in_flight", &self.in_flight())
            .finish()
    }
}

impl PartialEq for WorkGroup {
    fn eq(&self, other: &Self) -> bool {
        self.name == other.name
    }
}

impl Eq for WorkGroup {}

impl Hash for WorkGroup {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.name.hash(state);
    }
}
