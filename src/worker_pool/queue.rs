//! Bounded priority queue shared by all workers

use super::item::{Priority, Runnable};
use parking_lot::Mutex;
use std::cmp::Ordering;
use std::collections::BinaryHeap;
use tokio::sync::Notify;
use tokio::time::Instant;

pub(crate) struct QueuedJob {
    pub id: u64,
    pub priority: Priority,
    pub submitted_at: Instant,
    pub deadline: Option<Instant>,
    pub job: Box<dyn Runnable>,
}

// Highest priority first; ids are assigned in submission order, so a lower
// id within the same priority was submitted earlier
impl Ord for QueuedJob {
    fn cmp(&self, other: &Self) -> Ordering {
        self.priority
            .cmp(&other.priority)
            .then_with(|| other.id.cmp(&self.id))
    }
}

impl PartialOrd for QueuedJob {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for QueuedJob {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for QueuedJob {}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum PushRejected {
    Full,
    Closed,
}

struct QueueState {
    heap: BinaryHeap<QueuedJob>,
    closed: bool,
}

pub(crate) struct JobQueue {
    state: Mutex<QueueState>,
    capacity: usize,
    notify: Notify,
}

impl JobQueue {
    pub(crate) fn new(capacity: usize) -> Self {
        Self {
            state: Mutex::new(QueueState {
                heap: BinaryHeap::new(),
                closed: false,
            }),
            capacity,
            notify: Notify::new(),
        }
    }

    /// Enqueue without waiting; a full or closed queue rejects immediately
    pub(crate) fn push(&self, job: QueuedJob) -> Result<(), PushRejected> {
        {
            let mut state = self.state.lock();
            if state.closed {
                return Err(PushRejected::Closed);
            }
            if state.heap.len() >= self.capacity {
                return Err(PushRejected::Full);
            }
            state.heap.push(job);
        }
        self.notify.notify_one();
        Ok(())
    }

    pub(crate) fn pop(&self) -> Option<QueuedJob> {
        self.state.lock().heap.pop()
    }

    /// Stop accepting work. With `drain` false, queued jobs are handed back.
    pub(crate) fn close(&self, drain: bool) -> Vec<QueuedJob> {
        let mut state = self.state.lock();
        state.closed = true;
        if drain {
            Vec::new()
        } else {
            std::mem::take(&mut state.heap).into_vec()
        }
    }

    /// Resolves when a job may be available
    pub(crate) async fn notified(&self) {
        self.notify.notified().await
    }

    pub(crate) fn len(&self) -> usize {
        self.state.lock().heap.len()
    }

    pub(crate) fn capacity(&self) -> usize {
        self.capacity
    }
}
