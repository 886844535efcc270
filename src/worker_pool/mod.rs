/*!
 * Adaptive worker pool
 *
 * Long-lived tokio tasks pull [`WorkItem`]s from one bounded priority queue.
 * A scaler task grows the pool while the backlog outpaces the workers and
 * the host has headroom, and sheds one idle worker at a time once the pool
 * has been quiet for the grace period. Every payload runs isolated: errors,
 * panics and deadlines resolve only that item's [`WorkHandle`].
 */

mod item;
mod queue;
mod scaling;

pub use item::{Priority, WorkHandle, WorkItem};

use crate::config::WorkerSettings;
use crate::error::WorkError;
use crate::monitor::{refresh_host, HostSampler};
use item::Outcome;
use parking_lot::Mutex;
use queue::{JobQueue, PushRejected, QueuedJob};
use scaling::{ScaleDecision, ScaleInput, ScalingPolicy};
use serde::Serialize;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

/// Lifecycle of the pool as seen by workers and running jobs
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum PoolMode {
    Running,
    /// Closed to new work; queued and running items finish
    Draining,
    /// Closed to new work; running payloads are cancelled
    Aborting,
}

/// Counters and gauges of a [`WorkerPool`]
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct WorkerStats {
    pub submitted: u64,
    pub completed: u64,
    pub failed: u64,
    pub panicked: u64,
    pub cancelled: u64,
    /// Submissions turned away (queue full or shutting down)
    pub rejected: u64,
    pub deadline_exceeded: u64,
    /// Workers spawned to replace one whose payload panicked
    pub replaced: u64,
    pub scale_ups: u64,
    pub scale_downs: u64,
    pub queue_size: usize,
    pub queue_capacity: usize,
    pub active_workers: usize,
    pub workers: usize,
    pub min_workers: usize,
    pub max_workers: usize,
}

impl WorkerStats {
    /// Queue fill ratio in `[0, 1]`
    pub fn queue_saturation(&self) -> f64 {
        if self.queue_capacity == 0 {
            0.0
        } else {
            self.queue_size as f64 / self.queue_capacity as f64
        }
    }
}

#[derive(Default)]
struct Counters {
    submitted: AtomicU64,
    completed: AtomicU64,
    failed: AtomicU64,
    panicked: AtomicU64,
    cancelled: AtomicU64,
    rejected: AtomicU64,
    deadline_exceeded: AtomicU64,
    replaced: AtomicU64,
    scale_ups: AtomicU64,
    scale_downs: AtomicU64,
}

impl Counters {
    fn record(&self, outcome: Outcome) {
        let counter = match outcome {
            Outcome::Completed => &self.completed,
            Outcome::Failed => &self.failed,
            Outcome::Panicked => &self.panicked,
            Outcome::DeadlineExceeded => &self.deadline_exceeded,
            Outcome::Cancelled => &self.cancelled,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

struct PoolShared {
    queue: JobQueue,
    policy: ScalingPolicy,
    sampler: Arc<dyn HostSampler>,
    mode_tx: watch::Sender<PoolMode>,
    /// Live worker count; shutdown waits for it to reach zero
    workers_tx: watch::Sender<usize>,
    active: AtomicUsize,
    retire_requests: AtomicUsize,
    retire_notify: Notify,
    next_id: AtomicU64,
    next_worker: AtomicU64,
    last_busy: Mutex<Instant>,
    counters: Counters,
}

impl PoolShared {
    fn mode(&self) -> PoolMode {
        *self.mode_tx.borrow()
    }

    fn workers(&self) -> usize {
        *self.workers_tx.borrow()
    }

    /// Close the queue and move to draining or aborting. Never downgrades an
    /// abort back to a drain.
    fn close(&self, drain: bool) {
        for queued in self.queue.close(drain) {
            queued.job.reject(WorkError::Cancelled { id: queued.id });
            self.counters.cancelled.fetch_add(1, Ordering::Relaxed);
        }

        let target = if drain {
            PoolMode::Draining
        } else {
            PoolMode::Aborting
        };
        self.mode_tx.send_if_modified(|mode| {
            if *mode == target || *mode == PoolMode::Aborting {
                false
            } else {
                *mode = target;
                true
            }
        });
    }

    async fn run(&self, queued: QueuedJob) -> Outcome {
        let QueuedJob {
            id,
            submitted_at,
            deadline,
            job,
            ..
        } = queued;

        if deadline.is_some_and(|deadline| Instant::now() >= deadline) {
            debug!(id, "deadline passed while queued");
            job.reject(WorkError::DeadlineExceeded { id });
            self.counters.record(Outcome::DeadlineExceeded);
            return Outcome::DeadlineExceeded;
        }

        debug!(id, waited_ms = submitted_at.elapsed().as_millis() as u64, "work item started");
        self.active.fetch_add(1, Ordering::SeqCst);
        *self.last_busy.lock() = Instant::now();

        let outcome = job.run(deadline, self.mode_tx.subscribe()).await;

        *self.last_busy.lock() = Instant::now();
        self.active.fetch_sub(1, Ordering::SeqCst);
        self.counters.record(outcome);
        outcome
    }

    /// Claim a pending retire request, keeping at least `min_workers` alive
    fn try_retire(&self) -> bool {
        let claimed = self
            .retire_requests
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1))
            .is_ok();
        if !claimed {
            return false;
        }

        let floor = self.policy.min_workers;
        self.workers_tx.send_if_modified(|workers| {
            if *workers > floor {
                *workers -= 1;
                true
            } else {
                false
            }
        })
    }

    fn idle_for(&self, queued: usize, active: usize) -> Duration {
        if queued > 0 || active > 0 {
            Duration::ZERO
        } else {
            self.last_busy.lock().elapsed()
        }
    }
}

/// Decrements the worker count when a worker task ends, unless the worker
/// already gave its slot up by retiring
struct WorkerSlot {
    shared: Arc<PoolShared>,
    held: bool,
}

impl Drop for WorkerSlot {
    fn drop(&mut self) {
        if self.held {
            self.shared
                .workers_tx
                .send_modify(|workers| *workers = workers.saturating_sub(1));
        }
    }
}

fn spawn_worker(shared: &Arc<PoolShared>) {
    shared.workers_tx.send_modify(|workers| *workers += 1);
    let worker = shared.next_worker.fetch_add(1, Ordering::Relaxed);
    let slot = WorkerSlot {
        shared: Arc::clone(shared),
        held: true,
    };
    tokio::spawn(worker_loop(slot, worker));
}

async fn worker_loop(mut slot: WorkerSlot, worker: u64) {
    let shared = Arc::clone(&slot.shared);
    let mut mode_rx = shared.mode_tx.subscribe();
    debug!(worker, "worker started");

    loop {
        if let Some(queued) = shared.queue.pop() {
            let id = queued.id;
            if shared.run(queued).await == Outcome::Panicked {
                // The task itself survived, but its state is suspect
                if shared.mode() != PoolMode::Aborting {
                    warn!(worker, id, "replacing worker after payload panic");
                    shared.counters.replaced.fetch_add(1, Ordering::Relaxed);
                    spawn_worker(&shared);
                }
                return;
            }
            continue;
        }

        if *mode_rx.borrow_and_update() != PoolMode::Running {
            debug!(worker, "worker stopped");
            return;
        }

        if shared.try_retire() {
            slot.held = false;
            debug!(worker, "worker retired");
            return;
        }

        tokio::select! {
            _ = shared.queue.notified() => {}
            _ = mode_rx.changed() => {}
            _ = shared.retire_notify.notified() => {}
        }
    }
}

fn spawn_scaler(shared: Arc<PoolShared>) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut mode_rx = shared.mode_tx.subscribe();
        let mut ticker = tokio::time::interval(shared.policy.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        // Completes immediately
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = ticker.tick() => rescale(&shared).await,
                changed = mode_rx.changed() => {
                    if changed.is_err() || *mode_rx.borrow_and_update() != PoolMode::Running {
                        break;
                    }
                }
            }
        }
    })
}

async fn rescale(shared: &Arc<PoolShared>) {
    let workers = shared.workers();
    let queued = shared.queue.len();
    let active = shared.active.load(Ordering::SeqCst);
    let input = ScaleInput {
        queued,
        active,
        workers,
        idle_for: shared.idle_for(queued, active),
    };

    if shared.policy.may_grow(&input) {
        refresh_host(&shared.sampler).await;
    }
    match shared.policy.decide(input, || shared.sampler.sample()) {
        ScaleDecision::Grow(count) => {
            for _ in 0..count {
                spawn_worker(shared);
            }
            shared.counters.scale_ups.fetch_add(1, Ordering::Relaxed);
            info!(from = workers, to = workers + count, queued, "scaling worker pool up");
        }
        ScaleDecision::Shrink(count) => {
            // One outstanding request at a time; the previous one may not
            // have reached an idle worker yet
            if shared.retire_requests.load(Ordering::Acquire) == 0 {
                shared.retire_requests.fetch_add(count, Ordering::AcqRel);
                for _ in 0..count {
                    shared.retire_notify.notify_one();
                }
                shared.counters.scale_downs.fetch_add(1, Ordering::Relaxed);
                info!(
                    from = workers,
                    to = workers.saturating_sub(count),
                    "scaling worker pool down"
                );
            }
        }
        ScaleDecision::Hold => {}
    }
}

/// Bounded, prioritized, self-scaling executor
///
/// Must be created inside a tokio runtime. Dropping the pool aborts it like
/// `shutdown(false)` without waiting for the workers.
pub struct WorkerPool {
    shared: Arc<PoolShared>,
    scaler: Mutex<Option<JoinHandle<()>>>,
}

impl WorkerPool {
    pub fn new(settings: &WorkerSettings, sampler: Arc<dyn HostSampler>) -> Self {
        let policy = ScalingPolicy::from_settings(settings);
        let (mode_tx, _) = watch::channel(PoolMode::Running);
        let (workers_tx, _) = watch::channel(0usize);

        let shared = Arc::new(PoolShared {
            queue: JobQueue::new(settings.queue_capacity.max(1)),
            sampler,
            mode_tx,
            workers_tx,
            active: AtomicUsize::new(0),
            retire_requests: AtomicUsize::new(0),
            retire_notify: Notify::new(),
            next_id: AtomicU64::new(0),
            next_worker: AtomicU64::new(0),
            last_busy: Mutex::new(Instant::now()),
            counters: Counters::default(),
            policy,
        });

        for _ in 0..shared.policy.min_workers {
            spawn_worker(&shared);
        }
        let scaler = spawn_scaler(Arc::clone(&shared));

        info!(
            min_workers = shared.policy.min_workers,
            max_workers = shared.policy.max_workers,
            queue_capacity = shared.queue.capacity(),
            "worker pool started"
        );

        Self {
            shared,
            scaler: Mutex::new(Some(scaler)),
        }
    }

    /// Enqueue an item without waiting for room
    pub fn submit<T: Send + 'static>(&self, item: WorkItem<T>) -> Result<WorkHandle<T>, WorkError> {
        let shared = &self.shared;
        let id = shared.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        let priority = item.priority();
        let deadline = item.deadline();
        let (job, handle) = item::bind(id, item);

        let queued = QueuedJob {
            id,
            priority,
            submitted_at: handle.submitted_at(),
            deadline,
            job,
        };

        match shared.queue.push(queued) {
            Ok(()) => {
                shared.counters.submitted.fetch_add(1, Ordering::Relaxed);
                Ok(handle)
            }
            Err(rejected) => {
                shared.counters.rejected.fetch_add(1, Ordering::Relaxed);
                match rejected {
                    PushRejected::Full => {
                        debug!(id, "work queue full");
                        Err(WorkError::QueueFull {
                            capacity: shared.queue.capacity(),
                        })
                    }
                    PushRejected::Closed => Err(WorkError::ShuttingDown),
                }
            }
        }
    }

    /// Submit and wait for the result
    pub async fn execute<T: Send + 'static>(&self, item: WorkItem<T>) -> Result<T, WorkError> {
        self.submit(item)?.await
    }

    /// Stop accepting work and wait for every worker to exit
    ///
    /// With `drain`, queued and running items finish first. Otherwise queued
    /// items and running payloads resolve [`WorkError::Cancelled`].
    pub async fn shutdown(&self, drain: bool) {
        info!(drain, "worker pool shutting down");
        self.shared.close(drain);

        let mut workers = self.shared.workers_tx.subscribe();
        let _ = workers.wait_for(|count| *count == 0).await;

        // Nothing is left to pick these up
        self.shared.close(false);

        let scaler = self.scaler.lock().take();
        if let Some(scaler) = scaler {
            let _ = scaler.await;
        }
        info!("worker pool stopped");
    }

    pub fn is_running(&self) -> bool {
        self.shared.mode() == PoolMode::Running
    }

    pub fn stats(&self) -> WorkerStats {
        let shared = &self.shared;
        let counters = &shared.counters;
        WorkerStats {
            submitted: counters.submitted.load(Ordering::Relaxed),
            completed: counters.completed.load(Ordering::Relaxed),
            failed: counters.failed.load(Ordering::Relaxed),
            panicked: counters.panicked.load(Ordering::Relaxed),
            cancelled: counters.cancelled.load(Ordering::Relaxed),
            rejected: counters.rejected.load(Ordering::Relaxed),
            deadline_exceeded: counters.deadline_exceeded.load(Ordering::Relaxed),
            replaced: counters.replaced.load(Ordering::Relaxed),
            scale_ups: counters.scale_ups.load(Ordering::Relaxed),
            scale_downs: counters.scale_downs.load(Ordering::Relaxed),
            queue_size: shared.queue.len(),
            queue_capacity: shared.queue.capacity(),
            active_workers: shared.active.load(Ordering::SeqCst),
            workers: shared.workers(),
            min_workers: shared.policy.min_workers,
            max_workers: shared.policy.max_workers,
        }
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.shared.close(false);
    }
}

impl std::fmt::Debug for WorkerPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerPool")
            .field("mode", &self.shared.mode())
            .field("workers", &self.shared.workers())
            .field("queued", &self.shared.queue.len())
            .finish()
    }
}
