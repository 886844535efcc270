//! Units of work and the handles their results come back through

use super::PoolMode;
use crate::error::WorkError;
use futures::future::{BoxFuture, FutureExt};
use std::any::Any;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::sync::{oneshot, watch};
use tokio::time::Instant;
use tracing::debug;

/// Scheduling priority; higher runs first, FIFO within a priority
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub enum Priority {
    Low,
    #[default]
    Normal,
    High,
}

type Payload<T> = Box<dyn FnOnce() -> BoxFuture<'static, anyhow::Result<T>> + Send>;

/// A unit of work for the [`WorkerPool`](super::WorkerPool)
///
/// The id and submission time are assigned by the pool on submit.
pub struct WorkItem<T> {
    pub(crate) label: Option<String>,
    pub(crate) priority: Priority,
    pub(crate) deadline: Option<Instant>,
    pub(crate) payload: Payload<T>,
}

impl<T: Send + 'static> WorkItem<T> {
    /// Async payload
    pub fn new<F, Fut>(payload: F) -> Self
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<T>> + Send + 'static,
    {
        Self {
            label: None,
            priority: Priority::Normal,
            deadline: None,
            payload: Box::new(move || payload().boxed()),
        }
    }

    /// CPU-bound or otherwise blocking payload, run on the blocking thread pool.
    ///
    /// A deadline or abort stops waiting for the result but cannot interrupt
    /// the thread; its output is discarded.
    pub fn blocking<F>(payload: F) -> Self
    where
        F: FnOnce() -> anyhow::Result<T> + Send + 'static,
    {
        Self::new(move || async move {
            match tokio::task::spawn_blocking(payload).await {
                Ok(result) => result,
                Err(e) if e.is_panic() => std::panic::resume_unwind(e.into_panic()),
                Err(e) => Err(anyhow::anyhow!("blocking task did not finish: {e}")),
            }
        })
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    /// Absolute deadline; if it passes before the item starts, the item never runs
    pub fn with_deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(deadline);
        self
    }

    /// Deadline relative to now
    pub fn with_timeout(self, timeout: Duration) -> Self {
        self.with_deadline(Instant::now() + timeout)
    }

    /// Name used in logs
    pub fn labeled(mut self, label: impl Into<String>) -> Self {
        self.label = Some(label.into());
        self
    }

    pub fn priority(&self) -> Priority {
        self.priority
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }
}

impl<T> std::fmt::Debug for WorkItem<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkItem")
            .field("label", &self.label)
            .field("priority", &self.priority)
            .field("deadline", &self.deadline)
            .finish_non_exhaustive()
    }
}

/// Future resolving to the item's result, exactly once
///
/// Dropping the handle does not cancel the item.
#[derive(Debug)]
pub struct WorkHandle<T> {
    id: u64,
    submitted_at: Instant,
    receiver: oneshot::Receiver<Result<T, WorkError>>,
}

impl<T> WorkHandle<T> {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn submitted_at(&self) -> Instant {
        self.submitted_at
    }
}

impl<T> Future for WorkHandle<T> {
    type Output = Result<T, WorkError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let id = self.id;
        match Pin::new(&mut self.receiver).poll(cx) {
            Poll::Ready(Ok(result)) => Poll::Ready(result),
            // The job was dropped without reporting (pool torn down)
            Poll::Ready(Err(_)) => Poll::Ready(Err(WorkError::Cancelled { id })),
            Poll::Pending => Poll::Pending,
        }
    }
}

/// How a job ended, for the pool's counters
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Outcome {
    Completed,
    Failed,
    Panicked,
    DeadlineExceeded,
    Cancelled,
}

/// Type-erased job as stored in the queue
pub(crate) trait Runnable: Send {
    fn run(
        self: Box<Self>,
        deadline: Option<Instant>,
        mode: watch::Receiver<PoolMode>,
    ) -> BoxFuture<'static, Outcome>;

    /// Resolve the handle without running the payload
    fn reject(self: Box<Self>, error: WorkError);
}

pub(crate) struct TypedJob<T> {
    id: u64,
    label: Option<String>,
    payload: Payload<T>,
    reply: oneshot::Sender<Result<T, WorkError>>,
}

/// Split an item into the queued job and the caller's handle
pub(crate) fn bind<T: Send + 'static>(
    id: u64,
    item: WorkItem<T>,
) -> (Box<dyn Runnable>, WorkHandle<T>) {
    let (reply, receiver) = oneshot::channel();
    let job = TypedJob {
        id,
        label: item.label,
        payload: item.payload,
        reply,
    };
    let handle = WorkHandle {
        id,
        submitted_at: Instant::now(),
        receiver,
    };
    (Box::new(job), handle)
}

impl<T: Send + 'static> Runnable for TypedJob<T> {
    fn run(
        self: Box<Self>,
        deadline: Option<Instant>,
        mut mode: watch::Receiver<PoolMode>,
    ) -> BoxFuture<'static, Outcome> {
        let TypedJob {
            id,
            label,
            payload,
            reply,
        } = *self;

        async move {
            let guarded = AssertUnwindSafe(async move { payload().await }).catch_unwind();
            let aborted = async move {
                if mode.wait_for(|m| *m == PoolMode::Aborting).await.is_err() {
                    std::future::pending::<()>().await;
                }
            };

            let result = tokio::select! {
                finished = run_until(guarded, deadline) => match finished {
                    None => Err(WorkError::DeadlineExceeded { id }),
                    Some(Ok(Ok(value))) => Ok(value),
                    Some(Ok(Err(source))) => Err(WorkError::Failed { id, source }),
                    Some(Err(panic)) => Err(WorkError::Panicked {
                        id,
                        message: panic_message(panic.as_ref()),
                    }),
                },
                _ = aborted => Err(WorkError::Cancelled { id }),
            };

            let outcome = match &result {
                Ok(_) => Outcome::Completed,
                Err(WorkError::DeadlineExceeded { .. }) => Outcome::DeadlineExceeded,
                Err(WorkError::Panicked { .. }) => Outcome::Panicked,
                Err(WorkError::Cancelled { .. }) => Outcome::Cancelled,
                Err(_) => Outcome::Failed,
            };
            debug!(id, label = label.as_deref().unwrap_or(""), ?outcome, "work item finished");

            // The caller may have dropped its handle
            let _ = reply.send(result);
            outcome
        }
        .boxed()
    }

    fn reject(self: Box<Self>, error: WorkError) {
        let _ = self.reply.send(Err(error));
    }
}

async fn run_until<F: Future>(future: F, deadline: Option<Instant>) -> Option<F::Output> {
    match deadline {
        Some(deadline) => tokio::time::timeout_at(deadline, future).await.ok(),
        None => Some(future.await),
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
