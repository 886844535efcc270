/*!
 * Error types for the dispatch core
 */

use dispatch_core_resilience::ResilienceError;
use std::io;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, DispatchError>;

/// Errors raised by [`SmartCache`](crate::cache::SmartCache)
#[derive(Debug, Error)]
pub enum CacheError {
    /// The caller's own compute function failed; nothing was cached
    #[error("compute failed: {0}")]
    Compute(#[source] anyhow::Error),

    /// Another caller's fill for this key failed while we were waiting on it.
    /// `rejection` is set when that fill was refused admission.
    #[error("in-flight fill for '{key}' failed: {reason}")]
    FillFailed {
        key: String,
        reason: String,
        rejection: Option<Rejection>,
    },

    /// Gave up waiting for another caller's fill
    #[error("timed out after {0:?} waiting for in-flight fill")]
    FillTimeout(Duration),

    /// A fill is running and the cache is configured not to wait for it
    #[error("computation for '{0}' already in progress")]
    ComputeInProgress(String),

    /// Disk tier I/O failure
    #[error("cache I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// A disk record could not be encoded or decoded
    #[error("cache record codec error: {0}")]
    Codec(String),
}

impl CacheError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: io::Error) -> Self {
        CacheError::Io {
            path: path.into(),
            source,
        }
    }
}

/// Per-item outcome of [`WorkerPool`](crate::worker_pool::WorkerPool) execution
#[derive(Debug, Error)]
pub enum WorkError {
    /// The submission queue is at capacity
    #[error("worker queue is full ({capacity} items)")]
    QueueFull { capacity: usize },

    /// The pool no longer accepts work
    #[error("worker pool is shutting down")]
    ShuttingDown,

    /// The item's deadline passed before or while it ran
    #[error("work item {id} exceeded its deadline")]
    DeadlineExceeded { id: u64 },

    /// The item was cancelled by a non-draining shutdown
    #[error("work item {id} was cancelled")]
    Cancelled { id: u64 },

    /// The payload returned an error
    #[error("work item {id} failed: {source}")]
    Failed {
        id: u64,
        #[source]
        source: anyhow::Error,
    },

    /// The payload panicked; the worker that ran it was replaced
    #[error("work item {id} panicked: {message}")]
    Panicked { id: u64, message: String },
}

impl WorkError {
    /// Whether the item never ran to completion because of the pool itself
    pub fn is_rejection(&self) -> bool {
        matches!(self, WorkError::QueueFull { .. } | WorkError::ShuttingDown)
    }
}

/// Errors raised by [`LazyRegistry`](crate::registry::LazyRegistry)
#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("no loader registered for '{0}'")]
    NotRegistered(String),

    /// The loader failed; the failure is not cached and the next access retries
    #[error("loader for '{name}' failed: {reason}")]
    LoaderFailure { name: String, reason: String },

    #[error("capability '{name}' is not of type {expected}")]
    TypeMismatch { name: String, expected: &'static str },
}

/// Configuration loading and validation errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid value for {var}: '{value}'")]
    Env { var: String, value: String },

    #[error("invalid configuration: {0}")]
    Invalid(String),

    #[error("failed to initialise logging: {0}")]
    Logging(String),
}

/// Admission refusal, kept in a cloneable form so that callers coalesced
/// on a refused fill see the same refusal as the filler
#[derive(Debug, Clone, PartialEq)]
pub enum Rejection {
    Resilience(ResilienceError),
    QueueFull { capacity: usize },
    ShuttingDown,
}

impl From<Rejection> for DispatchError {
    fn from(rejection: Rejection) -> Self {
        match rejection {
            Rejection::Resilience(e) => DispatchError::Resilience(e),
            Rejection::QueueFull { capacity } => WorkError::QueueFull { capacity }.into(),
            Rejection::ShuttingDown => WorkError::ShuttingDown.into(),
        }
    }
}

/// Top-level error returned by the [`Dispatcher`](crate::dispatcher::Dispatcher)
#[derive(Debug, Error)]
pub enum DispatchError {
    #[error(transparent)]
    Resilience(#[from] ResilienceError),

    #[error(transparent)]
    Cache(#[from] CacheError),

    #[error(transparent)]
    Work(#[from] WorkError),

    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    /// Failure reported by a collaborator-supplied operation
    #[error("operation failed: {0}")]
    Operation(#[from] anyhow::Error),
}

/// Coarse error classes for logging and stats
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    Admission,
    Resource,
    Timeout,
    Execution,
    Cache,
    Loader,
    Configuration,
}

impl DispatchError {
    /// Rejections raised before any work ran (open circuit, rate limit,
    /// full queue). Callers back off or skip instead of retrying at once.
    pub fn is_fast_fail(&self) -> bool {
        match self {
            DispatchError::Cache(CacheError::ComputeInProgress(_)) => true,
            _ => self.rejection().is_some(),
        }
    }

    /// The admission refusal behind this error, if there was one
    pub fn rejection(&self) -> Option<Rejection> {
        match self {
            DispatchError::Resilience(e) if e.is_rejection() => {
                Some(Rejection::Resilience(e.clone()))
            }
            DispatchError::Work(WorkError::QueueFull { capacity }) => Some(Rejection::QueueFull {
                capacity: *capacity,
            }),
            DispatchError::Work(WorkError::ShuttingDown) => Some(Rejection::ShuttingDown),
            DispatchError::Cache(CacheError::FillFailed { rejection, .. }) => rejection.clone(),
            _ => None,
        }
    }

    /// Whether the circuit breaker for the target rejected the call
    pub fn is_circuit_open(&self) -> bool {
        matches!(
            self,
            DispatchError::Resilience(ResilienceError::CircuitOpen { .. })
        )
    }

    /// Whether this outcome says something about the target's health
    pub fn trips_breaker(&self) -> bool {
        match self {
            DispatchError::Resilience(e) => e.should_trip_breaker(),
            DispatchError::Work(WorkError::Failed { .. })
            | DispatchError::Work(WorkError::Panicked { .. })
            | DispatchError::Work(WorkError::DeadlineExceeded { .. })
            | DispatchError::Operation(_) => true,
            DispatchError::Cache(CacheError::Compute(_)) => true,
            _ => false,
        }
    }

    /// Get error category for logging and instrumentation
    pub fn category(&self) -> ErrorCategory {
        match self {
            DispatchError::Resilience(ResilienceError::Timeout(_)) => ErrorCategory::Timeout,
            DispatchError::Resilience(ResilienceError::PoolExhausted(_)) => ErrorCategory::Resource,
            DispatchError::Resilience(e) if e.is_rejection() => ErrorCategory::Admission,
            DispatchError::Resilience(_) => ErrorCategory::Execution,
            DispatchError::Work(WorkError::DeadlineExceeded { .. }) => ErrorCategory::Timeout,
            DispatchError::Work(e) if e.is_rejection() => ErrorCategory::Admission,
            DispatchError::Work(_) | DispatchError::Operation(_) => ErrorCategory::Execution,
            DispatchError::Cache(CacheError::FillTimeout(_)) => ErrorCategory::Timeout,
            DispatchError::Cache(CacheError::FillFailed {
                rejection: Some(_), ..
            }) => ErrorCategory::Admission,
            DispatchError::Cache(_) => ErrorCategory::Cache,
            DispatchError::Registry(_) => ErrorCategory::Loader,
            DispatchError::Config(_) => ErrorCategory::Configuration,
        }
    }
}

impl dispatch_core_resilience::TripsBreaker for DispatchError {
    fn trips_breaker(&self) -> bool {
        DispatchError::trips_breaker(self)
    }
}
