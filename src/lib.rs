/*!
 * Dispatch Core - resilience and performance layer for a tool-dispatch service
 *
 * Every unit of work a collaborator submits goes through:
 * - a lazy capability registry (expensive dependencies load on first use)
 * - a token-bucket rate limiter
 * - a two-tier result cache with request coalescing
 * - a per-target circuit breaker
 * - an adaptive worker pool with panic isolation and deadlines
 *
 * A performance monitor samples all of them plus the host. The
 * [`Dispatcher`] owns one of each and wires the flow together.
 *
 * # Example
 *
 * ```no_run
 * use dispatch_core::{DispatchConfig, DispatchRequest, Dispatcher, WorkDescriptor, WorkItem};
 * use bytes::Bytes;
 * use serde_json::json;
 *
 * # async fn run() -> dispatch_core::Result<()> {
 * let dispatcher = Dispatcher::new(DispatchConfig::from_env()?)?;
 *
 * let request = DispatchRequest::new(
 *     WorkDescriptor::new("nmap", json!({"target": "10.0.0.1", "ports": "22,80"})),
 *     "10.0.0.1",
 * );
 * let output = dispatcher
 *     .dispatch(request, WorkItem::new(|| async { Ok(Bytes::from("22/tcp open")) }))
 *     .await?;
 * println!("{} bytes", output.len());
 *
 * dispatcher.shutdown(true).await;
 * # Ok(())
 * # }
 * ```
 */

pub mod cache;
pub mod config;
pub mod dispatcher;
pub mod error;
pub mod fingerprint;
pub mod logging;
pub mod monitor;
pub mod registry;
pub mod worker_pool;

pub use cache::{CacheStats, SmartCache};
pub use config::DispatchConfig;
pub use dispatcher::{DispatchRequest, Dispatcher, GuardedPool};
pub use error::{
    CacheError, ConfigError, DispatchError, ErrorCategory, Rejection, RegistryError, Result,
    WorkError,
};
pub use fingerprint::{Fingerprint, WorkDescriptor};
pub use monitor::{HealthReport, HealthStatus, PerformanceMonitor, PerformanceSnapshot};
pub use registry::{LazyRegistry, Loader};
pub use worker_pool::{Priority, WorkHandle, WorkItem, WorkerPool, WorkerStats};

pub use dispatch_core_resilience as resilience;

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version() {
        assert_eq!(VERSION, env!("CARGO_PKG_VERSION"));
    }
}
