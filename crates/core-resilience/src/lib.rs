//! Dispatch Core Resilience: Pure-logic fault tolerance primitives
//!
//! # Overview
//!
//! This crate provides the admission and fault-isolation building blocks the
//! dispatch core puts in front of every external tool invocation:
//!
//! - **Circuit Breaker**: Fails fast for a target after repeated failures, probing again after a recovery window
//! - **Rate Limiter**: Token bucket admission control with an immediate allow/deny answer
//! - **Connection Pool**: Bounded connection reuse with keepalive limits, health checks and retried execution
//!
//! # Key Principles
//!
//! This crate is **pure logic** with zero knowledge of:
//! - Which tools are being dispatched
//! - Caching, scheduling or monitoring
//! - Network protocols
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────┐
//! │         Dispatcher                      │
//! └─────────────┬───────────────────────────┘
//!               │
//!               ▼
//! ┌─────────────────────────────────────────┐
//! │       Rate Limiter                      │  ← Admission
//! │  (Token bucket, never queues)           │
//! └─────────────┬───────────────────────────┘
//!               │
//!               ▼
//! ┌─────────────────────────────────────────┐
//! │       Circuit Breaker (per target)      │  ← Fail-fast protection
//! │  (Closed → Open → HalfOpen)             │
//! └─────────────┬───────────────────────────┘
//!               │
//!               ▼
//! ┌─────────────────────────────────────────┐
//! │       Connection Pool                   │  ← Resource reuse
//! │  (Bounded, retry with backoff)          │
//! └─────────────┬───────────────────────────┘
//!               │
//!               ▼
//!         External Tool / Service
//! ```
//!
//! # Usage Example
//!
//! ```no_run
//! use dispatch_core_resilience::{BreakerRegistry, CircuitBreakerConfig, RateLimiter, ResilienceError};
//!
//! # async fn example() -> Result<(), ResilienceError> {
//! let limiter = RateLimiter::new(200.0, 100.0);
//! let breakers = BreakerRegistry::new(CircuitBreakerConfig::default());
//!
//! limiter.check(1.0)?;
//! let output = breakers
//!     .breaker("nmap")
//!     .call(|| async { Ok::<_, ResilienceError>("scan complete") })
//!     .await?;
//! # let _ = output;
//! # Ok(())
//! # }
//! ```

pub mod circuit_breaker;
pub mod connection_pool;
pub mod error;
pub mod rate_limiter;

// Re-export main types for convenience
pub use circuit_breaker::{
    BreakerRegistry, BreakerSnapshot, CircuitBreaker, CircuitBreakerConfig, CircuitState,
    TripsBreaker,
};
pub use connection_pool::{ConnectionFactory, ConnectionPool, PoolConfig, PoolHandle, PoolStats};
pub use error::ResilienceError;
pub use rate_limiter::{LimiterStats, RateLimiter};

/// Prelude module for convenient imports
///
/// # Example
/// ```
/// use dispatch_core_resilience::prelude::*;
/// ```
pub mod prelude {
    pub use super::circuit_breaker::{BreakerRegistry, CircuitBreaker, CircuitBreakerConfig, CircuitState};
    pub use super::connection_pool::{ConnectionFactory, ConnectionPool, PoolConfig};
    pub use super::error::ResilienceError;
    pub use super::rate_limiter::RateLimiter;
}
