//! Error types for the resilience primitives

use std::time::Duration;
use thiserror::Error;

/// Errors that can occur in resilience operations
#[derive(Debug, Error, Clone, PartialEq)]
pub enum ResilienceError {
    /// Circuit breaker for the target is open, rejecting requests
    #[error("Circuit breaker for '{target}' is open, rejecting requests")]
    CircuitOpen { target: String },

    /// No pooled connection became available within the acquire timeout
    #[error("Connection pool is exhausted, no connection available within {0:?}")]
    PoolExhausted(Duration),

    /// Admission denied by the token bucket
    #[error("Rate limit exceeded, retry after cooldown")]
    RateLimitExceeded,

    /// Transient error that may be retried
    #[error("Transient error: {0}")]
    Transient(String),

    /// Permanent error that should not be retried
    #[error("Permanent error: {0}")]
    Permanent(String),

    /// Connection creation failed
    #[error("Failed to create connection: {0}")]
    ConnectionCreation(String),

    /// Operation did not finish in time
    #[error("Operation timeout after {0:?}")]
    Timeout(Duration),
}

impl ResilienceError {
    /// Check if this error is transient and can be retried
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            ResilienceError::Transient(_)
                | ResilienceError::ConnectionCreation(_)
                | ResilienceError::Timeout(_)
                | ResilienceError::PoolExhausted(_)
        )
    }

    /// Check if this error is permanent and should not be retried
    pub fn is_permanent(&self) -> bool {
        matches!(self, ResilienceError::Permanent(_))
    }

    /// Rejections raised by the admission layer itself, before any work ran.
    ///
    /// Callers typically skip (circuit open) or back off (rate limit) on these
    /// rather than retrying immediately.
    pub fn is_rejection(&self) -> bool {
        matches!(
            self,
            ResilienceError::CircuitOpen { .. } | ResilienceError::RateLimitExceeded
        )
    }

    /// Check if this error should contribute to circuit breaker failure count
    pub fn should_trip_breaker(&self) -> bool {
        !matches!(
            self,
            ResilienceError::CircuitOpen { .. }
                | ResilienceError::PoolExhausted(_)
                | ResilienceError::RateLimitExceeded
        )
    }
}
