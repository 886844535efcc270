//! Token bucket rate limiting for admission control
//!
//! Tokens refill continuously at `refill_rate_per_second` up to `capacity`
//! (the burst size). A request costing `n` tokens is admitted iff at least
//! `n` tokens are available; a rejected request leaves the bucket untouched.
//! The limiter never queues or sleeps: callers get an immediate answer and
//! are responsible for surfacing backpressure upward.

use super::error::ResilienceError;
use parking_lot::Mutex;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::time::Instant;
use tracing::trace;

/// Mutable bucket state, always updated as one unit under the bucket lock
#[derive(Debug)]
struct RateBucket {
    tokens: f64,
    last_refill_at: Instant,
}

/// Counters and current fill level of a limiter
#[derive(Debug, Clone, Serialize)]
pub struct LimiterStats {
    pub allowed: u64,
    pub rejected: u64,
    /// Fraction of requests admitted so far (0.0 - 1.0)
    pub current_rate: f64,
    pub tokens: f64,
    pub capacity: f64,
    pub refill_rate_per_second: f64,
}

/// Rate limiter using the token bucket algorithm
///
/// # Example
/// ```
/// use dispatch_core_resilience::RateLimiter;
///
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() {
/// // Burst of 10, refilling 5 tokens per second
/// let limiter = RateLimiter::new(10.0, 5.0);
///
/// assert!(limiter.try_acquire(1.0));
/// # }
/// ```
#[derive(Debug)]
pub struct RateLimiter {
    capacity: f64,
    refill_rate_per_second: f64,
    bucket: Mutex<RateBucket>,
    allowed: AtomicU64,
    rejected: AtomicU64,
}

impl RateLimiter {
    /// Create a full bucket holding `capacity` tokens
    pub fn new(capacity: f64, refill_rate_per_second: f64) -> Self {
        let capacity = capacity.max(0.0);
        Self {
            capacity,
            refill_rate_per_second: refill_rate_per_second.max(0.0),
            bucket: Mutex::new(RateBucket {
                tokens: capacity,
                last_refill_at: Instant::now(),
            }),
            allowed: AtomicU64::new(0),
            rejected: AtomicU64::new(0),
        }
    }

    /// Create a limiter whose burst equals one second of traffic
    pub fn per_second(requests_per_second: f64) -> Self {
        Self::new(requests_per_second, requests_per_second)
    }

    /// Try to take `cost` tokens from the bucket.
    ///
    /// Refill, check and deduction happen atomically; on rejection no tokens
    /// are deducted.
    pub fn try_acquire(&self, cost: f64) -> bool {
        let mut bucket = self.bucket.lock();
        self.refill(&mut bucket);

        if bucket.tokens >= cost {
            bucket.tokens -= cost;
            drop(bucket);
            self.allowed.fetch_add(1, Ordering::Relaxed);
            true
        } else {
            let available = bucket.tokens;
            drop(bucket);
            self.rejected.fetch_add(1, Ordering::Relaxed);
            trace!(cost, available, "rate limit rejected request");
            false
        }
    }

    /// Like [`try_acquire`](Self::try_acquire) but as a `Result`, for use with `?`
    pub fn check(&self, cost: f64) -> Result<(), ResilienceError> {
        if self.try_acquire(cost) {
            Ok(())
        } else {
            Err(ResilienceError::RateLimitExceeded)
        }
    }

    /// Try to execute an operation without waiting
    ///
    /// Returns `RateLimitExceeded` without running `op` if no token is available.
    pub async fn try_execute<F, Fut, T, E>(&self, op: F) -> Result<T, E>
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = Result<T, E>>,
        E: From<ResilienceError>,
    {
        self.check(1.0)?;
        op().await
    }

    fn refill(&self, bucket: &mut RateBucket) {
        let now = Instant::now();
        let elapsed = now.saturating_duration_since(bucket.last_refill_at);
        let added = elapsed.as_secs_f64() * self.refill_rate_per_second;
        bucket.tokens = (bucket.tokens + added).min(self.capacity);
        bucket.last_refill_at = now;
    }

    /// Tokens currently available (after refilling)
    pub fn available(&self) -> f64 {
        let mut bucket = self.bucket.lock();
        self.refill(&mut bucket);
        bucket.tokens
    }

    /// Bucket capacity (burst size)
    pub fn capacity(&self) -> f64 {
        self.capacity
    }

    /// Steady-state refill rate
    pub fn refill_rate_per_second(&self) -> f64 {
        self.refill_rate_per_second
    }

    /// Get limiter statistics
    pub fn stats(&self) -> LimiterStats {
        let tokens = self.available();
        let allowed = self.allowed.load(Ordering::Relaxed);
        let rejected = self.rejected.load(Ordering::Relaxed);
        let total = allowed + rejected;

        LimiterStats {
            allowed,
            rejected,
            current_rate: if total == 0 {
                0.0
            } else {
                allowed as f64 / total as f64
            },
            tokens,
            capacity: self.capacity,
            refill_rate_per_second: self.refill_rate_per_second,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    #[tokio::test(start_paused = true)]
    async fn test_burst_then_refill_scenario() {
        let limiter = RateLimiter::new(10.0, 5.0);

        for _ in 0..10 {
            assert!(limiter.try_acquire(1.0));
        }
        assert!(!limiter.try_acquire(1.0));

        tokio::time::advance(Duration::from_secs(1)).await;

        for _ in 0..5 {
            assert!(limiter.try_acquire(1.0));
        }
        assert!(!limiter.try_acquire(1.0));
    }

    #[tokio::test(start_paused = true)]
    async fn test_rejection_does_not_deduct() {
        let limiter = RateLimiter::new(3.0, 1.0);

        assert!(!limiter.try_acquire(4.0));
        assert!(limiter.try_acquire(3.0));
        assert_eq!(limiter.available(), 0.0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_refill_is_capped_at_capacity() {
        let limiter = RateLimiter::new(5.0, 100.0);
        assert!(limiter.try_acquire(5.0));

        tokio::time::advance(Duration::from_secs(60)).await;

        assert_eq!(limiter.available(), 5.0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_one_second_window_bound() {
        let limiter = RateLimiter::new(20.0, 10.0);
        let mut admitted = 0;

        // 100 attempts spread evenly over one second
        for _ in 0..100 {
            if limiter.try_acquire(1.0) {
                admitted += 1;
            }
            tokio::time::advance(Duration::from_millis(10)).await;
        }

        assert!(admitted <= 30, "admitted {admitted} > capacity + rate");
        assert!(admitted >= 29);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stats() {
        let limiter = RateLimiter::new(2.0, 1.0);
        limiter.try_acquire(1.0);
        limiter.try_acquire(1.0);
        limiter.try_acquire(1.0);
        limiter.try_acquire(1.0);

        let stats = limiter.stats();
        assert_eq!(stats.allowed, 2);
        assert_eq!(stats.rejected, 2);
        assert_eq!(stats.current_rate, 0.5);
        assert_eq!(stats.capacity, 2.0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_try_execute_skips_operation_when_limited() {
        let limiter = RateLimiter::new(1.0, 0.0);

        let first = limiter
            .try_execute(|| async { Ok::<_, ResilienceError>(1) })
            .await;
        assert_eq!(first, Ok(1));

        let second = limiter
            .try_execute(|| async { Ok::<_, ResilienceError>(2) })
            .await;
        assert_eq!(second, Err(ResilienceError::RateLimitExceeded));
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_acquire_never_oversubscribes() {
        let limiter = Arc::new(RateLimiter::new(50.0, 0.0));
        let mut handles = Vec::new();

        for _ in 0..10 {
            let limiter = Arc::clone(&limiter);
            handles.push(tokio::spawn(async move {
                (0..20).filter(|_| limiter.try_acquire(1.0)).count()
            }));
        }

        let mut total = 0;
        for handle in handles {
            total += handle.await.unwrap();
        }
        assert_eq!(total, 50);
        assert!(limiter.available() >= 0.0);
    }

    #[test]
    fn test_per_second_config() {
        let limiter = RateLimiter::per_second(100.0);
        assert_eq!(limiter.capacity(), 100.0);
        assert_eq!(limiter.refill_rate_per_second(), 100.0);
    }
}
