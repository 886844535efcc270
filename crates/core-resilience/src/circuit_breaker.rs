//! Circuit Breaker implementation for fault tolerance
//!
//! The circuit breaker prevents cascading failures by failing fast when a
//! downstream target is experiencing issues. It has three states:
//! - Closed: Normal operation, requests pass through
//! - Open: Target is unhealthy, requests fail immediately
//! - HalfOpen: A bounded number of trial requests test for recovery
//!
//! One breaker exists per target identity; [`BreakerRegistry`] creates them
//! lazily on first use and keeps them for the lifetime of the process.

use super::error::ResilienceError;
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{info, warn};

/// State of the circuit breaker
///
/// Ordered by severity so the worst state across many breakers is `max()`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    /// Circuit is closed, requests pass through normally
    Closed,
    /// Circuit is half-open, trial requests test target recovery
    HalfOpen,
    /// Circuit is open, requests fail immediately
    Open,
}

impl CircuitState {
    /// Stable lowercase label used in snapshots
    pub fn as_str(&self) -> &'static str {
        match self {
            CircuitState::Closed => "closed",
            CircuitState::HalfOpen => "half_open",
            CircuitState::Open => "open",
        }
    }
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Configuration for circuit breaker behavior
#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    /// Number of consecutive failures before opening circuit
    pub failure_threshold: usize,
    /// Time since the last failure before an open circuit admits a trial
    pub recovery_timeout: Duration,
    /// Maximum number of concurrent trial requests while half-open
    pub half_open_max_trials: usize,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            recovery_timeout: Duration::from_secs(60),
            half_open_max_trials: 1,
        }
    }
}

/// Outcome classification used by [`CircuitBreaker::call`].
///
/// Errors produced by the admission layer itself (an open circuit, an
/// exhausted pool) say nothing about the health of the target and must not
/// count as failures.
pub trait TripsBreaker {
    /// Whether this error counts against the target's health
    fn trips_breaker(&self) -> bool;
}

impl TripsBreaker for ResilienceError {
    fn trips_breaker(&self) -> bool {
        self.should_trip_breaker()
    }
}

/// Internal state of the circuit breaker
#[derive(Debug)]
struct CircuitBreakerState {
    state: CircuitState,
    consecutive_failures: usize,
    last_failure_at: Option<Instant>,
    /// Trials admitted while half-open that have not reported yet
    trials_in_flight: usize,
}

impl CircuitBreakerState {
    fn new() -> Self {
        Self {
            state: CircuitState::Closed,
            consecutive_failures: 0,
            last_failure_at: None,
            trials_in_flight: 0,
        }
    }
}

/// Point-in-time copy of a breaker, safe to serialize
#[derive(Debug, Clone, Serialize)]
pub struct BreakerSnapshot {
    pub target: String,
    pub state: CircuitState,
    pub consecutive_failures: usize,
    pub trials_in_flight: usize,
    /// Seconds elapsed since the most recent recorded failure
    pub seconds_since_last_failure: Option<f64>,
    pub total_successes: u64,
    pub total_failures: u64,
    pub total_rejected: u64,
}

/// Circuit breaker for protecting a single downstream target
///
/// # Example
/// ```no_run
/// use dispatch_core_resilience::{CircuitBreaker, CircuitBreakerConfig, ResilienceError};
///
/// #[tokio::main]
/// async fn main() -> Result<(), ResilienceError> {
///     let breaker = CircuitBreaker::new("api.example.com", CircuitBreakerConfig::default());
///
///     let result = breaker
///         .call(|| async { Ok::<_, ResilienceError>(42) })
///         .await?;
///
///     println!("Result: {}", result);
///     Ok(())
/// }
/// ```
#[derive(Debug)]
pub struct CircuitBreaker {
    target: String,
    config: Arc<CircuitBreakerConfig>,
    state: Mutex<CircuitBreakerState>,
    successes: AtomicU64,
    failures: AtomicU64,
    rejected: AtomicU64,
}

impl CircuitBreaker {
    /// Create a new circuit breaker for `target`
    pub fn new(target: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        Self::with_shared_config(target, Arc::new(config))
    }

    fn with_shared_config(target: impl Into<String>, config: Arc<CircuitBreakerConfig>) -> Self {
        Self {
            target: target.into(),
            config,
            state: Mutex::new(CircuitBreakerState::new()),
            successes: AtomicU64::new(0),
            failures: AtomicU64::new(0),
            rejected: AtomicU64::new(0),
        }
    }

    /// Target identity this breaker protects
    pub fn target(&self) -> &str {
        &self.target
    }

    /// Get the current state of the circuit breaker
    pub fn get_state(&self) -> CircuitState {
        self.state.lock().state
    }

    /// Get current consecutive failure count
    pub fn get_failure_count(&self) -> usize {
        self.state.lock().consecutive_failures
    }

    /// Reset the circuit breaker to closed state
    pub fn reset(&self) {
        let mut state = self.state.lock();
        *state = CircuitBreakerState::new();
    }

    /// Ask for permission to run one request against the target.
    ///
    /// An open circuit whose recovery timeout has elapsed moves to half-open
    /// here, and this request becomes its first trial. Every successful
    /// acquire must be followed by exactly one of [`record_success`],
    /// [`record_failure`] or [`release_trial`].
    ///
    /// [`record_success`]: Self::record_success
    /// [`record_failure`]: Self::record_failure
    /// [`release_trial`]: Self::release_trial
    pub fn try_acquire(&self) -> Result<(), ResilienceError> {
        let mut state = self.state.lock();

        match state.state {
            CircuitState::Closed => Ok(()),
            CircuitState::Open => {
                let recovered = state
                    .last_failure_at
                    .map(|at| at.elapsed() >= self.config.recovery_timeout)
                    .unwrap_or(true);

                if recovered {
                    state.state = CircuitState::HalfOpen;
                    state.trials_in_flight = 1;
                    info!(target_id = %self.target, "circuit half-open, admitting trial request");
                    Ok(())
                } else {
                    drop(state);
                    self.reject()
                }
            }
            CircuitState::HalfOpen => {
                if state.trials_in_flight < self.config.half_open_max_trials {
                    state.trials_in_flight += 1;
                    Ok(())
                } else {
                    drop(state);
                    self.reject()
                }
            }
        }
    }

    fn reject(&self) -> Result<(), ResilienceError> {
        self.rejected.fetch_add(1, Ordering::Relaxed);
        Err(ResilienceError::CircuitOpen {
            target: self.target.clone(),
        })
    }

    /// Report a successful request
    pub fn record_success(&self) {
        self.successes.fetch_add(1, Ordering::Relaxed);
        let mut state = self.state.lock();

        match state.state {
            CircuitState::Closed => {
                state.consecutive_failures = 0;
            }
            CircuitState::HalfOpen if state.trials_in_flight > 0 => {
                state.state = CircuitState::Closed;
                state.consecutive_failures = 0;
                state.trials_in_flight = 0;
                info!(target_id = %self.target, "trial succeeded, circuit closed");
            }
            CircuitState::HalfOpen | CircuitState::Open => {
                // Late result of a request that was not a live trial (admitted
                // before the trip, or a cancelled trial). It does not prove
                // recovery.
            }
        }
    }

    /// Report a failed request
    pub fn record_failure(&self) {
        self.failures.fetch_add(1, Ordering::Relaxed);
        let mut state = self.state.lock();
        let now = Instant::now();

        match state.state {
            CircuitState::Closed => {
                state.consecutive_failures += 1;
                state.last_failure_at = Some(now);

                if state.consecutive_failures >= self.config.failure_threshold {
                    state.state = CircuitState::Open;
                    warn!(
                        target_id = %self.target,
                        failures = state.consecutive_failures,
                        "circuit opened after consecutive failures"
                    );
                }
            }
            CircuitState::HalfOpen => {
                state.state = CircuitState::Open;
                state.last_failure_at = Some(now);
                state.trials_in_flight = 0;
                warn!(target_id = %self.target, "trial failed, circuit re-opened");
            }
            CircuitState::Open => {}
        }
    }

    /// Give back a trial slot without a verdict (the request never reached
    /// the target, e.g. it was cancelled or the pool was exhausted).
    pub fn release_trial(&self) {
        let mut state = self.state.lock();
        if state.state == CircuitState::HalfOpen {
            state.trials_in_flight = state.trials_in_flight.saturating_sub(1);
        }
    }

    /// Execute an operation with circuit breaker protection.
    ///
    /// Rejections are returned immediately and never retried here; retry
    /// policy belongs to the caller.
    pub async fn call<F, Fut, T, E>(&self, op: F) -> Result<T, E>
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = Result<T, E>>,
        E: From<ResilienceError> + TripsBreaker,
    {
        self.try_acquire()?;

        match op().await {
            Ok(result) => {
                self.record_success();
                Ok(result)
            }
            Err(e) => {
                if e.trips_breaker() {
                    self.record_failure();
                } else {
                    self.release_trial();
                }
                Err(e)
            }
        }
    }

    /// Copy the breaker's counters
    pub fn snapshot(&self) -> BreakerSnapshot {
        let state = self.state.lock();
        BreakerSnapshot {
            target: self.target.clone(),
            state: state.state,
            consecutive_failures: state.consecutive_failures,
            trials_in_flight: state.trials_in_flight,
            seconds_since_last_failure: state.last_failure_at.map(|at| at.elapsed().as_secs_f64()),
            total_successes: self.successes.load(Ordering::Relaxed),
            total_failures: self.failures.load(Ordering::Relaxed),
            total_rejected: self.rejected.load(Ordering::Relaxed),
        }
    }
}

/// Lazily-populated set of breakers, one per target identity
#[derive(Debug, Clone)]
pub struct BreakerRegistry {
    config: Arc<CircuitBreakerConfig>,
    breakers: Arc<DashMap<String, Arc<CircuitBreaker>>>,
}

impl BreakerRegistry {
    /// Create an empty registry; every breaker shares `config`
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            config: Arc::new(config),
            breakers: Arc::new(DashMap::new()),
        }
    }

    /// Get the breaker for `target`, creating it on first use
    pub fn breaker(&self, target: &str) -> Arc<CircuitBreaker> {
        if let Some(existing) = self.breakers.get(target) {
            return Arc::clone(existing.value());
        }

        let entry = self.breakers.entry(target.to_string()).or_insert_with(|| {
            Arc::new(CircuitBreaker::with_shared_config(
                target,
                Arc::clone(&self.config),
            ))
        });
        Arc::clone(entry.value())
    }

    /// Look up an existing breaker without creating one
    pub fn get(&self, target: &str) -> Option<Arc<CircuitBreaker>> {
        self.breakers.get(target).map(|b| Arc::clone(b.value()))
    }

    /// Snapshots of every known breaker, sorted by target
    pub fn snapshots(&self) -> Vec<BreakerSnapshot> {
        let breakers: Vec<Arc<CircuitBreaker>> =
            self.breakers.iter().map(|b| Arc::clone(b.value())).collect();

        let mut snapshots: Vec<BreakerSnapshot> = breakers.iter().map(|b| b.snapshot()).collect();
        snapshots.sort_by(|a, b| a.target.cmp(&b.target));
        snapshots
    }

    /// Most severe state across all targets (`Closed` when there are none)
    pub fn worst_state(&self) -> CircuitState {
        self.snapshots()
            .iter()
            .map(|s| s.state)
            .max()
            .unwrap_or(CircuitState::Closed)
    }

    /// Whether any target is currently open
    pub fn any_open(&self) -> bool {
        self.worst_state() == CircuitState::Open
    }

    /// Number of tracked targets
    pub fn len(&self) -> usize {
        self.breakers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.breakers.is_empty()
    }
}
