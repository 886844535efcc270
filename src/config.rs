/*!
 * Configuration types for the dispatch core
 */

use crate::error::ConfigError;
use dispatch_core_resilience::{CircuitBreakerConfig, PoolConfig};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

/// Top-level configuration, one section per component
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatchConfig {
    pub pool: PoolSettings,
    pub rate_limit: RateLimitSettings,
    pub circuit_breaker: BreakerSettings,
    pub workers: WorkerSettings,
    pub cache: CacheSettings,
    pub monitor: MonitorSettings,
    pub logging: LoggingConfig,
}

/// Connection pool settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolSettings {
    pub max_connections: usize,
    pub max_keepalive: usize,
    pub request_timeout_secs: f64,
    pub acquire_timeout_secs: f64,
    pub retry_count: usize,
    /// Base delay in seconds; retry `n` waits `backoff_factor * 2^n`
    pub backoff_factor: f64,
    pub max_backoff_secs: f64,
    pub idle_timeout_secs: Option<u64>,
    pub max_lifetime_secs: Option<u64>,
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self {
            max_connections: 100,
            max_keepalive: 50,
            request_timeout_secs: 30.0,
            acquire_timeout_secs: 30.0,
            retry_count: 3,
            backoff_factor: 0.5,
            max_backoff_secs: 30.0,
            idle_timeout_secs: Some(300),
            max_lifetime_secs: Some(1800),
        }
    }
}

impl PoolSettings {
    pub fn to_pool_config(&self) -> PoolConfig {
        PoolConfig {
            max_connections: self.max_connections,
            max_keepalive: self.max_keepalive,
            idle_timeout: self.idle_timeout_secs.map(Duration::from_secs),
            max_lifetime: self.max_lifetime_secs.map(Duration::from_secs),
            acquire_timeout: secs(self.acquire_timeout_secs),
            request_timeout: secs(self.request_timeout_secs),
            retry_count: self.retry_count,
            backoff_factor: secs(self.backoff_factor),
            max_backoff: secs(self.max_backoff_secs),
        }
    }
}

/// Token bucket settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitSettings {
    pub requests_per_second: f64,
    pub burst_size: f64,
}

impl Default for RateLimitSettings {
    fn default() -> Self {
        Self {
            requests_per_second: 100.0,
            burst_size: 200.0,
        }
    }
}

/// Circuit breaker settings, shared by every target
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BreakerSettings {
    pub failure_threshold: usize,
    pub recovery_timeout_secs: f64,
    pub half_open_max_trials: usize,
}

impl Default for BreakerSettings {
    fn default() -> Self {
        let defaults = CircuitBreakerConfig::default();
        Self {
            failure_threshold: defaults.failure_threshold,
            recovery_timeout_secs: defaults.recovery_timeout.as_secs_f64(),
            half_open_max_trials: defaults.half_open_max_trials,
        }
    }
}

impl BreakerSettings {
    pub fn to_breaker_config(&self) -> CircuitBreakerConfig {
        CircuitBreakerConfig {
            failure_threshold: self.failure_threshold,
            recovery_timeout: secs(self.recovery_timeout_secs),
            half_open_max_trials: self.half_open_max_trials,
        }
    }
}

/// Adaptive worker pool settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerSettings {
    pub min_workers: usize,
    pub max_workers: usize,
    /// Maximum number of queued (not yet running) items
    pub queue_capacity: usize,
    pub scale_interval_secs: f64,
    pub scale_step: usize,
    /// Queue depth that triggers a scale-up; `None` means twice the worker count
    pub high_water_mark: Option<usize>,
    /// How long the pool must sit idle before shedding a worker
    pub idle_grace_secs: f64,
    /// Host CPU percentage above which the pool will not grow
    pub cpu_ceiling: f32,
    /// Host memory percentage above which the pool will not grow
    pub memory_ceiling: f32,
}

impl Default for WorkerSettings {
    fn default() -> Self {
        Self {
            min_workers: 2,
            max_workers: default_max_workers(),
            queue_capacity: 1000,
            scale_interval_secs: 5.0,
            scale_step: 2,
            high_water_mark: None,
            idle_grace_secs: 30.0,
            cpu_ceiling: 80.0,
            memory_ceiling: 85.0,
        }
    }
}

/// Result cache settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheSettings {
    /// Memory tier budget in bytes
    pub memory_budget: usize,
    /// Disk tier budget in bytes; 0 disables the disk tier
    pub disk_budget: u64,
    /// Directory for the disk tier
    pub cache_dir: PathBuf,
    pub shards: usize,
    /// Default time-to-live in seconds; `None` never expires
    pub default_ttl_secs: Option<u64>,
    /// Per-tool TTL overrides in seconds
    pub tool_ttl: HashMap<String, u64>,
    pub coalesce: CoalescePolicy,
    /// Upper bound on waiting for another caller's fill
    pub fill_wait_timeout_secs: Option<f64>,
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            memory_budget: 256 * 1024 * 1024, // 256 MB
            disk_budget: 1024 * 1024 * 1024,  // 1 GB
            cache_dir: std::env::temp_dir().join("dispatch-cache"),
            shards: 16,
            default_ttl_secs: Some(3600),
            tool_ttl: default_tool_ttl(),
            coalesce: CoalescePolicy::Block,
            fill_wait_timeout_secs: None,
        }
    }
}

/// What late arrivals do while a fill for their key is running
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum CoalescePolicy {
    /// Wait for the in-flight fill
    #[default]
    Block,
    /// Fail with `ComputeInProgress`
    FailFast,
}

/// Performance monitor settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitorSettings {
    pub interval_secs: f64,
    /// Log every periodic snapshot at info level
    pub log_performance: bool,
    pub cpu_threshold: f32,
    pub memory_threshold: f32,
    pub disk_threshold: f32,
    /// Queue fill ratio (0.0 - 1.0) counted as saturated
    pub saturation_ratio: f64,
    /// Consecutive saturated samples before reporting degraded
    pub saturation_samples: u32,
}

impl Default for MonitorSettings {
    fn default() -> Self {
        Self {
            interval_secs: 30.0,
            log_performance: false,
            cpu_threshold: 90.0,
            memory_threshold: 90.0,
            disk_threshold: 95.0,
            saturation_ratio: 0.9,
            saturation_samples: 3,
        }
    }
}

/// Logging output settings
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: LogLevel,
    /// Log file path (None = stdout)
    pub file: Option<PathBuf>,
    pub format: LogFormat,
}

/// Log level for diagnostic output
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    /// Only errors
    Error,

    /// Warnings and errors
    Warn,

    /// Info, warnings, and errors
    #[default]
    Info,

    /// Debug and above
    Debug,

    /// All messages including traces
    Trace,
}

impl LogLevel {
    /// Convert to tracing::Level
    pub fn to_tracing_level(&self) -> tracing::Level {
        match self {
            LogLevel::Error => tracing::Level::ERROR,
            LogLevel::Warn => tracing::Level::WARN,
            LogLevel::Info => tracing::Level::INFO,
            LogLevel::Debug => tracing::Level::DEBUG,
            LogLevel::Trace => tracing::Level::TRACE,
        }
    }
}

impl FromStr for LogLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "error" => Ok(LogLevel::Error),
            "warn" | "warning" => Ok(LogLevel::Warn),
            "info" => Ok(LogLevel::Info),
            "debug" => Ok(LogLevel::Debug),
            "trace" => Ok(LogLevel::Trace),
            other => Err(format!("unknown log level '{other}'")),
        }
    }
}

/// Log line format
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Compact,
    Json,
}

impl FromStr for LogFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "compact" | "text" => Ok(LogFormat::Compact),
            "json" => Ok(LogFormat::Json),
            other => Err(format!("unknown log format '{other}'")),
        }
    }
}

// Default value functions for serde
fn default_max_workers() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get() * 2)
        .unwrap_or(4)
        .max(2)
}

fn default_tool_ttl() -> HashMap<String, u64> {
    // Fast-changing results expire sooner than stable reconnaissance data
    [
        ("nmap", 1800),
        ("gobuster", 3600),
        ("nuclei", 7200),
        ("sqlmap", 1800),
        ("subfinder", 14400),
        ("amass", 14400),
        ("whatweb", 21600),
        ("wafw00f", 21600),
    ]
    .into_iter()
    .map(|(tool, ttl)| (tool.to_string(), ttl))
    .collect()
}

/// Longest duration any float-seconds setting may hold (30 days)
const MAX_DURATION_SECS: f64 = 30.0 * 24.0 * 3600.0;

/// Float seconds to a `Duration`; values `validate` would reject become zero
pub(crate) fn secs(value: f64) -> Duration {
    if value > MAX_DURATION_SECS {
        return Duration::ZERO;
    }
    Duration::try_from_secs_f64(value).unwrap_or(Duration::ZERO)
}

/// Check a float-seconds setting: finite, non-negative, within `MAX_DURATION_SECS`
/// and, when `positive`, strictly above zero
fn check_secs(field: &str, value: f64, positive: bool) -> Result<(), ConfigError> {
    let in_range = value.is_finite()
        && value >= 0.0
        && value <= MAX_DURATION_SECS
        && (!positive || value > 0.0);
    if in_range {
        Ok(())
    } else {
        let bound = if positive { "positive" } else { "non-negative" };
        Err(ConfigError::Invalid(format!(
            "{field} must be a finite, {bound} number of seconds no larger than {MAX_DURATION_SECS}, got {value}"
        )))
    }
}

fn check_percent(field: &str, value: f32) -> Result<(), ConfigError> {
    if value.is_finite() && (0.0..=100.0).contains(&value) {
        Ok(())
    } else {
        Err(ConfigError::Invalid(format!(
            "{field} must be a percentage between 0 and 100, got {value}"
        )))
    }
}

impl DispatchConfig {
    /// Load configuration from a TOML file
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&contents)
    }

    /// Parse configuration from TOML text; missing fields take their defaults
    pub fn from_toml_str(contents: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(contents)?)
    }

    /// Defaults overlaid with the process environment, validated
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();
        config.apply_env()?;
        config.validate()?;
        Ok(config)
    }

    /// Overlay settings from the process environment
    pub fn apply_env(&mut self) -> Result<(), ConfigError> {
        self.apply_vars(|name| std::env::var(name).ok())
    }

    /// Overlay settings from an arbitrary variable source
    pub fn apply_vars<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let env = EnvSource { lookup };

        env.set("MAX_CONNECTIONS", &mut self.pool.max_connections)?;
        env.set("MAX_KEEPALIVE", &mut self.pool.max_keepalive)?;
        env.set("REQUEST_TIMEOUT", &mut self.pool.request_timeout_secs)?;
        env.set("RETRY_COUNT", &mut self.pool.retry_count)?;
        env.set("BACKOFF_FACTOR", &mut self.pool.backoff_factor)?;

        env.set("RATE_LIMIT_RPS", &mut self.rate_limit.requests_per_second)?;
        env.set("RATE_LIMIT_BURST", &mut self.rate_limit.burst_size)?;

        env.set("CB_FAILURE_THRESHOLD", &mut self.circuit_breaker.failure_threshold)?;
        env.set("CB_RECOVERY_TIMEOUT", &mut self.circuit_breaker.recovery_timeout_secs)?;

        env.set("MIN_WORKERS", &mut self.workers.min_workers)?;
        env.set("GUNICORN_WORKERS", &mut self.workers.max_workers)?;
        env.set("MAX_WORKERS", &mut self.workers.max_workers)?;
        env.set("WORKER_CONNECTIONS", &mut self.workers.queue_capacity)?;

        env.set("CACHE_MEMORY_BUDGET", &mut self.cache.memory_budget)?;
        env.set("CACHE_DISK_BUDGET", &mut self.cache.disk_budget)?;
        if let Some(ttl) = env.parse::<u64>("CACHE_TTL")? {
            self.cache.default_ttl_secs = (ttl > 0).then_some(ttl);
        }
        if let Some(dir) = env.raw("CACHE_DIR") {
            self.cache.cache_dir = PathBuf::from(dir);
        }

        env.set("MONITORING_INTERVAL", &mut self.monitor.interval_secs)?;
        if let Some(flag) = env.raw("LOG_PERFORMANCE") {
            self.monitor.log_performance = parse_flag(&flag);
        }

        env.set("LOG_LEVEL", &mut self.logging.level)?;
        env.set("LOG_FORMAT", &mut self.logging.format)?;
        if let Some(file) = env.raw("LOG_FILE") {
            self.logging.file = (!file.is_empty()).then(|| PathBuf::from(file));
        }

        Ok(())
    }

    /// Reject settings that would make the core unusable from the start
    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |msg: &str| Err(ConfigError::Invalid(msg.to_string()));

        if self.pool.max_connections == 0 {
            return invalid("pool.max_connections must be at least 1");
        }
        if self.pool.max_keepalive > self.pool.max_connections {
            return invalid("pool.max_keepalive cannot exceed pool.max_connections");
        }
        check_secs("pool.request_timeout_secs", self.pool.request_timeout_secs, true)?;
        check_secs("pool.acquire_timeout_secs", self.pool.acquire_timeout_secs, false)?;
        check_secs("pool.backoff_factor", self.pool.backoff_factor, false)?;
        check_secs("pool.max_backoff_secs", self.pool.max_backoff_secs, false)?;
        if !(self.rate_limit.requests_per_second.is_finite()
            && self.rate_limit.requests_per_second > 0.0)
        {
            return invalid("rate_limit.requests_per_second must be positive and finite");
        }
        if !(self.rate_limit.burst_size.is_finite() && self.rate_limit.burst_size >= 1.0) {
            return invalid("rate_limit.burst_size must be at least 1 and finite");
        }
        if self.circuit_breaker.failure_threshold == 0 {
            return invalid("circuit_breaker.failure_threshold must be at least 1");
        }
        if self.circuit_breaker.half_open_max_trials == 0 {
            return invalid("circuit_breaker.half_open_max_trials must be at least 1");
        }
        check_secs(
            "circuit_breaker.recovery_timeout_secs",
            self.circuit_breaker.recovery_timeout_secs,
            false,
        )?;
        if self.workers.min_workers == 0 {
            return invalid("workers.min_workers must be at least 1");
        }
        if self.workers.min_workers > self.workers.max_workers {
            return invalid("workers.min_workers cannot exceed workers.max_workers");
        }
        if self.workers.queue_capacity == 0 {
            return invalid("workers.queue_capacity must be at least 1");
        }
        if self.workers.scale_step == 0 {
            return invalid("workers.scale_step must be at least 1");
        }
        check_secs("workers.scale_interval_secs", self.workers.scale_interval_secs, true)?;
        check_secs("workers.idle_grace_secs", self.workers.idle_grace_secs, false)?;
        check_percent("workers.cpu_ceiling", self.workers.cpu_ceiling)?;
        check_percent("workers.memory_ceiling", self.workers.memory_ceiling)?;
        if self.cache.memory_budget == 0 {
            return invalid("cache.memory_budget must be positive");
        }
        if self.cache.shards == 0 {
            return invalid("cache.shards must be at least 1");
        }
        if let Some(timeout) = self.cache.fill_wait_timeout_secs {
            check_secs("cache.fill_wait_timeout_secs", timeout, false)?;
        }
        check_secs("monitor.interval_secs", self.monitor.interval_secs, true)?;
        check_percent("monitor.cpu_threshold", self.monitor.cpu_threshold)?;
        check_percent("monitor.memory_threshold", self.monitor.memory_threshold)?;
        check_percent("monitor.disk_threshold", self.monitor.disk_threshold)?;
        if !(self.monitor.saturation_ratio > 0.0 && self.monitor.saturation_ratio <= 1.0) {
            return invalid("monitor.saturation_ratio must be in (0, 1]");
        }

        Ok(())
    }
}

struct EnvSource<F> {
    lookup: F,
}

impl<F> EnvSource<F>
where
    F: Fn(&str) -> Option<String>,
{
    fn raw(&self, name: &str) -> Option<String> {
        (self.lookup)(name)
    }

    fn parse<T: FromStr>(&self, name: &str) -> Result<Option<T>, ConfigError> {
        match self.raw(name) {
            None => Ok(None),
            Some(value) => value
                .trim()
                .parse()
                .map(Some)
                .map_err(|_| ConfigError::Env {
                    var: name.to_string(),
                    value,
                }),
        }
    }

    fn set<T: FromStr>(&self, name: &str, field: &mut T) -> Result<(), ConfigError> {
        if let Some(value) = self.parse(name)? {
            *field = value;
        }
        Ok(())
    }
}

fn parse_flag(value: &str) -> bool {
    matches!(
        value.trim().to_ascii_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vars(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name| map.get(name).cloned()
    }

    #[test]
    fn test_defaults_are_valid() {
        let config = DispatchConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.pool.max_connections, 100);
        assert_eq!(config.pool.max_keepalive, 50);
        assert_eq!(config.rate_limit.burst_size, 200.0);
        assert_eq!(config.circuit_breaker.failure_threshold, 5);
        assert_eq!(config.workers.min_workers, 2);
        assert_eq!(config.workers.queue_capacity, 1000);
        assert_eq!(config.cache.default_ttl_secs, Some(3600));
        assert_eq!(config.cache.coalesce, CoalescePolicy::Block);
    }

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let config = DispatchConfig::from_toml_str(
            r#"
            [rate_limit]
            requests_per_second = 5.0

            [cache]
            coalesce = "fail_fast"
            tool_ttl = { nmap = 60 }
            "#,
        )
        .unwrap();

        assert_eq!(config.rate_limit.requests_per_second, 5.0);
        assert_eq!(config.rate_limit.burst_size, 200.0);
        assert_eq!(config.cache.coalesce, CoalescePolicy::FailFast);
        assert_eq!(config.cache.tool_ttl.get("nmap"), Some(&60));
        assert_eq!(config.pool.retry_count, 3);
    }

    #[test]
    fn test_env_overlay() {
        let mut config = DispatchConfig::default();
        config
            .apply_vars(vars(&[
                ("MAX_CONNECTIONS", "8"),
                ("MAX_KEEPALIVE", "4"),
                ("RATE_LIMIT_RPS", "12.5"),
                ("GUNICORN_WORKERS", "6"),
                ("CACHE_TTL", "0"),
                ("LOG_LEVEL", "DEBUG"),
                ("LOG_FORMAT", "json"),
                ("LOG_PERFORMANCE", "true"),
            ]))
            .unwrap();

        assert_eq!(config.pool.max_connections, 8);
        assert_eq!(config.pool.max_keepalive, 4);
        assert_eq!(config.rate_limit.requests_per_second, 12.5);
        assert_eq!(config.workers.max_workers, 6);
        assert_eq!(config.cache.default_ttl_secs, None);
        assert_eq!(config.logging.level, LogLevel::Debug);
        assert_eq!(config.logging.format, LogFormat::Json);
        assert!(config.monitor.log_performance);
    }

    #[test]
    fn test_max_workers_wins_over_alias() {
        let mut config = DispatchConfig::default();
        config
            .apply_vars(vars(&[("GUNICORN_WORKERS", "6"), ("MAX_WORKERS", "9")]))
            .unwrap();
        assert_eq!(config.workers.max_workers, 9);
    }

    #[test]
    fn test_bad_env_value_is_reported() {
        let mut config = DispatchConfig::default();
        let err = config
            .apply_vars(vars(&[("RETRY_COUNT", "lots")]))
            .unwrap_err();
        assert!(matches!(err, ConfigError::Env { ref var, .. } if var == "RETRY_COUNT"));
    }

    #[test]
    fn test_validate_rejects_unusable_settings() {
        let mut config = DispatchConfig::default();
        config.workers.min_workers = 0;
        assert!(config.validate().is_err());

        let mut config = DispatchConfig::default();
        config.workers.min_workers = 10;
        config.workers.max_workers = 4;
        assert!(config.validate().is_err());

        let mut config = DispatchConfig::default();
        config.pool.max_connections = 0;
        assert!(config.validate().is_err());

        let mut config = DispatchConfig::default();
        config.rate_limit.requests_per_second = 0.0;
        assert!(config.validate().is_err());

        let mut config = DispatchConfig::default();
        config.cache.memory_budget = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_negative_fill_wait() {
        let mut config = DispatchConfig::default();
        config.cache.fill_wait_timeout_secs = Some(-1.0);
        let err = config.validate().unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(ref msg) if msg.contains("fill_wait_timeout_secs")));

        config.cache.fill_wait_timeout_secs = Some(0.5);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_non_finite_env_durations() {
        for var in [
            "CB_RECOVERY_TIMEOUT",
            "REQUEST_TIMEOUT",
            "BACKOFF_FACTOR",
            "MONITORING_INTERVAL",
        ] {
            for value in ["inf", "NaN", "-3", "1e300"] {
                let mut config = DispatchConfig::default();
                config.apply_vars(vars(&[(var, value)])).unwrap();
                assert!(
                    matches!(config.validate(), Err(ConfigError::Invalid(_))),
                    "{var}={value} should be rejected"
                );
            }
        }

        for value in ["inf", "NaN"] {
            let mut config = DispatchConfig::default();
            config.apply_vars(vars(&[("RATE_LIMIT_RPS", value)])).unwrap();
            assert!(config.validate().is_err(), "RATE_LIMIT_RPS={value} should be rejected");
        }
    }

    #[test]
    fn test_validate_covers_every_duration_field() {
        let cases: [fn(&mut DispatchConfig); 7] = [
            |c| c.pool.acquire_timeout_secs = f64::INFINITY,
            |c| c.pool.max_backoff_secs = -0.5,
            |c| c.circuit_breaker.recovery_timeout_secs = f64::NAN,
            |c| c.workers.scale_interval_secs = 0.0,
            |c| c.workers.idle_grace_secs = f64::NEG_INFINITY,
            |c| c.monitor.interval_secs = f64::INFINITY,
            |c| c.monitor.saturation_ratio = f64::NAN,
        ];
        for (i, corrupt) in cases.iter().enumerate() {
            let mut config = DispatchConfig::default();
            corrupt(&mut config);
            assert!(config.validate().is_err(), "case {i} passed validation");
        }
    }

    #[test]
    fn test_out_of_range_seconds_convert_without_panicking() {
        assert_eq!(secs(f64::INFINITY), Duration::ZERO);
        assert_eq!(secs(f64::NAN), Duration::ZERO);
        assert_eq!(secs(-2.0), Duration::ZERO);
        assert_eq!(secs(1.5), Duration::from_millis(1500));

        let breaker = BreakerSettings {
            recovery_timeout_secs: f64::INFINITY,
            ..Default::default()
        };
        assert_eq!(breaker.to_breaker_config().recovery_timeout, Duration::ZERO);
    }

    #[test]
    fn test_settings_convert_to_component_configs() {
        let settings = PoolSettings {
            backoff_factor: 0.25,
            ..Default::default()
        };
        let pool = settings.to_pool_config();
        assert_eq!(pool.backoff_factor, Duration::from_millis(250));
        assert_eq!(pool.request_timeout, Duration::from_secs(30));

        let breaker = BreakerSettings::default().to_breaker_config();
        assert_eq!(breaker.recovery_timeout, Duration::from_secs(60));
    }

    #[test]
    fn test_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("dispatch.toml");
        std::fs::write(&path, "[workers]\nmin_workers = 3\nmax_workers = 3\n").unwrap();

        let config = DispatchConfig::from_file(&path).unwrap();
        assert_eq!(config.workers.min_workers, 3);
        assert!(config.validate().is_ok());

        assert!(matches!(
            DispatchConfig::from_file(&dir.path().join("missing.toml")),
            Err(ConfigError::Read { .. })
        ));
    }
}
