use bytes::Bytes;
use dispatch_core::config::{CacheSettings, DispatchConfig, WorkerSettings};
use dispatch_core::monitor::{HostSample, StaticSampler};
use dispatch_core::resilience::{CircuitState, ResilienceError};
use dispatch_core::{DispatchError, DispatchRequest, Dispatcher, WorkDescriptor, WorkError, WorkItem};
use async_trait::async_trait;
use dispatch_core::resilience::ConnectionFactory;
use futures::future::join_all;
use serde_json::json;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

fn base_config() -> DispatchConfig {
    DispatchConfig {
        cache: CacheSettings {
            disk_budget: 0,
            ..Default::default()
        },
        workers: WorkerSettings {
            min_workers: 2,
            max_workers: 8,
            ..Default::default()
        },
        ..Default::default()
    }
}

fn start(config: DispatchConfig) -> Dispatcher {
    let host = Arc::new(StaticSampler::new(HostSample {
        cpu_percent: 15.0,
        memory_percent: 35.0,
        disk_usage: 40.0,
    }));
    Dispatcher::with_sampler(config, host).expect("valid config")
}

fn scan(target: &str) -> DispatchRequest {
    DispatchRequest::new(
        WorkDescriptor::new("nmap", json!({"target": target, "flags": ["-sV", "-T4"]})),
        target,
    )
}

fn work(runs: &Arc<AtomicUsize>, output: &'static str) -> WorkItem<Bytes> {
    let runs = Arc::clone(runs);
    WorkItem::new(move || async move {
        runs.fetch_add(1, Ordering::SeqCst);
        Ok(Bytes::from_static(output.as_bytes()))
    })
}

fn failing(runs: &Arc<AtomicUsize>) -> WorkItem<Bytes> {
    let runs = Arc::clone(runs);
    WorkItem::new(move || async move {
        runs.fetch_add(1, Ordering::SeqCst);
        anyhow::bail!("connection refused")
    })
}

#[tokio::test]
async fn test_concurrent_identical_requests_run_once() {
    let dispatcher = start(base_config());
    let runs = Arc::new(AtomicUsize::new(0));

    let requests = (0..16).map(|_| {
        let runs = Arc::clone(&runs);
        let item = WorkItem::new(move || async move {
            runs.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(50)).await;
            Ok(Bytes::from_static(b"443/tcp open https"))
        });
        dispatcher.dispatch(scan("198.51.100.7"), item)
    });
    let results = join_all(requests).await;

    assert_eq!(runs.load(Ordering::SeqCst), 1);
    for result in results {
        assert_eq!(result.unwrap(), Bytes::from_static(b"443/tcp open https"));
    }

    let stats = dispatcher.cache().stats();
    assert_eq!(stats.coalesced_waits, 15);
    assert_eq!(stats.fills_in_flight, 0);
}

#[tokio::test]
async fn test_parameter_order_shares_cache_entry() {
    let dispatcher = start(base_config());
    let runs = Arc::new(AtomicUsize::new(0));

    let a = DispatchRequest::new(
        WorkDescriptor::new("gobuster", json!({"url": "http://t", "wordlist": "common.txt"})),
        "t",
    );
    let b = DispatchRequest::new(
        WorkDescriptor::new("GoBuster", json!({"wordlist": "common.txt", "url": "http://t"})),
        "t",
    );
    assert_eq!(a.fingerprint(), b.fingerprint());

    dispatcher.dispatch(a, work(&runs, "/admin")).await.unwrap();
    let second = dispatcher.dispatch(b, work(&runs, "/other")).await.unwrap();

    assert_eq!(second, Bytes::from_static(b"/admin"));
    assert_eq!(runs.load(Ordering::SeqCst), 1);
}

#[tokio::test(start_paused = true)]
async fn test_expired_entry_is_refilled() {
    let dispatcher = start(base_config());
    let runs = Arc::new(AtomicUsize::new(0));
    let request = || scan("203.0.113.9").ttl(Duration::from_secs(1));

    dispatcher.dispatch(request(), work(&runs, "first")).await.unwrap();
    assert_eq!(
        dispatcher.dispatch(request(), work(&runs, "second")).await.unwrap(),
        Bytes::from_static(b"first")
    );

    tokio::time::advance(Duration::from_secs(2)).await;

    assert_eq!(
        dispatcher.dispatch(request(), work(&runs, "second")).await.unwrap(),
        Bytes::from_static(b"second")
    );
    assert_eq!(runs.load(Ordering::SeqCst), 2);
    assert_eq!(dispatcher.cache().stats().expirations, 1);
}

#[tokio::test(start_paused = true)]
async fn test_breaker_opens_and_recovers_through_trial() {
    let mut config = base_config();
    config.circuit_breaker.failure_threshold = 3;
    config.circuit_breaker.recovery_timeout_secs = 60.0;
    let dispatcher = start(config);
    let target = "api.internal";
    let runs = Arc::new(AtomicUsize::new(0));

    for _ in 0..3 {
        let result = dispatcher.dispatch(scan(target).uncached(), failing(&runs)).await;
        assert!(matches!(result, Err(DispatchError::Work(WorkError::Failed { .. }))));
    }
    let breaker = dispatcher.breakers().get(target).unwrap();
    assert_eq!(breaker.get_state(), CircuitState::Open);

    // Rejected without running
    let rejected = dispatcher.dispatch(scan(target).uncached(), work(&runs, "x")).await;
    assert!(matches!(
        rejected,
        Err(DispatchError::Resilience(ResilienceError::CircuitOpen { .. }))
    ));
    assert_eq!(runs.load(Ordering::SeqCst), 3);

    tokio::time::advance(Duration::from_secs(61)).await;

    let trial = dispatcher.dispatch(scan(target).uncached(), work(&runs, "back")).await;
    assert_eq!(trial.unwrap(), Bytes::from_static(b"back"));
    assert_eq!(breaker.get_state(), CircuitState::Closed);
    assert!(dispatcher.health_status().is_operational());
}

#[tokio::test(start_paused = true)]
async fn test_rate_limit_burst_then_refill() {
    let mut config = base_config();
    config.rate_limit.burst_size = 10.0;
    config.rate_limit.requests_per_second = 5.0;
    let dispatcher = start(config);
    let runs = Arc::new(AtomicUsize::new(0));

    for i in 0..10 {
        let request = scan(&format!("10.1.0.{i}")).uncached();
        dispatcher.dispatch(request, work(&runs, "ok")).await.unwrap();
    }
    let eleventh = dispatcher.dispatch(scan("10.1.0.10").uncached(), work(&runs, "ok")).await;
    assert!(matches!(
        eleventh,
        Err(DispatchError::Resilience(ResilienceError::RateLimitExceeded))
    ));

    tokio::time::advance(Duration::from_secs(1)).await;

    for i in 0..5 {
        let request = scan(&format!("10.2.0.{i}")).uncached();
        dispatcher.dispatch(request, work(&runs, "ok")).await.unwrap();
    }
    assert!(dispatcher
        .dispatch(scan("10.2.0.5").uncached(), work(&runs, "ok"))
        .await
        .is_err_and(|e| e.is_fast_fail()));

    assert_eq!(runs.load(Ordering::SeqCst), 15);
    let limiter = dispatcher.limiter().stats();
    assert_eq!(limiter.allowed, 15);
    assert_eq!(limiter.rejected, 2);
}

#[tokio::test]
async fn test_panicking_work_does_not_affect_others() {
    let dispatcher = start(base_config());
    let runs = Arc::new(AtomicUsize::new(0));

    let crashed = dispatcher
        .dispatch(
            scan("10.9.9.9"),
            WorkItem::new(|| async { panic!("parser blew up on unexpected output") }),
        )
        .await;
    assert!(matches!(crashed, Err(DispatchError::Work(WorkError::Panicked { .. }))));

    let fine = dispatcher.dispatch(scan("10.9.9.10"), work(&runs, "ok")).await;
    assert_eq!(fine.unwrap(), Bytes::from_static(b"ok"));
    assert_eq!(dispatcher.workers().stats().panicked, 1);
}

#[tokio::test]
async fn test_results_survive_restart_via_disk_tier() {
    let dir = tempfile::tempdir().unwrap();
    let config = DispatchConfig {
        cache: CacheSettings {
            disk_budget: 8 * 1024 * 1024,
            cache_dir: dir.path().to_path_buf(),
            ..Default::default()
        },
        ..base_config()
    };
    let runs = Arc::new(AtomicUsize::new(0));

    {
        let dispatcher = start(config.clone());
        dispatcher.dispatch(scan("192.0.2.1"), work(&runs, "persisted")).await.unwrap();
        dispatcher.shutdown(true).await;
    }

    let dispatcher = start(config);
    let value = dispatcher.dispatch(scan("192.0.2.1"), work(&runs, "fresh")).await.unwrap();
    assert_eq!(value, Bytes::from_static(b"persisted"));
    assert_eq!(runs.load(Ordering::SeqCst), 1);
    assert_eq!(dispatcher.cache().stats().promotions, 1);
}

#[tokio::test]
async fn test_config_file_drives_dispatcher() {
    let mut config = DispatchConfig::from_toml_str(
        r#"
        [rate_limit]
        requests_per_second = 0.01
        burst_size = 3.0

        [workers]
        min_workers = 1
        max_workers = 2
        queue_capacity = 8

        [cache]
        disk_budget = 0
        "#,
    )
    .unwrap();
    config
        .apply_vars(|name| (name == "CB_FAILURE_THRESHOLD").then(|| "1".to_string()))
        .unwrap();

    let dispatcher = start(config);
    assert_eq!(dispatcher.workers().stats().max_workers, 2);

    let runs = Arc::new(AtomicUsize::new(0));
    let _ = dispatcher.dispatch(scan("one-strike").uncached(), failing(&runs)).await;
    assert_eq!(
        dispatcher.breakers().get("one-strike").unwrap().get_state(),
        CircuitState::Open
    );

    // The failed attempt above spent the first token of the burst
    let admitted = dispatcher.dispatch(scan("other").uncached(), work(&runs, "x")).await;
    assert!(admitted.is_ok());
    let rejected = dispatcher.dispatch(scan("one-strike").uncached(), work(&runs, "x")).await;
    assert!(rejected.is_err_and(|e| e.is_circuit_open()));
    let limited = dispatcher.dispatch(scan("other").uncached(), work(&runs, "x")).await;
    assert!(matches!(
        limited,
        Err(DispatchError::Resilience(ResilienceError::RateLimitExceeded))
    ));
}

#[tokio::test]
async fn test_snapshot_reflects_activity() {
    let dispatcher = start(base_config());
    let runs = Arc::new(AtomicUsize::new(0));

    dispatcher.dispatch(scan("a"), work(&runs, "a")).await.unwrap();
    dispatcher.dispatch(scan("a"), work(&runs, "a")).await.unwrap();
    let _ = dispatcher.dispatch(scan("b"), failing(&runs)).await;

    let snapshot = serde_json::to_value(dispatcher.snapshot()).unwrap();
    assert_eq!(snapshot["cache"]["hits"], 1);
    assert_eq!(snapshot["worker_pool"]["completed"], 1);
    assert_eq!(snapshot["worker_pool"]["failed"], 1);
    assert_eq!(snapshot["rate_limiter"]["allowed"], 3);
    assert_eq!(snapshot["circuit_breakers"]["b"]["consecutive_failures"], 1);
    assert_eq!(snapshot["circuit_breaker_state"], "closed");
    assert_eq!(snapshot["system"]["memory_percent"], 35.0);
}

struct Session;
struct SessionFactory;

#[async_trait]
impl ConnectionFactory<Session> for SessionFactory {
    async fn create(&self) -> Result<Session, ResilienceError> {
        Ok(Session)
    }

    async fn is_healthy(&self, _conn: &Session) -> bool {
        true
    }
}

#[tokio::test]
async fn test_pooled_calls_go_through_breaker_and_limiter() {
    let mut config = base_config();
    config.pool.retry_count = 0;
    config.circuit_breaker.failure_threshold = 2;
    let dispatcher = start(config);
    let pool = dispatcher.connection_pool::<Session>(Arc::new(SessionFactory));
    let calls = AtomicUsize::new(0);

    for _ in 0..2 {
        let failed = pool
            .execute("db.internal", |_session| {
                calls.fetch_add(1, Ordering::SeqCst);
                Box::pin(async { Err::<(), _>(ResilienceError::Transient("connection reset".to_string())) })
            })
            .await;
        assert!(matches!(
            failed,
            Err(DispatchError::Resilience(ResilienceError::Transient(_)))
        ));
    }
    assert_eq!(
        dispatcher.breakers().get("db.internal").unwrap().get_state(),
        CircuitState::Open
    );

    // Open breaker: rejected before a connection is leased
    let rejected = pool
        .execute("db.internal", |_session| {
            calls.fetch_add(1, Ordering::SeqCst);
            Box::pin(async { Ok(()) })
        })
        .await;
    assert!(rejected.as_ref().is_err_and(DispatchError::is_circuit_open));
    assert_eq!(calls.load(Ordering::SeqCst), 2);

    // Other targets share the pool but not the breaker
    let ok = pool
        .execute("cache.internal", |_session| Box::pin(async { Ok(7u32) }))
        .await;
    assert_eq!(ok.unwrap(), 7);

    let snapshot = serde_json::to_value(dispatcher.snapshot()).unwrap();
    assert_eq!(snapshot["rate_limiter"]["allowed"], 4);
    assert!(!snapshot["connection_pool"].is_null());
    let stats = pool.stats();
    assert_eq!(stats.requests, 3);
    assert_eq!(stats.errors, 2);
}

#[tokio::test]
async fn test_pooled_calls_respect_rate_limit() {
    let mut config = base_config();
    config.rate_limit.burst_size = 1.0;
    config.rate_limit.requests_per_second = 0.001;
    let dispatcher = start(config);
    let pool = dispatcher.connection_pool::<Session>(Arc::new(SessionFactory));

    pool.execute("db.internal", |_session| Box::pin(async { Ok(()) }))
        .await
        .unwrap();
    let limited = pool
        .execute("db.internal", |_session| Box::pin(async { Ok(()) }))
        .await;
    assert!(matches!(
        limited,
        Err(DispatchError::Resilience(ResilienceError::RateLimitExceeded))
    ));
}
