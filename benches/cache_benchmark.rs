use bytes::Bytes;
use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use dispatch_core::config::CacheSettings;
use dispatch_core::{Fingerprint, SmartCache};
use serde_json::json;
use std::hint::black_box;
use tempfile::TempDir;
use tokio::runtime::Runtime;

fn runtime() -> Runtime {
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .unwrap()
}

fn memory_only(budget: usize) -> SmartCache {
    SmartCache::in_memory(&CacheSettings {
        memory_budget: budget,
        disk_budget: 0,
        ..Default::default()
    })
}

fn keys(count: usize) -> Vec<Fingerprint> {
    (0..count)
        .map(|i| Fingerprint::of("nmap", &json!({"target": format!("10.0.{}.{}", i / 256, i % 256)})))
        .collect()
}

/// Fingerprinting cost for small and nested parameter sets
fn bench_fingerprint(c: &mut Criterion) {
    let mut group = c.benchmark_group("fingerprint");

    let small = json!({"target": "10.0.0.1", "ports": "1-1000"});
    let nested = json!({
        "target": "example.com",
        "options": {"threads": 50, "extensions": ["php", "html", "txt"], "status": [200, 301, 403]},
        "wordlist": "/usr/share/wordlists/dirb/common.txt",
        "headers": {"User-Agent": "scanner", "Accept": "*/*"}
    });

    group.bench_function("small", |b| b.iter(|| Fingerprint::of("nmap", black_box(&small))));
    group.bench_function("nested", |b| b.iter(|| Fingerprint::of("gobuster", black_box(&nested))));
    group.finish();
}

/// Hot-path reads from the memory tier
fn bench_memory_hits(c: &mut Criterion) {
    let mut group = c.benchmark_group("memory_hits");
    let runtime = runtime();

    for entries in [100usize, 10_000] {
        let cache = memory_only(256 * 1024 * 1024);
        let keys = keys(entries);
        runtime.block_on(async {
            for key in &keys {
                cache.insert(key, Bytes::from(vec![0xAB; 512]), None).await;
            }
        });

        group.throughput(Throughput::Elements(1));
        group.bench_with_input(BenchmarkId::from_parameter(entries), &keys, |b, keys| {
            let mut i = 0;
            b.iter(|| {
                i = (i + 1) % keys.len();
                black_box(runtime.block_on(cache.get(&keys[i])))
            });
        });
    }
    group.finish();
}

/// Inserts into a full memory tier, with and without a disk tier to demote to
fn bench_eviction(c: &mut Criterion) {
    let mut group = c.benchmark_group("eviction");
    let runtime = runtime();
    let keys = keys(4096);
    let value = Bytes::from(vec![0xCD; 1024]);

    let cache = memory_only(256 * 1024);
    group.bench_function("memory_only", |b| {
        let mut i = 0;
        b.iter(|| {
            i = (i + 1) % keys.len();
            runtime.block_on(cache.insert(&keys[i], value.clone(), None));
        });
    });

    let dir = TempDir::new().unwrap();
    let tiered = SmartCache::open(&CacheSettings {
        memory_budget: 256 * 1024,
        disk_budget: 64 * 1024 * 1024,
        cache_dir: dir.path().to_path_buf(),
        ..Default::default()
    })
    .unwrap();
    group.bench_function("demote_to_disk", |b| {
        let mut i = 0;
        b.iter(|| {
            i = (i + 1) % keys.len();
            runtime.block_on(tiered.insert(&keys[i], value.clone(), None));
        });
    });

    group.finish();
}

/// get_or_compute on a warm key
fn bench_get_or_compute(c: &mut Criterion) {
    let runtime = runtime();
    let cache = memory_only(64 * 1024 * 1024);
    let key = Fingerprint::named("bench", "warm");
    runtime.block_on(cache.insert(&key, Bytes::from_static(b"cached"), None));

    c.bench_function("get_or_compute_hit", |b| {
        b.iter(|| {
            runtime.block_on(async {
                black_box(
                    cache
                        .get_or_compute(&key, None, || async { Ok(Bytes::from_static(b"fresh")) })
                        .await
                        .unwrap(),
                )
            })
        });
    });
}

criterion_group!(
    benches,
    bench_fingerprint,
    bench_memory_hits,
    bench_eviction,
    bench_get_or_compute
);
criterion_main!(benches);
