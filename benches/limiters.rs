//! Benchmarks for the rate limiters and the in-memory store.

use std::sync::Arc;
use std::time::Duration;

use criterion::{BenchmarkId, Criterion, black_box, criterion_group, criterion_main};
use rategate::{
    AlgorithmKind, AnyLimiter, Config, GcConfig, Limiter, MemoryStorage, Storage,
};
use tokio::runtime::Runtime;

const KINDS: [AlgorithmKind; 3] = [
    AlgorithmKind::TokenBucket,
    AlgorithmKind::FixedWindow,
    AlgorithmKind::SlidingWindow,
];

fn bench_limiters(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();
    let config = Config::per_second(1000).with_burst(100);

    let mut group = c.benchmark_group("limiters");

    for kind in KINDS {
        group.bench_function(kind.name(), |b| {
            let limiter = AnyLimiter::new(kind, MemoryStorage::new(), config.clone()).unwrap();
            let mut i = 0u64;
            b.iter(|| {
                i += 1;
                let key = format!("{}:{}", kind, i % 100);
                rt.block_on(async { black_box(limiter.allow(&key).await) })
            })
        });
    }

    group.finish();
}

fn bench_hot_key(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();
    let mut group = c.benchmark_group("hot_key");

    for kind in KINDS {
        group.bench_with_input(BenchmarkId::new("allow", kind), &kind, |b, &kind| {
            let limiter = AnyLimiter::new(kind, MemoryStorage::new(), Config::per_hour(u32::MAX as u64))
                .unwrap();
            b.iter(|| rt.block_on(async { black_box(limiter.allow("hot").await) }))
        });
    }

    group.finish();
}

fn bench_contended(c: &mut Criterion) {
    let rt = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(4)
        .enable_all()
        .build()
        .unwrap();
    let mut group = c.benchmark_group("contended");

    for tasks in [2usize, 8] {
        group.bench_with_input(BenchmarkId::new("sliding_window", tasks), &tasks, |b, &tasks| {
            let limiter = Arc::new(
                AnyLimiter::new(
                    AlgorithmKind::SlidingWindow,
                    MemoryStorage::new(),
                    Config::per_hour(u32::MAX as u64),
                )
                .unwrap(),
            );
            b.to_async(&rt).iter(|| {
                let limiter = Arc::clone(&limiter);
                async move {
                    let handles: Vec<_> = (0..tasks)
                        .map(|_| {
                            let limiter = Arc::clone(&limiter);
                            tokio::spawn(async move { limiter.allow("shared").await })
                        })
                        .collect();
                    for handle in handles {
                        black_box(handle.await.unwrap().unwrap());
                    }
                }
            })
        });
    }

    group.finish();
}

fn bench_storage(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();
    let storage = MemoryStorage::with_gc(GcConfig::manual());
    let ttl = Duration::from_secs(60);

    let mut group = c.benchmark_group("memory_storage");

    group.bench_function("increment", |b| {
        let mut i = 0u64;
        b.iter(|| {
            i += 1;
            let key = format!("counter:{}", i % 1000);
            rt.block_on(async { black_box(storage.increment(&key, 1, ttl).await) })
        })
    });

    group.bench_function("get", |b| {
        b.iter(|| rt.block_on(async { black_box(storage.get("counter:1").await) }))
    });

    group.finish();
}

criterion_group!(
    benches,
    bench_limiters,
    bench_hot_key,
    bench_contended,
    bench_storage
);
criterion_main!(benches);
