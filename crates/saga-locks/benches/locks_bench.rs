use std::time::Duration;

use criterion::{Criterion, criterion_group, criterion_main};
use saga_locks::{CorrelationKey, DispatchId, InMemorySagaLocks, SagaLocks};

fn bench_uncontended_acquire_release(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();
    let locks = InMemorySagaLocks::new();
    let key = CorrelationKey::new("BenchSaga", "correlation_id", "solo");

    c.bench_function("saga_locks/uncontended_acquire_release", |b| {
        b.iter(|| {
            rt.block_on(async {
                let handle = locks
                    .acquire(&key, DispatchId::new(), Duration::from_secs(1))
                    .await
                    .unwrap();
                locks.release(handle).await.unwrap();
            });
        });
    });
}

fn bench_contended_single_key(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();

    c.bench_function("saga_locks/contended_single_key_64_tasks", |b| {
        b.iter(|| {
            rt.block_on(async {
                let locks = InMemorySagaLocks::new();
                let mut tasks = Vec::with_capacity(64);
                for _ in 0..64 {
                    let locks = locks.clone();
                    tasks.push(tokio::spawn(async move {
                        let key = CorrelationKey::new("BenchSaga", "correlation_id", "shared");
                        let handle = locks
                            .acquire(&key, DispatchId::new(), Duration::from_secs(5))
                            .await
                            .unwrap();
                        locks.release(handle).await.unwrap();
                    }));
                }
                for task in tasks {
                    task.await.unwrap();
                }
            });
        });
    });
}

fn bench_many_keys(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();

    c.bench_function("saga_locks/spread_over_64_keys", |b| {
        b.iter(|| {
            rt.block_on(async {
                let locks = InMemorySagaLocks::new();
                let mut tasks = Vec::with_capacity(64);
                for i in 0..64 {
                    let locks = locks.clone();
                    tasks.push(tokio::spawn(async move {
                        let key =
                            CorrelationKey::new("BenchSaga", "correlation_id", format!("k{i}"));
                        let handle = locks
                            .acquire(&key, DispatchId::new(), Duration::from_secs(5))
                            .await
                            .unwrap();
                        locks.release(handle).await.unwrap();
                    }));
                }
                for task in tasks {
                    task.await.unwrap();
                }
            });
        });
    });
}

criterion_group!(
    benches,
    bench_uncontended_acquire_release,
    bench_contended_single_key,
    bench_many_keys
);
criterion_main!(benches);
