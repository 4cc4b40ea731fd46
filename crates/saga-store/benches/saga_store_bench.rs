use criterion::{Criterion, criterion_group, criterion_main};
use saga_store::{CorrelationKey, InMemorySagaStore, SagaStore};

fn bench_create_and_save(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();

    c.bench_function("saga_store/create_and_save", |b| {
        b.iter(|| {
            rt.block_on(async {
                let store = InMemorySagaStore::new();
                let key = CorrelationKey::new("CounterSaga", "correlation_id", "k");
                let (mut instance, _) = store
                    .load_or_create(&key, serde_json::json!({"count": 0}))
                    .await
                    .unwrap();
                store.save(&mut instance).await.unwrap();
            });
        });
    });
}

fn bench_load_mutate_save_100(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();

    c.bench_function("saga_store/load_mutate_save_100", |b| {
        b.iter(|| {
            rt.block_on(async {
                let store = InMemorySagaStore::new();
                let key = CorrelationKey::new("CounterSaga", "correlation_id", "k");
                for i in 0..100 {
                    let (mut instance, _) = store
                        .load_or_create(&key, serde_json::json!({"count": 0}))
                        .await
                        .unwrap();
                    instance.set_payload(serde_json::json!({"correlation_id": "k", "count": i}));
                    store.save(&mut instance).await.unwrap();
                }
            });
        });
    });
}

criterion_group!(benches, bench_create_and_save, bench_load_mutate_save_100);
criterion_main!(benches);
