use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::RwLock;

use crate::{
    CorrelationKey, Result, Revision, SagaId, SagaInstance, StoreError, store::SagaStore,
};

/// In-memory saga store.
///
/// Provides the same revision checks as the PostgreSQL implementation.
/// Clones share the same data.
#[derive(Clone, Default)]
pub struct InMemorySagaStore {
    instances: Arc<RwLock<HashMap<SagaId, SagaInstance>>>,
}

impl InMemorySagaStore {
    /// Creates a new empty in-memory saga store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns every persisted instance of `saga_type`.
    pub async fn instances_of(&self, saga_type: &str) -> Vec<SagaInstance> {
        let instances = self.instances.read().await;
        let mut found: Vec<_> = instances
            .values()
            .filter(|i| i.saga_type() == saga_type)
            .cloned()
            .collect();
        found.sort_by_key(|i| i.created_at());
        found
    }

    /// Removes all instances.
    pub async fn clear(&self) {
        self.instances.write().await.clear();
    }
}

#[async_trait]
impl SagaStore for InMemorySagaStore {
    async fn find(&self, key: &CorrelationKey) -> Result<Option<SagaInstance>> {
        let instances = self.instances.read().await;
        Ok(instances.values().find(|i| i.matches(key)).cloned())
    }

    #[tracing::instrument(skip(self, instance), fields(saga_id = %instance.id(), revision = %instance.revision()))]
    async fn save(&self, instance: &mut SagaInstance) -> Result<Revision> {
        let mut instances = self.instances.write().await;

        let current = instances
            .get(&instance.id())
            .map(|stored| stored.revision())
            .unwrap_or(Revision::initial());

        if current != instance.revision() {
            metrics::counter!("saga_store_conflicts_total").increment(1);
            return Err(StoreError::ConcurrencyConflict {
                saga_id: instance.id(),
                key: instance.correlation().clone(),
                expected: instance.revision(),
                actual: current,
            });
        }

        // A second creator for the same key (unique constraint simulation)
        if instance.is_new()
            && let Some(existing) = instances
                .values()
                .find(|i| i.id() != instance.id() && i.matches(instance.correlation()))
        {
            metrics::counter!("saga_store_conflicts_total").increment(1);
            return Err(StoreError::ConcurrencyConflict {
                saga_id: existing.id(),
                key: instance.correlation().clone(),
                expected: Revision::initial(),
                actual: existing.revision(),
            });
        }

        let next = current.next();
        instance.mark_persisted(next, Utc::now());
        instances.insert(instance.id(), instance.clone());

        Ok(next)
    }

    async fn get(&self, id: SagaId) -> Result<Option<SagaInstance>> {
        let instances = self.instances.read().await;
        Ok(instances.get(&id).cloned())
    }

    async fn count(&self) -> Result<usize> {
        Ok(self.instances.read().await.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn key(value: &str) -> CorrelationKey {
        CorrelationKey::new("CounterSaga", "correlation_id", value)
    }

    #[tokio::test]
    async fn load_or_create_returns_new_instance() {
        let store = InMemorySagaStore::new();

        let (instance, is_new) = store
            .load_or_create(&key("a"), json!({"count": 0}))
            .await
            .unwrap();
        assert!(is_new);
        assert_eq!(instance.revision(), Revision::initial());

        // Nothing is persisted until save
        assert_eq!(store.count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn save_increments_revision() {
        let store = InMemorySagaStore::new();
        let (mut instance, _) = store
            .load_or_create(&key("a"), json!({"count": 0}))
            .await
            .unwrap();

        let revision = store.save(&mut instance).await.unwrap();
        assert_eq!(revision, Revision::new(1));
        assert_eq!(instance.revision(), Revision::new(1));

        let (mut loaded, is_new) = store
            .load_or_create(&key("a"), json!({"count": 0}))
            .await
            .unwrap();
        assert!(!is_new);
        assert_eq!(loaded.id(), instance.id());

        loaded.set_payload(json!({"correlation_id": "a", "count": 1}));
        assert_eq!(store.save(&mut loaded).await.unwrap(), Revision::new(2));

        let stored = store.get(loaded.id()).await.unwrap().unwrap();
        assert_eq!(stored.payload()["count"], 1);
        assert_eq!(stored.revision(), Revision::new(2));
    }

    #[tokio::test]
    async fn stale_revision_is_a_conflict() {
        let store = InMemorySagaStore::new();
        let (mut instance, _) = store
            .load_or_create(&key("a"), json!({}))
            .await
            .unwrap();
        store.save(&mut instance).await.unwrap();

        let mut first = store.find(&key("a")).await.unwrap().unwrap();
        let mut second = first.clone();

        store.save(&mut first).await.unwrap();
        let result = store.save(&mut second).await;
        match result {
            Err(StoreError::ConcurrencyConflict {
                expected, actual, ..
            }) => {
                assert_eq!(expected, Revision::new(1));
                assert_eq!(actual, Revision::new(2));
            }
            other => panic!("expected conflict, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn second_creator_for_same_key_is_a_conflict() {
        let store = InMemorySagaStore::new();

        let (mut first, _) = store
            .load_or_create(&key("a"), json!({}))
            .await
            .unwrap();
        let (mut second, _) = store
            .load_or_create(&key("a"), json!({}))
            .await
            .unwrap();

        store.save(&mut first).await.unwrap();
        let result = store.save(&mut second).await;
        assert!(matches!(
            result,
            Err(StoreError::ConcurrencyConflict { .. })
        ));
        assert_eq!(store.count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn instances_of_filters_by_saga_type() {
        let store = InMemorySagaStore::new();
        let (mut a, _) = store
            .load_or_create(&key("a"), json!({}))
            .await
            .unwrap();
        let (mut b, _) = store
            .load_or_create(&CorrelationKey::new("OtherSaga", "id", "b"), json!({}))
            .await
            .unwrap();
        store.save(&mut a).await.unwrap();
        store.save(&mut b).await.unwrap();

        let counters = store.instances_of("CounterSaga").await;
        assert_eq!(counters.len(), 1);
        assert_eq!(counters[0].id(), a.id());

        store.clear().await;
        assert_eq!(store.count().await.unwrap(), 0);
    }
}
