use async_trait::async_trait;

use crate::{CorrelationKey, Result, Revision, SagaId, SagaInstance};

/// Core trait for saga persistence backends.
///
/// Every method that reads or writes the instance for a key must only be
/// called while the caller holds the saga lock for that key. The store does
/// not lock on its own; its revision check exists to surface violations of
/// that rule, not to replace it.
#[async_trait]
pub trait SagaStore: Send + Sync {
    /// Finds the instance addressed by `key`.
    async fn find(&self, key: &CorrelationKey) -> Result<Option<SagaInstance>>;

    /// Persists `instance` at the next revision.
    ///
    /// Fails with `ConcurrencyConflict` if the stored revision differs from
    /// `instance.revision()`, or if a new instance collides with an existing
    /// one for the same key. On success `instance` is updated in place and
    /// the new revision is returned.
    async fn save(&self, instance: &mut SagaInstance) -> Result<Revision>;

    /// Retrieves an instance by id.
    async fn get(&self, id: SagaId) -> Result<Option<SagaInstance>>;

    /// Returns the number of persisted instances.
    async fn count(&self) -> Result<usize>;

    /// Loads the instance for `key`, or initializes a new one at revision 0.
    ///
    /// The existence check runs on every call, so a dispatch that lost a
    /// race to create the instance sees the winner's copy once it holds the
    /// lock. Returns the instance and whether it is new. New instances are
    /// not persisted until [`SagaStore::save`].
    async fn load_or_create(
        &self,
        key: &CorrelationKey,
        initial: serde_json::Value,
    ) -> Result<(SagaInstance, bool)> {
        match self.find(key).await? {
            Some(instance) => Ok((instance, false)),
            None => Ok((SagaInstance::new(key.clone(), initial), true)),
        }
    }
}
