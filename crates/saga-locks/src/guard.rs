use std::sync::Arc;
use std::time::Duration;

use crate::{CorrelationKey, DispatchId, LockHandle, Result, SagaLocks};

/// Scoped ownership of a saga lock.
///
/// Call [`LockGuard::release`] on every normal exit path so release errors
/// are observed. If the guard is dropped while still holding the lock (the
/// owning future was cancelled, or a handler panicked), the release is
/// scheduled on the current Tokio runtime instead.
pub struct LockGuard {
    locks: Arc<dyn SagaLocks>,
    key: CorrelationKey,
    holder: DispatchId,
    handle: Option<LockHandle>,
}

impl LockGuard {
    /// Acquires `key` on `locks`, waiting at most `max_wait`.
    pub async fn acquire(
        locks: Arc<dyn SagaLocks>,
        key: &CorrelationKey,
        holder: DispatchId,
        max_wait: Duration,
    ) -> Result<Self> {
        let handle = locks.acquire(key, holder, max_wait).await?;
        Ok(Self {
            locks,
            key: key.clone(),
            holder,
            handle: Some(handle),
        })
    }

    /// The key this guard holds.
    pub fn key(&self) -> &CorrelationKey {
        &self.key
    }

    /// The dispatch recorded as holder.
    pub fn holder(&self) -> DispatchId {
        self.holder
    }

    /// Releases the lock now.
    pub async fn release(mut self) -> Result<()> {
        match self.handle.take() {
            Some(handle) => self.locks.release(handle).await,
            None => Ok(()),
        }
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        let Some(handle) = self.handle.take() else {
            return;
        };

        tracing::warn!(key = %self.key, holder = %self.holder, "saga lock dropped without release, releasing in background");
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                let locks = Arc::clone(&self.locks);
                runtime.spawn(async move {
                    if let Err(e) = locks.release(handle).await {
                        tracing::error!(error = %e, "background saga lock release failed");
                    }
                });
            }
            Err(_) => {
                tracing::error!(key = %self.key, "no runtime to release saga lock, lock leaked");
            }
        }
    }
}

impl std::fmt::Debug for LockGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LockGuard")
            .field("key", &self.key)
            .field("holder", &self.holder)
            .field("held", &self.handle.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::InMemorySagaLocks;

    fn key() -> CorrelationKey {
        CorrelationKey::new("TestSaga", "correlation_id", "guarded")
    }

    #[tokio::test]
    async fn explicit_release() {
        let locks = InMemorySagaLocks::new();
        let guard = LockGuard::acquire(
            Arc::new(locks.clone()),
            &key(),
            DispatchId::new(),
            Duration::from_secs(1),
        )
        .await
        .unwrap();
        assert_eq!(locks.count(), 1);

        guard.release().await.unwrap();
        assert_eq!(locks.count(), 0);
    }

    #[tokio::test]
    async fn dropped_guard_releases_in_background() {
        let locks = InMemorySagaLocks::new();
        let guard = LockGuard::acquire(
            Arc::new(locks.clone()),
            &key(),
            DispatchId::new(),
            Duration::from_secs(1),
        )
        .await
        .unwrap();
        assert_eq!(locks.count(), 1);

        drop(guard);
        for _ in 0..100 {
            if locks.count() == 0 {
                break;
            }
            tokio::task::yield_now().await;
        }
        assert_eq!(locks.count(), 0);
        assert_eq!(locks.tracked_keys(), 0);
    }

    #[tokio::test]
    async fn cancelled_scope_does_not_leak() {
        let locks = InMemorySagaLocks::new();
        let shared: Arc<dyn SagaLocks> = Arc::new(locks.clone());

        let task = tokio::spawn({
            let shared = Arc::clone(&shared);
            async move {
                let _guard =
                    LockGuard::acquire(shared, &key(), DispatchId::new(), Duration::from_secs(1))
                        .await
                        .unwrap();
                std::future::pending::<()>().await;
            }
        });

        for _ in 0..100 {
            if locks.count() == 1 {
                break;
            }
            tokio::task::yield_now().await;
        }
        assert_eq!(locks.count(), 1);

        task.abort();
        let _ = task.await;
        for _ in 0..100 {
            if locks.count() == 0 {
                break;
            }
            tokio::task::yield_now().await;
        }
        assert_eq!(locks.count(), 0);
    }
}
