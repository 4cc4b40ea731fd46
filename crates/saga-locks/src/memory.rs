use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::OwnedMutexGuard;

use crate::{
    CorrelationKey, DispatchId, LockEntry, LockError, LockHandle, LockToken, Result, SagaLocks,
};

/// In-memory saga lock backend.
///
/// Keeps a registry of per-key slots. A slot is created lazily by the first
/// dispatch that asks for a key and removed again once no dispatch holds or
/// waits for it, so an idle backend has an empty registry. Each slot owns a
/// fair (FIFO) async mutex that waiters queue on; the registry mutex itself
/// is only held for short, non-blocking bookkeeping.
///
/// Clones share the same registry.
#[derive(Clone, Default)]
pub struct InMemorySagaLocks {
    registry: Arc<Mutex<Registry>>,
}

#[derive(Default)]
struct Registry {
    slots: HashMap<CorrelationKey, Slot>,
    held: usize,
}

struct Slot {
    gate: Arc<tokio::sync::Mutex<()>>,
    /// Holder plus waiters.
    participants: usize,
    held: Option<Held>,
}

struct Held {
    entry: LockEntry,
    token: LockToken,
    _guard: OwnedMutexGuard<()>,
}

impl InMemorySagaLocks {
    /// Creates an empty lock registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the number of locks currently held.
    pub fn count(&self) -> usize {
        self.registry().held
    }

    /// Returns the number of keys with a holder or at least one waiter.
    pub fn tracked_keys(&self) -> usize {
        self.registry().slots.len()
    }

    /// Returns true if `key` is currently held.
    pub fn is_held(&self, key: &CorrelationKey) -> bool {
        self.registry()
            .slots
            .get(key)
            .is_some_and(|slot| slot.held.is_some())
    }

    fn registry(&self) -> MutexGuard<'_, Registry> {
        self.registry.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Registers interest in `key` and returns the slot's gate.
    fn join(&self, key: &CorrelationKey) -> Arc<tokio::sync::Mutex<()>> {
        let mut registry = self.registry();
        let slot = registry.slots.entry(key.clone()).or_insert_with(|| Slot {
            gate: Arc::new(tokio::sync::Mutex::new(())),
            participants: 0,
            held: None,
        });
        slot.participants += 1;
        Arc::clone(&slot.gate)
    }

    /// Drops interest in `key`, removing the slot when nobody is left.
    fn leave(registry: &mut Registry, key: &CorrelationKey) {
        if let Some(slot) = registry.slots.get_mut(key) {
            slot.participants = slot.participants.saturating_sub(1);
            if slot.participants == 0 && slot.held.is_none() {
                registry.slots.remove(key);
            }
        }
    }
}

/// Unregisters a waiter that timed out or whose future was dropped.
struct Waiter<'a> {
    locks: &'a InMemorySagaLocks,
    key: &'a CorrelationKey,
    armed: bool,
}

impl Drop for Waiter<'_> {
    fn drop(&mut self) {
        if self.armed {
            InMemorySagaLocks::leave(&mut self.locks.registry(), self.key);
        }
    }
}

#[async_trait]
impl SagaLocks for InMemorySagaLocks {
    #[tracing::instrument(skip(self, key, holder), fields(key = %key, holder = %holder))]
    async fn acquire(
        &self,
        key: &CorrelationKey,
        holder: DispatchId,
        max_wait: Duration,
    ) -> Result<LockHandle> {
        let gate = self.join(key);
        let mut waiter = Waiter {
            locks: self,
            key,
            armed: true,
        };

        let started = Instant::now();
        let guard = match tokio::time::timeout(max_wait, gate.lock_owned()).await {
            Ok(guard) => guard,
            Err(_) => {
                metrics::counter!("saga_lock_timeouts_total").increment(1);
                tracing::warn!(?max_wait, "timed out waiting for saga lock");
                return Err(LockError::Timeout {
                    key: key.clone(),
                    waited: started.elapsed(),
                });
            }
        };
        metrics::histogram!("saga_lock_wait_seconds").record(started.elapsed().as_secs_f64());

        let entry = LockEntry {
            key: key.clone(),
            holder,
            acquired_at: Utc::now(),
        };
        let token = LockToken::new();

        let mut registry = self.registry();
        let Some(slot) = registry.slots.get_mut(key) else {
            return Err(LockError::InvariantViolation(format!(
                "slot for {key} vanished while a waiter was registered"
            )));
        };
        if let Some(current) = &slot.held {
            return Err(LockError::InvariantViolation(format!(
                "lock {key} granted to {holder} while held by {}",
                current.entry.holder
            )));
        }
        slot.held = Some(Held {
            entry: entry.clone(),
            token,
            _guard: guard,
        });
        registry.held += 1;
        metrics::gauge!("saga_locks_live").set(registry.held as f64);
        // The waiter is now the holder; it leaves on release instead.
        waiter.armed = false;
        drop(registry);

        metrics::counter!("saga_lock_acquired_total").increment(1);
        tracing::trace!("saga lock acquired");
        Ok(LockHandle::new(entry, token))
    }

    #[tracing::instrument(skip(self, handle), fields(key = %handle.key(), holder = %handle.holder()))]
    async fn release(&self, handle: LockHandle) -> Result<()> {
        let key = handle.key();
        let mut registry = self.registry();
        let Some(slot) = registry.slots.get_mut(key) else {
            return Err(LockError::InvariantViolation(format!(
                "release of {key} by {} but the lock is not held",
                handle.holder()
            )));
        };
        match &slot.held {
            Some(held) if held.token == handle.token() => {}
            Some(held) => {
                return Err(LockError::InvariantViolation(format!(
                    "release of {key} by {} but the lock is held by {}",
                    handle.holder(),
                    held.entry.holder
                )));
            }
            None => {
                return Err(LockError::InvariantViolation(format!(
                    "release of {key} by {} but the lock is not held",
                    handle.holder()
                )));
            }
        }

        // Dropping the gate guard hands the key to the next waiter.
        slot.held = None;
        registry.held -= 1;
        Self::leave(&mut registry, key);
        metrics::gauge!("saga_locks_live").set(registry.held as f64);
        tracing::trace!("saga lock released");
        Ok(())
    }

    async fn live_count(&self) -> usize {
        self.count()
    }

    async fn entries(&self) -> Vec<LockEntry> {
        let mut entries: Vec<_> = self
            .registry()
            .slots
            .values()
            .filter_map(|slot| slot.held.as_ref().map(|held| held.entry.clone()))
            .collect();
        entries.sort_by(|a, b| a.acquired_at.cmp(&b.acquired_at));
        entries
    }
}
