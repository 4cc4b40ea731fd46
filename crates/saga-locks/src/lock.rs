use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{CorrelationKey, DispatchId, Result};

/// Unique token minted for every successful acquisition.
///
/// Backends compare the token of a released handle against the token of
/// the live entry, which is how a stale or foreign handle is detected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LockToken(Uuid);

impl LockToken {
    /// Creates a new random token.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Returns the underlying UUID.
    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl Default for LockToken {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for LockToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Diagnostic view of a held saga lock.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockEntry {
    /// The correlation key this lock guards.
    pub key: CorrelationKey,

    /// The dispatch currently holding the lock.
    pub holder: DispatchId,

    /// When the lock was acquired.
    pub acquired_at: DateTime<Utc>,
}

/// Proof of a successful acquisition.
///
/// A handle is deliberately not `Clone`: it is consumed by
/// [`SagaLocks::release`], so one acquisition maps to one release.
#[derive(Debug)]
pub struct LockHandle {
    entry: LockEntry,
    token: LockToken,
}

impl LockHandle {
    /// Creates a handle. Intended for lock backends.
    pub fn new(entry: LockEntry, token: LockToken) -> Self {
        Self { entry, token }
    }

    pub fn key(&self) -> &CorrelationKey {
        &self.entry.key
    }

    pub fn holder(&self) -> DispatchId {
        self.entry.holder
    }

    pub fn acquired_at(&self) -> DateTime<Utc> {
        self.entry.acquired_at
    }

    pub fn token(&self) -> LockToken {
        self.token
    }

    pub fn entry(&self) -> &LockEntry {
        &self.entry
    }
}

/// Exclusive, waitable, per-key lock primitive used to serialize saga
/// handling.
///
/// Implementations must guarantee:
/// - acquisition is atomic: two concurrent `acquire` calls for the same key
///   never both succeed;
/// - waiting yields the executor and wakes promptly when the key is released;
/// - a timed out or cancelled `acquire` leaves no trace in the registry;
/// - `release` of a handle that is not the live holder fails with
///   [`LockError::InvariantViolation`](crate::LockError::InvariantViolation).
///
/// Backends never retry on their own.
#[async_trait]
pub trait SagaLocks: Send + Sync {
    /// Waits up to `max_wait` for exclusive ownership of `key`.
    ///
    /// Fails with [`LockError::Timeout`](crate::LockError::Timeout) when the
    /// key stays held for the whole window.
    async fn acquire(
        &self,
        key: &CorrelationKey,
        holder: DispatchId,
        max_wait: Duration,
    ) -> Result<LockHandle>;

    /// Releases a previously acquired lock.
    async fn release(&self, handle: LockHandle) -> Result<()>;

    /// Returns the number of locks currently held.
    async fn live_count(&self) -> usize;

    /// Returns a snapshot of the locks currently held.
    async fn entries(&self) -> Vec<LockEntry>;
}
