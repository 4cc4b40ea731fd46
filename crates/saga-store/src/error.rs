use thiserror::Error;

use crate::{CorrelationKey, Revision, SagaId};

/// Errors that can occur when interacting with the saga store.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The stored revision did not match the revision the caller loaded.
    ///
    /// Under pessimistic locking this means two writers touched the same
    /// saga concurrently, which the lock should have prevented.
    #[error(
        "Concurrency conflict for saga {saga_id} ({key}): expected revision {expected}, found {actual}"
    )]
    ConcurrencyConflict {
        saga_id: SagaId,
        key: CorrelationKey,
        expected: Revision,
        actual: Revision,
    },

    /// A database error occurred.
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// A database migration error occurred.
    #[error("Migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    /// A serialization/deserialization error occurred.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Result type for saga store operations.
pub type Result<T> = std::result::Result<T, StoreError>;
