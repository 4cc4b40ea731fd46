use std::time::Duration;

use thiserror::Error;

use crate::CorrelationKey;

/// Errors that can occur when acquiring or releasing saga locks.
#[derive(Debug, Error)]
pub enum LockError {
    /// The lock stayed held by another dispatch for the whole wait window.
    ///
    /// This is an expected outcome under contention and is safe to retry.
    #[error("Timed out after {waited:?} waiting for saga lock {key}")]
    Timeout {
        key: CorrelationKey,
        waited: Duration,
    },

    /// A lock was released twice, released by a non-holder, or otherwise
    /// used in a way that indicates a programming error.
    #[error("Saga lock invariant violated: {0}")]
    InvariantViolation(String),

    /// The backing store of a lock backend failed.
    #[error("Lock backend error: {0}")]
    Backend(String),
}

impl LockError {
    /// Returns true if retrying the same operation later may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, LockError::Timeout { .. } | LockError::Backend(_))
    }
}

/// Result type for lock operations.
pub type Result<T> = std::result::Result<T, LockError>;
