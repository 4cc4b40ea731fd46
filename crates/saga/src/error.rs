//! Saga dispatch error types.

use std::time::Duration;

use saga_locks::LockError;
use saga_store::{CorrelationKey, Revision, SagaId, StoreError};
use thiserror::Error;

/// Errors that can occur while dispatching a message to a saga.
#[derive(Debug, Error)]
pub enum SagaError {
    /// No saga handles the message type, a message type was registered
    /// twice, or the configuration is invalid.
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// The saga lock stayed held by another dispatch for the whole wait
    /// window.
    #[error("Timed out after {waited:?} waiting for saga lock {key}")]
    LockTimeout {
        key: CorrelationKey,
        waited: Duration,
    },

    /// The stored revision moved while the saga lock was held.
    #[error(
        "Concurrency conflict for saga {saga_id} ({key}): expected revision {expected}, found {actual}"
    )]
    ConcurrencyConflict {
        saga_id: SagaId,
        key: CorrelationKey,
        expected: Revision,
        actual: Revision,
    },

    /// Two unlocked dispatches raced on the same saga. Only produced when
    /// pessimistic locking is disabled.
    #[error(
        "Optimistic conflict for saga {saga_id} ({key}): expected revision {expected}, found {actual}"
    )]
    OptimisticConflict {
        saga_id: SagaId,
        key: CorrelationKey,
        expected: Revision,
        actual: Revision,
    },

    /// The saga handler rejected the message.
    #[error("Saga '{saga_type}' failed to handle '{message_type}': {source}")]
    Handler {
        saga_type: String,
        message_type: String,
        #[source]
        source: HandlerError,
    },

    /// A lock or store contract was broken by the caller.
    #[error("Saga invariant violated: {0}")]
    InvariantViolation(String),

    /// The lock backend failed.
    #[error("Lock backend error: {0}")]
    Lock(String),

    /// The saga store failed.
    #[error("Saga store error: {0}")]
    Store(#[source] StoreError),

    /// Saga data or a message body could not be (de)serialized.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl SagaError {
    /// Returns true if redelivering the message later may succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            SagaError::LockTimeout { .. }
            | SagaError::OptimisticConflict { .. }
            | SagaError::Handler { .. }
            | SagaError::Lock(_) => true,
            SagaError::Store(err) => matches!(err, StoreError::Database(_)),
            SagaError::Configuration(_)
            | SagaError::ConcurrencyConflict { .. }
            | SagaError::InvariantViolation(_)
            | SagaError::Serialization(_) => false,
        }
    }

    /// Short label used for the `reason` metric dimension.
    pub fn reason(&self) -> &'static str {
        match self {
            SagaError::Configuration(_) => "configuration",
            SagaError::LockTimeout { .. } => "lock_timeout",
            SagaError::ConcurrencyConflict { .. } => "concurrency_conflict",
            SagaError::OptimisticConflict { .. } => "optimistic_conflict",
            SagaError::Handler { .. } => "handler",
            SagaError::InvariantViolation(_) => "invariant_violation",
            SagaError::Lock(_) => "lock",
            SagaError::Store(_) => "store",
            SagaError::Serialization(_) => "serialization",
        }
    }
}

impl From<LockError> for SagaError {
    fn from(err: LockError) -> Self {
        match err {
            LockError::Timeout { key, waited } => SagaError::LockTimeout { key, waited },
            LockError::InvariantViolation(msg) => SagaError::InvariantViolation(msg),
            LockError::Backend(msg) => SagaError::Lock(msg),
        }
    }
}

impl From<StoreError> for SagaError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::ConcurrencyConflict {
                saga_id,
                key,
                expected,
                actual,
            } => SagaError::ConcurrencyConflict {
                saga_id,
                key,
                expected,
                actual,
            },
            other => SagaError::Store(other),
        }
    }
}

/// Errors returned by saga handlers.
#[derive(Debug, Error)]
pub enum HandlerError {
    /// The handler refused the message.
    #[error("{0}")]
    Failed(String),

    /// The message body did not match the expected type.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Any other failure raised by the handler's collaborators.
    #[error(transparent)]
    Other(#[from] Box<dyn std::error::Error + Send + Sync>),
}

impl HandlerError {
    /// Creates a [`HandlerError::Failed`] with the given reason.
    pub fn failed(reason: impl Into<String>) -> Self {
        HandlerError::Failed(reason.into())
    }
}

/// Convenience type alias for saga results.
pub type Result<T> = std::result::Result<T, SagaError>;

#[cfg(test)]
mod tests {
    use super::*;

    fn key() -> CorrelationKey {
        CorrelationKey::new("CounterSaga", "correlation_id", "a")
    }

    #[test]
    fn lock_errors_map_by_kind() {
        let timeout: SagaError = LockError::Timeout {
            key: key(),
            waited: Duration::from_millis(10),
        }
        .into();
        assert!(matches!(timeout, SagaError::LockTimeout { .. }));
        assert!(timeout.is_retryable());

        let violation: SagaError = LockError::InvariantViolation("double release".into()).into();
        assert!(matches!(violation, SagaError::InvariantViolation(_)));
        assert!(!violation.is_retryable());
    }

    #[test]
    fn store_conflict_is_fatal() {
        let err: SagaError = StoreError::ConcurrencyConflict {
            saga_id: SagaId::new(),
            key: key(),
            expected: Revision::new(1),
            actual: Revision::new(2),
        }
        .into();
        assert!(matches!(err, SagaError::ConcurrencyConflict { .. }));
        assert!(!err.is_retryable());
        assert_eq!(err.reason(), "concurrency_conflict");
    }

    #[test]
    fn handler_failures_are_retryable() {
        let err = SagaError::Handler {
            saga_type: "CounterSaga".into(),
            message_type: "Increment".into(),
            source: HandlerError::failed("boom"),
        };
        assert!(err.is_retryable());
        assert!(err.to_string().contains("boom"));
    }

    #[test]
    fn configuration_is_not_retryable() {
        assert!(!SagaError::Configuration("no rule".into()).is_retryable());
    }
}
