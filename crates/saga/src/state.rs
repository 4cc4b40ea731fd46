//! Dispatch stage machine.

use serde::{Deserialize, Serialize};

/// The stage a single message dispatch has reached.
///
/// Stage transitions:
/// ```text
/// Resolving ──► Acquiring ──► Loaded ──► Handling ──► Persisting ──► Released ──► Done
///     │             │            │           │             │             │
///     └─────────────┴────────────┴───────────┴─────────────┴─────────────┴──► Failed
/// ```
///
/// The dispatcher records every transition on its tracing span. A failed
/// dispatch moves to `Failed` from the stage it failed in; the saga lock is
/// given back either way. Without pessimistic locking `Acquiring` and
/// `Released` are skipped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum DispatchStage {
    /// Mapping the message to a correlation key.
    #[default]
    Resolving,

    /// Waiting for the saga lock.
    Acquiring,

    /// Saga state loaded or initialized under the lock.
    Loaded,

    /// The saga handler is running.
    Handling,

    /// Writing the mutated state back.
    Persisting,

    /// The saga lock has been given back.
    Released,

    /// Dispatch completed (terminal stage).
    Done,

    /// Dispatch failed (terminal stage).
    Failed,
}

impl DispatchStage {
    /// Returns the stage name as a string.
    pub fn as_str(&self) -> &'static str {
        match self {
            DispatchStage::Resolving => "Resolving",
            DispatchStage::Acquiring => "Acquiring",
            DispatchStage::Loaded => "Loaded",
            DispatchStage::Handling => "Handling",
            DispatchStage::Persisting => "Persisting",
            DispatchStage::Released => "Released",
            DispatchStage::Done => "Done",
            DispatchStage::Failed => "Failed",
        }
    }
}

impl std::fmt::Display for DispatchStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}
