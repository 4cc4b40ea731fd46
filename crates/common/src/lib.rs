//! Identifiers shared by the lock manager, the saga store and the dispatcher.

mod correlation;
mod types;

pub use correlation::CorrelationKey;
pub use types::{DispatchId, MessageId, SagaId};
