//! Correlated saga dispatch with pessimistic per-saga locking.
//!
//! Many workers consume a shared stream of messages in parallel while all
//! messages that belong to the same saga instance are handled one at a time.
//!
//! A dispatch runs these stages:
//! 1. Resolve the message to a [`CorrelationKey`] using the saga's
//!    correlation rules
//! 2. Acquire the saga lock for that key, waiting at most `lock_max_wait`
//! 3. Load the saga data, or create it if the message initiates the saga
//! 4. Run the saga handler
//! 5. Save the data at the next revision
//! 6. Release the lock, whatever happened in steps 3 to 5
//!
//! [`SagaWorkerPool`] runs dispatches concurrently under a global
//! parallelism limit and reports outcomes back to the [`MessageSource`].

pub mod config;
pub mod correlation;
pub mod dispatcher;
pub mod error;
pub mod message;
pub mod registry;
pub mod state;
pub mod transport;
pub mod worker;

pub use common::{DispatchId, MessageId};
pub use config::SagaConfig;
pub use correlation::{CorrelationConfig, CorrelationRule, Resolution};
pub use dispatcher::{DispatchOutcome, SagaDispatcher};
pub use error::{HandlerError, Result, SagaError};
pub use message::{Message, MessageBuilder, SagaMessage};
pub use registry::{HandlerContext, Saga, SagaRegistry};
pub use saga_store::{CorrelationKey, Revision, SagaId};
pub use state::DispatchStage;
pub use transport::{DeadLetter, Delivery, InMemoryQueue, MessageSource, QueueClosed};
pub use worker::SagaWorkerPool;
