//! Pessimistic saga locks.
//!
//! A saga lock gives one dispatch exclusive access to the saga instance
//! addressed by a [`CorrelationKey`]. Acquisition waits up to a caller
//! supplied deadline; release must be performed exactly once per handle.
//!
//! Backends implement [`SagaLocks`]. [`InMemorySagaLocks`] is sufficient
//! for a single process and for tests.

pub mod error;
pub mod guard;
pub mod lock;
pub mod memory;

pub use common::{CorrelationKey, DispatchId};
pub use error::{LockError, Result};
pub use guard::LockGuard;
pub use lock::{LockEntry, LockHandle, LockToken, SagaLocks};
pub use memory::InMemorySagaLocks;
