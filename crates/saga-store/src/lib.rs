pub mod error;
pub mod instance;
pub mod memory;
pub mod postgres;
pub mod revision;
pub mod store;

pub use common::{CorrelationKey, SagaId};
pub use error::{Result, StoreError};
pub use instance::SagaInstance;
pub use memory::InMemorySagaStore;
pub use postgres::PostgresSagaStore;
pub use revision::Revision;
pub use store::SagaStore;
