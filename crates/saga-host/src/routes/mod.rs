pub mod health;
pub mod locks;
pub mod messages;
pub mod metrics;
pub mod sagas;
