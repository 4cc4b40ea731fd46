//! Dispatch configuration loaded from environment variables.

use std::time::Duration;

use crate::error::{Result, SagaError};

/// Worker pool and locking configuration with sensible defaults.
///
/// Reads from environment variables:
/// - `SAGA_WORKERS`: receiving worker tasks (default: `20`)
/// - `SAGA_MAX_PARALLELISM`: dispatches in flight across all workers (default: `100`)
/// - `SAGA_PESSIMISTIC_LOCKING`: lock each saga while it is handled (default: `true`)
/// - `SAGA_LOCK_MAX_WAIT_MS`: longest wait for a saga lock (default: `5000`)
/// - `SAGA_MAX_DELIVERY_ATTEMPTS`: deliveries before a message is dead-lettered (default: `5`)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SagaConfig {
    pub workers: usize,
    pub max_parallelism: usize,
    pub pessimistic_locking: bool,
    pub lock_max_wait: Duration,
    pub max_delivery_attempts: u32,
}

impl SagaConfig {
    /// Loads configuration from environment variables, falling back to defaults.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            workers: env_parse("SAGA_WORKERS").unwrap_or(defaults.workers),
            max_parallelism: env_parse("SAGA_MAX_PARALLELISM").unwrap_or(defaults.max_parallelism),
            pessimistic_locking: env_parse("SAGA_PESSIMISTIC_LOCKING")
                .unwrap_or(defaults.pessimistic_locking),
            lock_max_wait: env_parse("SAGA_LOCK_MAX_WAIT_MS")
                .map(Duration::from_millis)
                .unwrap_or(defaults.lock_max_wait),
            max_delivery_attempts: env_parse("SAGA_MAX_DELIVERY_ATTEMPTS")
                .unwrap_or(defaults.max_delivery_attempts),
        }
    }

    /// Checks that every limit is positive.
    pub fn validate(&self) -> Result<()> {
        if self.workers == 0 {
            return Err(SagaError::Configuration("workers must be > 0".into()));
        }
        if self.max_parallelism == 0 {
            return Err(SagaError::Configuration(
                "max_parallelism must be > 0".into(),
            ));
        }
        if self.lock_max_wait.is_zero() {
            return Err(SagaError::Configuration("lock_max_wait must be > 0".into()));
        }
        if self.max_delivery_attempts == 0 {
            return Err(SagaError::Configuration(
                "max_delivery_attempts must be > 0".into(),
            ));
        }
        Ok(())
    }

    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers;
        self
    }

    pub fn with_max_parallelism(mut self, max_parallelism: usize) -> Self {
        self.max_parallelism = max_parallelism;
        self
    }

    pub fn with_pessimistic_locking(mut self, enabled: bool) -> Self {
        self.pessimistic_locking = enabled;
        self
    }

    pub fn with_lock_max_wait(mut self, max_wait: Duration) -> Self {
        self.lock_max_wait = max_wait;
        self
    }

    pub fn with_max_delivery_attempts(mut self, attempts: u32) -> Self {
        self.max_delivery_attempts = attempts;
        self
    }
}

impl Default for SagaConfig {
    fn default() -> Self {
        Self {
            workers: 20,
            max_parallelism: 100,
            pessimistic_locking: true,
            lock_max_wait: Duration::from_secs(5),
            max_delivery_attempts: 5,
        }
    }
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    let raw = std::env::var(name).ok()?;
    match raw.trim().parse() {
        Ok(value) => Some(value),
        Err(_) => {
            tracing::warn!(var = name, value = %raw, "ignoring unparsable environment variable");
            None
        }
    }
}
