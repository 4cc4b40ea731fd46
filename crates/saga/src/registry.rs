//! Typed sagas and the static routing table built from them.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use common::{DispatchId, MessageId};
use saga_store::{CorrelationKey, Revision, SagaId};
use serde::{Deserialize, Serialize, de::DeserializeOwned};

use crate::correlation::{CorrelationConfig, CorrelationRule, Resolution};
use crate::error::{HandlerError, Result, SagaError};
use crate::message::Message;

/// What a handler knows about the dispatch it runs in.
#[derive(Debug, Clone)]
pub struct HandlerContext {
    pub saga_id: SagaId,
    /// Revision the data was loaded at; 0 for a saga created by this message.
    pub revision: Revision,
    pub is_new: bool,
    pub key: CorrelationKey,
    pub message_id: MessageId,
    pub dispatch_id: DispatchId,
}

/// A long-running process whose state is keyed by correlation.
///
/// Handlers for one saga instance never run concurrently: the dispatcher
/// holds the saga lock for the instance's key from before the data is
/// loaded until after it is saved.
#[async_trait]
pub trait Saga: Send + Sync + 'static {
    /// Persistent saga data. `Default` is the state of a new instance.
    type Data: Serialize + DeserializeOwned + Default + Send + Sync;

    /// Name the saga is stored and locked under.
    const SAGA_TYPE: &'static str;

    /// Declares which message types this saga handles and how each one is
    /// correlated.
    fn correlate(&self, config: &mut CorrelationConfig);

    /// Applies `message` to `data`. Returning an error discards the
    /// mutation.
    async fn handle(
        &self,
        data: &mut Self::Data,
        message: &Message,
        ctx: &HandlerContext,
    ) -> std::result::Result<(), HandlerError>;
}

/// Object-safe view of a [`Saga`] operating on JSON saga data.
#[async_trait]
pub(crate) trait ErasedSaga: Send + Sync {
    fn saga_type(&self) -> &'static str;

    fn initial_data(&self) -> Result<serde_json::Value>;

    async fn handle(
        &self,
        data: &mut serde_json::Value,
        message: &Message,
        ctx: &HandlerContext,
    ) -> Result<()>;
}

struct SagaAdapter<S>(S);

#[async_trait]
impl<S: Saga> ErasedSaga for SagaAdapter<S> {
    fn saga_type(&self) -> &'static str {
        S::SAGA_TYPE
    }

    fn initial_data(&self) -> Result<serde_json::Value> {
        Ok(serde_json::to_value(S::Data::default())?)
    }

    async fn handle(
        &self,
        data: &mut serde_json::Value,
        message: &Message,
        ctx: &HandlerContext,
    ) -> Result<()> {
        let mut typed = S::Data::deserialize(&*data)?;
        self.0
            .handle(&mut typed, message, ctx)
            .await
            .map_err(|source| SagaError::Handler {
                saga_type: S::SAGA_TYPE.to_string(),
                message_type: message.message_type.clone(),
                source,
            })?;
        *data = serde_json::to_value(&typed)?;
        Ok(())
    }
}

/// A message type's rule together with the saga it routes to.
#[derive(Clone)]
pub(crate) struct Route {
    pub(crate) rule: CorrelationRule,
    pub(crate) saga: Arc<dyn ErasedSaga>,
}

/// Static routing table from message type to correlation rule and saga.
///
/// Built once at startup; each message type routes to exactly one saga.
#[derive(Clone, Default)]
pub struct SagaRegistry {
    routes: HashMap<&'static str, Route>,
    saga_types: Vec<&'static str>,
}

impl SagaRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `saga` for every message type it correlates.
    ///
    /// Fails with [`SagaError::Configuration`] if the saga type is already
    /// registered, if it declares no rules, if its rules correlate on more
    /// than one property, or if one of its message types is already routed.
    /// Nothing is registered on failure.
    ///
    /// A saga instance is locked by its single correlation property, so every
    /// message addressing the instance must agree on that property.
    pub fn register<S: Saga>(&mut self, saga: S) -> Result<&mut Self> {
        if self.saga_types.contains(&S::SAGA_TYPE) {
            return Err(SagaError::Configuration(format!(
                "saga type '{}' registered twice",
                S::SAGA_TYPE
            )));
        }

        let mut config = CorrelationConfig::new();
        saga.correlate(&mut config);
        let rules = config.into_rules();
        if rules.is_empty() {
            return Err(SagaError::Configuration(format!(
                "saga '{}' declares no correlation rules",
                S::SAGA_TYPE
            )));
        }

        let property = rules[0].property();
        if let Some(other) = rules.iter().find(|r| r.property() != property) {
            return Err(SagaError::Configuration(format!(
                "saga '{}' correlates on both '{}' and '{}', only one property is supported",
                S::SAGA_TYPE,
                property,
                other.property()
            )));
        }

        for (i, rule) in rules.iter().enumerate() {
            let duplicate_here = rules[..i]
                .iter()
                .any(|r| r.message_type() == rule.message_type());
            if duplicate_here || self.routes.contains_key(rule.message_type()) {
                return Err(SagaError::Configuration(format!(
                    "message type '{}' registered twice (saga '{}')",
                    rule.message_type(),
                    S::SAGA_TYPE
                )));
            }
        }

        if !rules.iter().any(CorrelationRule::initiates) {
            tracing::warn!(
                saga_type = S::SAGA_TYPE,
                "saga has no initiating message type, it can never be created"
            );
        }

        let erased: Arc<dyn ErasedSaga> = Arc::new(SagaAdapter(saga));
        for rule in rules {
            tracing::debug!(
                saga_type = S::SAGA_TYPE,
                message_type = rule.message_type(),
                property = rule.property(),
                initiates = rule.initiates(),
                "registered saga route"
            );
            self.routes.insert(
                rule.message_type(),
                Route {
                    rule,
                    saga: Arc::clone(&erased),
                },
            );
        }
        self.saga_types.push(S::SAGA_TYPE);

        Ok(self)
    }

    /// Maps `message` to the key of the saga instance it addresses.
    ///
    /// Pure and non-blocking. Fails with [`SagaError::Configuration`] when
    /// no saga handles the message type, and with
    /// [`SagaError::Serialization`] when the body does not decode.
    pub fn resolve(&self, message: &Message) -> Result<Resolution> {
        self.route(message).map(|(_, resolution)| resolution)
    }

    pub(crate) fn route(&self, message: &Message) -> Result<(&Route, Resolution)> {
        let route = self
            .routes
            .get(message.message_type.as_str())
            .ok_or_else(|| {
                SagaError::Configuration(format!(
                    "no saga handles message type '{}'",
                    message.message_type
                ))
            })?;

        let resolution = match route.rule.extract(message)? {
            Some(value) => Resolution::Correlated(CorrelationKey::new(
                route.saga.saga_type(),
                route.rule.property(),
                value,
            )),
            None => Resolution::NoCorrelation,
        };
        Ok((route, resolution))
    }

    /// Returns true if a message of `message_type` would be routed.
    pub fn handles(&self, message_type: &str) -> bool {
        self.routes.contains_key(message_type)
    }

    /// Registered saga types, in registration order.
    pub fn saga_types(&self) -> &[&'static str] {
        &self.saga_types
    }

    /// Number of routed message types.
    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }
}

impl std::fmt::Debug for SagaRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut message_types: Vec<_> = self.routes.keys().collect();
        message_types.sort();
        f.debug_struct("SagaRegistry")
            .field("saga_types", &self.saga_types)
            .field("message_types", &message_types)
            .finish()
    }
}
