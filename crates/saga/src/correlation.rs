//! Correlation rules: how a message finds its saga instance.

use std::sync::Arc;

use saga_store::CorrelationKey;

use crate::message::{Message, SagaMessage};

type Extractor = Arc<dyn Fn(&Message) -> Result<Option<String>, serde_json::Error> + Send + Sync>;

/// Maps one message type to the saga-data property that stores the
/// comparable key, plus the function that reads that key off the message.
#[derive(Clone)]
pub struct CorrelationRule {
    message_type: &'static str,
    property: String,
    initiates: bool,
    extractor: Extractor,
}

impl CorrelationRule {
    /// The message type this rule applies to.
    pub fn message_type(&self) -> &'static str {
        self.message_type
    }

    /// The saga-data property the extracted value is compared against.
    pub fn property(&self) -> &str {
        &self.property
    }

    /// Returns true if a message of this type may create the saga.
    pub fn initiates(&self) -> bool {
        self.initiates
    }

    /// Reads the correlation value off `message`.
    ///
    /// `Ok(None)` means the message carries no value for this rule.
    pub fn extract(&self, message: &Message) -> Result<Option<String>, serde_json::Error> {
        (self.extractor)(message)
    }
}

impl std::fmt::Debug for CorrelationRule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CorrelationRule")
            .field("message_type", &self.message_type)
            .field("property", &self.property)
            .field("initiates", &self.initiates)
            .finish_non_exhaustive()
    }
}

/// Outcome of resolving a message against its rule.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolution {
    /// The message addresses the saga instance identified by the key.
    Correlated(CorrelationKey),

    /// The rule is partial and yielded no key for this message.
    NoCorrelation,
}

/// Collects the correlation rules a saga declares.
///
/// All rules of one saga must name the same property; the registry rejects
/// a saga that mixes properties.
///
/// ```ignore
/// fn correlate(&self, config: &mut CorrelationConfig) {
///     config
///         .initiated_by::<OrderPlaced>("order_id", |m| m.order_id.clone())
///         .correlate::<PaymentReceived>("order_id", |m| m.order_id.clone());
/// }
/// ```
#[derive(Debug, Default)]
pub struct CorrelationConfig {
    rules: Vec<CorrelationRule>,
}

impl CorrelationConfig {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Declares that `M` starts the saga when no instance exists for its key.
    pub fn initiated_by<M: SagaMessage>(
        &mut self,
        property: impl Into<String>,
        extract: impl Fn(&M) -> String + Send + Sync + 'static,
    ) -> &mut Self {
        self.push::<M>(property.into(), true, move |m| Some(extract(m)))
    }

    /// Declares that `M` continues an existing saga.
    pub fn correlate<M: SagaMessage>(
        &mut self,
        property: impl Into<String>,
        extract: impl Fn(&M) -> String + Send + Sync + 'static,
    ) -> &mut Self {
        self.push::<M>(property.into(), false, move |m| Some(extract(m)))
    }

    /// Declares that `M` continues an existing saga when it carries a key.
    /// Messages for which `extract` returns `None` are not dispatched.
    pub fn correlate_partial<M: SagaMessage>(
        &mut self,
        property: impl Into<String>,
        extract: impl Fn(&M) -> Option<String> + Send + Sync + 'static,
    ) -> &mut Self {
        self.push::<M>(property.into(), false, extract)
    }

    /// The rules declared so far.
    pub fn rules(&self) -> &[CorrelationRule] {
        &self.rules
    }

    pub(crate) fn into_rules(self) -> Vec<CorrelationRule> {
        self.rules
    }

    fn push<M: SagaMessage>(
        &mut self,
        property: String,
        initiates: bool,
        extract: impl Fn(&M) -> Option<String> + Send + Sync + 'static,
    ) -> &mut Self {
        let extractor: Extractor = Arc::new(move |message: &Message| {
            let body = message.body::<M>()?;
            Ok(extract(&body))
        });
        self.rules.push(CorrelationRule {
            message_type: M::MESSAGE_TYPE,
            property,
            initiates,
            extractor,
        });
        self
    }
}
