use serde::{Deserialize, Serialize};

/// Identity of a saga instance as seen from incoming messages.
///
/// A key names the saga type, the saga-data property that holds the
/// correlation value, and the value itself. Two messages that resolve to
/// equal keys address the same saga instance and are serialized by the
/// saga lock for that key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CorrelationKey {
    saga_type: String,
    property: String,
    value: String,
}

impl CorrelationKey {
    /// Creates a key for `saga_type` correlated on `property` = `value`.
    pub fn new(
        saga_type: impl Into<String>,
        property: impl Into<String>,
        value: impl Into<String>,
    ) -> Self {
        Self {
            saga_type: saga_type.into(),
            property: property.into(),
            value: value.into(),
        }
    }

    pub fn saga_type(&self) -> &str {
        &self.saga_type
    }

    pub fn property(&self) -> &str {
        &self.property
    }

    pub fn value(&self) -> &str {
        &self.value
    }
}

impl std::fmt::Display for CorrelationKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}={}", self.saga_type, self.property, self.value)
    }
}
