use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{CorrelationKey, Revision, SagaId};

/// Persisted state of one saga.
///
/// The payload is owned by the saga's handler logic and is opaque to the
/// store apart from correlation lookups, which read the correlation
/// property out of it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SagaInstance {
    id: SagaId,
    correlation: CorrelationKey,
    revision: Revision,
    payload: serde_json::Value,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl SagaInstance {
    /// Creates a new, not yet persisted instance at revision 0.
    ///
    /// The correlation value is written into the payload under the
    /// correlation property so later lookups by the same key find it.
    pub fn new(correlation: CorrelationKey, mut payload: serde_json::Value) -> Self {
        stamp_correlation(&correlation, &mut payload);
        let now = Utc::now();
        Self {
            id: SagaId::new(),
            correlation,
            revision: Revision::initial(),
            payload,
            created_at: now,
            updated_at: now,
        }
    }

    /// Rebuilds an instance read from a backend. Intended for store backends.
    pub fn restore(
        id: SagaId,
        correlation: CorrelationKey,
        revision: Revision,
        payload: serde_json::Value,
        created_at: DateTime<Utc>,
        updated_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id,
            correlation,
            revision,
            payload,
            created_at,
            updated_at,
        }
    }

    pub fn id(&self) -> SagaId {
        self.id
    }

    /// The key the instance was created for.
    pub fn correlation(&self) -> &CorrelationKey {
        &self.correlation
    }

    pub fn saga_type(&self) -> &str {
        self.correlation.saga_type()
    }

    pub fn revision(&self) -> Revision {
        self.revision
    }

    /// Returns true if the instance has never been saved.
    pub fn is_new(&self) -> bool {
        self.revision == Revision::initial()
    }

    pub fn payload(&self) -> &serde_json::Value {
        &self.payload
    }

    /// Replaces the payload. The correlation property keeps the value the
    /// instance was created with.
    pub fn set_payload(&mut self, mut payload: serde_json::Value) {
        stamp_correlation(&self.correlation, &mut payload);
        self.payload = payload;
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn updated_at(&self) -> DateTime<Utc> {
        self.updated_at
    }

    /// Returns true if this instance is addressed by `key`.
    pub fn matches(&self, key: &CorrelationKey) -> bool {
        &self.correlation == key
    }

    /// Records a successful save. Intended for store backends.
    pub fn mark_persisted(&mut self, revision: Revision, at: DateTime<Utc>) {
        self.revision = revision;
        self.updated_at = at;
    }
}

/// Writes the correlation value into an object payload, keeping the JSON
/// type of an existing field when the value parses as that type.
fn stamp_correlation(correlation: &CorrelationKey, payload: &mut serde_json::Value) {
    let Some(object) = payload.as_object_mut() else {
        return;
    };
    let raw = correlation.value();
    let value = match object.get(correlation.property()) {
        Some(serde_json::Value::Number(_)) => raw
            .parse::<serde_json::Number>()
            .map(serde_json::Value::Number)
            .unwrap_or_else(|_| serde_json::Value::String(raw.to_string())),
        Some(serde_json::Value::Bool(_)) => raw
            .parse::<bool>()
            .map(serde_json::Value::Bool)
            .unwrap_or_else(|_| serde_json::Value::String(raw.to_string())),
        _ => serde_json::Value::String(raw.to_string()),
    };
    object.insert(correlation.property().to_string(), value);
}
