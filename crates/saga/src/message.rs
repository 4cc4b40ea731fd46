//! Inbound messages.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use common::MessageId;
use serde::{Deserialize, Serialize, de::DeserializeOwned};

/// A typed message body that sagas can correlate on and handle.
///
/// `MESSAGE_TYPE` is the tag the registry routes on; it must be unique
/// across every saga registered with one dispatcher.
pub trait SagaMessage: Serialize + DeserializeOwned + Send + Sync + 'static {
    const MESSAGE_TYPE: &'static str;
}

/// A message as delivered by the inbound source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    /// Unique identifier for this message.
    pub id: MessageId,

    /// Routing tag (e.g., "OrderPlaced", "PaymentReceived").
    pub message_type: String,

    /// When the message was sent.
    pub sent_at: DateTime<Utc>,

    /// The message body as JSON.
    pub payload: serde_json::Value,

    /// Transport headers.
    #[serde(default)]
    pub headers: HashMap<String, String>,
}

impl Message {
    /// Creates a new message builder.
    pub fn builder() -> MessageBuilder {
        MessageBuilder::default()
    }

    /// Wraps a typed body, tagging it with its message type.
    pub fn from_body<M: SagaMessage>(body: &M) -> Result<Self, serde_json::Error> {
        Ok(Self {
            id: MessageId::new(),
            message_type: M::MESSAGE_TYPE.to_string(),
            sent_at: Utc::now(),
            payload: serde_json::to_value(body)?,
            headers: HashMap::new(),
        })
    }

    /// Returns true if this message carries an `M`.
    pub fn is<M: SagaMessage>(&self) -> bool {
        self.message_type == M::MESSAGE_TYPE
    }

    /// Decodes the body as `M`.
    pub fn body<M: SagaMessage>(&self) -> Result<M, serde_json::Error> {
        M::deserialize(&self.payload)
    }
}

/// Builder for constructing messages.
#[derive(Debug, Default)]
pub struct MessageBuilder {
    id: Option<MessageId>,
    message_type: Option<String>,
    sent_at: Option<DateTime<Utc>>,
    payload: Option<serde_json::Value>,
    headers: HashMap<String, String>,
}

impl MessageBuilder {
    /// Sets the message ID. If not set, a new ID will be generated.
    pub fn id(mut self, id: MessageId) -> Self {
        self.id = Some(id);
        self
    }

    /// Sets the message type.
    pub fn message_type(mut self, message_type: impl Into<String>) -> Self {
        self.message_type = Some(message_type.into());
        self
    }

    /// Sets the send time. If not set, the current time will be used.
    pub fn sent_at(mut self, sent_at: DateTime<Utc>) -> Self {
        self.sent_at = Some(sent_at);
        self
    }

    /// Sets the payload from a serializable value.
    pub fn payload<T: Serialize>(mut self, payload: &T) -> Result<Self, serde_json::Error> {
        self.payload = Some(serde_json::to_value(payload)?);
        Ok(self)
    }

    /// Sets the payload from a raw JSON value.
    pub fn payload_raw(mut self, payload: serde_json::Value) -> Self {
        self.payload = Some(payload);
        self
    }

    /// Adds a header.
    pub fn header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(key.into(), value.into());
        self
    }

    /// Builds the message, returning None if the message type or payload
    /// is missing.
    pub fn try_build(self) -> Option<Message> {
        Some(Message {
            id: self.id.unwrap_or_default(),
            message_type: self.message_type?,
            sent_at: self.sent_at.unwrap_or_else(Utc::now),
            payload: self.payload?,
            headers: self.headers,
        })
    }
}
