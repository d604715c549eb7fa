//! Message envelope and identity
//!
//! Every message that flows through Herald is wrapped in an [`Envelope`]:
//! a stable producer-assigned id, a string type tag, the message role
//! (command/query/event), timestamps, correlation metadata, and a JSON
//! payload. Handler resolution is by exact type tag — there is no
//! inheritance-based dispatch and no runtime type scanning.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Stable 128-bit message identity, assigned by the producer at
/// construction time and never recomputed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MessageId(Uuid);

impl MessageId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn nil() -> Self {
        Self(Uuid::nil())
    }

    pub fn is_nil(&self) -> bool {
        self.0.is_nil()
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for MessageId {
    fn default() -> Self {
        Self::new()
    }
}

impl From<Uuid> for MessageId {
    fn from(id: Uuid) -> Self {
        Self(id)
    }
}

impl std::fmt::Display for MessageId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The role a message plays in dispatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MessageKind {
    /// Routed to exactly one handler; zero or one response.
    Command,
    /// Routed to exactly one handler; exactly one response.
    Query,
    /// Routed to zero or more handlers; no return value.
    Event,
}

impl std::fmt::Display for MessageKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MessageKind::Command => write!(f, "command"),
            MessageKind::Query => write!(f, "query"),
            MessageKind::Event => write!(f, "event"),
        }
    }
}

/// Implemented by application payload types so envelopes carry a stable
/// type tag. The tag is the dispatch identity: handlers register against
/// it and the registry resolves by exact match.
pub trait MessagePayload: Serialize {
    /// Stable type discriminator, e.g. `"orders.order-placed"`.
    fn message_type() -> &'static str
    where
        Self: Sized;
}

/// The canonical message shape that flows through dispatchers, queues,
/// the outbox, and the inbox.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    pub id: MessageId,
    /// Exact-match dispatch tag.
    pub message_type: String,
    pub kind: MessageKind,
    pub timestamp: DateTime<Utc>,
    pub correlation_id: Option<String>,
    pub causation_id: Option<String>,
    #[serde(default)]
    pub metadata: HashMap<String, serde_json::Value>,
    pub payload: serde_json::Value,
}

impl Envelope {
    fn new(kind: MessageKind, message_type: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            id: MessageId::new(),
            message_type: message_type.into(),
            kind,
            timestamp: Utc::now(),
            correlation_id: None,
            causation_id: None,
            metadata: HashMap::new(),
            payload,
        }
    }

    /// Wrap a typed command payload.
    pub fn command<T: MessagePayload>(payload: &T) -> Result<Self, serde_json::Error> {
        Ok(Self::new(MessageKind::Command, T::message_type(), serde_json::to_value(payload)?))
    }

    /// Wrap a typed query payload.
    pub fn query<T: MessagePayload>(payload: &T) -> Result<Self, serde_json::Error> {
        Ok(Self::new(MessageKind::Query, T::message_type(), serde_json::to_value(payload)?))
    }

    /// Wrap a typed event payload.
    pub fn event<T: MessagePayload>(payload: &T) -> Result<Self, serde_json::Error> {
        Ok(Self::new(MessageKind::Event, T::message_type(), serde_json::to_value(payload)?))
    }

    /// Build an envelope from raw parts. Used by ingress adapters that
    /// receive the type tag and payload off a transport.
    pub fn from_parts(
        id: MessageId,
        kind: MessageKind,
        message_type: impl Into<String>,
        payload: serde_json::Value,
    ) -> Self {
        Self {
            id,
            message_type: message_type.into(),
            kind,
            timestamp: Utc::now(),
            correlation_id: None,
            causation_id: None,
            metadata: HashMap::new(),
            payload,
        }
    }

    pub fn with_correlation_id(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = Some(correlation_id.into());
        self
    }

    pub fn with_causation_id(mut self, causation_id: impl Into<String>) -> Self {
        self.causation_id = Some(causation_id.into());
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }

    /// Deserialize the payload back into its typed form.
    pub fn payload_as<T: serde::de::DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_value(self.payload.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Serialize, Deserialize, PartialEq, Debug)]
    struct OrderPlaced {
        order_id: String,
    }

    impl MessagePayload for OrderPlaced {
        fn message_type() -> &'static str {
            "orders.order-placed"
        }
    }

    #[test]
    fn envelope_carries_type_tag_and_kind() {
        let envelope = Envelope::event(&OrderPlaced { order_id: "o-1".into() }).unwrap();
        assert_eq!(envelope.message_type, "orders.order-placed");
        assert_eq!(envelope.kind, MessageKind::Event);
        assert!(!envelope.id.is_nil());
    }

    #[test]
    fn payload_round_trips() {
        let payload = OrderPlaced { order_id: "o-2".into() };
        let envelope = Envelope::command(&payload).unwrap();
        let back: OrderPlaced = envelope.payload_as().unwrap();
        assert_eq!(back, payload);
    }

    #[test]
    fn correlation_builders() {
        let envelope = Envelope::event(&OrderPlaced { order_id: "o-3".into() })
            .unwrap()
            .with_correlation_id("corr-1")
            .with_causation_id("cause-1")
            .with_metadata("source", serde_json::json!("api"));
        assert_eq!(envelope.correlation_id.as_deref(), Some("corr-1"));
        assert_eq!(envelope.causation_id.as_deref(), Some("cause-1"));
        assert_eq!(envelope.metadata.get("source"), Some(&serde_json::json!("api")));
    }
}
