//! # Packets
//!
//! Structured stanzas as produced by the wire-decoding layer or built by a
//! local sender. A packet is immutable once built; the builder methods
//! consume and return `self`.

use crate::correlation::CorrelationId;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

/// Type tag of a packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PacketKind {
    /// Query expecting a reply.
    Get,
    /// Mutation expecting a reply.
    Set,
    /// Successful reply.
    Result,
    /// Failed reply.
    Error,
    /// Fire-and-forget notification (message).
    Event,
}

impl PacketKind {
    /// `Result` or `Error`.
    #[must_use]
    pub fn is_reply(self) -> bool {
        matches!(self, Self::Result | Self::Error)
    }

    /// `Get` or `Set`.
    #[must_use]
    pub fn is_request(self) -> bool {
        matches!(self, Self::Get | Self::Set)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Get => "get",
            Self::Set => "set",
            Self::Result => "result",
            Self::Error => "error",
            Self::Event => "event",
        }
    }
}

impl fmt::Display for PacketKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single addressable protocol message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Packet {
    correlation_id: CorrelationId,
    #[serde(default)]
    from: String,
    #[serde(default)]
    to: String,
    kind: PacketKind,
    #[serde(default)]
    payload: Value,
}

impl Packet {
    /// Build a packet of any kind with an empty payload.
    pub fn new(kind: PacketKind, correlation_id: impl Into<CorrelationId>) -> Self {
        Self {
            correlation_id: correlation_id.into(),
            from: String::new(),
            to: String::new(),
            kind,
            payload: Value::Null,
        }
    }

    /// Build a `Get` request with a freshly generated correlation id.
    pub fn request(to: impl Into<String>, payload: Value) -> Self {
        Self::new(PacketKind::Get, CorrelationId::generate())
            .with_recipient(to)
            .with_payload(payload)
    }

    pub fn result(correlation_id: impl Into<CorrelationId>) -> Self {
        Self::new(PacketKind::Result, correlation_id)
    }

    pub fn error(correlation_id: impl Into<CorrelationId>) -> Self {
        Self::new(PacketKind::Error, correlation_id)
    }

    pub fn event(correlation_id: impl Into<CorrelationId>) -> Self {
        Self::new(PacketKind::Event, correlation_id)
    }

    /// Result packet answering `request`: same correlation id, addressed
    /// back to the requester.
    pub fn reply_to(request: &Packet) -> Self {
        Self::result(request.correlation_id.clone())
            .with_sender(request.to.clone())
            .with_recipient(request.from.clone())
    }

    #[must_use]
    pub fn with_sender(mut self, from: impl Into<String>) -> Self {
        self.from = from.into();
        self
    }

    #[must_use]
    pub fn with_recipient(mut self, to: impl Into<String>) -> Self {
        self.to = to.into();
        self
    }

    #[must_use]
    pub fn with_kind(mut self, kind: PacketKind) -> Self {
        self.kind = kind;
        self
    }

    #[must_use]
    pub fn with_payload(mut self, payload: Value) -> Self {
        self.payload = payload;
        self
    }

    pub fn correlation_id(&self) -> &CorrelationId {
        &self.correlation_id
    }

    pub fn sender(&self) -> &str {
        &self.from
    }

    pub fn recipient(&self) -> &str {
        &self.to
    }

    pub fn kind(&self) -> PacketKind {
        self.kind
    }

    pub fn payload(&self) -> &Value {
        &self.payload
    }

    pub fn into_payload(self) -> Value {
        self.payload
    }

    /// String field of an object payload.
    pub fn field(&self, name: &str) -> Option<&str> {
        self.payload.get(name).and_then(Value::as_str)
    }

    /// Boolean field of an object payload.
    pub fn flag(&self, name: &str) -> Option<bool> {
        self.payload.get(name).and_then(Value::as_bool)
    }

    /// Error details of an `Error` packet; `None` for any other kind.
    pub fn stanza_error(&self) -> Option<StanzaError> {
        (self.kind == PacketKind::Error).then(|| StanzaError::from_payload(&self.payload))
    }
}

/// Structured view of an error packet's payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StanzaError {
    /// Defined condition, e.g. `not-authorized` or `item-not-found`.
    pub condition: String,
    /// Optional human readable text.
    pub text: Option<String>,
}

impl StanzaError {
    /// Condition used when an error packet carries no condition.
    pub const UNDEFINED_CONDITION: &'static str = "undefined-condition";

    pub fn new(condition: impl Into<String>) -> Self {
        Self {
            condition: condition.into(),
            text: None,
        }
    }

    #[must_use]
    pub fn with_text(mut self, text: impl Into<String>) -> Self {
        self.text = Some(text.into());
        self
    }

    pub fn from_payload(payload: &Value) -> Self {
        let condition = payload
            .get("condition")
            .and_then(Value::as_str)
            .unwrap_or(Self::UNDEFINED_CONDITION)
            .to_string();
        let text = payload
            .get("text")
            .and_then(Value::as_str)
            .map(str::to_string);
        Self { condition, text }
    }

    pub fn to_payload(&self) -> Value {
        match &self.text {
            Some(text) => serde_json::json!({ "condition": self.condition, "text": text }),
            None => serde_json::json!({ "condition": self.condition }),
        }
    }
}

impl fmt::Display for StanzaError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.text {
            Some(text) => write!(f, "{}: {}", self.condition, text),
            None => f.write_str(&self.condition),
        }
    }
}
