//! Signaling envelope exchanged between hosts, viewers and the relay.
//!
//! Every message on the relay connection and on a peer's config channel is a
//! JSON object of the form:
//!
//! ```json
//! {"type": "offer", "payload": "<sdp json>", "from": "<peer id>", "to": "host"}
//! ```
//!
//! The payload encoding is fixed by `type`. Decoding an unknown `type` yields
//! [`ProtocolError::UnknownMessageType`] so the caller can decide whether to
//! ignore the message.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::error::{ProtocolError, Result};
use crate::geometry::WindowSize;

/// Sentinel peer identifier used by the host role.
pub const HOST_PEER_ID: &str = "host";

/// Opaque identifier of one participant in a session.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PeerId(String);

impl PeerId {
    /// Wraps an existing identifier.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Mints a fresh, globally unique identifier.
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    /// The identifier the host uses for itself.
    pub fn host() -> Self {
        Self(HOST_PEER_ID.to_string())
    }

    /// Returns true if this is the host sentinel.
    pub fn is_host(&self) -> bool {
        self.0 == HOST_PEER_ID
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for PeerId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

impl From<String> for PeerId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

/// The closed set of message types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageKind {
    Offer,
    Answer,
    IceCandidate,
    WindowSizeUpdate,
    RefreshRequest,
    KeepalivePing,
}

impl MessageKind {
    /// Every message kind, in wire-table order.
    pub const ALL: [MessageKind; 6] = [
        MessageKind::Offer,
        MessageKind::Answer,
        MessageKind::IceCandidate,
        MessageKind::WindowSizeUpdate,
        MessageKind::RefreshRequest,
        MessageKind::KeepalivePing,
    ];

    /// Returns the exact wire spelling of this type.
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageKind::Offer => "offer",
            MessageKind::Answer => "answer",
            MessageKind::IceCandidate => "ice-candidate",
            MessageKind::WindowSizeUpdate => "window-size-update",
            MessageKind::RefreshRequest => "refresh-request",
            MessageKind::KeepalivePing => "keepalive-ping",
        }
    }

    /// Parses a wire spelling. Matching is exact.
    pub fn from_wire(value: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|kind| kind.as_str() == value)
    }
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A decoded message with its typed payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    /// Serialized session description offered by a viewer.
    Offer { sdp: String },
    /// Serialized session description answered by the host.
    Answer { sdp: String },
    /// Serialized ICE candidate init object.
    IceCandidate { candidate: String },
    /// The host terminal's current size.
    WindowSizeUpdate(WindowSize),
    /// Ask the host to redraw its screen.
    RefreshRequest,
    /// Relay keep-alive; carries nothing.
    KeepalivePing,
}

impl Message {
    pub fn kind(&self) -> MessageKind {
        match self {
            Message::Offer { .. } => MessageKind::Offer,
            Message::Answer { .. } => MessageKind::Answer,
            Message::IceCandidate { .. } => MessageKind::IceCandidate,
            Message::WindowSizeUpdate(_) => MessageKind::WindowSizeUpdate,
            Message::RefreshRequest => MessageKind::RefreshRequest,
            Message::KeepalivePing => MessageKind::KeepalivePing,
        }
    }

    fn payload(&self) -> Result<Value> {
        Ok(match self {
            Message::Offer { sdp } | Message::Answer { sdp } => Value::String(sdp.clone()),
            Message::IceCandidate { candidate } => Value::String(candidate.clone()),
            Message::WindowSizeUpdate(size) => serde_json::to_value(size)?,
            Message::RefreshRequest | Message::KeepalivePing => Value::Null,
        })
    }

    fn from_payload(kind: MessageKind, payload: Value) -> Result<Self> {
        let string_payload = |payload: Value| match payload {
            Value::String(s) => Ok(s),
            other => Err(ProtocolError::InvalidPayload {
                kind: kind.as_str(),
                reason: format!("expected a string, got {}", json_type_name(&other)),
            }),
        };

        Ok(match kind {
            MessageKind::Offer => Message::Offer {
                sdp: string_payload(payload)?,
            },
            MessageKind::Answer => Message::Answer {
                sdp: string_payload(payload)?,
            },
            MessageKind::IceCandidate => Message::IceCandidate {
                candidate: string_payload(payload)?,
            },
            MessageKind::WindowSizeUpdate => {
                let size = serde_json::from_value(payload).map_err(|e| {
                    ProtocolError::InvalidPayload {
                        kind: kind.as_str(),
                        reason: e.to_string(),
                    }
                })?;
                Message::WindowSizeUpdate(size)
            }
            MessageKind::RefreshRequest => Message::RefreshRequest,
            MessageKind::KeepalivePing => Message::KeepalivePing,
        })
    }
}

fn json_type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

/// An addressed, typed message.
///
/// `from` and `to` are optional on the wire; `to` absent means the relay
/// broadcasts to every other member of the session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    pub message: Message,
    pub from: Option<PeerId>,
    pub to: Option<PeerId>,
}

/// Wire shape of an envelope.
#[derive(Debug, Serialize, Deserialize)]
struct WireEnvelope {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    payload: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    from: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    to: Option<String>,
}

impl Envelope {
    /// Creates an unaddressed envelope.
    pub fn new(message: Message) -> Self {
        Self {
            message,
            from: None,
            to: None,
        }
    }

    /// Sets the sender.
    pub fn with_from(mut self, from: PeerId) -> Self {
        self.from = Some(from);
        self
    }

    /// Sets the single recipient.
    pub fn with_to(mut self, to: PeerId) -> Self {
        self.to = Some(to);
        self
    }

    pub fn kind(&self) -> MessageKind {
        self.message.kind()
    }

    /// Returns true if this envelope is addressed to `peer`.
    pub fn is_addressed_to(&self, peer: &PeerId) -> bool {
        self.to.as_ref() == Some(peer)
    }

    /// Encodes the envelope as a JSON string.
    pub fn encode(&self) -> Result<String> {
        let wire = WireEnvelope {
            kind: self.kind().as_str().to_string(),
            payload: self.message.payload()?,
            from: self.from.as_ref().map(|p| p.to_string()),
            to: self.to.as_ref().map(|p| p.to_string()),
        };
        serde_json::to_string(&wire).map_err(|e| ProtocolError::Serialization(e.to_string()))
    }

    /// Decodes an envelope from JSON bytes.
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let wire: WireEnvelope = serde_json::from_slice(bytes)
            .map_err(|e| ProtocolError::Deserialization(e.to_string()))?;

        let kind = MessageKind::from_wire(&wire.kind)
            .ok_or_else(|| ProtocolError::UnknownMessageType(wire.kind.clone()))?;

        Ok(Self {
            message: Message::from_payload(kind, wire.payload)?,
            from: non_empty(wire.from),
            to: non_empty(wire.to),
        })
    }

    /// Decodes an envelope from a JSON string.
    pub fn decode_str(text: &str) -> Result<Self> {
        Self::decode(text.as_bytes())
    }
}

fn non_empty(id: Option<String>) -> Option<PeerId> {
    id.filter(|s| !s.is_empty()).map(PeerId::from)
}
