//! Error types for the protocol crate.

use thiserror::Error;

/// Protocol error type covering codec, routing and connection failures.
#[derive(Debug, Error)]
pub enum ProtocolError {
    // Codec errors
    /// Failed to serialize an envelope.
    #[error("serialization failed: {0}")]
    Serialization(String),

    /// Failed to parse an envelope.
    #[error("deserialization failed: {0}")]
    Deserialization(String),

    /// The envelope carried a `type` this implementation does not know.
    #[error("unknown message type: {0}")]
    UnknownMessageType(String),

    /// The payload does not match what its message type requires.
    #[error("invalid {kind} payload: {reason}")]
    InvalidPayload {
        /// Wire spelling of the message type.
        kind: &'static str,
        /// What was wrong with the payload.
        reason: String,
    },

    // Signaling errors
    /// A message arrived that the receiving role must never act on.
    #[error("unexpected {kind} message: {reason}")]
    UnexpectedMessage {
        /// Wire spelling of the message type.
        kind: &'static str,
        /// Why the message was rejected.
        reason: String,
    },

    /// A message referenced a peer link that does not exist.
    #[error("unknown peer: {peer_id}")]
    UnknownPeer {
        /// The peer identifier that could not be resolved.
        peer_id: String,
    },

    /// Session description negotiation failed.
    #[error("handshake failed: {0}")]
    HandshakeFailed(String),

    // Connection errors
    /// Connection was closed.
    #[error("connection closed: {0}")]
    ConnectionClosed(String),

    /// Operation timed out.
    #[error("operation timed out: {0}")]
    Timeout(String),

    /// Sending data over a channel or connection failed.
    #[error("transfer failed: {0}")]
    TransferFailed(String),
}

/// Result type alias for protocol operations.
pub type Result<T> = std::result::Result<T, ProtocolError>;

impl From<serde_json::Error> for ProtocolError {
    fn from(err: serde_json::Error) -> Self {
        if err.is_data() || err.is_eof() || err.is_syntax() {
            ProtocolError::Deserialization(err.to_string())
        } else {
            ProtocolError::Serialization(err.to_string())
        }
    }
}

impl From<std::io::Error> for ProtocolError {
    fn from(err: std::io::Error) -> Self {
        use std::io::ErrorKind;
        match err.kind() {
            ErrorKind::TimedOut => ProtocolError::Timeout(err.to_string()),
            ErrorKind::ConnectionReset
            | ErrorKind::ConnectionAborted
            | ErrorKind::BrokenPipe
            | ErrorKind::UnexpectedEof => ProtocolError::ConnectionClosed(err.to_string()),
            _ => ProtocolError::TransferFailed(err.to_string()),
        }
    }
}

impl ProtocolError {
    /// Returns true for errors that mean the underlying connection is gone.
    pub fn is_connection_closed(&self) -> bool {
        matches!(self, ProtocolError::ConnectionClosed(_))
    }
}
