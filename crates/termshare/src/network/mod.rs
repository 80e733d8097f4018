//! Network module.
//!
//! This module provides:
//! - The relay connection adapter used by hosts, viewers and the relay itself
//! - The peer transport abstraction and its WebRTC implementation

pub mod connection;
pub mod transport;
pub mod webrtc;

/// The logical sub-channels of one peer link.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChannelKind {
    /// Raw terminal bytes: keystrokes toward the host, screen output toward the viewer.
    Data,
    /// Control envelopes: window size updates and refresh requests.
    Control,
}

impl ChannelKind {
    /// Returns the label used when creating the data channel.
    pub fn label(&self) -> &'static str {
        match self {
            ChannelKind::Data => "data",
            ChannelKind::Control => "config",
        }
    }

    /// Maps a remote data channel label back to its kind.
    pub fn from_label(label: &str) -> Option<Self> {
        match label {
            "data" => Some(ChannelKind::Data),
            "config" => Some(ChannelKind::Control),
            _ => None,
        }
    }
}

// Re-export key types
pub use connection::{Heartbeat, RelayConfig, RelayConnection, RelayHandle, RelayInbound};
pub use transport::{DataChannel, PeerState, PeerTransport, TransportEvent, TransportFactory};
pub use webrtc::{IceServer, WebRtcConfig, WebRtcTransportFactory};
