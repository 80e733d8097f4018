//! Peer transport abstraction.
//!
//! The host and viewer sessions never touch the WebRTC API directly. They talk
//! to a [`PeerTransport`] and receive everything the transport reports as
//! [`TransportEvent`]s on a queue owned by the session, so all state changes
//! happen inside the session's own event loop instead of inside callbacks.

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use bytes::Bytes;
use protocol::error::Result;
use tokio::sync::mpsc;

use super::ChannelKind;

/// Connection state reported by a peer transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerState {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

impl PeerState {
    /// Returns true for the states after which the link is never used again.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            PeerState::Disconnected | PeerState::Failed | PeerState::Closed
        )
    }
}

/// Everything a transport can report to its owner.
pub enum TransportEvent {
    /// A local ICE candidate, serialized as a candidate init JSON object.
    LocalCandidate(String),
    /// The peer connection changed state.
    StateChanged(PeerState),
    /// A sub-channel finished opening and can carry data.
    ChannelOpen(Arc<dyn DataChannel>),
    /// A message arrived on a sub-channel.
    ChannelMessage { kind: ChannelKind, data: Bytes },
}

impl fmt::Debug for TransportEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportEvent::LocalCandidate(c) => f.debug_tuple("LocalCandidate").field(c).finish(),
            TransportEvent::StateChanged(s) => f.debug_tuple("StateChanged").field(s).finish(),
            TransportEvent::ChannelOpen(ch) => {
                f.debug_tuple("ChannelOpen").field(&ch.kind()).finish()
            }
            TransportEvent::ChannelMessage { kind, data } => f
                .debug_struct("ChannelMessage")
                .field("kind", kind)
                .field("len", &data.len())
                .finish(),
        }
    }
}

/// One sub-channel of a peer link.
pub trait DataChannel: Send + Sync {
    /// Which logical channel this is.
    fn kind(&self) -> ChannelKind;

    /// Sends one message.
    fn send<'a>(&'a self, data: &'a [u8]) -> Pin<Box<dyn Future<Output = Result<()>> + Send + 'a>>;

    /// Closes the channel.
    fn close(&self) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>>;
}

/// A negotiated point-to-point connection to one remote peer.
///
/// Session descriptions and candidates cross this boundary as the JSON strings
/// carried in envelopes, so callers never depend on the transport's types.
pub trait PeerTransport: Send + Sync {
    /// Creates an offer, sets it as the local description and returns it.
    fn create_offer(&self) -> Pin<Box<dyn Future<Output = Result<String>> + Send + '_>>;

    /// Creates an answer, sets it as the local description and returns it.
    fn create_answer(&self) -> Pin<Box<dyn Future<Output = Result<String>> + Send + '_>>;

    /// Applies the remote peer's session description.
    fn set_remote_description<'a>(
        &'a self,
        sdp: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + 'a>>;

    /// Applies a remote ICE candidate.
    fn add_ice_candidate<'a>(
        &'a self,
        candidate: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + 'a>>;

    /// Creates a sub-channel. A [`TransportEvent::ChannelOpen`] follows once it opens.
    fn create_data_channel(
        &self,
        kind: ChannelKind,
    ) -> Pin<Box<dyn Future<Output = Result<Arc<dyn DataChannel>>> + Send + '_>>;

    /// Closes the connection and every channel on it.
    fn close(&self) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>>;
}

/// Builds transports wired to an event queue.
pub trait TransportFactory: Send + Sync {
    /// Creates a transport that reports into `events`.
    fn create(
        &self,
        events: mpsc::Sender<TransportEvent>,
    ) -> Pin<Box<dyn Future<Output = Result<Arc<dyn PeerTransport>>> + Send + '_>>;
}
