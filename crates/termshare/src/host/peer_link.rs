//! One viewer's link as seen by the host.

use std::fmt;
use std::sync::Arc;

use protocol::PeerId;
use tokio::sync::oneshot;

use crate::network::{ChannelKind, DataChannel, PeerState, PeerTransport};

/// Lifecycle of a peer link.
///
/// `New -> Negotiating -> Connected`, then one of the two terminal states.
/// Any live state may jump straight to `Disconnected` or `Closed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    New,
    Negotiating,
    Connected,
    Disconnected,
    Closed,
}

impl LinkState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, LinkState::Disconnected | LinkState::Closed)
    }

    /// The state a transport report moves this link to, if it moves at all.
    pub fn next(self, reported: PeerState) -> Option<LinkState> {
        if self.is_terminal() {
            return None;
        }
        let next = match reported {
            PeerState::Connected => LinkState::Connected,
            PeerState::Disconnected | PeerState::Failed => LinkState::Disconnected,
            PeerState::Closed => LinkState::Closed,
            PeerState::New | PeerState::Connecting => return None,
        };
        (next != self).then_some(next)
    }
}

impl fmt::Display for LinkState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            LinkState::New => "new",
            LinkState::Negotiating => "negotiating",
            LinkState::Connected => "connected",
            LinkState::Disconnected => "disconnected",
            LinkState::Closed => "closed",
        };
        f.write_str(s)
    }
}

/// A negotiated (or negotiating) connection to a single viewer.
pub struct PeerLink {
    peer_id: PeerId,
    state: LinkState,
    transport: Arc<dyn PeerTransport>,
    data: Option<Arc<dyn DataChannel>>,
    control: Option<Arc<dyn DataChannel>>,
    /// Dropping the link drops this sender, which ends the link's event loop.
    _stop: oneshot::Sender<()>,
}

impl PeerLink {
    pub fn new(peer_id: PeerId, transport: Arc<dyn PeerTransport>, stop: oneshot::Sender<()>) -> Self {
        Self {
            peer_id,
            state: LinkState::New,
            transport,
            data: None,
            control: None,
            _stop: stop,
        }
    }

    pub fn peer_id(&self) -> &PeerId {
        &self.peer_id
    }

    pub fn state(&self) -> LinkState {
        self.state
    }

    pub fn transport(&self) -> Arc<dyn PeerTransport> {
        self.transport.clone()
    }

    /// Marks the answer as sent.
    pub fn set_negotiating(&mut self) {
        if self.state == LinkState::New {
            self.state = LinkState::Negotiating;
        }
    }

    /// Applies a transport state report, returning the new state on a change.
    pub fn apply(&mut self, reported: PeerState) -> Option<LinkState> {
        let next = self.state.next(reported)?;
        tracing::debug!(peer_id = %self.peer_id, from = %self.state, to = %next, "Link state changed");
        self.state = next;
        Some(next)
    }

    /// Records a sub-channel that finished opening.
    pub fn attach(&mut self, channel: Arc<dyn DataChannel>) {
        match channel.kind() {
            ChannelKind::Data => self.data = Some(channel),
            ChannelKind::Control => self.control = Some(channel),
        }
    }

    pub fn data_channel(&self) -> Option<Arc<dyn DataChannel>> {
        self.data.clone()
    }

    pub fn control_channel(&self) -> Option<Arc<dyn DataChannel>> {
        self.control.clone()
    }

    /// Closes both sub-channels and the transport.
    pub async fn close(mut self, state: LinkState) {
        self.state = state;
        for channel in [self.data.take(), self.control.take()].into_iter().flatten() {
            if let Err(e) = channel.close().await {
                tracing::debug!(peer_id = %self.peer_id, error = %e, "Channel close failed");
            }
        }
        if let Err(e) = self.transport.close().await {
            tracing::debug!(peer_id = %self.peer_id, error = %e, "Transport close failed");
        }
        tracing::info!(peer_id = %self.peer_id, state = %self.state, "Peer link removed");
    }
}
