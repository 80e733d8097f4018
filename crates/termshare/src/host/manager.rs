//! Host session manager.
//!
//! Owns the PTY and one [`PeerLink`] per viewer. Viewers are discovered through
//! offers arriving on the relay connection; each link then runs its own event
//! loop fed by the transport, so link state only ever changes inside that loop
//! or during host shutdown.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::future::join_all;
use protocol::{Envelope, Message, PeerId, ProtocolError, Result};
use tokio::sync::{mpsc, oneshot, Mutex, RwLock};

use super::peer_link::{LinkState, PeerLink};
use super::HostConfig;
use crate::network::{
    ChannelKind, DataChannel, PeerTransport, RelayHandle, RelayInbound, TransportEvent,
    TransportFactory,
};
use crate::pty::PtyDevice;

/// Capacity of each link's transport event queue.
const LINK_EVENT_CAPACITY: usize = 256;

/// Multiplexes one PTY across every connected viewer.
#[derive(Clone)]
pub struct HostSession {
    config: HostConfig,
    host_id: PeerId,
    pty: Arc<dyn PtyDevice>,
    relay: RelayHandle,
    factory: Arc<dyn TransportFactory>,
    links: Arc<RwLock<HashMap<PeerId, PeerLink>>>,
    /// Held for each viewer write so keystroke chunks from different viewers never mix.
    input: Arc<Mutex<()>>,
    shutting_down: Arc<AtomicBool>,
}

impl HostSession {
    pub fn new(
        config: HostConfig,
        pty: Arc<dyn PtyDevice>,
        relay: RelayHandle,
        factory: Arc<dyn TransportFactory>,
    ) -> Self {
        Self {
            config,
            host_id: PeerId::host(),
            pty,
            relay,
            factory,
            links: Arc::new(RwLock::new(HashMap::new())),
            input: Arc::new(Mutex::new(())),
            shutting_down: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Handles envelopes from the relay until the relay connection closes.
    pub async fn run_relay(&self, mut inbound: RelayInbound) {
        while let Some(envelope) = inbound.recv().await {
            self.handle_envelope(envelope).await;
        }
        tracing::info!("Relay connection ended");
    }

    /// Handles one envelope from the relay. Errors only affect the sender.
    pub async fn handle_envelope(&self, envelope: Envelope) {
        if let Some(to) = &envelope.to {
            if *to != self.host_id {
                tracing::debug!(to = %to, kind = %envelope.kind(), "Skipping envelope for another peer");
                return;
            }
        }

        let kind = envelope.kind();
        let result = match (envelope.message, envelope.from) {
            (Message::KeepalivePing, _) => {
                tracing::trace!("Keep-alive from relay member");
                Ok(())
            }
            (Message::Offer { sdp }, Some(from)) => self.accept_offer(from, &sdp).await,
            (Message::IceCandidate { candidate }, Some(from)) => {
                self.apply_candidate(&from, &candidate).await
            }
            (Message::Offer { .. } | Message::IceCandidate { .. }, None) => {
                Err(ProtocolError::UnexpectedMessage {
                    kind: kind.as_str(),
                    reason: "missing sender".to_string(),
                })
            }
            (_, _) => Err(ProtocolError::UnexpectedMessage {
                kind: kind.as_str(),
                reason: "not handled by the host".to_string(),
            }),
        };

        if let Err(e) = result {
            tracing::warn!(kind = %kind, error = %e, "Discarding envelope");
        }
    }

    /// Creates a link for a new viewer and answers its offer.
    ///
    /// A failure aborts only this link; nothing else is affected.
    pub async fn accept_offer(&self, peer_id: PeerId, sdp: &str) -> Result<()> {
        if self.shutting_down.load(Ordering::SeqCst) {
            return Err(ProtocolError::ConnectionClosed("host is shutting down".to_string()));
        }
        if self.links.read().await.contains_key(&peer_id) {
            return Err(ProtocolError::UnexpectedMessage {
                kind: "offer",
                reason: format!("peer {} already has a link", peer_id),
            });
        }

        tracing::info!(peer_id = %peer_id, "New viewer");

        let (events_tx, events_rx) = mpsc::channel(LINK_EVENT_CAPACITY);
        let transport = self.factory.create(events_tx).await?;

        let (stop_tx, stop_rx) = oneshot::channel();
        self.links.write().await.insert(
            peer_id.clone(),
            PeerLink::new(peer_id.clone(), transport.clone(), stop_tx),
        );

        // The event loop starts only once the answer is out, so a candidate
        // gathered while answering waits in the queue instead of overtaking it.
        match self.answer(&peer_id, transport.as_ref(), sdp).await {
            Ok(()) => {
                if let Some(link) = self.links.write().await.get_mut(&peer_id) {
                    link.set_negotiating();
                }
                tokio::spawn(self.clone().run_link(peer_id, events_rx, stop_rx));
                Ok(())
            }
            Err(e) => {
                self.remove_link(&peer_id, LinkState::Closed).await;
                Err(e)
            }
        }
    }

    async fn answer(&self, peer_id: &PeerId, transport: &dyn PeerTransport, offer: &str) -> Result<()> {
        transport.set_remote_description(offer).await?;
        let answer = transport.create_answer().await?;

        let envelope = Envelope::new(Message::Answer { sdp: answer })
            .with_from(self.host_id.clone())
            .with_to(peer_id.clone());
        self.relay.send(envelope).await?;

        tracing::debug!(peer_id = %peer_id, "Sent answer");
        Ok(())
    }

    async fn apply_candidate(&self, peer_id: &PeerId, candidate: &str) -> Result<()> {
        let transport = self
            .links
            .read()
            .await
            .get(peer_id)
            .map(|link| link.transport())
            .ok_or_else(|| ProtocolError::UnknownPeer {
                peer_id: peer_id.to_string(),
            })?;
        transport.add_ice_candidate(candidate).await
    }

    /// Consumes one link's transport events until the link is removed.
    async fn run_link(
        self,
        peer_id: PeerId,
        mut events: mpsc::Receiver<TransportEvent>,
        mut stop: oneshot::Receiver<()>,
    ) {
        loop {
            tokio::select! {
                _ = &mut stop => break,
                event = events.recv() => {
                    let Some(event) = event else { break };
                    self.handle_transport_event(&peer_id, event).await;
                }
            }
        }
        tracing::debug!(peer_id = %peer_id, "Link event loop finished");
    }

    /// Applies one transport event to a link.
    pub async fn handle_transport_event(&self, peer_id: &PeerId, event: TransportEvent) {
        match event {
            TransportEvent::LocalCandidate(candidate) => {
                let envelope = Envelope::new(Message::IceCandidate { candidate })
                    .with_from(self.host_id.clone())
                    .with_to(peer_id.clone());
                if let Err(e) = self.relay.send(envelope).await {
                    tracing::debug!(peer_id = %peer_id, error = %e, "Could not send local candidate");
                }
            }
            TransportEvent::StateChanged(reported) => {
                let changed = self
                    .links
                    .write()
                    .await
                    .get_mut(peer_id)
                    .and_then(|link| link.apply(reported));

                match changed {
                    Some(LinkState::Connected) => {
                        tracing::info!(peer_id = %peer_id, "Viewer connected");
                        let session = self.clone();
                        let peer_id = peer_id.clone();
                        tokio::spawn(async move {
                            session.deliver_window_size(&peer_id).await;
                        });
                    }
                    Some(state) if state.is_terminal() => {
                        self.remove_link(peer_id, state).await;
                    }
                    _ => {}
                }
            }
            TransportEvent::ChannelOpen(channel) => {
                let kind = channel.kind();
                let attached = match self.links.write().await.get_mut(peer_id) {
                    Some(link) => {
                        link.attach(channel);
                        true
                    }
                    None => false,
                };
                if !attached {
                    return;
                }
                tracing::debug!(peer_id = %peer_id, channel = kind.label(), "Sub-channel open");

                if kind == ChannelKind::Data {
                    // The new viewer gets the current screen, not just future output.
                    self.refresh_pty().await;
                }
            }
            TransportEvent::ChannelMessage {
                kind: ChannelKind::Data,
                data,
            } => {
                let _input = self.input.lock().await;
                if let Err(e) = self.pty.write(&data).await {
                    tracing::warn!(peer_id = %peer_id, error = %e, "PTY write failed");
                }
            }
            TransportEvent::ChannelMessage {
                kind: ChannelKind::Control,
                data,
            } => match Envelope::decode(&data) {
                Ok(envelope) => match envelope.message {
                    Message::RefreshRequest => self.refresh_pty().await,
                    other => {
                        tracing::debug!(peer_id = %peer_id, kind = %other.kind(), "Unhandled control message")
                    }
                },
                Err(e) => tracing::warn!(peer_id = %peer_id, error = %e, "Bad control message"),
            },
        }
    }

    async fn refresh_pty(&self) {
        if let Err(e) = self.pty.refresh().await {
            tracing::warn!(error = %e, "PTY refresh failed");
        }
    }

    /// Writes a chunk of PTY output to every viewer with an open data channel.
    ///
    /// Returns the number of viewers the chunk reached. A failing viewer is
    /// logged and skipped.
    pub async fn broadcast_output(&self, chunk: &[u8]) -> usize {
        let targets: Vec<(PeerId, Arc<dyn DataChannel>)> = self
            .links
            .read()
            .await
            .values()
            .filter(|link| !link.state().is_terminal())
            .filter_map(|link| link.data_channel().map(|ch| (link.peer_id().clone(), ch)))
            .collect();

        let sends = targets.iter().map(|(peer_id, channel)| async move {
            match channel.send(chunk).await {
                Ok(()) => true,
                Err(e) => {
                    tracing::debug!(peer_id = %peer_id, error = %e, "Output send failed");
                    false
                }
            }
        });

        join_all(sends).await.into_iter().filter(|sent| *sent).count()
    }

    /// Sends the current PTY size to one viewer.
    ///
    /// The viewer's config channel may open a little after the link reports
    /// itself connected, so delivery is retried at a fixed interval. Gives up
    /// after the configured number of attempts or once the link is gone.
    pub async fn deliver_window_size(&self, peer_id: &PeerId) -> bool {
        for attempt in 1..=self.config.winsize_retry_attempts {
            let control = match self.links.read().await.get(peer_id) {
                Some(link) => link.control_channel(),
                None => return false,
            };

            if let Some(control) = control {
                let size = self.pty.size();
                let envelope = Envelope::new(Message::WindowSizeUpdate(size))
                    .with_from(self.host_id.clone())
                    .with_to(peer_id.clone());
                match envelope.encode() {
                    Ok(json) => match control.send(json.as_bytes()).await {
                        Ok(()) => {
                            tracing::debug!(peer_id = %peer_id, %size, attempt, "Sent window size");
                            return true;
                        }
                        Err(e) => tracing::debug!(peer_id = %peer_id, error = %e, attempt, "Window size send failed"),
                    },
                    Err(e) => {
                        tracing::warn!(error = %e, "Could not encode window size");
                        return false;
                    }
                }
            }

            tokio::time::sleep(self.config.winsize_retry_interval).await;
        }

        tracing::warn!(peer_id = %peer_id, "Gave up sending window size");
        false
    }

    /// Resizes the PTY to the host terminal and tells every connected viewer.
    pub async fn on_local_resize(&self, size: protocol::WindowSize) {
        if let Err(e) = self.pty.resize(size).await {
            tracing::warn!(error = %e, %size, "PTY resize failed");
            return;
        }

        let connected: Vec<PeerId> = self
            .links
            .read()
            .await
            .values()
            .filter(|link| link.state() == LinkState::Connected)
            .map(|link| link.peer_id().clone())
            .collect();

        for peer_id in connected {
            let session = self.clone();
            tokio::spawn(async move {
                session.deliver_window_size(&peer_id).await;
            });
        }
    }

    /// Broadcasts one keep-alive through the relay.
    pub async fn send_keepalive(&self) -> Result<()> {
        self.relay
            .send(Envelope::new(Message::KeepalivePing).with_from(self.host_id.clone()))
            .await
    }

    /// Sends keep-alives until the relay connection closes.
    ///
    /// The first one goes out immediately so the relay learns the host early.
    pub async fn run_keepalive(&self) {
        let mut ticker = tokio::time::interval(self.config.keepalive_interval);
        loop {
            ticker.tick().await;
            if let Err(e) = self.send_keepalive().await {
                tracing::debug!(error = %e, "Keep-alive stopped");
                break;
            }
        }
    }

    async fn remove_link(&self, peer_id: &PeerId, state: LinkState) {
        let link = self.links.write().await.remove(peer_id);
        if let Some(link) = link {
            link.close(state).await;
        }
    }

    /// Closes every link. Later calls do nothing.
    pub async fn shutdown(&self) {
        if self.shutting_down.swap(true, Ordering::SeqCst) {
            return;
        }

        let links: Vec<PeerLink> = self.links.write().await.drain().map(|(_, link)| link).collect();
        tracing::info!(count = links.len(), "Closing peer links");
        join_all(links.into_iter().map(|link| link.close(LinkState::Closed))).await;
    }

    pub async fn link_count(&self) -> usize {
        self.links.read().await.len()
    }

    /// Resolves once no viewer has a link, checking every `poll`.
    pub async fn wait_until_idle(&self, poll: Duration) {
        let mut ticker = tokio::time::interval(poll);
        loop {
            ticker.tick().await;
            if self.link_count().await == 0 {
                return;
            }
        }
    }

    pub async fn link_state(&self, peer_id: &PeerId) -> Option<LinkState> {
        self.links.read().await.get(peer_id).map(|link| link.state())
    }

    /// Viewers that currently have a link, sorted.
    pub async fn peers(&self) -> Vec<PeerId> {
        let mut peers: Vec<PeerId> = self.links.read().await.keys().cloned().collect();
        peers.sort();
        peers
    }
}
