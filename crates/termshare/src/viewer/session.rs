//! Viewer session: one peer link to the host.
//!
//! The viewer initiates everything. It opens both sub-channels itself, sends
//! the offer through the relay and waits for the host's answer. After that the
//! relay only carries ICE candidates and keep-alives.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use protocol::{
    too_small_message, Envelope, GeometryAction, Message, Negotiator, PeerId, ProtocolError,
    Result, WindowSize,
};
use tokio::sync::{mpsc, watch, Mutex, RwLock};

use super::input::{EscapeDetector, InputAction};
use super::screen::Screen;
use super::ViewerConfig;
use crate::network::{
    ChannelKind, DataChannel, PeerTransport, RelayHandle, RelayInbound, TransportEvent,
    TransportFactory,
};

/// Capacity of the transport event queue.
const EVENT_CAPACITY: usize = 256;

#[derive(Default)]
struct Channels {
    data: Option<Arc<dyn DataChannel>>,
    control: Option<Arc<dyn DataChannel>>,
}

/// A viewer's connection to the host.
#[derive(Clone)]
pub struct ViewerSession {
    config: ViewerConfig,
    peer_id: PeerId,
    host_id: PeerId,
    relay: RelayHandle,
    transport: Arc<dyn PeerTransport>,
    screen: Arc<dyn Screen>,
    channels: Arc<RwLock<Channels>>,
    negotiator: Arc<Mutex<Negotiator>>,
    detector: Arc<Mutex<EscapeDetector>>,
    connected: Arc<AtomicBool>,
    stopped: Arc<AtomicBool>,
    done: Arc<watch::Sender<Option<String>>>,
}

impl ViewerSession {
    /// Builds the transport, opens both sub-channels and sends the offer.
    ///
    /// Returns the session and the queue its transport reports into; feed that
    /// queue to [`ViewerSession::run_transport`].
    pub async fn connect(
        config: ViewerConfig,
        peer_id: PeerId,
        relay: RelayHandle,
        factory: &dyn TransportFactory,
        screen: Arc<dyn Screen>,
        local_size: WindowSize,
    ) -> Result<(Self, mpsc::Receiver<TransportEvent>)> {
        let (events_tx, events_rx) = mpsc::channel(EVENT_CAPACITY);
        let transport = factory.create(events_tx).await?;

        let mut negotiator = Negotiator::new();
        negotiator.set_local(local_size);

        let (done, _) = watch::channel(None);
        let session = Self {
            detector: Arc::new(Mutex::new(EscapeDetector::new(config.escape_byte))),
            config,
            peer_id,
            host_id: PeerId::host(),
            relay,
            transport,
            screen,
            channels: Arc::new(RwLock::new(Channels::default())),
            negotiator: Arc::new(Mutex::new(negotiator)),
            connected: Arc::new(AtomicBool::new(false)),
            stopped: Arc::new(AtomicBool::new(false)),
            done: Arc::new(done),
        };

        session.transport.create_data_channel(ChannelKind::Data).await?;
        session.transport.create_data_channel(ChannelKind::Control).await?;

        let offer = session.transport.create_offer().await?;
        session
            .relay
            .send(
                Envelope::new(Message::Offer { sdp: offer })
                    .with_from(session.peer_id.clone())
                    .with_to(session.host_id.clone()),
            )
            .await?;
        tracing::info!(peer_id = %session.peer_id, "Sent offer to host");

        Ok((session, events_rx))
    }

    pub fn peer_id(&self) -> &PeerId {
        &self.peer_id
    }

    /// Handles envelopes from the relay until it closes.
    ///
    /// Losing the relay before the link is up ends the session.
    pub async fn run_relay(&self, mut inbound: RelayInbound) {
        while let Some(envelope) = inbound.recv().await {
            if let Err(e) = self.handle_envelope(envelope).await {
                tracing::warn!(error = %e, "Discarding envelope");
            }
        }

        if !self.connected.load(Ordering::SeqCst) {
            self.stop("Lost connection to the signaling relay").await;
        } else {
            tracing::info!("Relay connection ended");
        }
    }

    /// Handles one envelope from the relay.
    pub async fn handle_envelope(&self, envelope: Envelope) -> Result<()> {
        if envelope.from.as_ref().is_some_and(|from| *from != self.host_id) {
            tracing::trace!(from = ?envelope.from, "Ignoring envelope from another viewer");
            return Ok(());
        }
        if envelope.to.as_ref().is_some_and(|to| *to != self.peer_id) {
            tracing::trace!(to = ?envelope.to, "Ignoring envelope for another viewer");
            return Ok(());
        }

        match envelope.message {
            Message::Answer { sdp } => {
                self.transport.set_remote_description(&sdp).await?;
                tracing::debug!("Applied answer");
                Ok(())
            }
            Message::IceCandidate { candidate } => self.transport.add_ice_candidate(&candidate).await,
            Message::KeepalivePing => Ok(()),
            Message::Offer { .. } => Err(ProtocolError::UnexpectedMessage {
                kind: "offer",
                reason: "viewers never accept offers".to_string(),
            }),
            other => Err(ProtocolError::UnexpectedMessage {
                kind: other.kind().as_str(),
                reason: "not expected over the relay".to_string(),
            }),
        }
    }

    /// Consumes transport events until the transport goes away or the session stops.
    pub async fn run_transport(&self, mut events: mpsc::Receiver<TransportEvent>) {
        let mut done = self.done.subscribe();
        loop {
            tokio::select! {
                _ = stopped(&mut done) => break,
                event = events.recv() => {
                    let Some(event) = event else { break };
                    self.handle_transport_event(event).await;
                }
            }
        }
    }

    /// Applies one transport event.
    pub async fn handle_transport_event(&self, event: TransportEvent) {
        match event {
            TransportEvent::LocalCandidate(candidate) => {
                let envelope = Envelope::new(Message::IceCandidate { candidate })
                    .with_from(self.peer_id.clone())
                    .with_to(self.host_id.clone());
                if let Err(e) = self.relay.send(envelope).await {
                    tracing::debug!(error = %e, "Could not send local candidate");
                }
            }
            TransportEvent::StateChanged(state) => {
                tracing::debug!(?state, "Peer connection state");
                if state == crate::network::PeerState::Connected {
                    self.connected.store(true, Ordering::SeqCst);
                    tracing::info!("Connected to host");
                } else if state.is_terminal() {
                    self.stop("Disconnected!").await;
                }
            }
            TransportEvent::ChannelOpen(channel) => {
                let kind = channel.kind();
                let mut channels = self.channels.write().await;
                match kind {
                    ChannelKind::Data => channels.data = Some(channel),
                    ChannelKind::Control => channels.control = Some(channel),
                }
                tracing::debug!(channel = kind.label(), "Sub-channel open");
            }
            TransportEvent::ChannelMessage {
                kind: ChannelKind::Data,
                data,
            } => {
                if !self.is_muted().await {
                    self.screen.write(&data);
                }
            }
            TransportEvent::ChannelMessage {
                kind: ChannelKind::Control,
                data,
            } => match Envelope::decode(&data) {
                Ok(envelope) => match envelope.message {
                    Message::WindowSizeUpdate(size) => {
                        tracing::debug!(%size, "Host window size");
                        let action = self.negotiator.lock().await.set_remote(size);
                        self.apply_geometry(action).await;
                    }
                    other => tracing::debug!(kind = %other.kind(), "Unhandled control message"),
                },
                Err(e) => tracing::warn!(error = %e, "Bad control message"),
            },
        }
    }

    /// Re-evaluates geometry after the local terminal changed size.
    pub async fn on_local_resize(&self, size: WindowSize) {
        let action = self.negotiator.lock().await.set_local(size);
        self.apply_geometry(action).await;
    }

    async fn apply_geometry(&self, action: GeometryAction) {
        match action {
            GeometryAction::Pending | GeometryAction::Unchanged => {}
            GeometryAction::Mute { local, remote } => {
                tracing::info!(%local, %remote, "Terminal too small, muting output");
                self.screen.clear();
                self.screen
                    .message(&too_small_message(local, remote, &self.config.escape_hint()));
            }
            GeometryAction::Unmute => {
                self.screen.clear();
                if let Err(e) = self.send_control(Message::RefreshRequest).await {
                    tracing::warn!(error = %e, "Could not request a refresh");
                }
            }
        }
    }

    async fn send_control(&self, message: Message) -> Result<()> {
        let control = self.channels.read().await.control.clone().ok_or_else(|| {
            ProtocolError::TransferFailed("config channel not open".to_string())
        })?;
        let json = Envelope::new(message)
            .with_from(self.peer_id.clone())
            .with_to(self.host_id.clone())
            .encode()?;
        control.send(json.as_bytes()).await
    }

    pub async fn is_muted(&self) -> bool {
        self.negotiator.lock().await.is_muted()
    }

    /// Forwards local keystrokes one byte at a time, watching for the exit gesture.
    pub async fn handle_input(&self, bytes: &[u8]) {
        for &byte in bytes {
            let action = self.detector.lock().await.feed(byte);
            match action {
                InputAction::Forward(byte) => {
                    let data = self.channels.read().await.data.clone();
                    match data {
                        Some(channel) => {
                            if let Err(e) = channel.send(&[byte]).await {
                                tracing::debug!(error = %e, "Input send failed");
                            }
                        }
                        None => tracing::trace!("Data channel not open, dropping input"),
                    }
                }
                InputAction::Escape => {
                    self.stop("Bye!").await;
                    return;
                }
            }
        }
    }

    /// Ends the session. Only the first call has any effect.
    pub async fn stop(&self, reason: &str) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        tracing::info!(reason = %reason, "Viewer session stopping");

        self.relay.close(reason).await;
        if let Err(e) = self.transport.close().await {
            tracing::debug!(error = %e, "Transport close failed");
        }
        self.screen.restore();
        self.screen.clear();
        self.screen.message(reason);

        self.done.send_replace(Some(reason.to_string()));
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    /// Waits for the session to stop and returns the reason.
    pub async fn wait(&self) -> String {
        let mut done = self.done.subscribe();
        let result = match done.wait_for(|reason| reason.is_some()).await {
            Ok(reason) => reason.clone().unwrap_or_default(),
            Err(_) => String::new(),
        };
        result
    }
}

async fn stopped(done: &mut watch::Receiver<Option<String>>) {
    let _ = done.wait_for(|reason| reason.is_some()).await;
}
