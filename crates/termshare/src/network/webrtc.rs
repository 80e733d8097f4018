//! WebRTC implementation of the peer transport.
//!
//! This module provides:
//! - ICE server configuration (STUN with optional TURN fallback)
//! - A [`TransportFactory`] that builds one peer connection per link
//! - Data channels labelled `data` and `config`
//!
//! Every webrtc callback only forwards a [`TransportEvent`] into the owning
//! session's queue.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use bytes::Bytes;
use protocol::error::{ProtocolError, Result};
use tokio::sync::mpsc;
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::APIBuilder;
use webrtc::data_channel::data_channel_init::RTCDataChannelInit;
use webrtc::data_channel::data_channel_message::DataChannelMessage;
use webrtc::data_channel::RTCDataChannel;
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;

use super::transport::{DataChannel, PeerState, PeerTransport, TransportEvent, TransportFactory};
use super::ChannelKind;

/// Public STUN servers used when the configuration names none.
pub const FALLBACK_STUN: &[&str] = &[
    "stun:stun.l.google.com:19302",
    "stun:stun1.l.google.com:19302",
];

/// One entry of the ICE server list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IceServer {
    /// Address discovery only. Several URLs may share one entry.
    Stun { urls: Vec<String> },
    /// Relayed fallback for peers that cannot reach each other directly.
    Turn {
        url: String,
        username: String,
        credential: String,
    },
}

impl IceServer {
    pub fn stun<I, S>(urls: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        IceServer::Stun {
            urls: urls.into_iter().map(Into::into).collect(),
        }
    }

    pub fn turn(
        url: impl Into<String>,
        username: impl Into<String>,
        credential: impl Into<String>,
    ) -> Self {
        IceServer::Turn {
            url: url.into(),
            username: username.into(),
            credential: credential.into(),
        }
    }

    pub fn is_turn(&self) -> bool {
        matches!(self, IceServer::Turn { .. })
    }
}

impl From<&IceServer> for RTCIceServer {
    fn from(server: &IceServer) -> Self {
        match server {
            IceServer::Stun { urls } => RTCIceServer {
                urls: urls.clone(),
                ..Default::default()
            },
            IceServer::Turn {
                url,
                username,
                credential,
            } => RTCIceServer {
                urls: vec![url.clone()],
                username: username.clone(),
                credential: credential.clone(),
                ..Default::default()
            },
        }
    }
}

/// ICE servers handed to every peer connection the factory builds.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WebRtcConfig {
    pub ice_servers: Vec<IceServer>,
}

impl Default for WebRtcConfig {
    fn default() -> Self {
        Self::new(vec![IceServer::stun(FALLBACK_STUN.iter().copied())])
    }
}

impl WebRtcConfig {
    pub fn new(ice_servers: Vec<IceServer>) -> Self {
        Self { ice_servers }
    }

    /// Drops the TURN entries, keeping direct and STUN-assisted paths only.
    pub fn without_turn(mut self) -> Self {
        self.ice_servers.retain(|server| !server.is_turn());
        self
    }

    fn rtc_configuration(&self) -> RTCConfiguration {
        RTCConfiguration {
            ice_servers: self.ice_servers.iter().map(RTCIceServer::from).collect(),
            ..Default::default()
        }
    }
}

impl From<RTCPeerConnectionState> for PeerState {
    fn from(state: RTCPeerConnectionState) -> Self {
        match state {
            RTCPeerConnectionState::Unspecified | RTCPeerConnectionState::New => PeerState::New,
            RTCPeerConnectionState::Connecting => PeerState::Connecting,
            RTCPeerConnectionState::Connected => PeerState::Connected,
            RTCPeerConnectionState::Disconnected => PeerState::Disconnected,
            RTCPeerConnectionState::Failed => PeerState::Failed,
            RTCPeerConnectionState::Closed => PeerState::Closed,
        }
    }
}

/// Builds WebRTC peer connections from a fixed configuration.
pub struct WebRtcTransportFactory {
    config: WebRtcConfig,
}

impl WebRtcTransportFactory {
    pub fn new(config: WebRtcConfig) -> Self {
        Self { config }
    }

    async fn build(&self, events: mpsc::Sender<TransportEvent>) -> Result<WebRtcTransport> {
        // Create a MediaEngine (required even for data-only connections)
        let mut media_engine = MediaEngine::default();
        media_engine.register_default_codecs().map_err(|e| {
            ProtocolError::HandshakeFailed(format!("failed to register codecs: {}", e))
        })?;

        let mut registry = Registry::new();
        registry = register_default_interceptors(registry, &mut media_engine).map_err(|e| {
            ProtocolError::HandshakeFailed(format!("failed to register interceptors: {}", e))
        })?;

        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();

        let peer_connection = api
            .new_peer_connection(self.config.rtc_configuration())
            .await
            .map_err(|e| {
                ProtocolError::HandshakeFailed(format!("failed to create peer connection: {}", e))
            })?;
        let peer_connection = Arc::new(peer_connection);

        let tx = events.clone();
        peer_connection.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
            let tx = tx.clone();
            Box::pin(async move {
                // None marks the end of gathering.
                let Some(candidate) = candidate else { return };
                let json = match candidate.to_json() {
                    Ok(init) => serde_json::to_string(&init),
                    Err(e) => {
                        tracing::warn!(error = %e, "Failed to serialize local ICE candidate");
                        return;
                    }
                };
                match json {
                    Ok(json) => {
                        let _ = tx.send(TransportEvent::LocalCandidate(json)).await;
                    }
                    Err(e) => tracing::warn!(error = %e, "Failed to encode local ICE candidate"),
                }
            })
        }));

        let tx = events.clone();
        peer_connection.on_peer_connection_state_change(Box::new(
            move |state: RTCPeerConnectionState| {
                let tx = tx.clone();
                Box::pin(async move {
                    tracing::debug!("peer connection state changed: {:?}", state);
                    let _ = tx.send(TransportEvent::StateChanged(state.into())).await;
                })
            },
        ));

        let tx = events.clone();
        peer_connection.on_data_channel(Box::new(move |channel: Arc<RTCDataChannel>| {
            let tx = tx.clone();
            Box::pin(async move {
                wire_channel(channel, tx);
            })
        }));

        Ok(WebRtcTransport {
            peer_connection,
            events,
        })
    }
}

impl TransportFactory for WebRtcTransportFactory {
    fn create(
        &self,
        events: mpsc::Sender<TransportEvent>,
    ) -> Pin<Box<dyn Future<Output = Result<Arc<dyn PeerTransport>>> + Send + '_>> {
        Box::pin(async move {
            let transport = self.build(events).await?;
            Ok(Arc::new(transport) as Arc<dyn PeerTransport>)
        })
    }
}

/// Hooks a webrtc data channel up to the event queue.
///
/// Returns `None` for channels with a label this program does not use.
fn wire_channel(
    channel: Arc<RTCDataChannel>,
    events: mpsc::Sender<TransportEvent>,
) -> Option<Arc<dyn DataChannel>> {
    let Some(kind) = ChannelKind::from_label(channel.label()) else {
        tracing::warn!("unknown data channel: {}", channel.label());
        return None;
    };

    let wrapped: Arc<dyn DataChannel> = Arc::new(WebRtcDataChannel {
        kind,
        channel: channel.clone(),
    });

    let tx = events.clone();
    channel.on_message(Box::new(move |msg: DataChannelMessage| {
        let tx = tx.clone();
        Box::pin(async move {
            if tx
                .send(TransportEvent::ChannelMessage {
                    kind,
                    data: msg.data,
                })
                .await
                .is_err()
            {
                tracing::debug!("dropping {} message: session gone", kind.label());
            }
        })
    }));

    let opened = wrapped.clone();
    channel.on_open(Box::new(move || {
        Box::pin(async move {
            tracing::debug!("data channel '{}' established", kind.label());
            let _ = events.send(TransportEvent::ChannelOpen(opened)).await;
        })
    }));

    Some(wrapped)
}

/// A WebRTC data channel.
pub struct WebRtcDataChannel {
    kind: ChannelKind,
    channel: Arc<RTCDataChannel>,
}

impl DataChannel for WebRtcDataChannel {
    fn kind(&self) -> ChannelKind {
        self.kind
    }

    fn send<'a>(&'a self, data: &'a [u8]) -> Pin<Box<dyn Future<Output = Result<()>> + Send + 'a>> {
        Box::pin(async move {
            self.channel
                .send(&Bytes::copy_from_slice(data))
                .await
                .map_err(|e| ProtocolError::TransferFailed(format!("failed to send: {}", e)))?;
            Ok(())
        })
    }

    fn close(&self) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>> {
        Box::pin(async move {
            self.channel.close().await.map_err(|e| {
                ProtocolError::ConnectionClosed(format!("failed to close channel: {}", e))
            })
        })
    }
}

/// One WebRTC peer connection.
pub struct WebRtcTransport {
    peer_connection: Arc<RTCPeerConnection>,
    events: mpsc::Sender<TransportEvent>,
}

impl WebRtcTransport {
    async fn set_local(&self, desc: RTCSessionDescription) -> Result<String> {
        self.peer_connection
            .set_local_description(desc.clone())
            .await
            .map_err(|e| {
                ProtocolError::HandshakeFailed(format!("failed to set local description: {}", e))
            })?;

        serde_json::to_string(&desc).map_err(|e| ProtocolError::Serialization(e.to_string()))
    }
}

impl PeerTransport for WebRtcTransport {
    fn create_offer(&self) -> Pin<Box<dyn Future<Output = Result<String>> + Send + '_>> {
        Box::pin(async move {
            let offer = self.peer_connection.create_offer(None).await.map_err(|e| {
                ProtocolError::HandshakeFailed(format!("failed to create offer: {}", e))
            })?;
            self.set_local(offer).await
        })
    }

    fn create_answer(&self) -> Pin<Box<dyn Future<Output = Result<String>> + Send + '_>> {
        Box::pin(async move {
            let answer = self.peer_connection.create_answer(None).await.map_err(|e| {
                ProtocolError::HandshakeFailed(format!("failed to create answer: {}", e))
            })?;
            self.set_local(answer).await
        })
    }

    fn set_remote_description<'a>(
        &'a self,
        sdp: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + 'a>> {
        Box::pin(async move {
            let desc: RTCSessionDescription = serde_json::from_str(sdp).map_err(|e| {
                ProtocolError::HandshakeFailed(format!("malformed session description: {}", e))
            })?;
            self.peer_connection
                .set_remote_description(desc)
                .await
                .map_err(|e| {
                    ProtocolError::HandshakeFailed(format!(
                        "failed to set remote description: {}",
                        e
                    ))
                })
        })
    }

    fn add_ice_candidate<'a>(
        &'a self,
        candidate: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + 'a>> {
        Box::pin(async move {
            let init: RTCIceCandidateInit = serde_json::from_str(candidate).map_err(|e| {
                ProtocolError::HandshakeFailed(format!("malformed ICE candidate: {}", e))
            })?;
            self.peer_connection
                .add_ice_candidate(init)
                .await
                .map_err(|e| {
                    ProtocolError::HandshakeFailed(format!("failed to add ICE candidate: {}", e))
                })
        })
    }

    fn create_data_channel(
        &self,
        kind: ChannelKind,
    ) -> Pin<Box<dyn Future<Output = Result<Arc<dyn DataChannel>>> + Send + '_>> {
        Box::pin(async move {
            // Both channels are ordered and reliable: keystrokes and screen
            // output must arrive in order.
            let options = RTCDataChannelInit {
                ordered: Some(true),
                ..Default::default()
            };
            let channel = self
                .peer_connection
                .create_data_channel(kind.label(), Some(options))
                .await
                .map_err(|e| {
                    ProtocolError::HandshakeFailed(format!(
                        "failed to create {} channel: {}",
                        kind.label(),
                        e
                    ))
                })?;

            wire_channel(channel, self.events.clone()).ok_or_else(|| {
                ProtocolError::HandshakeFailed(format!("unusable channel label {}", kind.label()))
            })
        })
    }

    fn close(&self) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>> {
        Box::pin(async move {
            self.peer_connection.close().await.map_err(|e| {
                ProtocolError::ConnectionClosed(format!("failed to close connection: {}", e))
            })
        })
    }
}
