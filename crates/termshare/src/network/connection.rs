//! Relay connection adapter.
//!
//! Turns one WebSocket into two bounded queues of [`Envelope`]s:
//! - [`RelayHandle`]: cloneable sender side plus `close(reason)`
//! - [`RelayInbound`]: decoded envelopes read from the socket
//!
//! Two tasks run for the lifetime of the connection, one draining the
//! outbound queue into the socket and one reading frames into the inbound
//! queue. A transport error on either side tears the whole connection down.
//! Teardown is one-shot: queued items are discarded, both queues close, and a
//! close frame is sent within a bounded grace period.

use std::future::pending;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use protocol::{Envelope, PeerId, ProtocolError, Result};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, watch, RwLock};
use tokio::time::{Instant, Interval};
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::{CloseFrame, Role};
use tokio_tungstenite::tungstenite::{Error as WsError, Message as WsMessage};
use tokio_tungstenite::{connect_async, WebSocketStream};
use url::Url;

/// Default capacity of the inbound and outbound queues.
pub const DEFAULT_QUEUE_CAPACITY: usize = 256;

/// Default time allowed for the close frame to reach the peer.
pub const DEFAULT_CLOSE_GRACE: Duration = Duration::from_secs(1);

/// Longest close reason that fits in a WebSocket close frame.
const MAX_CLOSE_REASON_BYTES: usize = 123;

/// Client-side liveness check using WebSocket ping frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Heartbeat {
    /// Interval between heartbeat pings.
    pub interval: Duration,
    /// Extra time allowed for a pong before the connection is considered dead.
    pub timeout: Duration,
}

impl Default for Heartbeat {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(30),
            timeout: Duration::from_secs(10),
        }
    }
}

/// Configuration for one relay connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayConfig {
    /// Capacity of each queue. Producers wait once a queue is full.
    pub queue_capacity: usize,
    /// Upper bound on delivering the close frame.
    pub close_grace: Duration,
    /// Heartbeat settings; `None` disables pings.
    pub heartbeat: Option<Heartbeat>,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            close_grace: DEFAULT_CLOSE_GRACE,
            heartbeat: None,
        }
    }
}

/// State shared by the handle, the inbound side and both tasks.
struct Shared {
    closed: AtomicBool,
    reason: watch::Sender<Option<String>>,
    writer_done: watch::Sender<bool>,
}

impl Shared {
    /// Starts teardown. Returns false if it had already started.
    fn begin_close(&self, reason: impl Into<String>) -> bool {
        if self.closed.swap(true, Ordering::SeqCst) {
            return false;
        }
        let reason = reason.into();
        tracing::debug!(reason = %reason, "Relay connection closing");
        self.reason.send_replace(Some(reason));
        true
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

/// Sending half of a relay connection.
#[derive(Clone)]
pub struct RelayHandle {
    outbound: mpsc::Sender<Envelope>,
    shared: Arc<Shared>,
    close_grace: Duration,
}

impl RelayHandle {
    /// Queues an envelope for delivery, waiting while the queue is full.
    pub async fn send(&self, envelope: Envelope) -> Result<()> {
        if self.is_closed() {
            return Err(ProtocolError::ConnectionClosed(
                "relay connection closed".to_string(),
            ));
        }

        self.outbound.send(envelope).await.map_err(|_| {
            ProtocolError::ConnectionClosed("relay connection closed".to_string())
        })
    }

    /// Queues an envelope without waiting for room in the outbound queue.
    pub fn try_send(&self, envelope: Envelope) -> Result<()> {
        if self.is_closed() {
            return Err(ProtocolError::ConnectionClosed(
                "relay connection closed".to_string(),
            ));
        }

        self.outbound.try_send(envelope).map_err(|e| match e {
            TrySendError::Full(_) => {
                ProtocolError::TransferFailed("relay outbound queue full".to_string())
            }
            TrySendError::Closed(_) => {
                ProtocolError::ConnectionClosed("relay connection closed".to_string())
            }
        })
    }

    /// Returns whether teardown has started.
    pub fn is_closed(&self) -> bool {
        self.shared.is_closed()
    }

    /// Closes the connection, sending `reason` in the close frame.
    ///
    /// Waits at most the grace period for the close frame to go out. Closing an
    /// already closed connection does nothing.
    pub async fn close(&self, reason: &str) {
        self.shared.begin_close(reason);

        let mut done = self.shared.writer_done.subscribe();
        let _ = tokio::time::timeout(self.close_grace, done.wait_for(|done| *done)).await;
    }

    /// Resolves once the connection is closed, returning the close reason.
    pub async fn closed(&self) -> String {
        let mut reason = self.shared.reason.subscribe();
        let result = match reason.wait_for(|reason| reason.is_some()).await {
            Ok(reason) => reason.clone().unwrap_or_default(),
            Err(_) => String::new(),
        };
        result
    }
}

/// Receiving half of a relay connection.
pub struct RelayInbound {
    inbound: mpsc::Receiver<Envelope>,
    shared: Arc<Shared>,
}

impl RelayInbound {
    /// Receives the next envelope.
    ///
    /// Returns `None` once the connection is closed, even if decoded envelopes
    /// were still queued.
    pub async fn recv(&mut self) -> Option<Envelope> {
        if self.shared.is_closed() {
            return None;
        }

        let envelope = self.inbound.recv().await?;
        if self.shared.is_closed() {
            return None;
        }
        Some(envelope)
    }
}

/// A running relay connection, split into its two halves.
pub struct RelayConnection {
    pub handle: RelayHandle,
    pub inbound: RelayInbound,
}

impl RelayConnection {
    /// Starts the reader and writer tasks over an established WebSocket.
    pub fn start<S>(stream: WebSocketStream<S>, config: RelayConfig) -> Self
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let capacity = config.queue_capacity.max(1);
        let (outbound_tx, outbound_rx) = mpsc::channel::<Envelope>(capacity);
        let (inbound_tx, inbound_rx) = mpsc::channel::<Envelope>(capacity);

        let (reason_tx, _) = watch::channel(None);
        let (done_tx, _) = watch::channel(false);
        let shared = Arc::new(Shared {
            closed: AtomicBool::new(false),
            reason: reason_tx,
            writer_done: done_tx,
        });

        // Shared timestamp for last pong received (initialized to now for grace period)
        let last_pong = Arc::new(RwLock::new(Instant::now()));

        let (sink, stream) = stream.split();

        // Subscribe before spawning so an immediate close is never missed.
        let writer_shutdown = shared.reason.subscribe();
        let reader_shutdown = shared.reason.subscribe();

        tokio::spawn(write_loop(
            sink,
            outbound_rx,
            shared.clone(),
            writer_shutdown,
            config.heartbeat,
            last_pong.clone(),
            config.close_grace,
        ));
        tokio::spawn(read_loop(
            stream,
            inbound_tx,
            shared.clone(),
            reader_shutdown,
            last_pong,
        ));

        Self {
            handle: RelayHandle {
                outbound: outbound_tx,
                shared: shared.clone(),
                close_grace: config.close_grace,
            },
            inbound: RelayInbound {
                inbound: inbound_rx,
                shared,
            },
        }
    }

    /// Connects to a relay endpoint and starts the connection.
    pub async fn connect(url: &str, config: RelayConfig) -> Result<Self> {
        tracing::info!("Connecting to signaling relay: {}", url);

        let (ws_stream, _) = connect_async(url).await.map_err(|e| match e {
            WsError::Io(io_err) => ProtocolError::from(io_err),
            _ => ProtocolError::ConnectionClosed(format!("WebSocket connection failed: {}", e)),
        })?;

        Ok(Self::start(ws_stream, config))
    }

    /// Two connected ends over an in-memory stream: `(client, server)`.
    pub async fn pair(config: RelayConfig) -> (Self, Self) {
        let (client_io, server_io) = tokio::io::duplex(64 * 1024);
        let client = WebSocketStream::from_raw_socket(client_io, Role::Client, None).await;
        let server = WebSocketStream::from_raw_socket(server_io, Role::Server, None).await;
        (
            Self::start(client, config.clone()),
            Self::start(server, config),
        )
    }

    pub fn into_parts(self) -> (RelayHandle, RelayInbound) {
        (self.handle, self.inbound)
    }
}

/// Builds the relay URL for a session: `{base}/ws/{session_id}?peer={peer}`.
pub fn session_url(base: &str, session_id: &str, peer: &PeerId) -> Result<String> {
    let base = base.trim_end_matches('/');
    let mut url = Url::parse(&format!("{}/ws/{}", base, session_id))
        .map_err(|e| ProtocolError::HandshakeFailed(format!("invalid signaling URL: {}", e)))?;
    url.query_pairs_mut().append_pair("peer", peer.as_str());
    Ok(url.to_string())
}

async fn write_loop<S>(
    mut sink: SplitSink<WebSocketStream<S>, WsMessage>,
    mut outbound: mpsc::Receiver<Envelope>,
    shared: Arc<Shared>,
    mut shutdown: watch::Receiver<Option<String>>,
    heartbeat: Option<Heartbeat>,
    last_pong: Arc<RwLock<Instant>>,
    close_grace: Duration,
) where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let mut ticker = heartbeat.map(|hb| tokio::time::interval_at(Instant::now() + hb.interval, hb.interval));

    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            next = outbound.recv() => {
                let Some(envelope) = next else {
                    shared.begin_close("all relay handles dropped");
                    break;
                };
                let text = match envelope.encode() {
                    Ok(text) => text,
                    Err(e) => {
                        tracing::warn!(error = %e, "Dropping unencodable envelope");
                        continue;
                    }
                };
                if let Err(e) = sink.send(WsMessage::Text(text)).await {
                    tracing::warn!(error = %e, "Relay write failed");
                    shared.begin_close(format!("write failed: {}", e));
                    break;
                }
            }
            _ = heartbeat_tick(&mut ticker) => {
                let Some(hb) = heartbeat else { continue };
                let last_pong_time = *last_pong.read().await;
                if last_pong_time.elapsed() > hb.timeout + hb.interval {
                    tracing::warn!("Heartbeat timeout on relay connection");
                    shared.begin_close("heartbeat timeout");
                    break;
                }
                if let Err(e) = sink.send(WsMessage::Ping(Vec::new())).await {
                    shared.begin_close(format!("ping failed: {}", e));
                    break;
                }
                tracing::trace!("Sent heartbeat ping");
            }
        }
    }

    // Anything still queued is discarded with the receiver.
    drop(outbound);

    let reason = shutdown.borrow().clone().unwrap_or_default();
    let frame = CloseFrame {
        code: CloseCode::Normal,
        reason: truncate_reason(reason).into(),
    };
    let _ = tokio::time::timeout(close_grace, async {
        let _ = sink.send(WsMessage::Close(Some(frame))).await;
        let _ = sink.close().await;
    })
    .await;

    shared.writer_done.send_replace(true);
}

async fn read_loop<S>(
    mut stream: SplitStream<WebSocketStream<S>>,
    inbound: mpsc::Sender<Envelope>,
    shared: Arc<Shared>,
    mut shutdown: watch::Receiver<Option<String>>,
    last_pong: Arc<RwLock<Instant>>,
) where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let reason = loop {
        let frame = tokio::select! {
            _ = shutdown.changed() => return,
            frame = stream.next() => frame,
        };

        let bytes = match frame {
            Some(Ok(WsMessage::Text(text))) => text.into_bytes(),
            Some(Ok(WsMessage::Binary(data))) => data,
            Some(Ok(WsMessage::Pong(_))) => {
                *last_pong.write().await = Instant::now();
                continue;
            }
            Some(Ok(WsMessage::Close(frame))) => {
                break match frame {
                    Some(frame) if !frame.reason.is_empty() => {
                        format!("peer closed: {}", frame.reason)
                    }
                    _ => "peer closed".to_string(),
                };
            }
            // Pings are answered by tungstenite itself.
            Some(Ok(_)) => continue,
            Some(Err(e)) => break format!("read failed: {}", e),
            None => break "connection ended".to_string(),
        };

        let envelope = match Envelope::decode(&bytes) {
            Ok(envelope) => envelope,
            Err(e) => {
                tracing::warn!(error = %e, "Dropping undecodable relay message");
                continue;
            }
        };

        tokio::select! {
            _ = shutdown.changed() => return,
            sent = inbound.send(envelope) => {
                if sent.is_err() {
                    break "inbound queue dropped".to_string();
                }
            }
        }
    };

    shared.begin_close(reason);
}

async fn heartbeat_tick(ticker: &mut Option<Interval>) {
    match ticker {
        Some(ticker) => {
            ticker.tick().await;
        }
        None => pending::<()>().await,
    }
}

fn truncate_reason(mut reason: String) -> String {
    if reason.len() > MAX_CLOSE_REASON_BYTES {
        let mut end = MAX_CLOSE_REASON_BYTES;
        while !reason.is_char_boundary(end) {
            end -= 1;
        }
        reason.truncate(end);
    }
    reason
}
