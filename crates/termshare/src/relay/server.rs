//! HTTP front end of the relay.
//!
//! Connections are served by hyper. `GET /ws/{id}` upgrades to a WebSocket
//! and joins room `id`; `/` and `/health` answer a liveness probe; anything
//! else gets a 404.

use std::convert::Infallible;
use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use http_body_util::Full;
use hyper::body::{Bytes, Incoming};
use hyper::header::{
    HeaderName, HeaderValue, CONNECTION, CONTENT_TYPE, SEC_WEBSOCKET_ACCEPT, SEC_WEBSOCKET_KEY,
    SEC_WEBSOCKET_VERSION, UPGRADE,
};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use protocol::PeerId;
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::tungstenite::handshake::derive_accept_key;
use tokio_tungstenite::tungstenite::protocol::Role;
use tokio_tungstenite::WebSocketStream;
use url::Url;

use super::sessions::SessionTable;
use crate::network::{RelayConfig, RelayConnection};

/// What a request asks for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Route {
    /// WebSocket upgrade into a session.
    Join {
        session_id: String,
        peer: Option<PeerId>,
    },
    /// Liveness probe.
    Health,
    NotFound,
}

impl Route {
    /// Routes a request by method and target, e.g. `GET /ws/abc?peer=v1`.
    pub fn parse(method: &Method, target: &str) -> Self {
        if *method != Method::GET {
            return Route::NotFound;
        }

        let Ok(url) = Url::parse(&format!("http://relay{}", target)) else {
            return Route::NotFound;
        };

        match url.path() {
            "/" | "/health" => Route::Health,
            path => match path.strip_prefix("/ws/") {
                Some(session_id) if !session_id.is_empty() && !session_id.contains('/') => {
                    let peer = url
                        .query_pairs()
                        .find(|(key, value)| key == "peer" && !value.is_empty())
                        .map(|(_, value)| PeerId::new(value.into_owned()));
                    Route::Join {
                        session_id: session_id.to_string(),
                        peer,
                    }
                }
                _ => Route::NotFound,
            },
        }
    }

    fn of<B>(req: &Request<B>) -> Self {
        let target = req
            .uri()
            .path_and_query()
            .map(|target| target.as_str())
            .unwrap_or("/");
        Self::parse(req.method(), target)
    }
}

/// The signaling relay.
pub struct RelayServer {
    listener: TcpListener,
    config: RelayConfig,
    sessions: Arc<SessionTable>,
}

impl RelayServer {
    /// Binds the listening socket.
    pub async fn bind(addr: &str, config: RelayConfig) -> io::Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        Ok(Self {
            listener,
            config,
            sessions: Arc::new(SessionTable::new()),
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub fn sessions(&self) -> Arc<SessionTable> {
        self.sessions.clone()
    }

    /// Accepts connections until `shutdown` resolves, then closes every member.
    pub async fn run<F>(self, shutdown: F) -> io::Result<()>
    where
        F: Future<Output = ()>,
    {
        tracing::info!(addr = ?self.listener.local_addr().ok(), "Relay listening");
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                _ = &mut shutdown => break,
                accepted = self.listener.accept() => {
                    let (stream, addr) = match accepted {
                        Ok(accepted) => accepted,
                        Err(e) => {
                            tracing::warn!(error = %e, "Accept failed");
                            continue;
                        }
                    };
                    tracing::debug!(%addr, "Accepted connection");
                    tokio::spawn(serve_connection(
                        stream,
                        addr,
                        self.sessions.clone(),
                        self.config.clone(),
                    ));
                }
            }
        }

        tracing::info!("Relay shutting down");
        self.sessions.close_all("relay shutting down").await;
        Ok(())
    }
}

async fn serve_connection(
    stream: TcpStream,
    addr: SocketAddr,
    sessions: Arc<SessionTable>,
    config: RelayConfig,
) {
    let service = service_fn(move |req| {
        let sessions = sessions.clone();
        let config = config.clone();
        async move { handle_request(req, sessions, config).await }
    });

    if let Err(e) = http1::Builder::new()
        .serve_connection(TokioIo::new(stream), service)
        .with_upgrades()
        .await
    {
        // Clients hanging up mid-request are routine.
        if !e.is_incomplete_message() {
            tracing::debug!(%addr, error = %e, "HTTP connection error");
        }
    }
}

async fn handle_request(
    mut req: Request<Incoming>,
    sessions: Arc<SessionTable>,
    config: RelayConfig,
) -> Result<Response<Full<Bytes>>, Infallible> {
    let response = match Route::of(&req) {
        Route::Join { session_id, peer } => {
            upgrade_to_member(&mut req, sessions, config, session_id, peer)
        }
        Route::Health => text(StatusCode::OK, format!("I'm fine: {}", unix_millis())),
        Route::NotFound => text(StatusCode::NOT_FOUND, "404 page not found"),
    };
    Ok(response)
}

/// Answers the WebSocket handshake and hands the upgraded stream to the room.
fn upgrade_to_member(
    req: &mut Request<Incoming>,
    sessions: Arc<SessionTable>,
    config: RelayConfig,
    session_id: String,
    peer: Option<PeerId>,
) -> Response<Full<Bytes>> {
    let Some(accept) = websocket_accept(req) else {
        return text(StatusCode::BAD_REQUEST, "expected a WebSocket upgrade");
    };
    let Ok(accept) = HeaderValue::from_str(&accept) else {
        return text(StatusCode::BAD_REQUEST, "invalid WebSocket key");
    };

    let on_upgrade = hyper::upgrade::on(req);
    tokio::spawn(async move {
        match on_upgrade.await {
            Ok(upgraded) => {
                let ws =
                    WebSocketStream::from_raw_socket(TokioIo::new(upgraded), Role::Server, None)
                        .await;
                let connection = RelayConnection::start(ws, config);
                serve_member(sessions, session_id, peer, connection).await;
            }
            Err(e) => tracing::debug!(error = %e, "WebSocket upgrade failed"),
        }
    });

    let mut response = Response::new(Full::default());
    *response.status_mut() = StatusCode::SWITCHING_PROTOCOLS;
    let headers = response.headers_mut();
    headers.insert(CONNECTION, HeaderValue::from_static("Upgrade"));
    headers.insert(UPGRADE, HeaderValue::from_static("websocket"));
    headers.insert(SEC_WEBSOCKET_ACCEPT, accept);
    response
}

/// The `Sec-WebSocket-Accept` value for a valid upgrade request.
fn websocket_accept<B>(req: &Request<B>) -> Option<String> {
    let headers = req.headers();
    let has_token = |name: HeaderName, token: &str| {
        headers.get_all(name).iter().any(|value: &HeaderValue| {
            value
                .to_str()
                .map(|value| {
                    value
                        .split(',')
                        .any(|part| part.trim().eq_ignore_ascii_case(token))
                })
                .unwrap_or(false)
        })
    };

    if !has_token(CONNECTION, "upgrade") || !has_token(UPGRADE, "websocket") {
        return None;
    }
    if headers.get(SEC_WEBSOCKET_VERSION).map(|v| v.as_bytes()) != Some(&b"13"[..]) {
        return None;
    }
    let key = headers.get(SEC_WEBSOCKET_KEY)?;
    Some(derive_accept_key(key.as_bytes()))
}

/// Runs one member for the lifetime of its connection.
async fn serve_member(
    sessions: Arc<SessionTable>,
    session_id: String,
    peer: Option<PeerId>,
    connection: RelayConnection,
) {
    let (handle, mut inbound) = connection.into_parts();
    let membership = sessions.join(&session_id, peer, handle.clone()).await;

    while let Some(envelope) = inbound.recv().await {
        sessions.route(&membership, envelope).await;
    }

    sessions.leave(&membership).await;
    handle.close("member left").await;
}

fn text(status: StatusCode, body: impl Into<String>) -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::new(Bytes::from(body.into())));
    *response.status_mut() = status;
    response.headers_mut().insert(
        CONTENT_TYPE,
        HeaderValue::from_static("text/plain; charset=utf-8"),
    );
    response
}

fn unix_millis() -> u128 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis())
        .unwrap_or(0)
}
