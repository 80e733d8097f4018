//! `termshare join`: watch and type into someone else's shared terminal.

use std::sync::Arc;

use anyhow::{Context, Result};
use protocol::PeerId;
use tokio::io::AsyncReadExt;

use super::screen::{Screen, StdoutScreen};
use super::session::ViewerSession;
use crate::config::Config;
use crate::network::connection::session_url;
use crate::network::{RelayConnection, WebRtcTransportFactory};
use crate::pty::{terminal, RawModeGuard};

/// Command-line choices for joining a session.
#[derive(Debug, Clone)]
pub struct JoinOptions {
    pub session_id: String,
    /// Overrides `network.signaling_url`.
    pub signaling_url: Option<String>,
}

/// Joins a session and runs until it stops. Returns the stop reason.
pub async fn run_join(config: &Config, options: JoinOptions) -> Result<String> {
    let signaling_url = options
        .signaling_url
        .unwrap_or_else(|| config.network.signaling_url.clone());
    let peer_id = PeerId::generate();

    let url = session_url(&signaling_url, &options.session_id, &peer_id)?;
    let (relay, inbound) = RelayConnection::connect(&url, config.client_relay_config())
        .await
        .with_context(|| format!("Failed to reach the signaling relay at {}", signaling_url))?
        .into_parts();

    let viewer_config = config.viewer_config();
    println!(
        "Joining session {} (press {} to leave)",
        options.session_id,
        viewer_config.escape_hint()
    );

    let raw_mode = match RawModeGuard::enable() {
        Ok(guard) => Some(guard),
        Err(e) => {
            tracing::warn!(error = %e, "Terminal stays in cooked mode");
            None
        }
    };
    let screen: Arc<dyn Screen> = Arc::new(StdoutScreen::new(raw_mode));

    let factory = WebRtcTransportFactory::new(config.webrtc_config(false));
    let (session, events) = match ViewerSession::connect(
        viewer_config,
        peer_id,
        relay.clone(),
        &factory,
        screen.clone(),
        terminal::local_size_or_default(),
    )
    .await
    {
        Ok(connected) => connected,
        Err(e) => {
            screen.restore();
            relay.close("viewer failed to start").await;
            return Err(e).context("Failed to start the peer connection");
        }
    };
    tracing::info!(peer_id = %session.peer_id(), session_id = %options.session_id, "Viewer session started");

    let relay_task = tokio::spawn({
        let session = session.clone();
        async move { session.run_relay(inbound).await }
    });
    let transport_task = tokio::spawn({
        let session = session.clone();
        async move { session.run_transport(events).await }
    });
    let input_task = tokio::spawn(pump_stdin(session.clone()));
    let resize_task = match terminal::watch_resize() {
        Ok(mut sizes) => {
            let session = session.clone();
            Some(tokio::spawn(async move {
                while let Some(size) = sizes.recv().await {
                    session.on_local_resize(size).await;
                }
            }))
        }
        Err(e) => {
            tracing::warn!(error = %e, "Resize notifications unavailable");
            None
        }
    };
    let signal_task = tokio::spawn({
        let session = session.clone();
        async move {
            let reason = match terminal::termination_signal().await {
                Ok(name) => format!("Received {}", name),
                Err(e) => format!("Signal handling failed: {}", e),
            };
            session.stop(&reason).await;
        }
    });

    let reason = session.wait().await;

    for task in [relay_task, transport_task, input_task, signal_task] {
        task.abort();
    }
    if let Some(task) = resize_task {
        task.abort();
    }

    Ok(reason)
}

/// Feeds local keystrokes to the session until stdin closes.
async fn pump_stdin(session: ViewerSession) {
    let mut stdin = tokio::io::stdin();
    let mut buf = [0u8; 1024];
    loop {
        match stdin.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => {
                session.handle_input(&buf[..n]).await;
                if session.is_stopped() {
                    break;
                }
            }
            Err(e) => {
                tracing::debug!(error = %e, "Stdin read failed");
                break;
            }
        }
    }
}
