//! `termshare share`: run a shell and let viewers join it.

use std::io::Write;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use protocol::PeerId;
use tokio::io::AsyncReadExt;
use uuid::Uuid;

use super::{HostSession, SESSION_ENV_VAR};
use crate::config::Config;
use crate::network::connection::session_url;
use crate::network::{RelayConnection, WebRtcTransportFactory};
use crate::pty::{terminal, PtyDevice, PtySession, RawModeGuard};

/// How often the host checks for remaining viewers once the relay is gone.
const IDLE_POLL: Duration = Duration::from_secs(1);

/// Command-line choices for one sharing session.
#[derive(Debug, Clone, Default)]
pub struct ShareOptions {
    /// Overrides `network.signaling_url`.
    pub signaling_url: Option<String>,
    /// Leaves the TURN servers out of the ICE configuration.
    pub disable_turn: bool,
}

/// Shares a new shell until it exits or the host is told to stop.
///
/// Returns the one-line reason the session ended.
pub async fn run_share(config: &Config, options: ShareOptions) -> Result<String> {
    if let Ok(existing) = std::env::var(SESSION_ENV_VAR) {
        bail!(
            "this shell is already being shared (session {}); exit it before sharing again",
            existing
        );
    }

    let session_id = Uuid::new_v4().to_string();
    let signaling_url = options
        .signaling_url
        .unwrap_or_else(|| config.network.signaling_url.clone());

    let url = session_url(&signaling_url, &session_id, &PeerId::host())?;
    let (relay, inbound) = RelayConnection::connect(&url, config.client_relay_config())
        .await
        .with_context(|| format!("Failed to reach the signaling relay at {}", signaling_url))?
        .into_parts();

    let size = terminal::local_size_or_default();
    let pty = Arc::new(
        PtySession::spawn(
            Some(config.host.shell.clone()),
            size,
            vec![(SESSION_ENV_VAR.to_string(), session_id.clone())],
        )
        .context("Failed to start the shell")?,
    );
    let mut output = pty.start_read_loop().await?;

    println!("Sharing session {}", session_id);
    println!("Viewers can join with:");
    println!();
    println!("  termshare join --server {} {}", signaling_url, session_id);
    println!();

    let raw_mode = match RawModeGuard::enable() {
        Ok(guard) => Some(guard),
        Err(e) => {
            tracing::warn!(error = %e, "Host terminal stays in cooked mode");
            None
        }
    };

    let factory = Arc::new(WebRtcTransportFactory::new(
        config.webrtc_config(options.disable_turn),
    ));
    let host = HostSession::new(config.host_config(), pty.clone(), relay.clone(), factory);
    tracing::info!(session_id = %session_id, "Host session started");

    let mut relay_task = tokio::spawn({
        let host = host.clone();
        async move { host.run_relay(inbound).await }
    });
    let keepalive_task = tokio::spawn({
        let host = host.clone();
        async move { host.run_keepalive().await }
    });
    let stdin_task = tokio::spawn(pump_stdin(pty.clone()));
    let resize_task = match terminal::watch_resize() {
        Ok(mut sizes) => {
            let host = host.clone();
            Some(tokio::spawn(async move {
                while let Some(size) = sizes.recv().await {
                    host.on_local_resize(size).await;
                }
            }))
        }
        Err(e) => {
            tracing::warn!(error = %e, "Resize notifications unavailable");
            None
        }
    };

    let terminated = terminal::termination_signal();
    tokio::pin!(terminated);

    let mut stdout = std::io::stdout();
    let mut relay_lost = false;
    let reason = loop {
        tokio::select! {
            chunk = output.recv() => {
                let Some(chunk) = chunk else {
                    break "Shell exited".to_string();
                };
                if let Err(e) = stdout.write_all(&chunk).and_then(|_| stdout.flush()) {
                    tracing::debug!(error = %e, "Local echo failed");
                }
                host.broadcast_output(&chunk).await;
            }
            _ = &mut relay_task, if !relay_lost => {
                relay_lost = true;
                tracing::warn!("Signaling relay gone; connected viewers stay, new viewers cannot join");
            }
            // Without a relay nobody new can join, so the last viewer leaving ends the session.
            _ = host.wait_until_idle(IDLE_POLL), if relay_lost => {
                break "Lost connection to the signaling relay".to_string();
            }
            signal = &mut terminated => {
                break match signal {
                    Ok(name) => format!("Received {}", name),
                    Err(e) => format!("Signal handling failed: {}", e),
                };
            }
        }
    };

    tracing::info!(reason = %reason, "Host session ending");
    host.shutdown().await;
    relay.close("host leaving").await;
    keepalive_task.abort();
    stdin_task.abort();
    if let Some(task) = resize_task {
        task.abort();
    }
    if let Err(e) = pty.kill().await {
        tracing::debug!(error = %e, "Shell kill failed");
    }
    if let Some(guard) = raw_mode {
        guard.restore();
    }

    Ok(reason)
}

/// Copies the host's own keystrokes into the shell.
async fn pump_stdin(pty: Arc<PtySession>) {
    let mut stdin = tokio::io::stdin();
    let mut buf = [0u8; 1024];
    loop {
        match stdin.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => {
                if let Err(e) = pty.write(&buf[..n]).await {
                    tracing::debug!(error = %e, "Stdin forwarding stopped");
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
