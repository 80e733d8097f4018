//! The terminal this process runs in.
//!
//! Provides raw mode management, size queries and resize notifications using
//! the crossterm backend and tokio's signal support.

use std::io::Write;
use std::sync::atomic::{AtomicBool, Ordering};

use crossterm::cursor::MoveTo;
use crossterm::execute;
use crossterm::terminal::{disable_raw_mode, enable_raw_mode, Clear, ClearType};
use protocol::WindowSize;
use tokio::sync::mpsc;

use super::PtyError;

/// Size assumed when stdout is not a terminal.
pub const FALLBACK_SIZE: WindowSize = WindowSize { rows: 24, cols: 80 };

/// Keeps the local terminal in raw mode until restored or dropped.
pub struct RawModeGuard {
    active: AtomicBool,
}

impl RawModeGuard {
    /// Switches the local terminal to raw mode.
    pub fn enable() -> Result<Self, PtyError> {
        enable_raw_mode().map_err(|e| PtyError::Terminal(e.to_string()))?;
        Ok(Self {
            active: AtomicBool::new(true),
        })
    }

    /// Restores the original mode. Only the first call has an effect.
    pub fn restore(&self) {
        if self.active.swap(false, Ordering::SeqCst) {
            if let Err(e) = disable_raw_mode() {
                tracing::warn!(error = %e, "Failed to restore terminal mode");
            }
        }
    }
}

impl Drop for RawModeGuard {
    fn drop(&mut self) {
        self.restore();
    }
}

/// Returns the size of the local terminal.
pub fn local_size() -> Result<WindowSize, PtyError> {
    let (cols, rows) = crossterm::terminal::size().map_err(|e| PtyError::Terminal(e.to_string()))?;
    if rows == 0 || cols == 0 {
        return Err(PtyError::Terminal("terminal reports zero size".to_string()));
    }
    Ok(WindowSize::new(rows, cols))
}

/// Returns the size of the local terminal, or [`FALLBACK_SIZE`].
pub fn local_size_or_default() -> WindowSize {
    local_size().unwrap_or(FALLBACK_SIZE)
}

/// Clears `out` and moves the cursor home.
pub fn clear_screen<W: Write>(out: &mut W) -> std::io::Result<()> {
    execute!(out, Clear(ClearType::All), MoveTo(0, 0))
}

/// Reports the new local size every time the terminal is resized.
#[cfg(unix)]
pub fn watch_resize() -> Result<mpsc::Receiver<WindowSize>, PtyError> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigwinch = signal(SignalKind::window_change())?;
    let (tx, rx) = mpsc::channel(16);

    tokio::spawn(async move {
        while sigwinch.recv().await.is_some() {
            match local_size() {
                Ok(size) => {
                    if tx.send(size).await.is_err() {
                        break;
                    }
                }
                Err(e) => tracing::debug!(error = %e, "Ignoring resize"),
            }
        }
    });

    Ok(rx)
}

/// Reports the new local size every time the terminal is resized.
#[cfg(not(unix))]
pub fn watch_resize() -> Result<mpsc::Receiver<WindowSize>, PtyError> {
    // No resize signal on this platform: the sender is parked forever.
    let (tx, rx) = mpsc::channel(1);
    tokio::spawn(async move {
        tx.closed().await;
    });
    Ok(rx)
}

/// Resolves with the name of the first termination signal received.
#[cfg(unix)]
pub async fn termination_signal() -> std::io::Result<&'static str> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sighup = signal(SignalKind::hangup())?;

    tokio::select! {
        _ = sigterm.recv() => Ok("SIGTERM"),
        _ = sighup.recv() => Ok("SIGHUP"),
    }
}

/// Resolves with the name of the first termination signal received.
#[cfg(not(unix))]
pub async fn termination_signal() -> std::io::Result<&'static str> {
    tokio::signal::ctrl_c().await?;
    Ok("Ctrl-C")
}
