//! Pseudo-terminal and local terminal glue.
//!
//! - [`session`]: the shared shell running under a PTY
//! - [`terminal`]: raw mode, size queries and resize notifications for the
//!   terminal the process itself runs in

pub mod session;
pub mod terminal;

use std::future::Future;
use std::pin::Pin;

use protocol::WindowSize;
use thiserror::Error;

/// Errors that can occur during PTY operations.
#[derive(Error, Debug)]
pub enum PtyError {
    /// Failed to spawn the PTY.
    #[error("failed to spawn PTY: {0}")]
    SpawnFailed(String),

    /// The shell has already exited or been killed.
    #[error("PTY already terminated")]
    AlreadyTerminated,

    /// The output reader was already handed out.
    #[error("PTY reader already taken")]
    ReaderTaken,

    /// Failed to write to the PTY.
    #[error("failed to write to PTY: {0}")]
    WriteFailed(String),

    /// Failed to resize the PTY.
    #[error("failed to resize PTY: {0}")]
    ResizeFailed(String),

    /// Failed to kill the shell.
    #[error("failed to kill shell: {0}")]
    KillFailed(String),

    /// The local terminal could not be queried or switched.
    #[error("terminal error: {0}")]
    Terminal(String),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// The operations the host session needs from its PTY.
///
/// Writes must be serialized by the implementation: several viewers may type
/// at the same time.
pub trait PtyDevice: Send + Sync {
    /// Writes input to the shell.
    fn write<'a>(
        &'a self,
        data: &'a [u8],
    ) -> Pin<Box<dyn Future<Output = Result<(), PtyError>> + Send + 'a>>;

    /// Returns the current terminal size.
    fn size(&self) -> WindowSize;

    /// Changes the terminal size.
    fn resize(
        &self,
        size: WindowSize,
    ) -> Pin<Box<dyn Future<Output = Result<(), PtyError>> + Send + '_>>;

    /// Forces the shell to redraw its screen.
    fn refresh(&self) -> Pin<Box<dyn Future<Output = Result<(), PtyError>> + Send + '_>>;
}

pub use session::PtySession;
pub use terminal::RawModeGuard;
