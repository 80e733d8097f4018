//! Viewer side of a shared terminal.
//!
//! - [`session`]: the single link to the host
//! - [`input`]: escape gesture detection on local keystrokes
//! - [`screen`]: the local display
//! - [`join`]: the `termshare join` command

pub mod input;
pub mod join;
pub mod screen;
pub mod session;

pub use input::{EscapeDetector, InputAction};
pub use join::{run_join, JoinOptions};
pub use screen::{Screen, StdoutScreen};
pub use session::ViewerSession;

/// Viewer tuning, built from the `[viewer]` config section.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ViewerConfig {
    /// Control byte that ends the session when pressed twice.
    pub escape_byte: u8,
}

impl ViewerConfig {
    /// How the exit gesture is described to the user.
    pub fn escape_hint(&self) -> String {
        format!("{} twice", input::key_name(self.escape_byte))
    }
}

impl Default for ViewerConfig {
    fn default() -> Self {
        Self { escape_byte: 0x18 }
    }
}
