//! Where the viewer draws.

use std::io::Write;

use crate::pty::terminal::clear_screen;
use crate::pty::RawModeGuard;

/// The viewer's local display.
pub trait Screen: Send + Sync {
    /// Writes remote output.
    fn write(&self, data: &[u8]);

    /// Clears the display and homes the cursor.
    fn clear(&self);

    /// Shows a one-line notice.
    fn message(&self, text: &str);

    /// Gives the terminal back in the mode it started in.
    fn restore(&self);
}

/// The process's own terminal, kept in raw mode while the session runs.
pub struct StdoutScreen {
    raw_mode: Option<RawModeGuard>,
}

impl StdoutScreen {
    pub fn new(raw_mode: Option<RawModeGuard>) -> Self {
        Self { raw_mode }
    }
}

impl Screen for StdoutScreen {
    fn write(&self, data: &[u8]) {
        let mut out = std::io::stdout().lock();
        if let Err(e) = out.write_all(data).and_then(|_| out.flush()) {
            tracing::debug!(error = %e, "Screen write failed");
        }
    }

    fn clear(&self) {
        let mut out = std::io::stdout().lock();
        if let Err(e) = clear_screen(&mut out) {
            tracing::debug!(error = %e, "Screen clear failed");
        }
    }

    fn message(&self, text: &str) {
        // Raw mode needs the explicit carriage return.
        self.write(format!("{}\r\n", text).as_bytes());
    }

    fn restore(&self) {
        if let Some(guard) = &self.raw_mode {
            guard.restore();
        }
    }
}
