//! Window geometry negotiation.
//!
//! A viewer can only render the host's screen correctly when its own terminal
//! is at least as large as the host's. The [`Negotiator`] tracks the last known
//! local and remote sizes and decides, on every change, whether the viewer
//! should mute its display or unmute and ask the host for a redraw.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Terminal dimensions in character cells.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct WindowSize {
    pub rows: u16,
    pub cols: u16,
}

impl WindowSize {
    pub fn new(rows: u16, cols: u16) -> Self {
        Self { rows, cols }
    }

    /// Returns true if `self` is smaller than `other` in either dimension.
    pub fn is_smaller_than(&self, other: &WindowSize) -> bool {
        self.rows < other.rows || self.cols < other.cols
    }
}

impl fmt::Display for WindowSize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}", self.cols, self.rows)
    }
}

/// What the viewer should do after an evaluation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GeometryAction {
    /// At least one size is still unknown; do nothing.
    Pending,
    /// Local terminal is too small: mute output, clear, show the advisory.
    Mute { local: WindowSize, remote: WindowSize },
    /// Local terminal just became large enough: unmute, clear, request a refresh.
    Unmute,
    /// Already unmuted and still large enough.
    Unchanged,
}

/// Decides when a viewer mutes or unmutes its display.
#[derive(Debug, Default)]
pub struct Negotiator {
    local: Option<WindowSize>,
    remote: Option<WindowSize>,
    muted: bool,
    unmuted_once: bool,
}

impl Negotiator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records the viewer's own terminal size and re-evaluates.
    pub fn set_local(&mut self, size: WindowSize) -> GeometryAction {
        self.local = Some(size);
        self.evaluate()
    }

    /// Records the host's terminal size and re-evaluates.
    pub fn set_remote(&mut self, size: WindowSize) -> GeometryAction {
        self.remote = Some(size);
        self.evaluate()
    }

    pub fn local(&self) -> Option<WindowSize> {
        self.local
    }

    pub fn remote(&self) -> Option<WindowSize> {
        self.remote
    }

    pub fn is_muted(&self) -> bool {
        self.muted
    }

    /// Evaluates the current sizes from scratch.
    ///
    /// The fit test ignores history; only the `Unmute` action is edge
    /// triggered so a refresh is requested once per transition.
    pub fn evaluate(&mut self) -> GeometryAction {
        let (Some(local), Some(remote)) = (self.local, self.remote) else {
            return GeometryAction::Pending;
        };

        if local.is_smaller_than(&remote) {
            self.muted = true;
            return GeometryAction::Mute { local, remote };
        }

        let transition = self.muted || !self.unmuted_once;
        self.muted = false;
        self.unmuted_once = true;
        if transition {
            GeometryAction::Unmute
        } else {
            GeometryAction::Unchanged
        }
    }
}

/// Advisory shown while the viewer is muted.
pub fn too_small_message(local: WindowSize, remote: WindowSize, exit_hint: &str) -> String {
    format!(
        "Your terminal is {local} but the host's is {remote}. \
         Enlarge your window to at least {remote}, or press {exit_hint} to exit."
    )
}
