//! Host side of a shared terminal.
//!
//! - [`manager`]: the per-viewer link table and the PTY fan-out
//! - [`peer_link`]: one viewer's link and its state machine
//! - [`share`]: the `termshare share` command

pub mod manager;
pub mod peer_link;
pub mod share;

use std::time::Duration;

pub use manager::HostSession;
pub use peer_link::{LinkState, PeerLink};
pub use share::{run_share, ShareOptions};

/// Environment variable telling shells inside a shared session which session
/// they belong to.
pub const SESSION_ENV_VAR: &str = "TERMSHARE_SESSIONID";

/// Host tuning, built from the `[host]` config section.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostConfig {
    /// Interval between keep-alive pings through the relay.
    pub keepalive_interval: Duration,
    /// Delay between window-size delivery attempts.
    pub winsize_retry_interval: Duration,
    /// Window-size delivery attempts before giving up.
    pub winsize_retry_attempts: u32,
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            keepalive_interval: Duration::from_secs(5),
            winsize_retry_interval: Duration::from_millis(200),
            winsize_retry_attempts: 25,
        }
    }
}
