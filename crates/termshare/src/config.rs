//! Configuration management for termshare.
//!
//! One TOML file with a section per role. Every section has defaults, so an
//! empty or missing file is a valid configuration.
//! The default configuration path is `~/.config/termshare/config.toml`.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;
use thiserror::Error;

use crate::host::HostConfig;
use crate::network::connection::{Heartbeat, RelayConfig};
use crate::network::webrtc::{IceServer, WebRtcConfig};
use crate::viewer::ViewerConfig;

/// Default signaling relay the host and viewers connect to.
pub const DEFAULT_SIGNALING_URL: &str = "ws://localhost:3000";

/// Default address the relay listens on.
pub const DEFAULT_LISTEN_ADDR: &str = "0.0.0.0:3000";

/// Configuration validation errors.
#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error("signaling_url must start with ws:// or wss://, got {0}")]
    InvalidSignalingUrl(String),

    #[error("ICE server URL must start with stun:, stuns:, turn: or turns:, got {0}")]
    InvalidIceServerUrl(String),

    #[error("shell path does not exist: {0}")]
    InvalidShellPath(String),

    #[error("log_level must be one of: trace, debug, info, warn, error; got {0}")]
    InvalidLogLevel(String),

    #[error("queue_capacity must be greater than 0")]
    InvalidQueueCapacity,

    #[error("close_grace_ms must be between 1 and 10000, got {0}")]
    InvalidCloseGrace(u64),

    #[error("keepalive_interval_secs must be greater than 0")]
    InvalidKeepaliveInterval,

    #[error("winsize_retry_interval_ms and winsize_retry_attempts must be greater than 0")]
    InvalidRetry,

    #[error("escape_byte must be an ASCII control character, got {0:#04x}")]
    InvalidEscapeByte(u8),
}

/// Valid log level values for tracing configuration.
const VALID_LOG_LEVELS: &[&str] = &["trace", "debug", "info", "warn", "error"];

/// Main configuration structure for termshare.
#[derive(Debug, Clone, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct Config {
    /// General settings.
    pub general: GeneralConfig,

    /// Signaling relay and ICE servers.
    pub network: NetworkConfig,

    /// Settings for `termshare relay`.
    pub relay: RelaySettings,

    /// Settings for `termshare share`.
    pub host: HostSettings,

    /// Settings for `termshare join`.
    pub viewer: ViewerSettings,
}

/// General configuration.
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default)]
pub struct GeneralConfig {
    /// Directory holding the log file.
    pub data_dir: PathBuf,

    /// Logging level (trace, debug, info, warn, error).
    pub log_level: String,
}

/// A TURN server with its credentials.
#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct TurnServer {
    pub url: String,
    pub username: String,
    pub credential: String,
}

/// Network configuration for signaling and WebRTC.
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default)]
pub struct NetworkConfig {
    /// Base URL of the signaling relay.
    pub signaling_url: String,

    /// List of STUN servers for NAT traversal.
    pub stun_servers: Vec<String>,

    /// Fallback relays used when a direct path cannot be found.
    pub turn_servers: Vec<TurnServer>,

    /// Whether the TURN servers are offered to the transport at all.
    pub use_turn: bool,
}

/// Relay server configuration.
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default)]
pub struct RelaySettings {
    /// Address to listen on.
    pub listen_addr: String,

    /// Capacity of each connection's inbound and outbound queue.
    pub queue_capacity: usize,

    /// How long to wait for a close frame to go out before dropping the socket.
    pub close_grace_ms: u64,
}

/// Host configuration.
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default)]
pub struct HostSettings {
    /// Shell to run inside the shared terminal.
    pub shell: String,

    /// Seconds between keep-alive pings sent through the relay.
    pub keepalive_interval_secs: u64,

    /// Delay between window-size delivery attempts.
    pub winsize_retry_interval_ms: u64,

    /// Maximum window-size delivery attempts per viewer.
    pub winsize_retry_attempts: u32,
}

/// Viewer configuration.
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default)]
pub struct ViewerSettings {
    /// Control byte that ends the session when pressed twice (0x18 is Ctrl-X).
    pub escape_byte: u8,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            log_level: "info".to_string(),
        }
    }
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            signaling_url: DEFAULT_SIGNALING_URL.to_string(),
            stun_servers: vec![
                "stun:stun.l.google.com:19302".to_string(),
                "stun:stun1.l.google.com:19302".to_string(),
            ],
            turn_servers: Vec::new(),
            use_turn: true,
        }
    }
}

impl Default for RelaySettings {
    fn default() -> Self {
        Self {
            listen_addr: DEFAULT_LISTEN_ADDR.to_string(),
            queue_capacity: 256,
            close_grace_ms: 1000,
        }
    }
}

impl Default for HostSettings {
    fn default() -> Self {
        Self {
            shell: default_shell(),
            keepalive_interval_secs: 5,
            winsize_retry_interval_ms: 200,
            winsize_retry_attempts: 25,
        }
    }
}

impl Default for ViewerSettings {
    fn default() -> Self {
        Self { escape_byte: 0x18 }
    }
}

/// Returns the default configuration file path.
pub fn default_config_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("termshare")
        .join("config.toml")
}

/// Returns the default data directory path.
fn default_data_dir() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("termshare")
}

/// Returns the default shell for the current platform.
fn default_shell() -> String {
    if cfg!(windows) {
        "powershell.exe".to_string()
    } else {
        std::env::var("SHELL").unwrap_or_else(|_| "/bin/sh".to_string())
    }
}

impl Config {
    /// Apply environment variable overrides to the configuration.
    ///
    /// Environment variables take precedence over config file values.
    /// Supported variables:
    /// - TERMSHARE_SIGNALING_URL: Override signaling relay URL
    /// - TERMSHARE_LOG_LEVEL: Override log level (trace, debug, info, warn, error)
    ///
    /// Runs before logging is set up, so it returns one note per override for
    /// the caller to log afterwards.
    pub fn apply_env_overrides(&mut self) -> Vec<String> {
        let mut notes = Vec::new();

        if let Ok(url) = std::env::var("TERMSHARE_SIGNALING_URL") {
            if !url.is_empty() {
                notes.push(format!("Overriding signaling_url from environment: {}", url));
                self.network.signaling_url = url;
            }
        }

        if let Ok(level) = std::env::var("TERMSHARE_LOG_LEVEL") {
            if !level.is_empty() {
                notes.push(format!("Overriding log_level from environment: {}", level));
                self.general.log_level = level;
            }
        }

        notes
    }

    /// Validate the configuration values.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let url = &self.network.signaling_url;
        if !url.starts_with("ws://") && !url.starts_with("wss://") {
            return Err(ConfigError::InvalidSignalingUrl(url.clone()));
        }

        let ice_urls = self
            .network
            .stun_servers
            .iter()
            .chain(self.network.turn_servers.iter().map(|t| &t.url));
        for ice_url in ice_urls {
            let known = ["stun:", "stuns:", "turn:", "turns:"]
                .iter()
                .any(|scheme| ice_url.starts_with(scheme));
            if !known {
                return Err(ConfigError::InvalidIceServerUrl(ice_url.clone()));
            }
        }

        if self.relay.queue_capacity == 0 {
            return Err(ConfigError::InvalidQueueCapacity);
        }

        if self.relay.close_grace_ms == 0 || self.relay.close_grace_ms > 10_000 {
            return Err(ConfigError::InvalidCloseGrace(self.relay.close_grace_ms));
        }

        if self.host.keepalive_interval_secs == 0 {
            return Err(ConfigError::InvalidKeepaliveInterval);
        }

        if self.host.winsize_retry_interval_ms == 0 || self.host.winsize_retry_attempts == 0 {
            return Err(ConfigError::InvalidRetry);
        }

        if !self.viewer.escape_byte.is_ascii_control() {
            return Err(ConfigError::InvalidEscapeByte(self.viewer.escape_byte));
        }

        let level = self.general.log_level.to_lowercase();
        if !VALID_LOG_LEVELS.contains(&level.as_str()) {
            return Err(ConfigError::InvalidLogLevel(self.general.log_level.clone()));
        }

        Ok(())
    }

    /// Validate the shell used by `termshare share`.
    ///
    /// Kept apart from [`Config::validate`] so that `join` and `relay` work on
    /// machines where the configured shell does not exist.
    pub fn validate_shell(&self) -> Result<(), ConfigError> {
        let shell_path = Path::new(&self.host.shell);

        if shell_path.is_absolute() {
            if !shell_path.exists() {
                return Err(ConfigError::InvalidShellPath(self.host.shell.clone()));
            }
        } else if which::which(&self.host.shell).is_err() {
            return Err(ConfigError::InvalidShellPath(self.host.shell.clone()));
        }

        Ok(())
    }

    /// Reads `path`, falling back to the defaults when there is no file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let contents = match fs::read_to_string(path) {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!(path = %path.display(), "No config file, using defaults");
                return Ok(Self::default());
            }
            Err(e) => {
                return Err(e).with_context(|| format!("Cannot read {}", path.display()));
            }
        };

        Self::from_toml(&contents)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))
    }

    pub fn from_toml(text: &str) -> Result<Self> {
        toml::from_str(text)
            .map_err(|e| anyhow::anyhow!("Invalid TOML configuration: {}", describe_toml_error(&e)))
    }

    /// ICE servers handed to every new peer transport.
    ///
    /// STUN servers are always present; TURN servers are appended unless
    /// disabled here or with `use_turn = false`.
    pub fn webrtc_config(&self, disable_turn: bool) -> WebRtcConfig {
        let mut ice_servers = Vec::new();
        if !self.network.stun_servers.is_empty() {
            ice_servers.push(IceServer::stun(self.network.stun_servers.iter().cloned()));
        }
        ice_servers.extend(
            self.network
                .turn_servers
                .iter()
                .map(|turn| IceServer::turn(&turn.url, &turn.username, &turn.credential)),
        );

        let config = WebRtcConfig::new(ice_servers);
        if self.network.use_turn && !disable_turn {
            config
        } else {
            config.without_turn()
        }
    }

    /// Settings for one relay connection on the client side.
    pub fn client_relay_config(&self) -> RelayConfig {
        RelayConfig {
            heartbeat: Some(Heartbeat::default()),
            ..self.server_relay_config()
        }
    }

    /// Settings for one relay connection accepted by the server.
    pub fn server_relay_config(&self) -> RelayConfig {
        RelayConfig {
            queue_capacity: self.relay.queue_capacity,
            close_grace: Duration::from_millis(self.relay.close_grace_ms),
            heartbeat: None,
        }
    }

    pub fn host_config(&self) -> HostConfig {
        HostConfig {
            keepalive_interval: Duration::from_secs(self.host.keepalive_interval_secs),
            winsize_retry_interval: Duration::from_millis(self.host.winsize_retry_interval_ms),
            winsize_retry_attempts: self.host.winsize_retry_attempts,
        }
    }

    pub fn viewer_config(&self) -> ViewerConfig {
        ViewerConfig {
            escape_byte: self.viewer.escape_byte,
        }
    }
}

/// The parser's message plus the byte range it points at.
fn describe_toml_error(error: &toml::de::Error) -> String {
    match error.span() {
        Some(span) => format!("{} (bytes {}..{})", error.message(), span.start, span.end),
        None => error.message().to_string(),
    }
}
