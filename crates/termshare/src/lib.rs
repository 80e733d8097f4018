//! # Termshare Library
//!
//! Share one terminal with any number of remote viewers. A small relay carries
//! the connection handshake; terminal bytes then flow peer-to-peer over WebRTC
//! data channels.
//!
//! ## Overview
//!
//! - **Relay**: rooms keyed by session ID, forwarding envelopes between members
//! - **Host**: one shell under a PTY, fanned out to a peer link per viewer
//! - **Viewer**: a single peer link to the host, with window-size negotiation
//!   so a viewer whose terminal is too small does not render garbage
//!
//! ## Architecture
//!
//! ```text
//!   ┌──────────┐   offer / answer / ice-candidate   ┌──────────┐
//!   │  Viewer  │ ◄───────────── relay ────────────► │   Host   │
//!   └────┬─────┘                                     └────┬─────┘
//!        │            "data"   keystrokes ─►              │
//!        │                     ◄─ screen output           │   ┌─────┐
//!        └──── WebRTC ─────────────────────────────────────┴──►│ PTY │
//!                     "config" window size, refresh           └─────┘
//! ```
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use termshare::network::RelayConfig;
//! use termshare::relay::RelayServer;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let server = RelayServer::bind("127.0.0.1:3000", RelayConfig::default()).await?;
//!     server.run(async { let _ = tokio::signal::ctrl_c().await; }).await?;
//!     Ok(())
//! }
//! ```
//!
//! ## Modules
//!
//! - [`config`]: Configuration loading and defaults
//! - [`network`]: Relay connection adapter and the peer transport
//! - [`relay`]: The signaling relay server
//! - [`host`]: Host session manager and `share`
//! - [`viewer`]: Viewer session and `join`
//! - [`pty`]: The shared shell and the local terminal

pub mod config;
pub mod host;
pub mod network;
pub mod pty;
pub mod relay;
pub mod viewer;

// Re-export protocol for convenience
pub use protocol;

pub use config::Config;
pub use host::{HostConfig, HostSession, LinkState};
pub use network::{RelayConfig, RelayConnection, RelayHandle, RelayInbound};
pub use relay::RelayServer;
pub use viewer::{ViewerConfig, ViewerSession};
