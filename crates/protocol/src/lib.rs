//! # Termshare Protocol Library
//!
//! Wire types shared by the relay, the sharing host and its viewers.
//!
//! ## Overview
//!
//! - **Envelope**: the typed, addressed JSON message carried over the relay
//!   connection and the peer config channel
//! - **Window geometry**: terminal sizes and the mute/unmute negotiator used by
//!   viewers to stay consistent with the host
//! - **Errors**: one error enum for codec, routing and connection failures
//!
//! ## Example Usage
//!
//! ```rust
//! use protocol::{Envelope, Message, PeerId, WindowSize};
//!
//! let envelope = Envelope::new(Message::WindowSizeUpdate(WindowSize::new(24, 80)))
//!     .with_from(PeerId::host())
//!     .with_to(PeerId::new("viewer-1"));
//!
//! let json = envelope.encode().unwrap();
//! assert_eq!(Envelope::decode_str(&json).unwrap(), envelope);
//! ```
//!
//! ## Modules
//!
//! - [`envelope`]: Envelope, message kinds and peer identifiers
//! - [`geometry`]: Window sizes and the geometry negotiator
//! - [`error`]: Error types

pub mod envelope;
pub mod error;
pub mod geometry;

pub use envelope::{Envelope, Message, MessageKind, PeerId, HOST_PEER_ID};
pub use error::{ProtocolError, Result};
pub use geometry::{too_small_message, GeometryAction, Negotiator, WindowSize};
