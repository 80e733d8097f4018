//! Signaling relay.
//!
//! Forwards envelopes between the members of a session. The relay never sees
//! terminal content; once peer links are up it only carries keep-alives.

pub mod server;
pub mod sessions;

pub use server::{RelayServer, Route};
pub use sessions::{Membership, SessionTable};
