//! Shared engine pieces for the reverse TCP tunnel.
//!
//! The server and agent meet in the middle of a tunnel socket; this crate
//! holds the two things both sides need: the [`handshake`] that confirms a
//! freshly paired tunnel socket belongs to a peer of this protocol, and the
//! [`splice`](splice::splice) pump that moves application bytes between a
//! paired tunnel socket and its client or backend counterpart.

pub mod handshake;
pub mod splice;

pub use handshake::{answer, greet, HandshakeError};
pub use splice::splice;
