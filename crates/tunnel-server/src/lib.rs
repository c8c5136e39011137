//! Server half of the reverse TCP tunnel.
//!
//! The server listens on two ports: a public port that external clients
//! dial, and a tunnel port that agents dial out to from behind NAT. A
//! pool of acceptor tasks admits clients into a bounded queue; a pool of
//! worker tasks drains it, pairing each client with the next handshaken
//! tunnel socket and splicing the two together.

mod server;

pub use server::{ServerConfig, ServerError, TunnelServer};
