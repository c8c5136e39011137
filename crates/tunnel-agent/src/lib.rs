//! Agent half of the reverse TCP tunnel.
//!
//! The agent runs next to the hidden backend. A pool of workers dials
//! out to the server's tunnel port, answers the handshake, dials the
//! backend, and splices the two connections until either side ends,
//! then dials again, backing off while the server or backend is
//! unreachable.

mod agent;

pub use agent::{AgentConfig, AgentError, TunnelAgent};
