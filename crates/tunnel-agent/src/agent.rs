//! Worker pool that keeps tunnel sockets pre-dialed toward the server
//! and splices each paired one onto a fresh backend connection.

use std::io;
use std::sync::Arc;
use std::time::Duration;

use socket2::{SockRef, TcpKeepalive};
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::task::JoinSet;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use tunnel_splice::{answer, splice, HandshakeError};

/// First wait after a failed dial.
const DIAL_BACKOFF_INITIAL: Duration = Duration::from_secs(1);
/// Ceiling for the doubling dial backoff.
const DIAL_BACKOFF_MAX: Duration = Duration::from_secs(30);

/// Tunnel agent errors.
#[derive(Debug, Error)]
pub enum AgentError {
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("failed to dial tunnel {addr}: {source}")]
    DialTunnel {
        addr: String,
        #[source]
        source: io::Error,
    },

    #[error("failed to dial server {addr}: {source}")]
    DialServer {
        addr: String,
        #[source]
        source: io::Error,
    },

    #[error("tunnel handshake failed: {0}")]
    Handshake(#[from] HandshakeError),

    #[error("failed to enable tunnel keepalive: {0}")]
    KeepAlive(#[source] io::Error),
}

/// Tunnel agent configuration.
#[derive(Debug, Clone)]
pub struct AgentConfig {
    /// Address of the server's tunnel port.
    pub tunnel_addr: String,
    /// Address of the hidden backend service.
    pub server_addr: String,
    /// Size of the worker pool.
    pub worker_count: usize,
    /// TCP keepalive period applied to each tunnel socket. The tunnel
    /// sits idle across NAT until a client shows up; without keepalive
    /// the NAT mapping expires underneath it.
    pub keep_alive_period: Duration,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            tunnel_addr: "127.0.0.1:5080".to_string(),
            server_addr: String::new(),
            worker_count: 32,
            keep_alive_period: Duration::from_secs(20),
        }
    }
}

struct Shared {
    config: AgentConfig,
    shutdown: CancellationToken,
}

/// NAT-side half of the reverse tunnel.
///
/// Workers run until [`TunnelAgent::shutdown`]; there is nothing to
/// listen on, so shutdown only has to cancel and join them.
pub struct TunnelAgent {
    shared: Arc<Shared>,
    tasks: JoinSet<()>,
}

impl TunnelAgent {
    pub fn new(config: AgentConfig) -> Result<Self, AgentError> {
        if config.worker_count == 0 {
            return Err(AgentError::InvalidConfig(
                "worker_count must be at least 1".to_string(),
            ));
        }

        Ok(Self {
            shared: Arc::new(Shared {
                config,
                shutdown: CancellationToken::new(),
            }),
            tasks: JoinSet::new(),
        })
    }

    /// Spawn the worker pool. Call once.
    pub fn start(&mut self) {
        for worker in 0..self.shared.config.worker_count {
            let shared = self.shared.clone();
            self.tasks.spawn(shared.worker_loop(worker));
        }
        info!(
            workers = self.shared.config.worker_count,
            tunnel = %self.shared.config.tunnel_addr,
            server = %self.shared.config.server_addr,
            "tunnel agent running"
        );
    }

    /// Tear down in-flight sessions and wait for every worker to exit.
    pub async fn shutdown(mut self) {
        self.shared.shutdown.cancel();
        while self.tasks.join_next().await.is_some() {}
        info!("tunnel agent stopped");
    }
}

impl Shared {
    async fn worker_loop(self: Arc<Self>, worker: usize) {
        let mut backoff = Backoff::new(DIAL_BACKOFF_INITIAL, DIAL_BACKOFF_MAX);
        loop {
            if self.shutdown.is_cancelled() {
                break;
            }

            let session = Uuid::new_v4();
            info!(worker, %session, "session begin");
            let outcome = tokio::select! {
                _ = self.shutdown.cancelled() => break,
                result = self.run_session(worker, session) => result,
            };
            match outcome {
                Ok(()) => backoff.reset(),
                Err(e) => {
                    warn!(worker, %session, error = %e, "session failed");
                    // Dial failures back off so a down server is not
                    // hammered; a failed handshake retries with a fresh
                    // dial immediately.
                    if matches!(
                        e,
                        AgentError::DialTunnel { .. } | AgentError::DialServer { .. }
                    ) {
                        tokio::select! {
                            _ = self.shutdown.cancelled() => break,
                            _ = backoff.wait() => {}
                        }
                    }
                }
            }
            info!(worker, %session, "session end");
        }
        info!(worker, "worker exiting");
    }

    /// One full iteration: dial the tunnel, answer the handshake, arm
    /// keepalive, dial the backend, splice until either leg ends. Both
    /// sockets are closed on every exit path by ownership.
    async fn run_session(&self, worker: usize, session: Uuid) -> Result<(), AgentError> {
        let mut tunnel = TcpStream::connect(self.config.tunnel_addr.as_str())
            .await
            .map_err(|source| AgentError::DialTunnel {
                addr: self.config.tunnel_addr.clone(),
                source,
            })?;

        answer(&mut tunnel).await?;
        set_keepalive(&tunnel, self.config.keep_alive_period)
            .map_err(AgentError::KeepAlive)?;
        debug!(worker, %session, "tunnel paired");

        let server = TcpStream::connect(self.config.server_addr.as_str())
            .await
            .map_err(|source| AgentError::DialServer {
                addr: self.config.server_addr.clone(),
                source,
            })?;
        debug!(worker, %session, "server connected");

        splice(server, tunnel, "server", "tunnel").await;
        Ok(())
    }
}

/// Enable TCP keepalive on the tunnel socket with `period` as both the
/// idle time and the probe interval.
fn set_keepalive(stream: &TcpStream, period: Duration) -> io::Result<()> {
    let keepalive = TcpKeepalive::new()
        .with_time(period)
        .with_interval(period);
    SockRef::from(stream).set_tcp_keepalive(&keepalive)
}

/// Doubling wait between failed dial attempts, capped and resettable.
struct Backoff {
    initial: Duration,
    max: Duration,
    current: Duration,
}

impl Backoff {
    fn new(initial: Duration, max: Duration) -> Self {
        Self {
            initial,
            max,
            current: initial,
        }
    }

    async fn wait(&mut self) {
        debug!(wait = ?self.current, "backing off before redial");
        sleep(self.current).await;
        self.current = (self.current * 2).min(self.max);
    }

    fn reset(&mut self) {
        self.current = self.initial;
    }

    #[cfg(test)]
    fn current(&self) -> Duration {
        self.current
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    #[test]
    fn default_config_matches_flag_defaults() {
        let config = AgentConfig::default();
        assert_eq!(config.tunnel_addr, "127.0.0.1:5080");
        assert_eq!(config.worker_count, 32);
        assert_eq!(config.keep_alive_period, Duration::from_secs(20));
    }

    #[test]
    fn new_rejects_zero_workers() {
        let config = AgentConfig {
            worker_count: 0,
            ..AgentConfig::default()
        };
        assert!(matches!(
            TunnelAgent::new(config),
            Err(AgentError::InvalidConfig(_))
        ));
    }

    #[tokio::test]
    async fn backoff_doubles_to_cap_and_resets() {
        let mut backoff =
            Backoff::new(Duration::from_millis(10), Duration::from_millis(35));
        assert_eq!(backoff.current(), Duration::from_millis(10));

        backoff.wait().await;
        assert_eq!(backoff.current(), Duration::from_millis(20));

        backoff.wait().await;
        assert_eq!(backoff.current(), Duration::from_millis(35));

        backoff.wait().await;
        assert_eq!(backoff.current(), Duration::from_millis(35));

        backoff.reset();
        assert_eq!(backoff.current(), Duration::from_millis(10));
    }

    #[tokio::test]
    async fn keepalive_is_armed_on_a_live_socket() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let (stream, accepted) =
            tokio::join!(TcpStream::connect(addr), listener.accept());
        let stream = stream.unwrap();
        let _accepted = accepted.unwrap();

        set_keepalive(&stream, Duration::from_secs(10)).unwrap();
        assert!(SockRef::from(&stream).keepalive().unwrap());
    }
}
