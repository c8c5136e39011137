//! Dual-listener engine: acceptors feed a bounded client queue, workers
//! pair each client with a handshaken tunnel socket and splice.

use std::io;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_channel::TrySendError;
use thiserror::Error;
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use tunnel_splice::{greet, splice};

/// Tunnel server errors.
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("failed to bind {role} listener on port {port}: {source}")]
    Bind {
        role: &'static str,
        port: u16,
        #[source]
        source: io::Error,
    },

    #[error("tunnel accept failed: {0}")]
    TunnelAccept(#[source] io::Error),
}

/// Tunnel server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Port agents dial out to.
    pub tunnel_port: u16,
    /// Port external clients dial.
    pub public_port: u16,
    /// Number of concurrent acceptor tasks on the public port.
    pub acceptor_count: usize,
    /// Size of the worker pool.
    pub worker_count: usize,
    /// Capacity of the bounded client queue. Clients accepted while the
    /// queue is full and no worker is waiting are closed immediately.
    pub conn_queue_len: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            tunnel_port: 5080,
            public_port: 80,
            acceptor_count: 1,
            worker_count: 32,
            conn_queue_len: 20,
        }
    }
}

/// State shared by every acceptor and worker task.
struct Shared {
    config: ServerConfig,
    public_listener: TcpListener,
    tunnel_listener: TcpListener,
    queue_tx: async_channel::Sender<TcpStream>,
    queue_rx: async_channel::Receiver<TcpStream>,
    /// Workers parked on the dequeue side. An idle worker counts as
    /// admission capacity even when `conn_queue_len` is zero, so a
    /// client can rendezvous straight through the queue.
    idle_workers: AtomicUsize,
    shutdown: CancellationToken,
}

/// Public half of the reverse tunnel.
///
/// ```no_run
/// # use tunnel_server::{ServerConfig, TunnelServer};
/// # async fn run() -> Result<(), tunnel_server::ServerError> {
/// let mut server = TunnelServer::bind(ServerConfig::default()).await?;
/// server.start();
/// // ... wait for a shutdown signal ...
/// server.shutdown().await;
/// # Ok(())
/// # }
/// ```
pub struct TunnelServer {
    shared: Arc<Shared>,
    tasks: JoinSet<()>,
}

impl TunnelServer {
    /// Validate the configuration and bind both listeners.
    pub async fn bind(config: ServerConfig) -> Result<Self, ServerError> {
        if config.acceptor_count == 0 {
            return Err(ServerError::InvalidConfig(
                "acceptor_count must be at least 1".to_string(),
            ));
        }
        if config.worker_count == 0 {
            return Err(ServerError::InvalidConfig(
                "worker_count must be at least 1".to_string(),
            ));
        }

        let tunnel_listener =
            Self::bind_listener("tunnel", config.tunnel_port).await?;
        let public_listener =
            Self::bind_listener("public", config.public_port).await?;

        // Zero-length queues still need one physical slot for the
        // rendezvous handoff; admission keeps the steady-state depth at
        // the configured bound.
        let (queue_tx, queue_rx) =
            async_channel::bounded(config.conn_queue_len.max(1));

        Ok(Self {
            shared: Arc::new(Shared {
                config,
                public_listener,
                tunnel_listener,
                queue_tx,
                queue_rx,
                idle_workers: AtomicUsize::new(0),
                shutdown: CancellationToken::new(),
            }),
            tasks: JoinSet::new(),
        })
    }

    async fn bind_listener(
        role: &'static str,
        port: u16,
    ) -> Result<TcpListener, ServerError> {
        let addr = SocketAddr::from((Ipv4Addr::UNSPECIFIED, port));
        TcpListener::bind(addr)
            .await
            .map_err(|source| ServerError::Bind { role, port, source })
    }

    /// Address of the public listener.
    pub fn public_addr(&self) -> io::Result<SocketAddr> {
        self.shared.public_listener.local_addr()
    }

    /// Address of the tunnel listener.
    pub fn tunnel_addr(&self) -> io::Result<SocketAddr> {
        self.shared.tunnel_listener.local_addr()
    }

    /// Spawn the acceptor and worker pools. Call once.
    pub fn start(&mut self) {
        for acceptor in 0..self.shared.config.acceptor_count {
            let shared = self.shared.clone();
            self.tasks.spawn(shared.accept_loop(acceptor));
        }
        for worker in 0..self.shared.config.worker_count {
            let shared = self.shared.clone();
            self.tasks.spawn(shared.worker_loop(worker));
        }
        info!(
            acceptors = self.shared.config.acceptor_count,
            workers = self.shared.config.worker_count,
            "tunnel server running"
        );
    }

    /// Stop admitting clients, drain the queue, and wait for every task
    /// to exit. In-flight pairings and splices are torn down; queued
    /// clients that cannot be served anymore are closed. The listeners
    /// are released last.
    pub async fn shutdown(mut self) {
        self.shared.shutdown.cancel();
        self.shared.queue_tx.close();
        while self.tasks.join_next().await.is_some() {}
        info!("tunnel server stopped");
    }
}

impl Shared {
    async fn accept_loop(self: Arc<Self>, acceptor: usize) {
        loop {
            let (client, peer) = tokio::select! {
                _ = self.shutdown.cancelled() => break,
                accepted = self.public_listener.accept() => match accepted {
                    Ok(pair) => pair,
                    Err(e) => {
                        warn!(acceptor, error = %e, "client accept failed");
                        continue;
                    }
                },
            };
            debug!(acceptor, %peer, "client accepted");
            self.admit(client, peer, acceptor);
        }
        info!(acceptor, "acceptor exiting");
    }

    /// Admission test. The fullness check mirrors the original lock-free
    /// length observation: racy against sibling acceptors, overshoot
    /// bounded by the acceptor count, with `try_send` as the final
    /// arbiter. The connection is dropped (closed) on every reject path.
    fn admit(&self, client: TcpStream, peer: SocketAddr, acceptor: usize) {
        let queued = self.queue_rx.len();
        if queued >= self.config.conn_queue_len
            && self.idle_workers.load(Ordering::Acquire) == 0
        {
            warn!(acceptor, %peer, queued, "rejecting client: queue full");
            return;
        }
        if self.shutdown.is_cancelled() {
            warn!(acceptor, %peer, "rejecting client: shutting down");
            return;
        }

        match self.queue_tx.try_send(client) {
            Ok(()) => debug!(acceptor, %peer, "client enqueued"),
            Err(TrySendError::Full(_)) => {
                warn!(acceptor, %peer, "rejecting client: queue full");
            }
            Err(TrySendError::Closed(_)) => {
                warn!(acceptor, %peer, "rejecting client: shutting down");
            }
        }
    }

    async fn worker_loop(self: Arc<Self>, worker: usize) {
        loop {
            self.idle_workers.fetch_add(1, Ordering::AcqRel);
            let received = self.queue_rx.recv().await;
            self.idle_workers.fetch_sub(1, Ordering::AcqRel);

            // The queue is closed and drained: nothing left to serve.
            let Ok(client) = received else { break };

            let session = Uuid::new_v4();
            info!(worker, %session, "session begin");
            tokio::select! {
                _ = self.shutdown.cancelled() => {
                    info!(worker, %session, "session aborted: shutting down");
                }
                result = self.serve(client, worker, session) => {
                    if let Err(e) = result {
                        warn!(worker, %session, error = %e, "session failed");
                    }
                    info!(worker, %session, "session end");
                }
            }
        }
        info!(worker, "worker exiting");
    }

    /// Serve one dequeued client: obtain a handshaken tunnel socket,
    /// then splice until either leg ends. The client socket is closed on
    /// every exit path by ownership.
    async fn serve(
        &self,
        client: TcpStream,
        worker: usize,
        session: Uuid,
    ) -> Result<(), ServerError> {
        let tunnel = self.pair_tunnel(worker, session).await?;
        splice(client, tunnel, "client", "tunnel").await;
        Ok(())
    }

    /// Accept tunnel sockets until one completes the handshake. A failed
    /// candidate is dropped and the next accept is tried; the client is
    /// not retried if the tunnel listener itself fails.
    async fn pair_tunnel(
        &self,
        worker: usize,
        session: Uuid,
    ) -> Result<TcpStream, ServerError> {
        loop {
            let (mut tunnel, agent) = self
                .tunnel_listener
                .accept()
                .await
                .map_err(ServerError::TunnelAccept)?;
            match greet(&mut tunnel).await {
                Ok(()) => {
                    debug!(worker, %session, %agent, "tunnel paired");
                    return Ok(tunnel);
                }
                Err(e) => {
                    warn!(worker, %session, %agent, error = %e, "handshake failed");
                }
            }
        }
    }
}
