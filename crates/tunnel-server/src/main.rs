//! Reverse tunnel server CLI.
//!
//! Binds the public and tunnel listeners, runs the acceptor and worker
//! pools, and drains them on SIGINT/SIGTERM.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};
use tracing::info;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};
use tunnel_server::{ServerConfig, TunnelServer};

/// Reverse tunnel server - exposes a NAT-hidden service through agents that dial out
#[derive(Parser, Debug)]
#[command(name = "tunnel-server")]
#[command(about = "Reverse tunnel server - exposes a NAT-hidden service through agents that dial out")]
#[command(version = concat!(env!("GIT_TAG"), " (", env!("GIT_HASH"), ")"))]
#[command(long_about = r#"
The tunnel server listens on two ports: a public port that external
clients dial, and a tunnel port that agents dial out to. Each client
connection is paired with the next handshaken agent connection and the
two are spliced together.

EXAMPLES:
  # Defaults: public port 80, tunnel port 5080
  tunnel-server

  # Custom ports and pool sizes, JSON logs on stdout
  tunnel-server --server.publicPort 8000 --server.tunnelPort 5080 \
    --server.workerCount 16 --server.acceptorCount 5 \
    --server.connQueueLen 200 --logFormat json

  # Rotating JSON log file
  tunnel-server --server.publicPort 8000 --logFile log/tunnel-server.log

ENVIRONMENT VARIABLES:
  TUNNEL_SERVER_TUNNEL_PORT     Tunnel listen port
  TUNNEL_SERVER_PUBLIC_PORT     Public listen port
  TUNNEL_SERVER_ACCEPTOR_COUNT  Acceptor task count
  TUNNEL_SERVER_WORKER_COUNT    Worker pool size
  TUNNEL_SERVER_CONN_QUEUE_LEN  Client queue capacity
  TUNNEL_SERVER_LOG_FORMAT      text or json
  TUNNEL_SERVER_LOG_FILE        Rotating JSON log file path
  TUNNEL_SERVER_LOG_LEVEL       Log filter directives
"#)]
struct Args {
    /// Port agents dial out to
    #[arg(long = "server.tunnelPort", env = "TUNNEL_SERVER_TUNNEL_PORT", default_value_t = 5080)]
    tunnel_port: u16,

    /// Port external clients dial
    #[arg(long = "server.publicPort", env = "TUNNEL_SERVER_PUBLIC_PORT", default_value_t = 80)]
    public_port: u16,

    /// Number of acceptor tasks on the public port
    #[arg(long = "server.acceptorCount", env = "TUNNEL_SERVER_ACCEPTOR_COUNT", default_value_t = 1)]
    acceptor_count: usize,

    /// Size of the worker pool
    #[arg(long = "server.workerCount", env = "TUNNEL_SERVER_WORKER_COUNT", default_value_t = 32)]
    worker_count: usize,

    /// Client queue capacity; clients beyond it are rejected immediately
    #[arg(long = "server.connQueueLen", env = "TUNNEL_SERVER_CONN_QUEUE_LEN", default_value_t = 20)]
    conn_queue_len: usize,

    /// Log format for stdout output
    #[arg(long = "logFormat", env = "TUNNEL_SERVER_LOG_FORMAT", value_enum, default_value = "text")]
    log_format: LogFormat,

    /// Write JSON logs to this file instead of stdout, rotating daily
    #[arg(long = "logFile", env = "TUNNEL_SERVER_LOG_FILE")]
    log_file: Option<PathBuf>,

    /// Log filter directives (e.g. "info" or "tunnel_server=debug,info")
    #[arg(long = "logLevel", env = "TUNNEL_SERVER_LOG_LEVEL", default_value = "info")]
    log_level: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum LogFormat {
    /// Human-readable lines
    Text,
    /// One JSON object per line
    Json,
}

/// Build the subscriber selected on the command line. The returned guard
/// keeps the non-blocking file writer alive for the process lifetime.
fn setup_logging(args: &Args) -> Result<Option<WorkerGuard>> {
    let filter = EnvFilter::try_new(&args.log_level)
        .with_context(|| format!("invalid log level: {}", args.log_level))?;

    if let Some(path) = &args.log_file {
        let directory = path.parent().filter(|p| !p.as_os_str().is_empty());
        let file_name = path
            .file_name()
            .context("log file path has no file name")?;
        let appender = tracing_appender::rolling::daily(
            directory.unwrap_or_else(|| std::path::Path::new(".")),
            file_name,
        );
        let (writer, guard) = tracing_appender::non_blocking(appender);
        tracing_subscriber::registry()
            .with(fmt::layer().json().with_writer(writer))
            .with(filter)
            .init();
        return Ok(Some(guard));
    }

    match args.log_format {
        LogFormat::Json => {
            tracing_subscriber::registry()
                .with(fmt::layer().json())
                .with(filter)
                .init();
        }
        LogFormat::Text => {
            tracing_subscriber::registry()
                .with(fmt::layer().with_target(true).with_thread_ids(false))
                .with(filter)
                .init();
        }
    }
    Ok(None)
}

/// Wait for SIGINT or, on unix, SIGTERM.
async fn shutdown_signal() -> Result<()> {
    #[cfg(unix)]
    {
        let mut term =
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                .context("failed to install SIGTERM handler")?;
        tokio::select! {
            result = tokio::signal::ctrl_c() => {
                result.context("failed to wait for SIGINT")?;
            }
            _ = term.recv() => {}
        }
    }
    #[cfg(not(unix))]
    tokio::signal::ctrl_c()
        .await
        .context("failed to wait for SIGINT")?;
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let _guard = setup_logging(&args)?;

    let config = ServerConfig {
        tunnel_port: args.tunnel_port,
        public_port: args.public_port,
        acceptor_count: args.acceptor_count,
        worker_count: args.worker_count,
        conn_queue_len: args.conn_queue_len,
    };

    let mut server = TunnelServer::bind(config)
        .await
        .context("failed to start tunnel server")?;
    info!(
        public = %server.public_addr().context("public listener address")?,
        tunnel = %server.tunnel_addr().context("tunnel listener address")?,
        "listening"
    );

    server.start();

    shutdown_signal().await?;
    info!("shutdown signal received, draining");
    server.shutdown().await;

    Ok(())
}
