//! Reverse tunnel agent CLI.
//!
//! Validates the addresses, starts the worker pool, and tears it down
//! on SIGINT/SIGTERM.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};
use tracing::info;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};
use tunnel_agent::{AgentConfig, TunnelAgent};

/// Reverse tunnel agent - dials out to the tunnel server and forwards its traffic to a hidden service
#[derive(Parser, Debug)]
#[command(name = "tunnel-agent")]
#[command(about = "Reverse tunnel agent - dials out to the tunnel server and forwards its traffic to a hidden service")]
#[command(version = concat!(env!("GIT_TAG"), " (", env!("GIT_HASH"), ")"))]
#[command(long_about = r#"
The tunnel agent runs next to a service that the public internet cannot
reach. Each worker dials out to the tunnel server, waits to be paired
with an external client, connects to the hidden service, and splices
the two connections together.

EXAMPLES:
  # Forward tunnel traffic to a local service
  tunnel-agent --agent.tunnelAddr 127.0.0.1:5080 --agent.serverAddr 127.0.0.1:9000

  # Bigger pool, 30s keepalive, JSON logs on stdout
  tunnel-agent --agent.tunnelAddr tunnel.example.com:5080 \
    --agent.serverAddr 10.0.0.7:9000 \
    --agent.workerCount 16 --agent.keepAlivePeriod 30 --logFormat json

ENVIRONMENT VARIABLES:
  TUNNEL_AGENT_TUNNEL_ADDR        Tunnel server address (host:port)
  TUNNEL_AGENT_SERVER_ADDR        Hidden service address (host:port)
  TUNNEL_AGENT_WORKER_COUNT       Worker pool size
  TUNNEL_AGENT_KEEP_ALIVE_PERIOD  Tunnel keepalive period in seconds
  TUNNEL_AGENT_LOG_FORMAT         text or json
  TUNNEL_AGENT_LOG_FILE           Rotating JSON log file path
  TUNNEL_AGENT_LOG_LEVEL          Log filter directives
"#)]
struct Args {
    /// Tunnel server address (host:port)
    #[arg(long = "agent.tunnelAddr", env = "TUNNEL_AGENT_TUNNEL_ADDR", default_value = "127.0.0.1:5080")]
    tunnel_addr: String,

    /// Hidden service address to forward tunnel traffic to (host:port)
    #[arg(long = "agent.serverAddr", env = "TUNNEL_AGENT_SERVER_ADDR")]
    server_addr: String,

    /// Size of the worker pool
    #[arg(long = "agent.workerCount", env = "TUNNEL_AGENT_WORKER_COUNT", default_value_t = 32)]
    worker_count: usize,

    /// Tunnel keepalive period in seconds
    #[arg(long = "agent.keepAlivePeriod", env = "TUNNEL_AGENT_KEEP_ALIVE_PERIOD", default_value_t = 20)]
    keep_alive_period: u64,

    /// Log format for stdout output
    #[arg(long = "logFormat", env = "TUNNEL_AGENT_LOG_FORMAT", value_enum, default_value = "text")]
    log_format: LogFormat,

    /// Write JSON logs to this file instead of stdout, rotating daily
    #[arg(long = "logFile", env = "TUNNEL_AGENT_LOG_FILE")]
    log_file: Option<PathBuf>,

    /// Log filter directives (e.g. "info" or "tunnel_agent=debug,info")
    #[arg(long = "logLevel", env = "TUNNEL_AGENT_LOG_LEVEL", default_value = "info")]
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

/// Validate address format (should be host:port).
fn validate_address(addr: &str, addr_type: &str) -> Result<()> {
    let (host, port) = addr.rsplit_once(':').with_context(|| {
        format!(
            "invalid {} address '{}' (expected format: host:port)",
            addr_type, addr
        )
    })?;

    if host.is_empty() {
        anyhow::bail!(
            "invalid {} address '{}' (host cannot be empty)",
            addr_type,
            addr
        );
    }

    port.parse::<u16>().with_context(|| {
        format!("invalid port in {} address '{}'", addr_type, addr)
    })?;

    Ok(())
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

    validate_address(&args.tunnel_addr, "tunnel")?;
    validate_address(&args.server_addr, "server")?;

    let config = AgentConfig {
        tunnel_addr: args.tunnel_addr,
        server_addr: args.server_addr,
        worker_count: args.worker_count,
        keep_alive_period: Duration::from_secs(args.keep_alive_period),
    };

    let mut agent = TunnelAgent::new(config).context("failed to create tunnel agent")?;
    agent.start();

    shutdown_signal().await?;
    info!("shutdown signal received, draining");
    agent.shutdown().await;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validate_address_accepts_host_port() {
        assert!(validate_address("tunnel.example.com:5080", "tunnel").is_ok());
        assert!(validate_address("localhost:9000", "server").is_ok());
        assert!(validate_address("192.168.1.100:8080", "server").is_ok());
    }

    #[test]
    fn validate_address_rejects_malformed() {
        assert!(validate_address("tunnel.example.com", "tunnel").is_err());
        assert!(validate_address("tunnel.example.com:", "tunnel").is_err());
        assert!(validate_address("tunnel.example.com:abc", "tunnel").is_err());
        assert!(validate_address(":5080", "tunnel").is_err());
        assert!(validate_address("", "server").is_err());
    }
}
