//! bzrelay server binary
//!
//! Listens for inbound TCP sessions, bzip2-compresses each session in memory
//! and forwards the finished stream to a storage node once the client closes.
//!
//! # Examples
//!
//! ```bash
//! # Relay port 31337 to a storage node
//! bzrelay -r storage-1.internal -p 4000
//!
//! # Faster compression, bounded concurrency, settings from a file
//! bzrelay --config /etc/bzrelay.toml -c 3 --max-workers 256
//! ```

use anyhow::Context;
use bzrelay::events::RelayEvent;
use bzrelay::metrics;
use bzrelay::{CompressionLevel, ConnectionAcceptor, RelayConfig};
use clap::Parser;
use std::path::PathBuf;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// bzrelay - streaming bzip2 compression relay
#[derive(Parser, Debug)]
#[command(name = "bzrelay")]
#[command(version = bzrelay::VERSION)]
#[command(about = "Compresses inbound TCP sessions and forwards them to a storage node", long_about = None)]
struct Cli {
    /// Bind to a specific ip address
    #[arg(short = 'b', long = "bindip")]
    bind_ip: Option<String>,

    /// Listen on this port for incoming data
    #[arg(short = 'l', long = "localport")]
    local_port: Option<u16>,

    /// Host where the compressed data is sent
    #[arg(short = 'r', long = "remoteip")]
    remote_ip: Option<String>,

    /// Port where the compressed data is sent
    #[arg(short = 'p', long = "remoteport")]
    remote_port: Option<u16>,

    /// bzip2 compression level (1-9)
    #[arg(short = 'c', long = "compress", value_parser = clap::value_parser!(u32).range(1..=9))]
    compress: Option<u32>,

    /// TOML configuration file
    #[arg(long, env = "BZRELAY_CONFIG")]
    config: Option<PathBuf>,

    /// Maximum concurrently running workers (unbounded when unset)
    #[arg(long)]
    max_workers: Option<usize>,

    /// Listen backlog
    #[arg(long)]
    backlog: Option<u32>,

    /// Accept poll and worker sweep interval in milliseconds
    #[arg(long)]
    poll_interval_ms: Option<u64>,

    /// Maximum bytes per inbound read
    #[arg(long)]
    read_chunk_size: Option<usize>,

    /// Drop inbound connections idle for this many seconds
    #[arg(long)]
    idle_timeout_secs: Option<u64>,

    /// Give up on a storage node not writable within this many seconds
    #[arg(long)]
    send_timeout_secs: Option<u64>,

    /// Give up connecting to the storage node after this many seconds
    #[arg(long)]
    connect_timeout_secs: Option<u64>,

    /// Extra forward attempts after a failure (default: none)
    #[arg(long)]
    forward_retries: Option<u32>,

    /// Seconds to wait for in-flight workers on shutdown
    #[arg(long)]
    shutdown_timeout_secs: Option<u64>,

    /// Log directory path
    #[arg(long, default_value = "logs", env = "BZRELAY_LOG_DIR")]
    log_dir: PathBuf,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info", env = "RUST_LOG")]
    log_level: String,

    /// Disable colored output
    #[arg(long)]
    no_color: bool,
}

impl Cli {
    /// Layer command line flags over file and environment configuration
    fn relay_config(&self) -> anyhow::Result<RelayConfig> {
        let mut config = RelayConfig::load(self.config.as_deref())
            .context("failed to load configuration")?;

        if let Some(bind_ip) = &self.bind_ip {
            config.bind_addr = bind_ip.clone();
        }
        if let Some(port) = self.local_port {
            config.listen_port = port;
        }
        if let Some(remote_ip) = &self.remote_ip {
            config.remote_host = remote_ip.clone();
        }
        if let Some(port) = self.remote_port {
            config.remote_port = port;
        }
        if let Some(level) = self.compress {
            config.compression_level = CompressionLevel::new(level)?;
        }
        if self.max_workers.is_some() {
            config.max_workers = self.max_workers;
        }
        if let Some(backlog) = self.backlog {
            config.backlog = backlog;
        }
        if let Some(interval) = self.poll_interval_ms {
            config.poll_interval_ms = interval;
        }
        if let Some(size) = self.read_chunk_size {
            config.read_chunk_size = size;
        }
        if self.idle_timeout_secs.is_some() {
            config.idle_timeout_secs = self.idle_timeout_secs;
        }
        if self.send_timeout_secs.is_some() {
            config.send_timeout_secs = self.send_timeout_secs;
        }
        if self.connect_timeout_secs.is_some() {
            config.connect_timeout_secs = self.connect_timeout_secs;
        }
        if let Some(retries) = self.forward_retries {
            config.forward_retries = retries;
        }
        if let Some(timeout) = self.shutdown_timeout_secs {
            config.shutdown_timeout_secs = timeout;
        }

        config.validate()?;
        Ok(config)
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Setup logging
    setup_logging(&cli)?;
    metrics::init_metrics();

    let config = cli.relay_config()?;
    info!(version = %bzrelay::VERSION, "bzrelay starting");

    let acceptor = ConnectionAcceptor::bind(config)
        .await
        .context("failed to bind listener")?;
    tokio::spawn(log_events(acceptor.subscribe()));

    let report = acceptor.serve_with_shutdown(shutdown_signal()).await?;
    if !report.aborted.is_empty() {
        warn!(
            aborted = ?report.aborted,
            "Workers aborted at shutdown, their data was not forwarded"
        );
    }

    debug!("Final metrics:\n{}", metrics::export_metrics());
    Ok(())
}

/// Setup logging with rolling files and console output
fn setup_logging(cli: &Cli) -> anyhow::Result<()> {
    std::fs::create_dir_all(&cli.log_dir)?;

    let file_appender = RollingFileAppender::new(Rotation::DAILY, &cli.log_dir, "bzrelay.log");

    let log_level = cli
        .log_level
        .parse::<tracing::Level>()
        .unwrap_or(tracing::Level::INFO);

    tracing_subscriber::registry()
        .with(
            fmt::layer()
                .with_writer(std::io::stdout)
                .with_ansi(!cli.no_color),
        )
        .with(fmt::layer().with_writer(file_appender).with_ansi(false))
        .with(EnvFilter::from_default_env().add_directive(log_level.into()))
        .init();

    Ok(())
}

/// Write every relay event as a JSON line at debug level
async fn log_events(mut events: broadcast::Receiver<RelayEvent>) {
    loop {
        match events.recv().await {
            Ok(event) => match serde_json::to_string(&event) {
                Ok(line) => debug!(target: "bzrelay::events", "{}", line),
                Err(e) => warn!(error = %e, "Failed to encode relay event"),
            },
            Err(broadcast::error::RecvError::Lagged(missed)) => {
                warn!(missed, "Relay event log lagging");
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}

/// Resolves on ctrl-c, or SIGTERM on unix
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "Failed to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    info!("Shutdown signal received");
}
