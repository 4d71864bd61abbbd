//! dbxlink reference server
//!
//! Serves an in-memory engine over the dbxlink wire protocol.

use clap::Parser;
use dbxlink_core::MemoryEngine;
use dbxlink_server::{ServerConfig, WireServer};
use std::net::SocketAddr;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

/// Serves an in-memory dbxlink engine over TCP.
#[derive(Parser)]
#[command(name = "dbxlink-server")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Address to listen on
    #[arg(short, long, default_value = "127.0.0.1:1972")]
    bind: SocketAddr,

    /// Maximum concurrent client sessions
    #[arg(long, default_value_t = 1000)]
    max_connections: usize,

    /// Idle timeout per session in milliseconds (0 waits forever)
    #[arg(long, default_value_t = 300_000)]
    read_timeout_ms: u64,

    /// Version string reported during the handshake
    #[arg(long)]
    server_version: Option<String>,

    /// Extra namespaces to create at startup
    #[arg(short, long)]
    namespace: Vec<String>,

    /// Enable verbose output
    #[arg(short, long)]
    verbose: bool,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    // Initialize logging
    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::new("info")
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let timeout = match cli.read_timeout_ms {
        0 => None,
        ms => Some(Duration::from_millis(ms)),
    };
    let mut config = ServerConfig::new(cli.bind)
        .with_max_connections(cli.max_connections)
        .with_read_timeout(timeout);
    if let Some(version) = cli.server_version {
        config = config.with_version(version);
    }

    let engine = MemoryEngine::new();
    for namespace in &cli.namespace {
        engine.add_namespace(namespace.to_uppercase());
    }

    WireServer::bind(config, engine)?.serve()?;
    Ok(())
}
