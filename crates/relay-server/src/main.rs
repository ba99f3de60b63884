//! relay-server: Signalling relay for peer-to-peer chat rooms.
//!
//! Clients create or join rooms here and exchange offers, answers and
//! candidates through it; chat text itself never passes through the relay.

use anyhow::Result;
use clap::Parser;
use relay_server::{DEFAULT_HANDSHAKE_TIMEOUT, DEFAULT_MAX_MESSAGE_SIZE, RelayServer};
use std::time::Duration;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "relay-server")]
#[command(about = "Signalling relay for peer-to-peer chat")]
struct Args {
    /// Address to listen on for client connections
    #[arg(short, long, default_value = "0.0.0.0:3000", env = "RELAY_LISTEN")]
    listen: String,

    /// Largest inbound frame accepted, in bytes
    #[arg(long, default_value_t = DEFAULT_MAX_MESSAGE_SIZE, env = "RELAY_MAX_MESSAGE_SIZE")]
    max_message_size: usize,

    /// Seconds a new connection gets to complete the WebSocket upgrade
    #[arg(long, default_value_t = DEFAULT_HANDSHAKE_TIMEOUT.as_secs(), env = "RELAY_HANDSHAKE_TIMEOUT")]
    handshake_timeout: u64,

    /// Enable verbose logging
    #[arg(long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Respects RUST_LOG, defaults to info (or debug with --verbose)
    let default_filter = if args.verbose {
        "debug,relay_server=debug"
    } else {
        "info,relay_server=info"
    };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    info!("Starting relay-server");
    info!("Max message size: {} bytes", args.max_message_size);

    let listener = RelayServer::bind(&args.listen).await?;
    let server = RelayServer::new(args.max_message_size)
        .with_handshake_timeout(Duration::from_secs(args.handshake_timeout));

    info!("Relay running. Press Ctrl+C to stop.");
    server
        .run(listener, async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!("Failed to listen for shutdown signal: {}", e);
                std::future::pending::<()>().await;
            }
        })
        .await;

    info!("Shutting down");
    Ok(())
}
