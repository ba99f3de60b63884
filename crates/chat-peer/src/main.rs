//! chat-peer: Terminal client for peer-to-peer chat rooms.
//!
//! Connects to the relay, creates or joins a room, negotiates a direct
//! WebRTC data channel with every other participant, and then sends each
//! line typed on stdin to all of them.

use anyhow::Result;
use chat_core::{EventBus, RoomId, Sequencer};
use chat_peer::display::render;
use chat_peer::{DEFAULT_STUN_URL, RelayClient, RelayEvent, WebrtcNegotiator};
use clap::Parser;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "chat-peer")]
#[command(about = "Peer-to-peer chat client")]
struct Args {
    /// Relay WebSocket URL
    #[arg(long, default_value = "ws://127.0.0.1:3000", env = "CHAT_RELAY_URL")]
    relay: String,

    /// Room to join (a new room is created when absent or too short)
    #[arg(long, env = "CHAT_ROOM")]
    room: Option<String>,

    /// STUN server used for connectivity candidates
    #[arg(long, default_value = DEFAULT_STUN_URL, env = "CHAT_STUN_URL")]
    stun: String,

    /// Enable verbose logging
    #[arg(long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Logs go to stderr so they don't interleave with chat output.
    let default_filter = if args.verbose {
        "debug,chat_peer=debug,chat_core=debug"
    } else {
        "warn,chat_peer=info,chat_core=info"
    };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    info!("Starting chat-peer");
    info!("Relay: {}", args.relay);
    info!("STUN: {}", args.stun);

    let bus = Arc::new(EventBus::new());
    let _printer = bus.subscribe(|event| println!("{}", render(&event)));

    let (relay_event_tx, mut relay_rx) = mpsc::unbounded_channel();
    let (mut relay, relay_tx) = RelayClient::connect(&args.relay, relay_event_tx).await?;

    let negotiator = Arc::new(WebrtcNegotiator::new(vec![args.stun.clone()]));
    let (mut seq, mut peer_rx) = Sequencer::new(negotiator, relay_tx, Arc::clone(&bus));

    match RoomId::from_request(args.room.as_deref()) {
        Some(room_id) => seq.join_room(room_id)?,
        None => seq.create_room()?,
    }

    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    loop {
        tokio::select! {
            Some(event) = relay_rx.recv() => {
                match event {
                    RelayEvent::Message(msg) => {
                        if let Err(e) = seq.handle_relay_message(msg).await {
                            seq.report(&e);
                        }
                    }
                    RelayEvent::Lost => seq.relay_lost(),
                }
            }

            Some(event) = peer_rx.recv() => {
                if let Err(e) = seq.handle_peer_event(event).await {
                    seq.report(&e);
                }
            }

            line = lines.next_line() => {
                match line {
                    Ok(Some(line)) => {
                        let text = line.trim();
                        if text == "/quit" {
                            break;
                        }
                        seq.send_chat(text).await;
                    }
                    Ok(None) => {
                        info!("stdin closed");
                        break;
                    }
                    Err(e) => {
                        error!("Failed to read stdin: {}", e);
                        break;
                    }
                }
            }

            _ = tokio::signal::ctrl_c() => {
                info!("Shutdown signal received");
                break;
            }
        }
    }

    seq.leave().await;
    relay.shutdown();
    info!("Left {}", relay.url());
    Ok(())
}
