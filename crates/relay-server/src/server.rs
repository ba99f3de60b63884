//! WebSocket relay: assigns peer IDs, tracks rooms, forwards signalling.
//!
//! The server owns the connection table and room registry outright. Read
//! tasks only push `ConnectionEvent`s into a channel, and the single event
//! loop in [`RelayServer::run`] applies them one at a time. WebSocket
//! handshakes run in their own tasks and hand finished streams back to the
//! loop, so nothing in the loop waits on a client.

use crate::connection::{ConnectionEvent, RelayConnection};
use crate::rooms::{JoinOutcome, RoomRegistry};
use anyhow::{Context, Result};
use chat_core::{ClientMessage, PeerId, RelayMessage, RoomId};
use std::collections::HashMap;
use std::future::Future;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_tungstenite::{WebSocketStream, accept_async};
use tracing::{debug, error, info, warn};

/// How long a new TCP connection gets to complete the WebSocket upgrade.
pub const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// A connection that finished its upgrade and awaits a peer ID.
type Upgraded = (WebSocketStream<TcpStream>, SocketAddr);

pub struct RelayServer {
    /// Live connections indexed by the peer ID we assigned
    connections: HashMap<PeerId, RelayConnection>,
    rooms: RoomRegistry,
    max_message_size: usize,
    handshake_timeout: Duration,
    event_tx: mpsc::UnboundedSender<ConnectionEvent>,
    event_rx: mpsc::UnboundedReceiver<ConnectionEvent>,
    upgrade_tx: mpsc::UnboundedSender<Upgraded>,
    upgrade_rx: mpsc::UnboundedReceiver<Upgraded>,
}

impl RelayServer {
    pub fn new(max_message_size: usize) -> Self {
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let (upgrade_tx, upgrade_rx) = mpsc::unbounded_channel();

        Self {
            connections: HashMap::new(),
            rooms: RoomRegistry::new(),
            max_message_size,
            handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
            event_tx,
            event_rx,
            upgrade_tx,
            upgrade_rx,
        }
    }

    pub fn with_handshake_timeout(mut self, handshake_timeout: Duration) -> Self {
        self.handshake_timeout = handshake_timeout;
        self
    }

    /// Bind to an address and return the TCP listener.
    pub async fn bind(listen_addr: &str) -> Result<TcpListener> {
        let listener = TcpListener::bind(listen_addr)
            .await
            .with_context(|| format!("Failed to bind {}", listen_addr))?;
        info!("Relay listening on {}", listener.local_addr()?);
        Ok(listener)
    }

    /// Serve until `shutdown` resolves.
    pub async fn run(mut self, listener: TcpListener, shutdown: impl Future<Output = ()>) {
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, addr)) => self.accept_connection(stream, addr),
                        Err(e) => error!("Failed to accept connection: {}", e),
                    }
                }

                Some((ws_stream, addr)) = self.upgrade_rx.recv() => {
                    self.register(ws_stream, addr);
                }

                Some(event) = self.event_rx.recv() => {
                    self.handle_event(event);
                }

                _ = &mut shutdown => {
                    info!("Shutdown signal received");
                    break;
                }
            }
        }

        info!("Closing {} connection(s)", self.connections.len());
        for conn in self.connections.values_mut() {
            conn.close().await;
        }
    }

    /// Start the WebSocket upgrade for a new TCP connection in its own task.
    /// Connections that don't finish within the handshake timeout are dropped.
    pub fn accept_connection(&self, stream: TcpStream, addr: SocketAddr) {
        let upgrade_tx = self.upgrade_tx.clone();
        let handshake_timeout = self.handshake_timeout;

        tokio::spawn(async move {
            match timeout(handshake_timeout, accept_async(stream)).await {
                Ok(Ok(ws_stream)) => {
                    let _ = upgrade_tx.send((ws_stream, addr));
                }
                Ok(Err(e)) => {
                    // Health checks connect and close without upgrading.
                    let err_str = e.to_string();
                    if err_str.contains("Handshake not finished")
                        || err_str.contains("Connection reset")
                        || err_str.contains("unexpected EOF")
                    {
                        debug!("Connection closed before upgrade from {}", addr);
                    } else {
                        error!("WebSocket upgrade failed for {}: {}", addr, e);
                    }
                }
                Err(_) => {
                    warn!(
                        "No WebSocket upgrade from {} within {:?}, dropping",
                        addr, handshake_timeout
                    );
                }
            }
        });
    }

    /// Assign an upgraded connection a peer ID and welcome it.
    fn register(&mut self, ws_stream: WebSocketStream<TcpStream>, addr: SocketAddr) {
        let peer_id = loop {
            let id = PeerId::generate();
            if !self.connections.contains_key(&id) {
                break id;
            }
        };
        info!(%peer_id, "New connection from {}", addr);

        let conn = RelayConnection::new(
            peer_id,
            ws_stream,
            self.event_tx.clone(),
            self.max_message_size,
        );
        if let Err(e) = conn.send(&RelayMessage::Welcome { peer_id }) {
            error!(%peer_id, "Failed to send welcome: {}", e);
            return;
        }

        self.connections.insert(peer_id, conn);
    }

    pub fn handle_event(&mut self, event: ConnectionEvent) {
        match event {
            ConnectionEvent::Message { peer_id, data } => self.handle_message(peer_id, &data),
            ConnectionEvent::Closed { peer_id } => self.handle_disconnect(peer_id),
        }
    }

    fn handle_message(&mut self, sender: PeerId, data: &[u8]) {
        let msg = match ClientMessage::from_json(data) {
            Ok(msg) => msg,
            Err(e) => {
                warn!(peer_id = %sender, "Dropping undecodable message: {}", e);
                return;
            }
        };
        debug!(peer_id = %sender, "Received {:?}", msg);

        match msg {
            ClientMessage::CreateRoom => {
                let room_id = self.rooms.create_room(sender);
                info!(peer_id = %sender, "Created room {}", room_id);
                self.send_to(sender, &RelayMessage::RoomCreated { room_id });
            }
            ClientMessage::JoinRoom { room_id } => self.join(sender, room_id),
            signal => {
                // Only the three signal variants remain.
                if let Some((kind, target, payload)) = signal.into_signal() {
                    if !self.connections.contains_key(&target) {
                        debug!(
                            peer_id = %sender,
                            "Dropping {} for {}: not connected",
                            kind.as_str(),
                            target
                        );
                        return;
                    }
                    self.send_to(target, &RelayMessage::signal(kind, sender, payload));
                }
            }
        }
    }

    fn join(&mut self, sender: PeerId, room_id: RoomId) {
        match self.rooms.join_room(sender, &room_id) {
            JoinOutcome::Created(room_id) => {
                info!(peer_id = %sender, "Requested room not found, created {}", room_id);
                self.send_to(sender, &RelayMessage::RoomCreated { room_id });
            }
            JoinOutcome::Joined { room_id, existing } => {
                info!(
                    peer_id = %sender,
                    "Joined room {} ({} already there)",
                    room_id,
                    existing.len()
                );
                let notice = RelayMessage::NewUserJoined { peer_id: sender };
                for member in existing {
                    self.send_to(member, &notice);
                }
            }
        }
    }

    fn handle_disconnect(&mut self, peer_id: PeerId) {
        info!(%peer_id, "Disconnected");
        self.connections.remove(&peer_id);

        let notice = RelayMessage::UserDisconnected { peer_id };
        for departure in self.rooms.leave_all(peer_id) {
            debug!(
                %peer_id,
                "Notifying {} member(s) of room {}",
                departure.remaining.len(),
                departure.room_id
            );
            for member in departure.remaining {
                self.send_to(member, &notice);
            }
        }
    }

    /// Queue a message for one connected peer. Failures are logged; the
    /// peer's own read task reports the disconnect.
    fn send_to(&self, peer_id: PeerId, msg: &RelayMessage) {
        let Some(conn) = self.connections.get(&peer_id) else {
            debug!(%peer_id, "Not connected, dropping message");
            return;
        };
        if let Err(e) = conn.send(msg) {
            warn!(%peer_id, "{}", e);
        }
    }

    /// Number of connected clients.
    pub fn peer_count(&self) -> usize {
        self.connections.len()
    }

    pub fn rooms(&self) -> &RoomRegistry {
        &self.rooms
    }
}
