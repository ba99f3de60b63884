//! One client's WebSocket connection to the relay.
//!
//! The stream is split: a spawned read task forwards frames to the server's
//! event channel, and a write task drains an outbound queue into the socket.
//! Sending never waits on the peer, so a client that stops reading only
//! backs up its own queue.

use anyhow::{Result, anyhow};
use chat_core::{PeerId, RelayMessage};
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::{
    WebSocketStream,
    tungstenite::{Error as WsError, Message},
};
use tracing::{debug, error, warn};

/// Default cap on a single inbound frame.
pub const DEFAULT_MAX_MESSAGE_SIZE: usize = 64 * 1024;

/// How long `close` waits for queued frames to flush.
const CLOSE_FLUSH_TIMEOUT: Duration = Duration::from_secs(1);

/// Event emitted by a connection's read task.
#[derive(Debug)]
pub enum ConnectionEvent {
    /// A frame arrived; not decoded yet.
    Message { peer_id: PeerId, data: Vec<u8> },
    /// The connection ended, for whatever reason.
    Closed { peer_id: PeerId },
}

type WsSink = SplitSink<WebSocketStream<TcpStream>, Message>;

pub struct RelayConnection {
    peer_id: PeerId,
    outbound: mpsc::UnboundedSender<Message>,
    read_task: Option<JoinHandle<()>>,
    write_task: Option<JoinHandle<()>>,
}

impl RelayConnection {
    /// Wrap an upgraded stream and start reading from it.
    pub fn new(
        peer_id: PeerId,
        ws_stream: WebSocketStream<TcpStream>,
        event_tx: mpsc::UnboundedSender<ConnectionEvent>,
        max_message_size: usize,
    ) -> Self {
        let (write, read) = ws_stream.split();

        let (outbound, outbound_rx) = mpsc::unbounded_channel();

        let read_task = tokio::spawn(async move {
            Self::read_loop(peer_id, read, event_tx, max_message_size).await;
        });
        let write_task = tokio::spawn(async move {
            Self::write_loop(peer_id, write, outbound_rx).await;
        });

        Self {
            peer_id,
            outbound,
            read_task: Some(read_task),
            write_task: Some(write_task),
        }
    }

    pub fn peer_id(&self) -> PeerId {
        self.peer_id
    }

    async fn read_loop(
        peer_id: PeerId,
        mut read: SplitStream<WebSocketStream<TcpStream>>,
        event_tx: mpsc::UnboundedSender<ConnectionEvent>,
        max_message_size: usize,
    ) {
        loop {
            match read.next().await {
                Some(Ok(msg)) => {
                    let data = match msg {
                        Message::Text(text) => text.into_bytes(),
                        Message::Binary(data) => data,
                        Message::Close(_) => {
                            debug!(%peer_id, "Received close frame");
                            break;
                        }
                        Message::Ping(_) | Message::Pong(_) | Message::Frame(_) => continue,
                    };

                    if data.len() > max_message_size {
                        warn!(
                            %peer_id,
                            "Message exceeds max size ({} > {}), dropping",
                            data.len(),
                            max_message_size
                        );
                        continue;
                    }

                    if event_tx
                        .send(ConnectionEvent::Message { peer_id, data })
                        .is_err()
                    {
                        // Server is gone; nobody left to read for.
                        return;
                    }
                }
                Some(Err(e)) => {
                    match e {
                        WsError::ConnectionClosed | WsError::AlreadyClosed => {
                            debug!(%peer_id, "Connection closed");
                        }
                        _ => error!(%peer_id, "WebSocket error: {}", e),
                    }
                    break;
                }
                None => {
                    debug!(%peer_id, "Stream ended");
                    break;
                }
            }
        }

        let _ = event_tx.send(ConnectionEvent::Closed { peer_id });
    }

    async fn write_loop(
        peer_id: PeerId,
        mut write: WsSink,
        mut outbound_rx: mpsc::UnboundedReceiver<Message>,
    ) {
        while let Some(msg) = outbound_rx.recv().await {
            let closing = matches!(msg, Message::Close(_));
            if let Err(e) = write.send(msg).await {
                // The read task reports the disconnect.
                debug!(%peer_id, "Write failed: {}", e);
                return;
            }
            if closing {
                return;
            }
        }
    }

    /// Queue one protocol message as a text frame. Never waits on the peer.
    pub fn send(&self, msg: &RelayMessage) -> Result<()> {
        self.outbound
            .send(Message::Text(msg.to_json()))
            .map_err(|_| anyhow!("Failed to send to {}: writer stopped", self.peer_id))
    }

    /// Close the connection gracefully, giving queued frames a moment to flush.
    pub async fn close(&mut self) {
        let _ = self.outbound.send(Message::Close(None));
        if let Some(mut task) = self.write_task.take() {
            if tokio::time::timeout(CLOSE_FLUSH_TIMEOUT, &mut task)
                .await
                .is_err()
            {
                task.abort();
            }
        }
        if let Some(task) = self.read_task.take() {
            task.abort();
        }
    }
}

impl Drop for RelayConnection {
    fn drop(&mut self) {
        if let Some(task) = self.read_task.take() {
            task.abort();
        }
        if let Some(task) = self.write_task.take() {
            task.abort();
        }
    }
}
