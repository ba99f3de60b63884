//! WebSocket connection from a chat client to the relay.
//!
//! Outbound `ClientMessage`s are queued on a channel and written by a
//! dedicated task; inbound frames are decoded by a read task and delivered
//! as [`RelayEvent`]s. There is no reconnection: once the relay is lost the
//! client keeps its direct sessions and stops talking to the relay.

use anyhow::{Context, Result};
use chat_core::{ClientMessage, RelayMessage};
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::{
    MaybeTlsStream, WebSocketStream, connect_async,
    tungstenite::{Error as WsError, Message},
};
use tracing::{debug, error, info, warn};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// What the read task observed.
#[derive(Debug)]
pub enum RelayEvent {
    Message(RelayMessage),
    /// The relay connection ended.
    Lost,
}

pub struct RelayClient {
    url: String,
    read_task: Option<JoinHandle<()>>,
    write_task: Option<JoinHandle<()>>,
}

impl RelayClient {
    /// Connect to the relay at `url`.
    ///
    /// Returns the client (which owns the I/O tasks) and the sender for
    /// outbound messages.
    pub async fn connect(
        url: &str,
        event_tx: mpsc::UnboundedSender<RelayEvent>,
    ) -> Result<(Self, mpsc::UnboundedSender<ClientMessage>)> {
        let (ws_stream, _) = connect_async(url)
            .await
            .with_context(|| format!("Failed to connect to relay at {}", url))?;
        info!("Connected to relay at {}", url);

        let (write, read) = ws_stream.split();
        let (out_tx, out_rx) = mpsc::unbounded_channel();

        let read_tx = event_tx.clone();
        let read_task = tokio::spawn(async move {
            Self::read_loop(read, read_tx).await;
        });
        let write_task = tokio::spawn(async move {
            Self::write_loop(write, out_rx, event_tx).await;
        });

        Ok((
            Self {
                url: url.to_string(),
                read_task: Some(read_task),
                write_task: Some(write_task),
            },
            out_tx,
        ))
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    async fn read_loop(
        mut read: SplitStream<WsStream>,
        event_tx: mpsc::UnboundedSender<RelayEvent>,
    ) {
        loop {
            match read.next().await {
                Some(Ok(msg)) => {
                    let data = match msg {
                        Message::Text(text) => text.into_bytes(),
                        Message::Binary(data) => data,
                        Message::Close(_) => {
                            debug!("Relay sent close frame");
                            break;
                        }
                        Message::Ping(_) | Message::Pong(_) | Message::Frame(_) => continue,
                    };

                    match RelayMessage::from_json(&data) {
                        Ok(msg) => {
                            if event_tx.send(RelayEvent::Message(msg)).is_err() {
                                return;
                            }
                        }
                        Err(e) => warn!("Dropping undecodable relay message: {}", e),
                    }
                }
                Some(Err(e)) => {
                    match e {
                        WsError::ConnectionClosed | WsError::AlreadyClosed => {
                            debug!("Relay connection closed");
                        }
                        _ => error!("Relay WebSocket error: {}", e),
                    }
                    break;
                }
                None => {
                    debug!("Relay stream ended");
                    break;
                }
            }
        }

        let _ = event_tx.send(RelayEvent::Lost);
    }

    async fn write_loop(
        mut write: SplitSink<WsStream, Message>,
        mut out_rx: mpsc::UnboundedReceiver<ClientMessage>,
        event_tx: mpsc::UnboundedSender<RelayEvent>,
    ) {
        while let Some(msg) = out_rx.recv().await {
            debug!("Sending {:?}", msg);
            if let Err(e) = write.send(Message::Text(msg.to_json())).await {
                error!("Failed to send to relay: {}", e);
                // The read side usually notices too; the sequencer ignores
                // a second loss.
                let _ = event_tx.send(RelayEvent::Lost);
                return;
            }
        }
        let _ = write.send(Message::Close(None)).await;
    }

    /// Stop both I/O tasks.
    pub fn shutdown(&mut self) {
        for task in [self.read_task.take(), self.write_task.take()]
            .into_iter()
            .flatten()
        {
            task.abort();
        }
    }
}

impl Drop for RelayClient {
    fn drop(&mut self) {
        self.shutdown();
    }
}
