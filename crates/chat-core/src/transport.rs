//! Traits for the connection-negotiation primitive.
//!
//! Implementations:
//! - Loopback: in-process pairing for tests and demos ([`crate::loopback`])
//! - WebRTC: webrtc-rs peer connections with data channels (chat-peer)
//!
//! Implementations never call back into chat logic. Everything they observe
//! (local candidates, channel open/message/close) is pushed as a
//! [`PeerEvent`] into the channel handed to [`Negotiator::connect`].

use crate::peer_id::PeerId;
use crate::protocol::{IceCandidate, SessionDescription};
use async_trait::async_trait;
use std::fmt::{self, Debug, Display, Formatter};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use thiserror::Error;
use tokio::sync::mpsc;

#[derive(Debug, Error)]
pub enum RtcError {
    #[error("Negotiation rejected: {0}")]
    Rejected(String),

    #[error("Invalid negotiation payload: {0}")]
    InvalidPayload(String),

    #[error("Invalid negotiation state: {0}")]
    InvalidState(String),

    #[error("Connection closed")]
    Closed,
}

pub type Result<T> = std::result::Result<T, RtcError>;

/// Identity of one connection handle.
///
/// A peer can be re-negotiated, so events are matched against the handle
/// currently registered for that peer, not just the peer ID.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(u64);

impl ConnectionId {
    /// Allocate a process-unique connection ID.
    pub fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        Self(NEXT.fetch_add(1, Ordering::Relaxed))
    }
}

impl Display for ConnectionId {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// Event observed by a negotiation primitive for one remote peer.
#[derive(Debug)]
pub enum PeerEvent {
    /// We discovered a local candidate that the remote side needs.
    LocalCandidate {
        peer_id: PeerId,
        connection_id: ConnectionId,
        candidate: IceCandidate,
    },
    /// The data channel is open and can carry chat text.
    ChannelOpen {
        peer_id: PeerId,
        connection_id: ConnectionId,
        channel: Arc<dyn DataChannel>,
    },
    /// Chat text arrived over the data channel.
    ChannelMessage {
        peer_id: PeerId,
        connection_id: ConnectionId,
        text: String,
    },
    /// The data channel closed (remote left, network dropped, or we closed it).
    ChannelClosed {
        peer_id: PeerId,
        connection_id: ConnectionId,
    },
}

impl PeerEvent {
    pub fn peer_id(&self) -> PeerId {
        match self {
            PeerEvent::LocalCandidate { peer_id, .. }
            | PeerEvent::ChannelOpen { peer_id, .. }
            | PeerEvent::ChannelMessage { peer_id, .. }
            | PeerEvent::ChannelClosed { peer_id, .. } => *peer_id,
        }
    }

    pub fn connection_id(&self) -> ConnectionId {
        match self {
            PeerEvent::LocalCandidate { connection_id, .. }
            | PeerEvent::ChannelOpen { connection_id, .. }
            | PeerEvent::ChannelMessage { connection_id, .. }
            | PeerEvent::ChannelClosed { connection_id, .. } => *connection_id,
        }
    }
}

/// An opened data channel to one peer.
#[async_trait]
pub trait DataChannel: Send + Sync + Debug {
    /// Send chat text to the peer.
    async fn send_text(&self, text: &str) -> Result<()>;
}

/// One negotiated (or negotiating) connection to a remote peer.
#[async_trait]
pub trait RtcConnection: Send + Sync {
    fn id(&self) -> ConnectionId;

    /// Create the chat data channel (offering side only).
    async fn create_data_channel(&self, label: &str) -> Result<()>;

    async fn create_offer(&self) -> Result<SessionDescription>;

    async fn create_answer(&self) -> Result<SessionDescription>;

    async fn set_local_description(&self, desc: SessionDescription) -> Result<()>;

    async fn set_remote_description(&self, desc: SessionDescription) -> Result<()>;

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<()>;

    /// Release the connection and everything attached to it.
    async fn close(&self) -> Result<()>;
}

/// Factory for connections, the entry point of a negotiation primitive.
#[async_trait]
pub trait Negotiator: Send + Sync {
    /// Create a fresh connection handle toward `peer_id`.
    ///
    /// Events for the handle are delivered to `events`.
    async fn connect(
        &self,
        peer_id: PeerId,
        events: mpsc::UnboundedSender<PeerEvent>,
    ) -> Result<Arc<dyn RtcConnection>>;
}
