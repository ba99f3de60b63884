//! In-process negotiation primitive.
//!
//! Connections created through the same [`LoopbackHub`] pair up the way
//! real peer connections do: the offer and answer carry an endpoint token,
//! and once the offering side applies the answer both sides see their
//! channel open. Candidates are fake but follow the real ordering rule:
//! adding one before the remote description is set is rejected.

use crate::peer_id::PeerId;
use crate::protocol::{IceCandidate, SdpKind, SessionDescription};
use crate::transport::{
    ConnectionId, DataChannel, Negotiator, PeerEvent, Result, RtcConnection, RtcError,
};
use async_trait::async_trait;
use std::collections::HashMap;
use std::fmt::{self, Debug, Formatter};
use std::sync::{Arc, Mutex, Weak};
use tokio::sync::mpsc;
use tracing::debug;

/// Registry of live loopback endpoints, shared by every client in a test.
#[derive(Default)]
pub struct LoopbackHub {
    endpoints: Mutex<HashMap<String, Weak<LoopbackConnection>>>,
}

impl LoopbackHub {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn register(&self, conn: &Arc<LoopbackConnection>) {
        self.endpoints
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(conn.token.clone(), Arc::downgrade(conn));
    }

    fn unregister(&self, token: &str) {
        self.endpoints
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(token);
    }

    fn lookup(&self, token: &str) -> Option<Arc<LoopbackConnection>> {
        self.endpoints
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(token)
            .and_then(Weak::upgrade)
    }

    /// Number of endpoints not yet closed.
    pub fn live_endpoints(&self) -> usize {
        self.endpoints
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .filter(|w| w.strong_count() > 0)
            .count()
    }
}

/// [`Negotiator`] backed by a [`LoopbackHub`].
pub struct LoopbackNegotiator {
    hub: Arc<LoopbackHub>,
}

impl LoopbackNegotiator {
    pub fn new(hub: Arc<LoopbackHub>) -> Self {
        Self { hub }
    }
}

#[async_trait]
impl Negotiator for LoopbackNegotiator {
    async fn connect(
        &self,
        peer_id: PeerId,
        events: mpsc::UnboundedSender<PeerEvent>,
    ) -> Result<Arc<dyn RtcConnection>> {
        let id = ConnectionId::next();
        let conn = Arc::new(LoopbackConnection {
            id,
            token: format!("loopback-{}", id),
            peer_id,
            events,
            hub: Arc::clone(&self.hub),
            state: Mutex::new(EndpointState::default()),
        });
        self.hub.register(&conn);
        Ok(conn)
    }
}

#[derive(Default)]
struct EndpointState {
    local_kind: Option<SdpKind>,
    remote_token: Option<String>,
    closed: bool,
}

/// One side of a loopback pairing.
pub struct LoopbackConnection {
    id: ConnectionId,
    token: String,
    /// The remote peer this connection talks to
    peer_id: PeerId,
    events: mpsc::UnboundedSender<PeerEvent>,
    hub: Arc<LoopbackHub>,
    state: Mutex<EndpointState>,
}

impl LoopbackConnection {
    fn with_state<T>(&self, f: impl FnOnce(&mut EndpointState) -> Result<T>) -> Result<T> {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        if state.closed {
            return Err(RtcError::Closed);
        }
        f(&mut state)
    }

    fn emit(&self, event: PeerEvent) {
        // The owning client may already be gone; nothing to deliver to then.
        let _ = self.events.send(event);
    }

    fn open_channel_to(&self, remote_token: &str) {
        self.emit(PeerEvent::ChannelOpen {
            peer_id: self.peer_id,
            connection_id: self.id,
            channel: Arc::new(LoopbackChannel {
                hub: Arc::clone(&self.hub),
                remote_token: remote_token.to_string(),
            }),
        });
    }
}

#[async_trait]
impl RtcConnection for LoopbackConnection {
    fn id(&self) -> ConnectionId {
        self.id
    }

    async fn create_data_channel(&self, _label: &str) -> Result<()> {
        self.with_state(|_| Ok(()))
    }

    async fn create_offer(&self) -> Result<SessionDescription> {
        self.with_state(|_| Ok(SessionDescription::offer(self.token.clone())))
    }

    async fn create_answer(&self) -> Result<SessionDescription> {
        self.with_state(|state| match state.remote_token {
            Some(_) => Ok(SessionDescription::answer(self.token.clone())),
            None => Err(RtcError::InvalidState(
                "cannot answer before an offer is applied".to_string(),
            )),
        })
    }

    async fn set_local_description(&self, desc: SessionDescription) -> Result<()> {
        self.with_state(|state| {
            state.local_kind = Some(desc.kind);
            Ok(())
        })?;

        self.emit(PeerEvent::LocalCandidate {
            peer_id: self.peer_id,
            connection_id: self.id,
            candidate: IceCandidate {
                candidate: format!("candidate:{} 1 udp 1 127.0.0.1 9 typ host", self.token),
                sdp_mid: Some("0".to_string()),
                sdp_mline_index: Some(0),
                username_fragment: None,
            },
        });
        Ok(())
    }

    async fn set_remote_description(&self, desc: SessionDescription) -> Result<()> {
        let remote = self
            .hub
            .lookup(&desc.sdp)
            .ok_or_else(|| RtcError::Rejected(format!("unknown endpoint '{}'", desc.sdp)))?;

        self.with_state(|state| {
            state.remote_token = Some(desc.sdp.clone());
            Ok(())
        })?;

        // Applying the answer completes the pairing on both sides.
        if desc.kind == SdpKind::Answer {
            let local_kind = self.with_state(|state| Ok(state.local_kind))?;
            if local_kind != Some(SdpKind::Offer) {
                return Err(RtcError::InvalidState(
                    "answer applied without a local offer".to_string(),
                ));
            }
            debug!("Loopback {} paired with {}", self.token, remote.token);
            self.open_channel_to(&remote.token);
            remote.open_channel_to(&self.token);
        }
        Ok(())
    }

    async fn add_ice_candidate(&self, _candidate: IceCandidate) -> Result<()> {
        self.with_state(|state| match state.remote_token {
            Some(_) => Ok(()),
            None => Err(RtcError::InvalidState(
                "candidate added before remote description".to_string(),
            )),
        })
    }

    async fn close(&self) -> Result<()> {
        let remote_token = {
            let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
            if state.closed {
                return Ok(());
            }
            state.closed = true;
            state.remote_token.take()
        };
        self.hub.unregister(&self.token);

        // The remote side observes its channel closing.
        if let Some(remote) = remote_token.and_then(|t| self.hub.lookup(&t)) {
            remote.emit(PeerEvent::ChannelClosed {
                peer_id: remote.peer_id,
                connection_id: remote.id,
            });
        }
        Ok(())
    }
}

/// Data channel that delivers text to the paired endpoint.
pub struct LoopbackChannel {
    hub: Arc<LoopbackHub>,
    remote_token: String,
}

impl Debug for LoopbackChannel {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("LoopbackChannel")
            .field("remote", &self.remote_token)
            .finish()
    }
}

#[async_trait]
impl DataChannel for LoopbackChannel {
    async fn send_text(&self, text: &str) -> Result<()> {
        let remote = self.hub.lookup(&self.remote_token).ok_or(RtcError::Closed)?;
        remote.emit(PeerEvent::ChannelMessage {
            peer_id: remote.peer_id,
            connection_id: remote.id,
            text: text.to_string(),
        });
        Ok(())
    }
}
