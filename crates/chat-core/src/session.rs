//! Session registry: one record per remote participant.
//!
//! The registry is owned by the negotiation sequencer and mutated from a
//! single event loop, so it needs no interior locking. Every add/remove
//! publishes the participant count, and each departure publishes exactly
//! one `UserLeft`.

use crate::error::{ChatError, Result};
use crate::events::{ChatEvent, EventBus};
use crate::peer_id::PeerId;
use crate::protocol::IceCandidate;
use crate::transport::{DataChannel, RtcConnection};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, warn};

/// Display colors assigned to remote participants.
pub const PALETTE: [&str; 9] = [
    "lch(80.09% 47 220)",
    "lch(80.09% 47 190)",
    "lch(80.09% 47 160)",
    "lch(80.09% 47 130)",
    "lch(80.09% 47 100)",
    "lch(80.09% 47 60)",
    "lch(67.8% 47 28)",
    "lch(67.8% 47 300)",
    "lch(67.8% 47 270)",
];

fn random_color() -> &'static str {
    use rand::Rng;
    PALETTE[rand::rng().random_range(0..PALETTE.len())]
}

/// Negotiation progress for one remote participant.
#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum NegotiationState {
    /// Connection handle created, nothing exchanged yet
    Init,
    /// We offered and are waiting for the answer
    OfferSent,
    /// We accepted their offer and answered
    Answering,
    /// Their answer to our offer is applied
    AnswerReceived,
    /// Data channel open
    Connected,
}

impl NegotiationState {
    /// Whether the remote description is applied, so candidates can be added.
    pub fn accepts_candidates(&self) -> bool {
        matches!(
            self,
            NegotiationState::Answering
                | NegotiationState::AnswerReceived
                | NegotiationState::Connected
        )
    }
}

/// Tracked state for one remote participant.
pub struct SessionRecord {
    peer_id: PeerId,
    connection: Arc<dyn RtcConnection>,
    channel: Option<Arc<dyn DataChannel>>,
    display_color: &'static str,
    state: NegotiationState,
    /// Remote candidates that arrived before the remote description
    pending_candidates: Vec<IceCandidate>,
}

impl SessionRecord {
    fn new(peer_id: PeerId, connection: Arc<dyn RtcConnection>) -> Self {
        Self {
            peer_id,
            connection,
            channel: None,
            display_color: random_color(),
            state: NegotiationState::Init,
            pending_candidates: Vec::new(),
        }
    }

    pub fn peer_id(&self) -> PeerId {
        self.peer_id
    }

    pub fn connection(&self) -> &Arc<dyn RtcConnection> {
        &self.connection
    }

    pub fn channel(&self) -> Option<&Arc<dyn DataChannel>> {
        self.channel.as_ref()
    }

    pub fn display_color(&self) -> &'static str {
        self.display_color
    }

    pub fn state(&self) -> NegotiationState {
        self.state
    }

    pub(crate) fn set_state(&mut self, state: NegotiationState) {
        debug!("Session {}: {:?} -> {:?}", self.peer_id, self.state, state);
        self.state = state;
    }

    pub(crate) fn buffer_candidate(&mut self, candidate: IceCandidate) {
        self.pending_candidates.push(candidate);
    }

    pub(crate) fn take_pending_candidates(&mut self) -> Vec<IceCandidate> {
        std::mem::take(&mut self.pending_candidates)
    }

    pub fn pending_candidate_count(&self) -> usize {
        self.pending_candidates.len()
    }
}

/// Registry of session records, keyed by remote peer ID.
pub struct SessionRegistry {
    sessions: HashMap<PeerId, SessionRecord>,
    events: Arc<EventBus>,
}

impl SessionRegistry {
    pub fn new(events: Arc<EventBus>) -> Self {
        Self {
            sessions: HashMap::new(),
            events,
        }
    }

    /// Register a fresh session for `peer_id`, replacing any previous one.
    ///
    /// A replaced session's connection is released, but that is not a
    /// departure, so no `UserLeft` is emitted for it.
    pub async fn upsert(
        &mut self,
        peer_id: PeerId,
        connection: Arc<dyn RtcConnection>,
    ) -> &SessionRecord {
        if let Some(old) = self.sessions.remove(&peer_id) {
            debug!("Replacing existing session for {}", peer_id);
            release(old).await;
        }

        self.sessions
            .insert(peer_id, SessionRecord::new(peer_id, connection));
        self.emit_count();
        &self.sessions[&peer_id]
    }

    pub fn exists(&self, peer_id: PeerId) -> bool {
        self.sessions.contains_key(&peer_id)
    }

    pub fn get(&self, peer_id: PeerId) -> Result<&SessionRecord> {
        self.sessions
            .get(&peer_id)
            .ok_or(ChatError::UnknownPeer(peer_id))
    }

    pub(crate) fn get_mut(&mut self, peer_id: PeerId) -> Result<&mut SessionRecord> {
        self.sessions
            .get_mut(&peer_id)
            .ok_or(ChatError::UnknownPeer(peer_id))
    }

    /// Record the opened data channel for `peer_id`.
    ///
    /// Messages and closure of the channel arrive as `PeerEvent`s; the
    /// sequencer turns a close into [`SessionRegistry::remove`].
    pub fn attach_channel(&mut self, peer_id: PeerId, channel: Arc<dyn DataChannel>) -> Result<()> {
        self.get_mut(peer_id)?.channel = Some(channel);
        Ok(())
    }

    /// Remove the session for a departed participant.
    ///
    /// Idempotent: only the call that actually removes a record releases its
    /// connection and emits `UserLeft`. Returns whether a record was removed.
    pub async fn remove(&mut self, peer_id: PeerId) -> bool {
        let Some(record) = self.sessions.remove(&peer_id) else {
            debug!("Session for {} already removed", peer_id);
            return false;
        };

        let notice = ChatEvent::UserLeft { peer_id };
        release(record).await;
        self.events.emit(notice);
        self.emit_count();
        true
    }

    /// Release every session on voluntary exit, without per-user notices.
    pub async fn remove_all(&mut self) {
        for (_, record) in self.sessions.drain() {
            release(record).await;
        }
        self.emit_count();
    }

    /// Send `message` over every attached channel.
    ///
    /// Does nothing for `None` or empty text. Sessions without an open
    /// channel are skipped. Returns the number of channels that accepted it.
    pub async fn broadcast(&self, message: Option<&str>) -> usize {
        let Some(message) = message.filter(|m| !m.is_empty()) else {
            return 0;
        };

        let mut sent = 0;
        for record in self.sessions.values() {
            let Some(channel) = &record.channel else {
                continue;
            };
            match channel.send_text(message).await {
                Ok(()) => sent += 1,
                Err(e) => warn!("Failed to send to {}: {}", record.peer_id, e),
            }
        }
        sent
    }

    /// Participants in the room as we see it, ourselves included.
    pub fn participant_count(&self) -> usize {
        self.sessions.len() + 1
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    pub fn peer_ids(&self) -> Vec<PeerId> {
        self.sessions.keys().copied().collect()
    }

    fn emit_count(&self) {
        self.events.emit(ChatEvent::ParticipantCount {
            count: self.participant_count(),
        });
    }
}

async fn release(record: SessionRecord) {
    if let Err(e) = record.connection.close().await {
        warn!("Failed to close connection to {}: {}", record.peer_id, e);
    }
}
