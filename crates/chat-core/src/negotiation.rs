//! Negotiation sequencer: drives offer/answer/candidate exchange per peer.
//!
//! The sequencer consumes two input streams and owns the session registry:
//! - `RelayMessage`s forwarded by the relay (joins, offers, answers,
//!   candidates, departures)
//! - `PeerEvent`s raised by the negotiation primitive (local candidates,
//!   data channel open/message/close)
//!
//! Who offers is decided by the relay alone: we only offer to peers the
//! relay announces as new, and only answer offers we receive.

use crate::error::{ChatError, Result};
use crate::events::{ChatEvent, EventBus, OWN_COLOR};
use crate::peer_id::PeerId;
use crate::protocol::{ClientMessage, IceCandidate, RelayMessage, SessionDescription, SignalKind};
use crate::room::RoomId;
use crate::session::{NegotiationState, SessionRegistry};
use crate::transport::{Negotiator, PeerEvent, RtcError};
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Label of the chat data channel.
pub const CHANNEL_LABEL: &str = "my-rtc-chat";

/// Sent by the offering side once its channel opens.
pub const OFFERER_GREETING: &str = "Hi! You have established peer-to-peer connection with me! Other users will also send you this message once they have their own connection!";

/// Sent by the answering side once its channel opens.
pub const ANSWERER_GREETING: &str = "Hi I am new to this chat room!";

/// Per-client negotiation state machine over all remote peers.
pub struct Sequencer {
    /// Our ID, known once the relay welcomes us
    local_id: Option<PeerId>,
    registry: SessionRegistry,
    negotiator: Arc<dyn Negotiator>,
    /// Outbound messages to the relay
    relay_tx: mpsc::UnboundedSender<ClientMessage>,
    /// Handed to every connection the negotiator creates
    peer_events_tx: mpsc::UnboundedSender<PeerEvent>,
    relay_available: bool,
    events: Arc<EventBus>,
}

impl Sequencer {
    /// Create a sequencer. The returned receiver yields the primitive's
    /// events and must be fed back through [`Sequencer::handle_peer_event`].
    pub fn new(
        negotiator: Arc<dyn Negotiator>,
        relay_tx: mpsc::UnboundedSender<ClientMessage>,
        events: Arc<EventBus>,
    ) -> (Self, mpsc::UnboundedReceiver<PeerEvent>) {
        let (peer_events_tx, peer_events_rx) = mpsc::unbounded_channel();

        (
            Self {
                local_id: None,
                registry: SessionRegistry::new(Arc::clone(&events)),
                negotiator,
                relay_tx,
                peer_events_tx,
                relay_available: true,
                events,
            },
            peer_events_rx,
        )
    }

    pub fn local_id(&self) -> Option<PeerId> {
        self.local_id
    }

    pub fn registry(&self) -> &SessionRegistry {
        &self.registry
    }

    /// Negotiation state for `peer_id`, if a session exists.
    pub fn state(&self, peer_id: PeerId) -> Option<NegotiationState> {
        self.registry.get(peer_id).ok().map(|r| r.state())
    }

    pub fn relay_available(&self) -> bool {
        self.relay_available
    }

    /// Ask the relay for a new room.
    pub fn create_room(&mut self) -> Result<()> {
        info!("Creating new chat room");
        self.send_relay(ClientMessage::CreateRoom)
    }

    /// Ask the relay to join `room_id`.
    pub fn join_room(&mut self, room_id: RoomId) -> Result<()> {
        info!("Joining room '{}'", room_id);
        self.send_relay(ClientMessage::JoinRoom { room_id })
    }

    /// Handle one message forwarded by the relay.
    pub async fn handle_relay_message(&mut self, msg: RelayMessage) -> Result<()> {
        debug!("Relay message: {:?}", msg);

        match msg {
            RelayMessage::Welcome { peer_id } => {
                info!("Relay assigned us peer ID {}", peer_id);
                self.local_id = Some(peer_id);
                Ok(())
            }
            RelayMessage::RoomCreated { room_id } => {
                info!("Room created: {}", room_id);
                self.events.emit(ChatEvent::RoomCreated { room_id });
                Ok(())
            }
            RelayMessage::NewUserJoined { peer_id } => self.offer_to(peer_id).await,
            RelayMessage::RtcOffer { peer_id, payload } => self.answer_offer(peer_id, payload).await,
            RelayMessage::RtcAnswer { peer_id, payload } => self.accept_answer(peer_id, payload).await,
            RelayMessage::IceCandidate { peer_id, payload } => {
                self.add_remote_candidate(peer_id, payload).await
            }
            RelayMessage::UserDisconnected { peer_id } => {
                info!("Relay reports {} disconnected", peer_id);
                self.registry.remove(peer_id).await;
                Ok(())
            }
        }
    }

    /// Handle one event raised by the negotiation primitive.
    pub async fn handle_peer_event(&mut self, event: PeerEvent) -> Result<()> {
        let peer_id = event.peer_id();
        let current = self.registry.get(peer_id).ok().map(|r| r.connection().id());
        if current != Some(event.connection_id()) {
            debug!(
                "Ignoring event for {} from stale connection {}",
                peer_id,
                event.connection_id()
            );
            return Ok(());
        }

        match event {
            PeerEvent::LocalCandidate { candidate, .. } => {
                debug!("Created ICE candidate to '{}'", peer_id);
                self.send_relay(ClientMessage::signal(
                    SignalKind::Candidate,
                    peer_id,
                    to_payload(&candidate),
                ))
            }
            PeerEvent::ChannelOpen { channel, .. } => {
                let previous = self.registry.get(peer_id)?.state();
                self.registry.attach_channel(peer_id, Arc::clone(&channel))?;
                let record = self.registry.get_mut(peer_id)?;
                record.set_state(NegotiationState::Connected);
                let color = record.display_color().to_string();
                info!("Data channel to {} open", peer_id);

                self.events.emit(ChatEvent::PeerConnected { peer_id, color });

                let greeting = match previous {
                    NegotiationState::Answering => ANSWERER_GREETING,
                    _ => OFFERER_GREETING,
                };
                if let Err(e) = channel.send_text(greeting).await {
                    warn!("Failed to greet {}: {}", peer_id, e);
                }
                Ok(())
            }
            PeerEvent::ChannelMessage { text, .. } => {
                debug!("Received {} bytes from {}", text.len(), peer_id);
                let color = self.registry.get(peer_id)?.display_color().to_string();
                self.events.emit(ChatEvent::Message {
                    peer_id: Some(peer_id),
                    text,
                    color,
                });
                Ok(())
            }
            PeerEvent::ChannelClosed { .. } => {
                info!("Data channel to {} closed", peer_id);
                self.registry.remove(peer_id).await;
                Ok(())
            }
        }
    }

    /// Send chat text to every connected peer and echo it locally.
    ///
    /// Returns the number of peers it was sent to.
    pub async fn send_chat(&mut self, text: &str) -> usize {
        if text.is_empty() {
            return 0;
        }
        self.events.emit(ChatEvent::Message {
            peer_id: None,
            text: text.to_string(),
            color: OWN_COLOR.to_string(),
        });
        self.registry.broadcast(Some(text)).await
    }

    /// Voluntary exit: release every session without per-user notices.
    pub async fn leave(&mut self) {
        info!("Leaving room, closing {} session(s)", self.registry.len());
        self.registry.remove_all().await;
    }

    /// The relay connection dropped. Direct sessions keep running.
    pub fn relay_lost(&mut self) {
        if self.relay_available {
            warn!("Relay connection lost; existing chats continue, new peers cannot join");
            self.relay_available = false;
            self.events.emit(ChatEvent::System {
                text: "Disconnected from relay".to_string(),
            });
        }
    }

    /// Surface a non-fatal error to logs and the front end.
    pub fn report(&self, err: &ChatError) {
        warn!("{}", err);
        self.events.emit(ChatEvent::System {
            text: err.to_string(),
        });
    }

    /// A peer joined after us: we open the channel and offer.
    async fn offer_to(&mut self, peer_id: PeerId) -> Result<()> {
        info!("New user joined: {}, sending offer", peer_id);
        let fail = ChatError::negotiation;

        let connection = self
            .negotiator
            .connect(peer_id, self.peer_events_tx.clone())
            .await
            .map_err(fail(peer_id))?;
        self.registry.upsert(peer_id, Arc::clone(&connection)).await;

        connection
            .create_data_channel(CHANNEL_LABEL)
            .await
            .map_err(fail(peer_id))?;
        let offer = connection.create_offer().await.map_err(fail(peer_id))?;
        connection
            .set_local_description(offer.clone())
            .await
            .map_err(fail(peer_id))?;

        self.registry
            .get_mut(peer_id)?
            .set_state(NegotiationState::OfferSent);
        self.send_relay(ClientMessage::signal(
            SignalKind::Offer,
            peer_id,
            to_payload(&offer),
        ))
    }

    /// A peer offered to us: accept and answer.
    async fn answer_offer(&mut self, peer_id: PeerId, payload: Value) -> Result<()> {
        info!("Offer from {}, answering", peer_id);
        let fail = ChatError::negotiation;
        let offer: SessionDescription = from_payload(peer_id, payload)?;

        let connection = self
            .negotiator
            .connect(peer_id, self.peer_events_tx.clone())
            .await
            .map_err(fail(peer_id))?;
        self.registry.upsert(peer_id, Arc::clone(&connection)).await;

        connection
            .set_remote_description(offer)
            .await
            .map_err(fail(peer_id))?;
        self.registry
            .get_mut(peer_id)?
            .set_state(NegotiationState::Answering);

        let answer = connection.create_answer().await.map_err(fail(peer_id))?;
        connection
            .set_local_description(answer.clone())
            .await
            .map_err(fail(peer_id))?;

        self.send_relay(ClientMessage::signal(
            SignalKind::Answer,
            peer_id,
            to_payload(&answer),
        ))?;
        self.flush_candidates(peer_id).await
    }

    /// The peer we offered to answered.
    async fn accept_answer(&mut self, peer_id: PeerId, payload: Value) -> Result<()> {
        let record = self.registry.get(peer_id)?;
        if record.state() != NegotiationState::OfferSent {
            return Err(ChatError::NegotiationFailure {
                peer_id,
                source: RtcError::InvalidState(format!(
                    "answer received while {:?}",
                    record.state()
                )),
            });
        }
        let connection = Arc::clone(record.connection());
        let answer: SessionDescription = from_payload(peer_id, payload)?;

        connection
            .set_remote_description(answer)
            .await
            .map_err(ChatError::negotiation(peer_id))?;
        self.registry
            .get_mut(peer_id)?
            .set_state(NegotiationState::AnswerReceived);

        self.flush_candidates(peer_id).await
    }

    /// Apply a remote candidate, or hold it until the remote description is set.
    async fn add_remote_candidate(&mut self, peer_id: PeerId, payload: Value) -> Result<()> {
        let record = self.registry.get_mut(peer_id)?;
        let candidate: IceCandidate = from_payload(peer_id, payload)?;

        if !record.state().accepts_candidates() {
            debug!(
                "Buffering candidate from {} until remote description is set",
                peer_id
            );
            record.buffer_candidate(candidate);
            return Ok(());
        }

        let connection = Arc::clone(record.connection());
        connection
            .add_ice_candidate(candidate)
            .await
            .map_err(ChatError::negotiation(peer_id))
    }

    /// Apply candidates buffered before the remote description.
    ///
    /// Every candidate is attempted; the first failure is returned.
    async fn flush_candidates(&mut self, peer_id: PeerId) -> Result<()> {
        let record = self.registry.get_mut(peer_id)?;
        let pending = record.take_pending_candidates();
        if pending.is_empty() {
            return Ok(());
        }
        let connection = Arc::clone(record.connection());

        debug!("Applying {} buffered candidate(s) from {}", pending.len(), peer_id);
        let mut first_error = None;
        for candidate in pending {
            if let Err(e) = connection.add_ice_candidate(candidate).await {
                warn!("Failed to apply buffered candidate from {}: {}", peer_id, e);
                first_error.get_or_insert(e);
            }
        }

        match first_error {
            Some(source) => Err(ChatError::NegotiationFailure { peer_id, source }),
            None => Ok(()),
        }
    }

    fn send_relay(&mut self, msg: ClientMessage) -> Result<()> {
        if !self.relay_available {
            return Err(ChatError::RelayUnavailable);
        }
        if self.relay_tx.send(msg).is_err() {
            self.relay_lost();
            return Err(ChatError::RelayUnavailable);
        }
        Ok(())
    }
}

fn to_payload<T: Serialize>(value: &T) -> Value {
    serde_json::to_value(value).expect("negotiation payload serialization should not fail")
}

fn from_payload<T: DeserializeOwned>(peer_id: PeerId, payload: Value) -> Result<T> {
    serde_json::from_value(payload).map_err(|e| ChatError::NegotiationFailure {
        peer_id,
        source: RtcError::InvalidPayload(e.to_string()),
    })
}
