//! Relay wire protocol.
//!
//! Every message is one JSON object per WebSocket text frame, tagged by
//! `"type"`. Negotiation payloads travel as opaque JSON: the relay never
//! looks inside them, clients decode them into [`SessionDescription`] and
//! [`IceCandidate`], which use the browser's JSON shapes.

use crate::peer_id::PeerId;
use crate::room::RoomId;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// The three negotiation message kinds the relay forwards between peers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalKind {
    Offer,
    Answer,
    Candidate,
}

impl SignalKind {
    /// Wire name of the message kind.
    pub fn as_str(&self) -> &'static str {
        match self {
            SignalKind::Offer => "rtc-offer",
            SignalKind::Answer => "rtc-answer",
            SignalKind::Candidate => "ice-candidate",
        }
    }
}

/// Messages a client sends to the relay.
///
/// Wire format: `{"type":"join-room","roomId":"jNdKguxVBe"}`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case", rename_all_fields = "camelCase")]
pub enum ClientMessage {
    CreateRoom,
    JoinRoom { room_id: RoomId },
    /// `peer_id` is the addressee.
    RtcOffer { peer_id: PeerId, payload: Value },
    RtcAnswer { peer_id: PeerId, payload: Value },
    IceCandidate { peer_id: PeerId, payload: Value },
}

impl ClientMessage {
    /// Build an addressed negotiation message.
    pub fn signal(kind: SignalKind, target: PeerId, payload: Value) -> Self {
        match kind {
            SignalKind::Offer => ClientMessage::RtcOffer { peer_id: target, payload },
            SignalKind::Answer => ClientMessage::RtcAnswer { peer_id: target, payload },
            SignalKind::Candidate => ClientMessage::IceCandidate { peer_id: target, payload },
        }
    }

    /// Split an addressed negotiation message into kind, target and payload.
    pub fn into_signal(self) -> Option<(SignalKind, PeerId, Value)> {
        match self {
            ClientMessage::RtcOffer { peer_id, payload } => Some((SignalKind::Offer, peer_id, payload)),
            ClientMessage::RtcAnswer { peer_id, payload } => Some((SignalKind::Answer, peer_id, payload)),
            ClientMessage::IceCandidate { peer_id, payload } => {
                Some((SignalKind::Candidate, peer_id, payload))
            }
            ClientMessage::CreateRoom | ClientMessage::JoinRoom { .. } => None,
        }
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string(self).expect("ClientMessage serialization should not fail")
    }

    pub fn from_json(data: &[u8]) -> serde_json::Result<Self> {
        serde_json::from_slice(data)
    }
}

/// Messages the relay sends to a client.
///
/// Wire format: `{"type":"new-user-joined","peerId":"a1b2c3d4e5f67890"}`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case", rename_all_fields = "camelCase")]
pub enum RelayMessage {
    /// First message on every connection: the ID the relay assigned to us.
    Welcome { peer_id: PeerId },
    RoomCreated { room_id: RoomId },
    NewUserJoined { peer_id: PeerId },
    /// `peer_id` is the sender.
    RtcOffer { peer_id: PeerId, payload: Value },
    RtcAnswer { peer_id: PeerId, payload: Value },
    IceCandidate { peer_id: PeerId, payload: Value },
    UserDisconnected { peer_id: PeerId },
}

impl RelayMessage {
    /// Build a forwarded negotiation message tagged with its sender.
    pub fn signal(kind: SignalKind, sender: PeerId, payload: Value) -> Self {
        match kind {
            SignalKind::Offer => RelayMessage::RtcOffer { peer_id: sender, payload },
            SignalKind::Answer => RelayMessage::RtcAnswer { peer_id: sender, payload },
            SignalKind::Candidate => RelayMessage::IceCandidate { peer_id: sender, payload },
        }
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string(self).expect("RelayMessage serialization should not fail")
    }

    pub fn from_json(data: &[u8]) -> serde_json::Result<Self> {
        serde_json::from_slice(data)
    }
}

/// Kind of a session description.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpKind {
    Offer,
    Answer,
    Pranswer,
    Rollback,
}

/// Session description, `{"type":"offer","sdp":"v=0..."}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    #[serde(rename = "type")]
    pub kind: SdpKind,
    pub sdp: String,
}

impl SessionDescription {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self { kind: SdpKind::Offer, sdp: sdp.into() }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self { kind: SdpKind::Answer, sdp: sdp.into() }
    }
}

/// Connectivity candidate in the browser's `RTCIceCandidateInit` shape.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IceCandidate {
    pub candidate: String,
    #[serde(default)]
    pub sdp_mid: Option<String>,
    #[serde(default, rename = "sdpMLineIndex")]
    pub sdp_mline_index: Option<u16>,
    #[serde(default)]
    pub username_fragment: Option<String>,
}
