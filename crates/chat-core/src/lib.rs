//! chat-core: Shared library for peer-to-peer room chat.
//!
//! This crate provides:
//! - Peer and room identifiers
//! - The JSON signalling protocol spoken with the relay
//! - The session registry and negotiation sequencer run by each client
//! - Negotiator/RtcConnection trait abstractions, plus an in-process loopback

pub mod error;
pub mod events;
pub mod loopback;
pub mod negotiation;
pub mod peer_id;
pub mod protocol;
pub mod room;
pub mod session;
pub mod transport;

pub use error::ChatError;
pub use events::{ChatEvent, EventBus, OWN_COLOR, Subscription};
pub use loopback::{LoopbackHub, LoopbackNegotiator};
pub use negotiation::{ANSWERER_GREETING, CHANNEL_LABEL, OFFERER_GREETING, Sequencer};
pub use peer_id::{PeerId, PeerIdError};
pub use protocol::{
    ClientMessage, IceCandidate, RelayMessage, SdpKind, SessionDescription, SignalKind,
};
pub use room::{RoomId, RoomIdError};
pub use session::{NegotiationState, PALETTE, SessionRecord, SessionRegistry};
pub use transport::{ConnectionId, DataChannel, Negotiator, PeerEvent, RtcConnection, RtcError};
