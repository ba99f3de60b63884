use crate::peer_id::PeerId;
use crate::transport::RtcError;
use thiserror::Error;

/// Errors raised while tracking sessions and driving negotiations.
///
/// None of these are fatal to the client: each one ends the operation that
/// raised it and is reported, the event loop keeps running.
#[derive(Debug, Error)]
pub enum ChatError {
    /// A message referenced a participant we never tried to reach.
    #[error("Unexpected message from '{0}', we never tried to connect to it")]
    UnknownPeer(PeerId),

    /// The negotiation primitive rejected an offer, answer or candidate.
    /// The session stays in place until a disconnect removes it.
    #[error("Negotiation with '{peer_id}' failed: {source}")]
    NegotiationFailure {
        peer_id: PeerId,
        #[source]
        source: RtcError,
    },

    /// The relay connection is gone. Direct sessions keep working, but new
    /// joins and negotiations cannot proceed.
    #[error("Relay unavailable")]
    RelayUnavailable,
}

pub type Result<T> = std::result::Result<T, ChatError>;

impl ChatError {
    pub(crate) fn negotiation(peer_id: PeerId) -> impl FnOnce(RtcError) -> ChatError {
        move |source| ChatError::NegotiationFailure { peer_id, source }
    }
}
