//! RoomId: short random token naming a chat room.

use serde::{Deserialize, Serialize};
use std::fmt::{self, Display, Formatter};
use std::str::FromStr;
use thiserror::Error;

/// Number of characters in a generated room ID.
pub const ROOM_ID_LEN: usize = 10;

/// Requested room IDs at or below this length are treated as "no room".
const MIN_REQUESTED_LEN: usize = 3;

const ALPHABET: &[u8; 64] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789_-";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RoomIdError {
    #[error("Room ID cannot be empty")]
    Empty,
}

/// Opaque room token. Generated IDs are 10 URL-safe characters.
///
/// Any non-empty string parses, since clients may hand the relay stale or
/// foreign links; the relay decides whether such a room exists.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RoomId(String);

impl RoomId {
    /// Generate a fresh random room ID.
    pub fn generate() -> Self {
        use rand::Rng;
        let mut rng = rand::rng();
        let id = (0..ROOM_ID_LEN)
            .map(|_| ALPHABET[rng.random_range(0..ALPHABET.len())] as char)
            .collect();
        Self(id)
    }

    /// Interpret a user-supplied room (e.g. from a shared link).
    ///
    /// Returns `None` when the value is missing or too short to be a room,
    /// in which case the caller should create a new room instead.
    pub fn from_request(requested: Option<&str>) -> Option<Self> {
        let requested = requested?.trim();
        if requested.len() > MIN_REQUESTED_LEN {
            Some(Self(requested.to_string()))
        } else {
            None
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for RoomId {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for RoomId {
    type Err = RoomIdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.is_empty() {
            return Err(RoomIdError::Empty);
        }
        Ok(Self(s.to_string()))
    }
}
