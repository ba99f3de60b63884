//! relay-server library: Exposes the relay components for the binary and
//! integration tests.

pub mod connection;
pub mod rooms;
pub mod server;

pub use connection::{ConnectionEvent, DEFAULT_MAX_MESSAGE_SIZE, RelayConnection};
pub use rooms::{Departure, JoinOutcome, RoomRegistry};
pub use server::{DEFAULT_HANDSHAKE_TIMEOUT, RelayServer};
