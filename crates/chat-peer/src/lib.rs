//! chat-peer library: relay client, WebRTC negotiation and terminal output
//! for the `chat-peer` binary.

pub mod display;
pub mod relay_client;
pub mod rtc;

pub use relay_client::{RelayClient, RelayEvent};
pub use rtc::{DEFAULT_STUN_URL, WebrtcNegotiator};
