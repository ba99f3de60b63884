//! Plain-text rendering of chat events for the terminal.

use chat_core::ChatEvent;

/// One line of terminal output for `event`.
pub fn render(event: &ChatEvent) -> String {
    match event {
        ChatEvent::ParticipantCount { count } => format!("* {} in room", count),
        ChatEvent::RoomCreated { room_id } => {
            format!("* Room created. Others can join with --room {}", room_id)
        }
        ChatEvent::PeerConnected { peer_id, .. } => format!("* {} connected", peer_id),
        ChatEvent::Message {
            peer_id: Some(peer_id),
            text,
            ..
        } => format!("[{}] {}", peer_id, text),
        ChatEvent::Message {
            peer_id: None,
            text,
            ..
        } => format!("[Me] {}", text),
        ChatEvent::UserLeft { peer_id } => format!("* {} left the chat", peer_id),
        ChatEvent::System { text } => format!("! {}", text),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chat_core::{OWN_COLOR, PeerId};

    #[test]
    fn test_own_message_is_marked() {
        let line = render(&ChatEvent::Message {
            peer_id: None,
            text: "hi".into(),
            color: OWN_COLOR.into(),
        });
        assert_eq!(line, "[Me] hi");
    }

    #[test]
    fn test_peer_message_shows_sender() {
        let line = render(&ChatEvent::Message {
            peer_id: Some(PeerId::from(0xab)),
            text: "hello".into(),
            color: "lch(80.09% 47 220)".into(),
        });
        assert_eq!(line, "[00000000000000ab] hello");
    }

    #[test]
    fn test_room_created_shows_join_hint() {
        let room_id = "jNdKguxVBe".parse().unwrap();
        assert_eq!(
            render(&ChatEvent::RoomCreated { room_id }),
            "* Room created. Others can join with --room jNdKguxVBe"
        );
    }
}
