//! Scenario tests: several sequencers wired through an in-memory relay and
//! the loopback negotiation primitive.

use chat_core::{
    ANSWERER_GREETING, ChatError, ChatEvent, ClientMessage, EventBus, IceCandidate, LoopbackHub,
    LoopbackNegotiator, NegotiationState, OFFERER_GREETING, PeerEvent, PeerId, RelayMessage,
    RoomId, RtcError, SessionDescription, Sequencer, Subscription,
};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;

struct TestClient {
    id: PeerId,
    seq: Sequencer,
    peer_rx: mpsc::UnboundedReceiver<PeerEvent>,
    relay_rx: mpsc::UnboundedReceiver<ClientMessage>,
    seen: Arc<Mutex<Vec<ChatEvent>>>,
    errors: Vec<ChatError>,
    _sub: Subscription,
}

impl TestClient {
    async fn new(hub: &Arc<LoopbackHub>, id: u64) -> Self {
        let bus = Arc::new(EventBus::new());
        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen_clone = Arc::clone(&seen);
        let sub = bus.subscribe(move |e| seen_clone.lock().unwrap().push(e));

        let (relay_tx, relay_rx) = mpsc::unbounded_channel();
        let negotiator = Arc::new(LoopbackNegotiator::new(Arc::clone(hub)));
        let (mut seq, peer_rx) = Sequencer::new(negotiator, relay_tx, bus);

        let id = PeerId::from(id);
        seq.handle_relay_message(RelayMessage::Welcome { peer_id: id })
            .await
            .unwrap();

        Self {
            id,
            seq,
            peer_rx,
            relay_rx,
            seen,
            errors: Vec::new(),
            _sub: sub,
        }
    }

    fn events(&self) -> Vec<ChatEvent> {
        self.seen.lock().unwrap().clone()
    }

    fn messages_from(&self, peer: PeerId) -> Vec<String> {
        self.events()
            .into_iter()
            .filter_map(|e| match e {
                ChatEvent::Message {
                    peer_id: Some(p),
                    text,
                    ..
                } if p == peer => Some(text),
                _ => None,
            })
            .collect()
    }

    fn user_left(&self) -> Vec<PeerId> {
        self.events()
            .into_iter()
            .filter_map(|e| match e {
                ChatEvent::UserLeft { peer_id } => Some(peer_id),
                _ => None,
            })
            .collect()
    }

    fn last_count(&self) -> Option<usize> {
        self.events().into_iter().rev().find_map(|e| match e {
            ChatEvent::ParticipantCount { count } => Some(count),
            _ => None,
        })
    }

    /// Next message this client sent to the relay, if any.
    fn next_outgoing(&mut self) -> Option<ClientMessage> {
        self.relay_rx.try_recv().ok()
    }
}

/// In-memory stand-in for the relay: one room, FIFO delivery.
struct TestRelay {
    members: Vec<usize>,
    queue: VecDeque<(usize, RelayMessage)>,
}

impl TestRelay {
    fn new() -> Self {
        Self {
            members: Vec::new(),
            queue: VecDeque::new(),
        }
    }

    fn route(&mut self, clients: &[TestClient], from: usize, msg: ClientMessage) {
        let sender = clients[from].id;
        match msg {
            ClientMessage::CreateRoom => {
                self.members.push(from);
                self.queue.push_back((
                    from,
                    RelayMessage::RoomCreated {
                        room_id: RoomId::from_request(Some("test-room")).unwrap(),
                    },
                ));
            }
            ClientMessage::JoinRoom { .. } => {
                for &member in &self.members {
                    self.queue
                        .push_back((member, RelayMessage::NewUserJoined { peer_id: sender }));
                }
                self.members.push(from);
            }
            signal => {
                let (kind, target, payload) = signal.into_signal().unwrap();
                if let Some(to) = clients.iter().position(|c| c.id == target) {
                    self.queue
                        .push_back((to, RelayMessage::signal(kind, sender, payload)));
                }
            }
        }
    }

    fn disconnect(&mut self, clients: &[TestClient], who: usize) {
        self.members.retain(|&m| m != who);
        for &member in &self.members {
            self.queue.push_back((
                member,
                RelayMessage::UserDisconnected {
                    peer_id: clients[who].id,
                },
            ));
        }
    }

    /// Deliver everything until no client has anything left to process.
    async fn pump(&mut self, clients: &mut [TestClient]) {
        loop {
            let mut progress = false;

            for client in clients.iter_mut() {
                while let Ok(event) = client.peer_rx.try_recv() {
                    progress = true;
                    if let Err(e) = client.seq.handle_peer_event(event).await {
                        client.errors.push(e);
                    }
                }
            }

            for from in 0..clients.len() {
                while let Some(msg) = clients[from].next_outgoing() {
                    progress = true;
                    self.route(clients, from, msg);
                }
            }

            while let Some((to, msg)) = self.queue.pop_front() {
                progress = true;
                let client = &mut clients[to];
                if let Err(e) = client.seq.handle_relay_message(msg).await {
                    client.errors.push(e);
                }
            }

            if !progress {
                break;
            }
        }
    }
}

fn candidate_payload() -> serde_json::Value {
    serde_json::to_value(IceCandidate {
        candidate: "candidate:1 1 udp 1 127.0.0.1 9 typ host".into(),
        sdp_mid: Some("0".into()),
        sdp_mline_index: Some(0),
        username_fragment: None,
    })
    .unwrap()
}

/// Two clients in one room with an open channel between them.
async fn connected_pair() -> (Arc<LoopbackHub>, TestRelay, Vec<TestClient>) {
    let hub = LoopbackHub::new();
    let mut relay = TestRelay::new();
    let mut clients = vec![TestClient::new(&hub, 1).await, TestClient::new(&hub, 2).await];

    clients[0].seq.create_room().unwrap();
    relay.pump(&mut clients).await;
    let room = RoomId::from_request(Some("test-room")).unwrap();
    clients[1].seq.join_room(room).unwrap();
    relay.pump(&mut clients).await;

    (hub, relay, clients)
}

#[tokio::test]
async fn test_create_join_connects_both_sides() {
    let (_hub, _relay, clients) = connected_pair().await;
    let (a, b) = (&clients[0], &clients[1]);

    assert!(a.errors.is_empty(), "errors on a: {:?}", a.errors);
    assert!(b.errors.is_empty(), "errors on b: {:?}", b.errors);
    assert_eq!(a.seq.state(b.id), Some(NegotiationState::Connected));
    assert_eq!(b.seq.state(a.id), Some(NegotiationState::Connected));

    assert!(a.events().iter().any(|e| matches!(e, ChatEvent::RoomCreated { .. })));
    assert!(
        a.events()
            .iter()
            .any(|e| matches!(e, ChatEvent::PeerConnected { peer_id, .. } if *peer_id == b.id))
    );

    // The offerer greets the newcomer; the newcomer introduces itself.
    assert_eq!(b.messages_from(a.id), vec![OFFERER_GREETING.to_string()]);
    assert_eq!(a.messages_from(b.id), vec![ANSWERER_GREETING.to_string()]);

    assert_eq!(a.last_count(), Some(2));
    assert_eq!(b.last_count(), Some(2));
}

#[tokio::test]
async fn test_chat_message_reaches_peer_with_its_color() {
    let (_hub, mut relay, mut clients) = connected_pair().await;
    let a_id = clients[0].id;

    let sent = clients[0].seq.send_chat("hello there").await;
    assert_eq!(sent, 1);
    relay.pump(&mut clients).await;

    let color = clients[1]
        .seq
        .registry()
        .get(a_id)
        .unwrap()
        .display_color()
        .to_string();
    assert!(clients[1].events().contains(&ChatEvent::Message {
        peer_id: Some(a_id),
        text: "hello there".to_string(),
        color,
    }));

    // Our own text is echoed locally, without a peer.
    assert!(
        clients[0]
            .events()
            .iter()
            .any(|e| matches!(e, ChatEvent::Message { peer_id: None, text, .. } if text == "hello there"))
    );
}

#[tokio::test]
async fn test_empty_chat_is_not_sent() {
    let (_hub, _relay, mut clients) = connected_pair().await;
    assert_eq!(clients[0].seq.send_chat("").await, 0);
}

#[tokio::test]
async fn test_departure_emits_one_user_left() {
    let (_hub, mut relay, mut clients) = connected_pair().await;
    let b_id = clients[1].id;

    // b leaves: its channel closes and the relay reports the disconnect.
    clients[1].seq.leave().await;
    relay.disconnect(&clients, 1);
    relay.pump(&mut clients).await;

    assert_eq!(clients[0].user_left(), vec![b_id]);
    assert!(clients[0].seq.registry().is_empty());
    assert_eq!(clients[0].last_count(), Some(1));

    // Voluntary exit is silent on the leaving side.
    assert!(clients[1].user_left().is_empty());
    assert_eq!(clients[1].last_count(), Some(1));
}

#[tokio::test]
async fn test_three_participants_form_a_mesh() {
    let (hub, mut relay, mut clients) = connected_pair().await;
    clients.push(TestClient::new(&hub, 3).await);

    let room = RoomId::from_request(Some("test-room")).unwrap();
    clients[2].seq.join_room(room).unwrap();
    relay.pump(&mut clients).await;

    for client in &clients {
        assert!(client.errors.is_empty(), "errors: {:?}", client.errors);
        assert_eq!(client.seq.registry().participant_count(), 3);
        assert_eq!(client.last_count(), Some(3));
    }
    let newcomer = &clients[2];
    assert_eq!(newcomer.seq.state(clients[0].id), Some(NegotiationState::Connected));
    assert_eq!(newcomer.seq.state(clients[1].id), Some(NegotiationState::Connected));
    assert_eq!(newcomer.messages_from(clients[0].id), vec![OFFERER_GREETING.to_string()]);
}

#[tokio::test]
async fn test_candidate_from_unknown_peer() {
    let hub = LoopbackHub::new();
    let mut client = TestClient::new(&hub, 1).await;

    let result = client
        .seq
        .handle_relay_message(RelayMessage::IceCandidate {
            peer_id: PeerId::from(99),
            payload: candidate_payload(),
        })
        .await;
    assert!(matches!(result, Err(ChatError::UnknownPeer(p)) if p == PeerId::from(99)));
}

#[tokio::test]
async fn test_early_candidate_is_buffered_until_answer() {
    let hub = LoopbackHub::new();
    let mut a = TestClient::new(&hub, 1).await;
    let mut b = TestClient::new(&hub, 2).await;

    a.seq
        .handle_relay_message(RelayMessage::NewUserJoined { peer_id: b.id })
        .await
        .unwrap();
    assert_eq!(a.seq.state(b.id), Some(NegotiationState::OfferSent));

    // A candidate from b overtakes b's answer.
    a.seq
        .handle_relay_message(RelayMessage::IceCandidate {
            peer_id: b.id,
            payload: candidate_payload(),
        })
        .await
        .unwrap();
    assert_eq!(a.seq.registry().get(b.id).unwrap().pending_candidate_count(), 1);

    let Some(ClientMessage::RtcOffer { payload, .. }) = a.next_outgoing() else {
        panic!("expected offer from a");
    };
    b.seq
        .handle_relay_message(RelayMessage::RtcOffer {
            peer_id: a.id,
            payload,
        })
        .await
        .unwrap();
    let Some(ClientMessage::RtcAnswer { payload, .. }) = b.next_outgoing() else {
        panic!("expected answer from b");
    };
    a.seq
        .handle_relay_message(RelayMessage::RtcAnswer {
            peer_id: b.id,
            payload,
        })
        .await
        .unwrap();

    let record = a.seq.registry().get(b.id).unwrap();
    assert_eq!(record.pending_candidate_count(), 0);
    assert_eq!(record.state(), NegotiationState::AnswerReceived);
}

#[tokio::test]
async fn test_answer_in_wrong_state_is_rejected() {
    let (_hub, _relay, mut clients) = connected_pair().await;
    let b_id = clients[1].id;

    let result = clients[0]
        .seq
        .handle_relay_message(RelayMessage::RtcAnswer {
            peer_id: b_id,
            payload: serde_json::to_value(SessionDescription::answer("late")).unwrap(),
        })
        .await;
    assert!(matches!(
        result,
        Err(ChatError::NegotiationFailure {
            source: RtcError::InvalidState(_),
            ..
        })
    ));
    // The session survives the failure.
    assert_eq!(clients[0].seq.state(b_id), Some(NegotiationState::Connected));
}

#[tokio::test]
async fn test_answer_from_unknown_peer() {
    let hub = LoopbackHub::new();
    let mut client = TestClient::new(&hub, 1).await;

    let result = client
        .seq
        .handle_relay_message(RelayMessage::RtcAnswer {
            peer_id: PeerId::from(5),
            payload: serde_json::to_value(SessionDescription::answer("x")).unwrap(),
        })
        .await;
    assert!(matches!(result, Err(ChatError::UnknownPeer(_))));
}

#[tokio::test]
async fn test_malformed_offer_payload() {
    let hub = LoopbackHub::new();
    let mut client = TestClient::new(&hub, 1).await;

    let result = client
        .seq
        .handle_relay_message(RelayMessage::RtcOffer {
            peer_id: PeerId::from(5),
            payload: serde_json::json!({ "bogus": true }),
        })
        .await;
    assert!(matches!(
        result,
        Err(ChatError::NegotiationFailure {
            source: RtcError::InvalidPayload(_),
            ..
        })
    ));
}

#[tokio::test]
async fn test_relay_loss_keeps_direct_chat() {
    let (_hub, mut relay, mut clients) = connected_pair().await;

    clients[0].seq.relay_lost();
    clients[0].seq.relay_lost();
    assert!(!clients[0].seq.relay_available());
    assert!(matches!(
        clients[0].seq.create_room(),
        Err(ChatError::RelayUnavailable)
    ));

    let system_notices = clients[0]
        .events()
        .iter()
        .filter(|e| matches!(e, ChatEvent::System { .. }))
        .count();
    assert_eq!(system_notices, 1);

    assert_eq!(clients[0].seq.send_chat("still here").await, 1);
    relay.pump(&mut clients).await;
    let a_id = clients[0].id;
    assert!(clients[1].messages_from(a_id).contains(&"still here".to_string()));
}
