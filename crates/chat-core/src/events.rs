//! Presentation events and the bus that delivers them.
//!
//! The chat core never renders anything. It emits `ChatEvent`s and whatever
//! front end is attached (a terminal, a test) subscribes to the `EventBus`.

use crate::peer_id::PeerId;
use crate::room::RoomId;
use serde::Serialize;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, RwLock, Weak};

/// Color used for our own messages.
pub const OWN_COLOR: &str = "hsl(0, 0%, 85%)";

/// Events a front end renders.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ChatEvent {
    /// Number of participants including ourselves.
    ParticipantCount { count: usize },
    /// The relay created a room for us; share this ID so others can join.
    RoomCreated {
        #[serde(rename = "roomId")]
        room_id: RoomId,
    },
    /// A direct channel to this peer is open.
    PeerConnected {
        #[serde(rename = "peerId")]
        peer_id: PeerId,
        color: String,
    },
    /// Chat text. `peer_id` is `None` for our own messages.
    Message {
        #[serde(rename = "peerId")]
        peer_id: Option<PeerId>,
        text: String,
        color: String,
    },
    /// A participant left; emitted once per departure.
    UserLeft {
        #[serde(rename = "peerId")]
        peer_id: PeerId,
    },
    /// Diagnostic notice (protocol violations, negotiation failures).
    System { text: String },
}

/// Subscription handle that unsubscribes automatically when dropped.
pub struct Subscription {
    bus: Weak<EventBus>,
    id: usize,
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(bus) = self.bus.upgrade() {
            bus.unsubscribe(self.id);
        }
    }
}

/// Event bus for publishing chat events to subscribers.
///
/// Wrap in `Arc` to enable subscriptions.
pub struct EventBus {
    callbacks: RwLock<Vec<(usize, Arc<dyn Fn(ChatEvent) + Send + Sync>)>>,
    next_id: AtomicUsize,
}

impl Default for EventBus {
    fn default() -> Self {
        Self {
            callbacks: RwLock::new(Vec::new()),
            next_id: AtomicUsize::new(0),
        }
    }
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribe to events. Returns `Subscription` that unsubscribes on drop.
    pub fn subscribe(
        self: &Arc<Self>,
        callback: impl Fn(ChatEvent) + Send + Sync + 'static,
    ) -> Subscription {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.callbacks
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .push((id, Arc::new(callback)));
        Subscription {
            bus: Arc::downgrade(self),
            id,
        }
    }

    fn unsubscribe(&self, id: usize) {
        // try_write: Drop may run during unwinding while emit holds the read lock.
        if let Ok(mut guard) = self.callbacks.try_write() {
            guard.retain(|(i, _)| *i != id);
        }
    }

    /// Emit an event to all subscribers.
    pub fn emit(&self, event: ChatEvent) {
        // Clone the list so a callback may subscribe without deadlocking.
        let callbacks: Vec<_> = self
            .callbacks
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .map(|(_, cb)| Arc::clone(cb))
            .collect();

        for callback in callbacks {
            callback(event.clone());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    fn recording_bus() -> (Arc<EventBus>, Arc<Mutex<Vec<ChatEvent>>>, Subscription) {
        let bus = Arc::new(EventBus::new());
        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen_clone = Arc::clone(&seen);
        let sub = bus.subscribe(move |event| seen_clone.lock().unwrap().push(event));
        (bus, seen, sub)
    }

    #[test]
    fn test_subscribe_and_emit() {
        let (bus, seen, _sub) = recording_bus();
        bus.emit(ChatEvent::ParticipantCount { count: 2 });
        assert_eq!(*seen.lock().unwrap(), vec![ChatEvent::ParticipantCount { count: 2 }]);
    }

    #[test]
    fn test_subscription_unsubscribes_on_drop() {
        let (bus, seen, sub) = recording_bus();
        bus.emit(ChatEvent::ParticipantCount { count: 1 });
        drop(sub);
        bus.emit(ChatEvent::ParticipantCount { count: 2 });
        assert_eq!(seen.lock().unwrap().len(), 1);
    }

    #[test]
    fn test_event_serialization() {
        let event = ChatEvent::UserLeft {
            peer_id: PeerId::from(1),
        };
        let json = serde_json::to_string(&event).unwrap();
        assert_eq!(json, r#"{"type":"userLeft","peerId":"0000000000000001"}"#);
    }
}
