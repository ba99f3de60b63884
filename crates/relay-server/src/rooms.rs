//! Room membership owned by the relay.
//!
//! Rooms map to their members in join order; a reverse index tracks which
//! rooms each participant is in so a disconnect can be fanned out without
//! scanning every room.

use chat_core::{PeerId, RoomId};
use std::collections::{HashMap, HashSet};
use tracing::debug;

/// Result of a join request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JoinOutcome {
    /// Joined an existing room. `existing` are the members who were already
    /// there and must be told about the newcomer.
    Joined { room_id: RoomId, existing: Vec<PeerId> },
    /// The requested room had no members, so a fresh room was created.
    Created(RoomId),
}

/// Members left behind in one room after a participant departed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Departure {
    pub room_id: RoomId,
    pub remaining: Vec<PeerId>,
}

#[derive(Debug, Default)]
pub struct RoomRegistry {
    rooms: HashMap<RoomId, Vec<PeerId>>,
    memberships: HashMap<PeerId, HashSet<RoomId>>,
}

impl RoomRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a room with a fresh ID and enroll `peer_id` in it.
    pub fn create_room(&mut self, peer_id: PeerId) -> RoomId {
        let room_id = loop {
            let candidate = RoomId::generate();
            if !self.rooms.contains_key(&candidate) {
                break candidate;
            }
        };

        debug!("Room {} created by {}", room_id, peer_id);
        self.rooms.insert(room_id.clone(), vec![peer_id]);
        self.memberships
            .entry(peer_id)
            .or_default()
            .insert(room_id.clone());
        room_id
    }

    /// Enroll `peer_id` in `room_id`.
    ///
    /// A room nobody is in does not exist as far as the relay is concerned:
    /// the request is treated as a create and a new ID is handed out.
    pub fn join_room(&mut self, peer_id: PeerId, room_id: &RoomId) -> JoinOutcome {
        let Some(members) = self.rooms.get_mut(room_id) else {
            debug!("Room {} not found, creating a new one for {}", room_id, peer_id);
            return JoinOutcome::Created(self.create_room(peer_id));
        };

        let existing: Vec<PeerId> = members.iter().copied().filter(|p| *p != peer_id).collect();
        if !members.contains(&peer_id) {
            members.push(peer_id);
        }
        self.memberships
            .entry(peer_id)
            .or_default()
            .insert(room_id.clone());

        JoinOutcome::Joined {
            room_id: room_id.clone(),
            existing,
        }
    }

    /// Drop `peer_id` from every room it is in.
    ///
    /// Rooms left empty are deleted. Returns, per room, who is still there.
    pub fn leave_all(&mut self, peer_id: PeerId) -> Vec<Departure> {
        let Some(rooms) = self.memberships.remove(&peer_id) else {
            return Vec::new();
        };

        let mut departures = Vec::with_capacity(rooms.len());
        for room_id in rooms {
            let Some(members) = self.rooms.get_mut(&room_id) else {
                continue;
            };
            members.retain(|p| *p != peer_id);

            if members.is_empty() {
                debug!("Room {} is empty, deleting", room_id);
                self.rooms.remove(&room_id);
                continue;
            }
            departures.push(Departure {
                room_id,
                remaining: members.clone(),
            });
        }
        departures
    }

    pub fn members(&self, room_id: &RoomId) -> Option<&[PeerId]> {
        self.rooms.get(room_id).map(Vec::as_slice)
    }

    pub fn rooms_of(&self, peer_id: PeerId) -> Vec<RoomId> {
        self.memberships
            .get(&peer_id)
            .map(|rooms| rooms.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn room_count(&self) -> usize {
        self.rooms.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn peer(n: u64) -> PeerId {
        PeerId::from(n)
    }

    #[test]
    fn test_create_room_enrolls_creator() {
        let mut rooms = RoomRegistry::new();
        let room = rooms.create_room(peer(1));

        assert_eq!(room.as_str().len(), chat_core::room::ROOM_ID_LEN);
        assert_eq!(rooms.members(&room), Some(&[peer(1)][..]));
        assert_eq!(rooms.rooms_of(peer(1)), vec![room]);
    }

    #[test]
    fn test_join_reports_existing_members() {
        let mut rooms = RoomRegistry::new();
        let room = rooms.create_room(peer(1));

        let outcome = rooms.join_room(peer(2), &room);
        assert_eq!(
            outcome,
            JoinOutcome::Joined {
                room_id: room.clone(),
                existing: vec![peer(1)],
            }
        );

        let outcome = rooms.join_room(peer(3), &room);
        assert_eq!(
            outcome,
            JoinOutcome::Joined {
                room_id: room.clone(),
                existing: vec![peer(1), peer(2)],
            }
        );
        assert_eq!(rooms.members(&room).map(<[_]>::len), Some(3));
    }

    #[test]
    fn test_join_twice_does_not_duplicate() {
        let mut rooms = RoomRegistry::new();
        let room = rooms.create_room(peer(1));
        rooms.join_room(peer(2), &room);
        rooms.join_room(peer(2), &room);

        assert_eq!(rooms.members(&room), Some(&[peer(1), peer(2)][..]));
    }

    #[test]
    fn test_join_ghost_room_creates_fresh_one() {
        let mut rooms = RoomRegistry::new();
        let ghost: RoomId = "ghost".parse().unwrap();

        let JoinOutcome::Created(room) = rooms.join_room(peer(1), &ghost) else {
            panic!("expected a new room");
        };
        assert_ne!(room, ghost);
        assert!(rooms.members(&ghost).is_none());
        assert_eq!(rooms.members(&room), Some(&[peer(1)][..]));
    }

    #[test]
    fn test_leave_all_reports_remaining_and_deletes_empty() {
        let mut rooms = RoomRegistry::new();
        let shared = rooms.create_room(peer(1));
        rooms.join_room(peer(2), &shared);
        let solo = rooms.create_room(peer(1));

        let departures = rooms.leave_all(peer(1));
        assert_eq!(
            departures,
            vec![Departure {
                room_id: shared.clone(),
                remaining: vec![peer(2)],
            }]
        );
        assert!(rooms.members(&solo).is_none());
        assert_eq!(rooms.room_count(), 1);
        assert!(rooms.rooms_of(peer(1)).is_empty());
    }

    #[test]
    fn test_leave_all_unknown_peer() {
        let mut rooms = RoomRegistry::new();
        assert!(rooms.leave_all(peer(9)).is_empty());
    }

    #[test]
    fn test_last_member_leaving_deletes_room() {
        let mut rooms = RoomRegistry::new();
        let room = rooms.create_room(peer(1));
        rooms.join_room(peer(2), &room);

        rooms.leave_all(peer(1));
        assert_eq!(rooms.leave_all(peer(2)), Vec::new());
        assert_eq!(rooms.room_count(), 0);

        // The ID is free again: joining it creates a new room.
        assert!(matches!(rooms.join_room(peer(3), &room), JoinOutcome::Created(_)));
    }
}
