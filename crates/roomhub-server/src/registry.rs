//! Room membership. Owned by the hub loop; nothing else touches it.

use std::collections::{HashMap, HashSet};

use roomhub_core::{ConnectionId, RoomId, UserId, UserSummary};
use serde::Serialize;

use crate::connection::ConnectionHandle;

/// Room listing entry.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct RoomSummary {
    pub room_id: RoomId,
    pub connections: usize,
}

/// Rooms keyed by id, each holding the ids of its member connections.
///
/// Rooms appear on first insert and are removed as soon as their last member
/// leaves, so an entry in `rooms` is never empty.
#[derive(Debug, Default)]
pub struct RoomRegistry {
    rooms: HashMap<RoomId, HashSet<ConnectionId>>,
    connections: HashMap<ConnectionId, ConnectionHandle>,
}

impl RoomRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns `false` (and changes nothing) if the id is already present.
    pub fn insert(&mut self, handle: ConnectionHandle) -> bool {
        if self.connections.contains_key(&handle.id) {
            return false;
        }
        self.rooms
            .entry(handle.room.clone())
            .or_default()
            .insert(handle.id.clone());
        self.connections.insert(handle.id.clone(), handle);
        true
    }

    /// Remove a connection; drops its room if that was the last member.
    pub fn remove(&mut self, id: &ConnectionId) -> Option<ConnectionHandle> {
        let handle = self.connections.remove(id)?;
        if let Some(members) = self.rooms.get_mut(&handle.room) {
            members.remove(id);
            if members.is_empty() {
                self.rooms.remove(&handle.room);
            }
        }
        Some(handle)
    }

    pub fn contains_room(&self, room: &RoomId) -> bool {
        self.rooms.contains_key(room)
    }

    /// Member handles of `room`, in no particular order.
    pub fn members<'a>(&'a self, room: &RoomId) -> impl Iterator<Item = &'a ConnectionHandle> + 'a {
        self.rooms
            .get(room)
            .into_iter()
            .flatten()
            .filter_map(|id| self.connections.get(id))
    }

    pub fn room_size(&self, room: &RoomId) -> usize {
        self.rooms.get(room).map_or(0, HashSet::len)
    }

    /// Distinct users in `room`, sorted by username then id. A user with
    /// several connections appears once.
    pub fn online_users(&self, room: &RoomId) -> Vec<UserSummary> {
        let mut seen = HashSet::new();
        let mut users: Vec<UserSummary> = self
            .members(room)
            .filter(|h| seen.insert(h.user.id.clone()))
            .map(|h| h.user.clone())
            .collect();
        users.sort_by(|a, b| a.username.cmp(&b.username).then_with(|| a.id.cmp(&b.id)));
        users
    }

    /// Whether `user` still has any connection in `room`.
    pub fn user_in_room(&self, room: &RoomId, user: &UserId) -> bool {
        self.members(room).any(|h| &h.user.id == user)
    }

    /// All rooms, sorted by id.
    pub fn rooms(&self) -> Vec<RoomSummary> {
        let mut rooms: Vec<RoomSummary> = self
            .rooms
            .iter()
            .map(|(id, members)| RoomSummary {
                room_id: id.clone(),
                connections: members.len(),
            })
            .collect();
        rooms.sort_by(|a, b| a.room_id.cmp(&b.room_id));
        rooms
    }

    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    pub fn room_count(&self) -> usize {
        self.rooms.len()
    }

    /// Remove everything, returning the handles that were registered.
    pub fn drain(&mut self) -> Vec<ConnectionHandle> {
        self.rooms.clear();
        self.connections.drain().map(|(_, h)| h).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::OutboundQueue;

    fn handle(user: &str, room: &str) -> ConnectionHandle {
        let (queue, _rx) = OutboundQueue::channel(4);
        ConnectionHandle::new(
            UserSummary::new(UserId::from_raw(user), user),
            RoomId::from_raw(room),
            queue,
        )
    }

    #[test]
    fn room_created_on_first_member() {
        let mut reg = RoomRegistry::new();
        let general = RoomId::from_raw("general");
        assert!(!reg.contains_room(&general));
        assert!(reg.insert(handle("alice", "general")));
        assert!(reg.contains_room(&general));
        assert_eq!(reg.room_size(&general), 1);
    }

    #[test]
    fn room_removed_with_last_member() {
        let mut reg = RoomRegistry::new();
        let a = handle("alice", "general");
        let b = handle("bob", "general");
        let (a_id, b_id) = (a.id.clone(), b.id.clone());
        reg.insert(a);
        reg.insert(b);

        reg.remove(&a_id).unwrap();
        assert_eq!(reg.room_size(&RoomId::from_raw("general")), 1);
        reg.remove(&b_id).unwrap();
        assert!(!reg.contains_room(&RoomId::from_raw("general")));
        assert_eq!(reg.room_count(), 0);
        assert_eq!(reg.connection_count(), 0);
    }

    #[test]
    fn duplicate_insert_rejected() {
        let mut reg = RoomRegistry::new();
        let a = handle("alice", "general");
        assert!(reg.insert(a.clone()));
        assert!(!reg.insert(a));
        assert_eq!(reg.room_size(&RoomId::from_raw("general")), 1);
    }

    #[test]
    fn removing_absent_connection_is_noop() {
        let mut reg = RoomRegistry::new();
        reg.insert(handle("alice", "general"));
        assert!(reg.remove(&ConnectionId::new()).is_none());
        assert_eq!(reg.connection_count(), 1);
    }

    #[test]
    fn membership_never_goes_negative_under_churn() {
        let mut reg = RoomRegistry::new();
        let room = RoomId::from_raw("general");
        let mut ids = Vec::new();
        for round in 0..5 {
            for i in 0..3 {
                let h = handle(&format!("u{round}{i}"), "general");
                ids.push(h.id.clone());
                reg.insert(h);
            }
            while let Some(id) = ids.pop() {
                reg.remove(&id);
                reg.remove(&id);
                assert_eq!(reg.contains_room(&room), reg.room_size(&room) > 0);
            }
            assert!(!reg.contains_room(&room));
        }
    }

    #[test]
    fn online_users_deduplicated_and_sorted() {
        let mut reg = RoomRegistry::new();
        reg.insert(handle("carol", "general"));
        reg.insert(handle("alice", "general"));
        reg.insert(handle("alice", "general"));
        reg.insert(handle("bob", "random"));

        let names: Vec<_> = reg
            .online_users(&RoomId::from_raw("general"))
            .into_iter()
            .map(|u| u.username)
            .collect();
        assert_eq!(names, vec!["alice", "carol"]);
        assert!(reg.user_in_room(&RoomId::from_raw("random"), &UserId::from_raw("bob")));
        assert!(!reg.user_in_room(&RoomId::from_raw("general"), &UserId::from_raw("bob")));
    }

    #[test]
    fn rooms_listing_sorted() {
        let mut reg = RoomRegistry::new();
        reg.insert(handle("a", "zeta"));
        reg.insert(handle("b", "alpha"));
        reg.insert(handle("c", "alpha"));
        let rooms = reg.rooms();
        assert_eq!(rooms[0].room_id.as_str(), "alpha");
        assert_eq!(rooms[0].connections, 2);
        assert_eq!(rooms[1].room_id.as_str(), "zeta");
    }

    #[test]
    fn members_of_unknown_room_is_empty() {
        let reg = RoomRegistry::new();
        assert_eq!(reg.members(&RoomId::from_raw("none")).count(), 0);
    }

    #[test]
    fn drain_empties_registry() {
        let mut reg = RoomRegistry::new();
        reg.insert(handle("a", "x"));
        reg.insert(handle("b", "y"));
        assert_eq!(reg.drain().len(), 2);
        assert_eq!(reg.room_count(), 0);
        assert_eq!(reg.connection_count(), 0);
    }
}
