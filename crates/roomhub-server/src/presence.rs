//! Join/leave events derived from registry transitions.
//!
//! Envelopes are built inline in the hub loop right after the registry
//! changes, so the online list always reflects exactly the membership that
//! produced it. Presence cache updates leave the loop through
//! [`PresenceBridge`], a single task that applies them in hub order.

use std::sync::Arc;

use roomhub_core::{Envelope, Event, PresenceCache, PresenceUpdate, RoomId, UserId, UserSummary};
use tokio::sync::mpsc;

use crate::registry::RoomRegistry;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PresenceChange {
    Joined,
    Left,
}

/// Build the `user_joined` / `user_left` envelope for `user` in `room`,
/// carrying the room's current online list.
pub fn presence_envelope(
    registry: &RoomRegistry,
    change: PresenceChange,
    room: &RoomId,
    user: UserSummary,
) -> Envelope {
    let update = PresenceUpdate {
        user,
        online_users: registry.online_users(room),
    };
    let event = match change {
        PresenceChange::Joined => Event::UserJoined(update),
        PresenceChange::Left => Event::UserLeft(update),
    };
    Envelope::new(event)
}

/// A cache update emitted by the hub when a user's presence in a room flips.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PresenceTransition {
    Online(RoomId, UserSummary),
    Offline(RoomId, UserId),
}

/// Forwards hub presence transitions to the [`PresenceCache`], one call at
/// a time.
pub struct PresenceBridge {
    rx: mpsc::UnboundedReceiver<PresenceTransition>,
    cache: Arc<dyn PresenceCache>,
}

impl PresenceBridge {
    pub fn new(rx: mpsc::UnboundedReceiver<PresenceTransition>, cache: Arc<dyn PresenceCache>) -> Self {
        Self { rx, cache }
    }

    /// Run until the hub drops its sender. Failures are logged and skipped.
    #[tracing::instrument(skip_all, name = "presence_bridge")]
    pub async fn run(mut self) {
        while let Some(transition) = self.rx.recv().await {
            match &transition {
                PresenceTransition::Online(room, user) => {
                    if let Err(e) = self.cache.mark_online(room, user).await {
                        tracing::warn!(room_id = %room, user_id = %user.id, error = %e, "presence mark_online failed");
                    }
                }
                PresenceTransition::Offline(room, user_id) => {
                    if let Err(e) = self.cache.mark_offline(room, user_id).await {
                        tracing::warn!(room_id = %room, user_id = %user_id, error = %e, "presence mark_offline failed");
                    }
                }
            }
        }
        tracing::debug!("presence bridge: hub closed, exiting");
    }
}

#[cfg(test)]
mod tests {
    use roomhub_core::EventKind;
    use roomhub_store::MemoryPresenceCache;

    use super::*;
    use crate::connection::{ConnectionHandle, OutboundQueue};

    fn join(reg: &mut RoomRegistry, name: &str) -> ConnectionHandle {
        let (queue, _rx) = OutboundQueue::channel(1);
        let h = ConnectionHandle::new(
            UserSummary::new(UserId::from_raw(name), name),
            RoomId::from_raw("general"),
            queue,
        );
        reg.insert(h.clone());
        h
    }

    #[test]
    fn joined_lists_new_member() {
        let mut reg = RoomRegistry::new();
        join(&mut reg, "bob");
        let alice = join(&mut reg, "alice");

        let env = presence_envelope(&reg, PresenceChange::Joined, &alice.room, alice.user.clone());
        assert_eq!(env.kind(), EventKind::UserJoined);
        let Event::UserJoined(update) = env.event else { unreachable!() };
        assert_eq!(update.user, alice.user);
        assert_eq!(update.online_users.len(), 2);
    }

    #[test]
    fn left_excludes_departed_member() {
        let mut reg = RoomRegistry::new();
        let a = join(&mut reg, "a");
        join(&mut reg, "b");
        join(&mut reg, "c");
        reg.remove(&a.id);

        let env = presence_envelope(&reg, PresenceChange::Left, &a.room, a.user.clone());
        let Event::UserLeft(update) = env.event else { unreachable!() };
        assert_eq!(update.online_users.len(), 2);
        assert!(!update.online_users.contains(&a.user));
    }

    #[test]
    fn left_from_emptied_room_has_empty_list() {
        let mut reg = RoomRegistry::new();
        let a = join(&mut reg, "a");
        reg.remove(&a.id);
        let env = presence_envelope(&reg, PresenceChange::Left, &a.room, a.user);
        let Event::UserLeft(update) = env.event else { unreachable!() };
        assert!(update.online_users.is_empty());
    }

    #[tokio::test]
    async fn bridge_applies_transitions_in_order() {
        let cache = Arc::new(MemoryPresenceCache::new());
        let (tx, rx) = mpsc::unbounded_channel();
        let room = RoomId::from_raw("general");
        let ann = UserSummary::new(UserId::from_raw("ann"), "ann");
        let ben = UserSummary::new(UserId::from_raw("ben"), "ben");

        tx.send(PresenceTransition::Online(room.clone(), ann.clone())).unwrap();
        tx.send(PresenceTransition::Online(room.clone(), ben.clone())).unwrap();
        tx.send(PresenceTransition::Offline(room.clone(), ann.id.clone())).unwrap();
        drop(tx);

        PresenceBridge::new(rx, cache.clone()).run().await;
        assert_eq!(cache.list_online(&room).await.unwrap(), vec![ben]);
    }
}
