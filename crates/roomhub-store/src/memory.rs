//! In-process collaborators, for tests and `--memory-store` runs.

use std::collections::BTreeMap;

use async_trait::async_trait;
use dashmap::DashMap;
use roomhub_core::{
    CollaboratorError, MessageFilter, MessageStore, PresenceCache, RoomId, StoredMessage, UserId,
    UserSummary,
};

/// Chat history kept in memory, per room, in insertion order.
#[derive(Default)]
pub struct MemoryMessageStore {
    rooms: DashMap<RoomId, Vec<StoredMessage>>,
}

impl MemoryMessageStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.rooms.iter().map(|r| r.value().len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl MessageStore for MemoryMessageStore {
    async fn save(&self, message: StoredMessage) -> Result<(), CollaboratorError> {
        self.rooms
            .entry(message.room_id.clone())
            .or_default()
            .push(message);
        Ok(())
    }

    async fn query(
        &self,
        room: &RoomId,
        filter: &MessageFilter,
    ) -> Result<Vec<StoredMessage>, CollaboratorError> {
        let Some(messages) = self.rooms.get(room) else {
            return Ok(Vec::new());
        };
        let search = filter.search_term();
        let mut matching: Vec<StoredMessage> = messages
            .iter()
            .filter(|m| search.map_or(true, |s| m.content.contains(s)))
            .cloned()
            .collect();
        // Stable sort keeps later inserts ahead on equal timestamps once reversed.
        matching.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        matching.reverse();
        Ok(matching
            .into_iter()
            .skip(filter.offset)
            .take(filter.effective_limit())
            .collect())
    }
}

/// Who is online where, as last reported by the hub.
#[derive(Default)]
pub struct MemoryPresenceCache {
    rooms: DashMap<RoomId, BTreeMap<UserId, String>>,
}

impl MemoryPresenceCache {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl PresenceCache for MemoryPresenceCache {
    async fn mark_online(&self, room: &RoomId, user: &UserSummary) -> Result<(), CollaboratorError> {
        self.rooms
            .entry(room.clone())
            .or_default()
            .insert(user.id.clone(), user.username.clone());
        Ok(())
    }

    async fn mark_offline(&self, room: &RoomId, user: &UserId) -> Result<(), CollaboratorError> {
        let now_empty = match self.rooms.get_mut(room) {
            Some(mut users) => {
                users.remove(user);
                users.is_empty()
            }
            None => false,
        };
        if now_empty {
            self.rooms.remove_if(room, |_, users| users.is_empty());
        }
        Ok(())
    }

    async fn list_online(&self, room: &RoomId) -> Result<Vec<UserSummary>, CollaboratorError> {
        Ok(self
            .rooms
            .get(room)
            .map(|users| {
                users
                    .iter()
                    .map(|(id, name)| UserSummary::new(id.clone(), name.clone()))
                    .collect()
            })
            .unwrap_or_default())
    }
}
