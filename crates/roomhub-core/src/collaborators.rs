//! Contracts for the services the hub leans on but does not own.
//!
//! Both are called off the hub loop (fire-and-forget), so a slow or failing
//! implementation never delays delivery.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::envelope::{ChatMessage, UserSummary};
use crate::errors::CollaboratorError;
use crate::ids::{MessageId, RoomId, UserId};

/// A chat message as persisted by a [`MessageStore`].
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredMessage {
    pub id: MessageId,
    pub room_id: RoomId,
    pub user_id: UserId,
    pub username: String,
    pub content: String,
    pub created_at: DateTime<Utc>,
}

impl StoredMessage {
    pub fn from_chat(message: &ChatMessage, created_at: DateTime<Utc>) -> Self {
        Self {
            id: MessageId::new(),
            room_id: message.room_id.clone(),
            user_id: message.user_id.clone(),
            username: message.username.clone(),
            content: message.content.clone(),
            created_at,
        }
    }
}

/// History query. Results are newest first.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MessageFilter {
    pub limit: usize,
    pub offset: usize,
    /// Substring match on message content.
    pub search: Option<String>,
}

pub const DEFAULT_HISTORY_LIMIT: usize = 50;
pub const MAX_HISTORY_LIMIT: usize = 500;

impl Default for MessageFilter {
    fn default() -> Self {
        Self {
            limit: DEFAULT_HISTORY_LIMIT,
            offset: 0,
            search: None,
        }
    }
}

impl MessageFilter {
    /// Limit clamped to `1..=MAX_HISTORY_LIMIT`.
    pub fn effective_limit(&self) -> usize {
        self.limit.clamp(1, MAX_HISTORY_LIMIT)
    }

    /// Search term, if any non-blank one was given.
    pub fn search_term(&self) -> Option<&str> {
        self.search.as_deref().map(str::trim).filter(|s| !s.is_empty())
    }
}

#[async_trait]
pub trait MessageStore: Send + Sync {
    async fn save(&self, message: StoredMessage) -> Result<(), CollaboratorError>;

    async fn query(
        &self,
        room: &RoomId,
        filter: &MessageFilter,
    ) -> Result<Vec<StoredMessage>, CollaboratorError>;
}

#[async_trait]
pub trait PresenceCache: Send + Sync {
    async fn mark_online(&self, room: &RoomId, user: &UserSummary) -> Result<(), CollaboratorError>;

    async fn mark_offline(&self, room: &RoomId, user: &UserId) -> Result<(), CollaboratorError>;

    async fn list_online(&self, room: &RoomId) -> Result<Vec<UserSummary>, CollaboratorError>;
}
