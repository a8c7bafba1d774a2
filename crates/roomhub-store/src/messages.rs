use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use roomhub_core::{
    CollaboratorError, MessageFilter, MessageId, MessageStore, RoomId, StoredMessage, UserId,
};
use tracing::instrument;

use crate::database::Database;
use crate::error::StoreError;

/// SQLite-backed chat history.
#[derive(Clone)]
pub struct SqliteMessageStore {
    db: Database,
}

impl SqliteMessageStore {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Insert one message.
    pub fn insert(&self, message: &StoredMessage) -> Result<(), StoreError> {
        self.db.with_conn(|conn| {
            conn.execute(
                "INSERT INTO messages (id, room_id, user_id, username, content, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                rusqlite::params![
                    message.id.as_str(),
                    message.room_id.as_str(),
                    message.user_id.as_str(),
                    message.username,
                    message.content,
                    format_timestamp(&message.created_at),
                ],
            )?;
            Ok(())
        })
    }

    /// Messages in `room`, newest first.
    pub fn list(&self, room: &RoomId, filter: &MessageFilter) -> Result<Vec<StoredMessage>, StoreError> {
        let pattern = filter.search_term().map(escape_like);
        let limit = i64::try_from(filter.effective_limit()).unwrap_or(i64::MAX);
        let offset = i64::try_from(filter.offset).unwrap_or(i64::MAX);

        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, room_id, user_id, username, content, created_at
                 FROM messages
                 WHERE room_id = ?1
                   AND (?2 IS NULL OR content LIKE '%' || ?2 || '%' ESCAPE '\\')
                 ORDER BY created_at DESC, rowid DESC
                 LIMIT ?3 OFFSET ?4",
            )?;
            let rows = stmt.query_map(
                rusqlite::params![room.as_str(), pattern, limit, offset],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, String>(3)?,
                        row.get::<_, String>(4)?,
                        row.get::<_, String>(5)?,
                    ))
                },
            )?;

            let mut messages = Vec::new();
            for row in rows {
                let (id, room_id, user_id, username, content, created_at) = row?;
                messages.push(StoredMessage {
                    id: MessageId::from_raw(id),
                    room_id: RoomId::from_raw(room_id),
                    user_id: UserId::from_raw(user_id),
                    username,
                    content,
                    created_at: parse_timestamp(&created_at)?,
                });
            }
            Ok(messages)
        })
    }

    /// Total messages stored for `room`.
    pub fn count(&self, room: &RoomId) -> Result<u64, StoreError> {
        self.db.with_conn(|conn| {
            let n: i64 = conn.query_row(
                "SELECT COUNT(*) FROM messages WHERE room_id = ?1",
                [room.as_str()],
                |row| row.get(0),
            )?;
            Ok(u64::try_from(n).unwrap_or(0))
        })
    }
}

#[async_trait]
impl MessageStore for SqliteMessageStore {
    #[instrument(skip(self, message), fields(room_id = %message.room_id, message_id = %message.id))]
    async fn save(&self, message: StoredMessage) -> Result<(), CollaboratorError> {
        let store = self.clone();
        tokio::task::spawn_blocking(move || store.insert(&message))
            .await
            .map_err(|e| StoreError::Task(e.to_string()))??;
        Ok(())
    }

    #[instrument(skip(self, filter), fields(room_id = %room))]
    async fn query(
        &self,
        room: &RoomId,
        filter: &MessageFilter,
    ) -> Result<Vec<StoredMessage>, CollaboratorError> {
        let store = self.clone();
        let room = room.clone();
        let filter = filter.clone();
        let messages = tokio::task::spawn_blocking(move || store.list(&room, &filter))
            .await
            .map_err(|e| StoreError::Task(e.to_string()))??;
        Ok(messages)
    }
}

/// Fixed-width UTC so lexical order matches time order.
fn format_timestamp(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_timestamp(raw: &str) -> Result<DateTime<Utc>, StoreError> {
    DateTime::parse_from_rfc3339(raw)
        .map(|ts| ts.with_timezone(&Utc))
        .map_err(|e| StoreError::CorruptRow {
            table: "messages",
            column: "created_at",
            detail: e.to_string(),
        })
}

fn escape_like(term: &str) -> String {
    let mut out = String::with_capacity(term.len());
    for c in term.chars() {
        if matches!(c, '%' | '_' | '\\') {
            out.push('\\');
        }
        out.push(c);
    }
    out
}
