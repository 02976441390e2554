//! Direct-message persistence for playzy.
//!
//! A message is a single text payload from one user identity to another.
//! Messages are written once by the gateway's read loop and only their
//! `is_read` flag ever changes afterwards. Both the live delivery path and
//! the conversation history serialize the same [`Message`] shape.

mod store;

use chrono::{DateTime, SecondsFormat, SubsecRound, Utc};
use rusqlite::{params, Connection, Row};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

pub use store::{MessageStore, SqliteMessageStore};

/// Errors that can occur during message operations.
#[derive(Debug, Error)]
pub enum MessageError {
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),
    #[error("database pool error: {0}")]
    Pool(#[from] r2d2::Error),
    #[error("invalid stored timestamp '{0}'")]
    Timestamp(String),
}

/// A persisted (or at least addressed) direct message.
///
/// Serializes as `{id, content, senderId, receiverId, timestamp, isRead}`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub id: String,
    pub content: String,
    pub sender_id: String,
    pub receiver_id: String,
    pub timestamp: DateTime<Utc>,
    pub is_read: bool,
}

/// A validated message that has not been assigned an id yet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewMessage {
    pub content: String,
    pub sender_id: String,
    pub receiver_id: String,
    pub timestamp: DateTime<Utc>,
}

impl NewMessage {
    pub fn new(
        sender_id: impl Into<String>,
        receiver_id: impl Into<String>,
        content: impl Into<String>,
    ) -> Self {
        Self {
            content: content.into(),
            sender_id: sender_id.into(),
            receiver_id: receiver_id.into(),
            timestamp: Utc::now().trunc_subsecs(6),
        }
    }

    /// Builds the message delivered when persistence failed: same payload,
    /// freshly generated id, unread.
    pub fn into_unpersisted(self) -> Message {
        self.into_message(Uuid::new_v4().to_string())
    }

    fn into_message(self, id: String) -> Message {
        Message {
            id,
            content: self.content,
            sender_id: self.sender_id,
            receiver_id: self.receiver_id,
            timestamp: self.timestamp,
            is_read: false,
        }
    }
}

/// Stored timestamps are fixed-width RFC 3339 so that text ordering in
/// SQLite matches chronological ordering.
fn encode_timestamp(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// Persists a message, assigning it a fresh UUID.
pub fn append_message(conn: &Connection, draft: &NewMessage) -> Result<Message, MessageError> {
    let message = draft.clone().into_message(Uuid::new_v4().to_string());

    conn.execute(
        "INSERT INTO messages (id, content, sender_id, receiver_id, created_at, is_read)
         VALUES (?1, ?2, ?3, ?4, ?5, 0)",
        params![
            message.id,
            message.content,
            message.sender_id,
            message.receiver_id,
            encode_timestamp(&message.timestamp),
        ],
    )?;

    Ok(message)
}

/// Lists messages exchanged between `a` and `b` in either direction,
/// most recent first.
pub fn list_between(
    conn: &Connection,
    a: &str,
    b: &str,
    limit: u32,
    offset: u32,
) -> Result<Vec<Message>, MessageError> {
    let mut stmt = conn.prepare(
        "SELECT id, content, sender_id, receiver_id, created_at, is_read
         FROM messages
         WHERE (sender_id = ?1 AND receiver_id = ?2)
            OR (sender_id = ?2 AND receiver_id = ?1)
         ORDER BY created_at DESC, seq DESC
         LIMIT ?3 OFFSET ?4",
    )?;

    let rows = stmt.query_map(params![a, b, limit, offset], map_row_to_raw)?;

    let mut messages = Vec::new();
    for row in rows {
        messages.push(row?.into_message()?);
    }
    Ok(messages)
}

/// Marks every unread message sent by `counterpart` to `owner` as read.
///
/// Returns how many rows flipped; a repeat call returns 0.
pub fn mark_read(conn: &Connection, owner: &str, counterpart: &str) -> Result<usize, MessageError> {
    let updated = conn.execute(
        "UPDATE messages SET is_read = 1
         WHERE receiver_id = ?1 AND sender_id = ?2 AND is_read = 0",
        params![owner, counterpart],
    )?;
    Ok(updated)
}

struct RawMessage {
    id: String,
    content: String,
    sender_id: String,
    receiver_id: String,
    created_at: String,
    is_read: bool,
}

impl RawMessage {
    fn into_message(self) -> Result<Message, MessageError> {
        let timestamp = DateTime::parse_from_rfc3339(&self.created_at)
            .map_err(|_| MessageError::Timestamp(self.created_at.clone()))?
            .with_timezone(&Utc);
        Ok(Message {
            id: self.id,
            content: self.content,
            sender_id: self.sender_id,
            receiver_id: self.receiver_id,
            timestamp,
            is_read: self.is_read,
        })
    }
}

fn map_row_to_raw(row: &Row) -> rusqlite::Result<RawMessage> {
    Ok(RawMessage {
        id: row.get(0)?,
        content: row.get(1)?,
        sender_id: row.get(2)?,
        receiver_id: row.get(3)?,
        created_at: row.get(4)?,
        is_read: row.get(5)?,
    })
}
