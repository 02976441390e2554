//! The [`MessageStore`] seam between the gateway and persistence.

use playzy_db::DbPool;

use crate::{Message, MessageError, NewMessage};

/// Durable storage for direct messages.
///
/// Implementations are synchronous; async callers run them on the blocking
/// pool (`tokio::task::spawn_blocking`).
pub trait MessageStore: Send + Sync + 'static {
    /// Persists a draft and returns it with its assigned id.
    fn append(&self, draft: &NewMessage) -> Result<Message, MessageError>;

    /// Messages between `a` and `b` in either direction, most recent first.
    fn list_between(
        &self,
        a: &str,
        b: &str,
        limit: u32,
        offset: u32,
    ) -> Result<Vec<Message>, MessageError>;

    /// Flags unread messages from `counterpart` to `owner` as read.
    fn mark_read(&self, owner: &str, counterpart: &str) -> Result<usize, MessageError>;
}

/// SQLite-backed store over the shared connection pool.
#[derive(Clone)]
pub struct SqliteMessageStore {
    pool: DbPool,
}

impl SqliteMessageStore {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

impl MessageStore for SqliteMessageStore {
    fn append(&self, draft: &NewMessage) -> Result<Message, MessageError> {
        let conn = self.pool.get()?;
        crate::append_message(&conn, draft)
    }

    fn list_between(
        &self,
        a: &str,
        b: &str,
        limit: u32,
        offset: u32,
    ) -> Result<Vec<Message>, MessageError> {
        let conn = self.pool.get()?;
        crate::list_between(&conn, a, b, limit, offset)
    }

    fn mark_read(&self, owner: &str, counterpart: &str) -> Result<usize, MessageError> {
        let conn = self.pool.get()?;
        let updated = crate::mark_read(&conn, owner, counterpart)?;
        if updated > 0 {
            tracing::debug!(owner, counterpart, updated, "marked messages read");
        }
        Ok(updated)
    }
}
