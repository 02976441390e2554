//! "Looking for group" sessions.
//!
//! A session advertises that a user wants teammates for a game, with an
//! objective and optionally a rank. Listings only show sessions whose owner
//! still has an active account.

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, Row};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{now_timestamp, parse_timestamp, require_fields, users, AccountError};

/// Sessions returned per listing page.
pub const SESSIONS_PAGE_SIZE: u32 = 6;

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct Session {
    pub id: String,
    pub game: String,
    pub user_id: String,
    pub objective: String,
    pub rank: Option<String>,
    pub is_ranked: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CreateSessionParams {
    #[serde(default)]
    pub game: String,
    #[serde(default)]
    pub objective: String,
    #[serde(default)]
    pub rank: Option<String>,
    #[serde(default)]
    pub is_ranked: bool,
}

/// A session joined with the public profile of its owner.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct SessionListing {
    #[serde(flatten)]
    pub session: Session,
    pub user_name: String,
    pub user_gamertag: String,
}

/// Optional listing filters. Blank strings count as absent.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct SessionFilter {
    /// Case-insensitive exact rank match.
    pub rank: Option<String>,
    /// Case-insensitive substring match on the game name.
    pub game: Option<String>,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct SessionsPage {
    pub page: u32,
    pub total_pages: u32,
    pub sessions: Vec<SessionListing>,
}

/// Creates a session owned by `user_id`.
pub fn create_session(
    conn: &Connection,
    user_id: &str,
    params: &CreateSessionParams,
) -> Result<Session, AccountError> {
    require_fields(&[
        ("game", params.game.as_str()),
        ("objective", params.objective.as_str()),
    ])?;
    users::find_user_by_id(conn, user_id)?;

    let rank = params
        .rank
        .as_deref()
        .map(str::trim)
        .filter(|r| !r.is_empty())
        .map(str::to_string);
    let id = Uuid::new_v4().to_string();
    let now = now_timestamp();

    conn.execute(
        "INSERT INTO sessions (id, game, user_id, objective, rank, is_ranked, created_at, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?7)",
        params![
            id,
            params.game.trim(),
            user_id,
            params.objective.trim(),
            rank,
            params.is_ranked,
            now,
        ],
    )?;

    tracing::info!(session_id = %id, user_id, "created session");

    Ok(Session {
        id,
        game: params.game.trim().to_string(),
        user_id: user_id.to_string(),
        objective: params.objective.trim().to_string(),
        rank,
        is_ranked: params.is_ranked,
        created_at: parse_timestamp(&now)?,
        updated_at: parse_timestamp(&now)?,
    })
}

/// Lists one page of sessions, newest first. Pages start at 1.
///
/// Filters are bound as parameters; `%`, `_` and `\` in the game filter
/// match literally.
pub fn list_available_sessions(
    conn: &Connection,
    page: u32,
    filter: &SessionFilter,
) -> Result<SessionsPage, AccountError> {
    if page == 0 {
        return Err(AccountError::Validation("page must be at least 1".to_string()));
    }

    let rank = non_blank(filter.rank.as_deref());
    let game = non_blank(filter.game.as_deref()).map(|g| format!("%{}%", escape_like(g)));

    let total: u32 = conn.query_row(
        "SELECT COUNT(*)
         FROM sessions s JOIN users u ON u.id = s.user_id
         WHERE u.is_deleted = 0
           AND (?1 IS NULL OR LOWER(s.rank) = LOWER(?1))
           AND (?2 IS NULL OR LOWER(s.game) LIKE LOWER(?2) ESCAPE '\\')",
        params![rank, game],
        |row| row.get(0),
    )?;

    let mut stmt = conn.prepare(
        "SELECT s.id, s.game, s.user_id, s.objective, s.rank, s.is_ranked,
                s.created_at, s.updated_at, u.name, u.gamertag
         FROM sessions s JOIN users u ON u.id = s.user_id
         WHERE u.is_deleted = 0
           AND (?1 IS NULL OR LOWER(s.rank) = LOWER(?1))
           AND (?2 IS NULL OR LOWER(s.game) LIKE LOWER(?2) ESCAPE '\\')
         ORDER BY s.created_at DESC, s.id
         LIMIT ?3 OFFSET ?4",
    )?;

    let offset = (page - 1).saturating_mul(SESSIONS_PAGE_SIZE);
    let rows = stmt.query_map(
        params![rank, game, SESSIONS_PAGE_SIZE, offset],
        map_row_to_raw_listing,
    )?;

    let mut sessions = Vec::new();
    for row in rows {
        sessions.push(row?.into_listing()?);
    }

    Ok(SessionsPage {
        page,
        total_pages: total.div_ceil(SESSIONS_PAGE_SIZE),
        sessions,
    })
}

fn non_blank(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|v| !v.is_empty())
}

fn escape_like(raw: &str) -> String {
    let mut escaped = String::with_capacity(raw.len());
    for ch in raw.chars() {
        if matches!(ch, '\\' | '%' | '_') {
            escaped.push('\\');
        }
        escaped.push(ch);
    }
    escaped
}

struct RawListing {
    id: String,
    game: String,
    user_id: String,
    objective: String,
    rank: Option<String>,
    is_ranked: bool,
    created_at: String,
    updated_at: String,
    user_name: String,
    user_gamertag: String,
}

impl RawListing {
    fn into_listing(self) -> Result<SessionListing, AccountError> {
        Ok(SessionListing {
            session: Session {
                created_at: parse_timestamp(&self.created_at)?,
                updated_at: parse_timestamp(&self.updated_at)?,
                id: self.id,
                game: self.game,
                user_id: self.user_id,
                objective: self.objective,
                rank: self.rank,
                is_ranked: self.is_ranked,
            },
            user_name: self.user_name,
            user_gamertag: self.user_gamertag,
        })
    }
}

fn map_row_to_raw_listing(row: &Row) -> rusqlite::Result<RawListing> {
    Ok(RawListing {
        id: row.get(0)?,
        game: row.get(1)?,
        user_id: row.get(2)?,
        objective: row.get(3)?,
        rank: row.get(4)?,
        is_ranked: row.get(5)?,
        created_at: row.get(6)?,
        updated_at: row.get(7)?,
        user_name: row.get(8)?,
        user_gamertag: row.get(9)?,
    })
}
