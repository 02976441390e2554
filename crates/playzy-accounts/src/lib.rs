//! Accounts, credentials and LFG sessions for playzy.
//!
//! - [`users`]: registration and email/password authentication.
//! - [`password`]: argon2id hashing of stored credentials.
//! - [`token`]: HS256 JWT issuance and verification with typed claims.
//! - [`sessions`]: "looking for group" sessions and their filtered listing.
//!
//! All database functions take a borrowed `rusqlite::Connection`; callers
//! own pooling and run them on the blocking pool.

pub mod password;
pub mod sessions;
pub mod token;
pub mod users;

use thiserror::Error;

pub use sessions::{
    create_session, list_available_sessions, CreateSessionParams, Session, SessionFilter,
    SessionListing, SessionsPage, SESSIONS_PAGE_SIZE,
};
pub use token::{issue_token, verify_token, Claims, TokenError};
pub use users::{authenticate, create_user, delete_user, find_user_by_id, CreateUserParams, User};

/// Errors that can occur during account and session operations.
#[derive(Debug, Error)]
pub enum AccountError {
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),
    #[error("{0}")]
    Validation(String),
    #[error("{0} already exists")]
    Conflict(String),
    #[error("{0} not found")]
    NotFound(String),
    #[error("invalid email or password")]
    InvalidCredentials,
    #[error("password hashing failed: {0}")]
    PasswordHash(String),
    #[error("invalid stored timestamp '{0}'")]
    Timestamp(String),
}

pub(crate) fn now_timestamp() -> String {
    chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Micros, true)
}

pub(crate) fn parse_timestamp(raw: &str) -> Result<chrono::DateTime<chrono::Utc>, AccountError> {
    chrono::DateTime::parse_from_rfc3339(raw)
        .map(|ts| ts.with_timezone(&chrono::Utc))
        .map_err(|_| AccountError::Timestamp(raw.to_string()))
}

/// Rejects blank required fields with a message naming the first one.
pub(crate) fn require_fields(fields: &[(&str, &str)]) -> Result<(), AccountError> {
    match fields.iter().find(|(_, value)| value.trim().is_empty()) {
        Some((name, _)) => Err(AccountError::Validation(format!("{name} is required"))),
        None => Ok(()),
    }
}
