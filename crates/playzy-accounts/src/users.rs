//! User registration and authentication.

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::password::{hash_password, verify_password};
use crate::{now_timestamp, parse_timestamp, require_fields, AccountError};

/// A registered user. The password hash never leaves this module.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct User {
    pub id: String,
    pub name: String,
    pub email: String,
    pub phone: String,
    pub gamertag: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Parameters for registering a user.
#[derive(Debug, Clone, Deserialize)]
pub struct CreateUserParams {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub email: String,
    #[serde(default)]
    pub phone: String,
    #[serde(default)]
    pub gamertag: String,
    #[serde(default)]
    pub password: String,
}

/// Registers a user. Every field is required and emails are unique,
/// compared case-insensitively.
pub fn create_user(conn: &Connection, params: &CreateUserParams) -> Result<User, AccountError> {
    require_fields(&[
        ("name", params.name.as_str()),
        ("email", params.email.as_str()),
        ("phone", params.phone.as_str()),
        ("gamertag", params.gamertag.as_str()),
        ("password", params.password.as_str()),
    ])?;

    let email = params.email.trim().to_lowercase();
    let taken: bool = conn.query_row(
        "SELECT COUNT(*) > 0 FROM users WHERE email = ?1",
        [&email],
        |row| row.get(0),
    )?;
    if taken {
        return Err(AccountError::Conflict(format!("user with email {email}")));
    }

    let password_hash = hash_password(&params.password)?;
    let id = Uuid::new_v4().to_string();
    let now = now_timestamp();

    conn.execute(
        "INSERT INTO users (id, name, email, phone, gamertag, password_hash, created_at, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?7)",
        params![
            id,
            params.name.trim(),
            email,
            params.phone.trim(),
            params.gamertag.trim(),
            password_hash,
            now,
        ],
    )?;

    tracing::info!(user_id = %id, "registered user");
    find_user_by_id(conn, &id)
}

/// Looks up an active (non-deleted) user by id.
pub fn find_user_by_id(conn: &Connection, user_id: &str) -> Result<User, AccountError> {
    conn.query_row(
        "SELECT id, name, email, phone, gamertag, created_at, updated_at
         FROM users WHERE id = ?1 AND is_deleted = 0",
        [user_id],
        map_row_to_raw_user,
    )
    .optional()?
    .ok_or_else(|| AccountError::NotFound(format!("user {user_id}")))?
    .into_user()
}

/// Checks an email/password pair.
///
/// Unknown emails, deleted accounts and wrong passwords all yield
/// [`AccountError::InvalidCredentials`].
pub fn authenticate(conn: &Connection, email: &str, password: &str) -> Result<User, AccountError> {
    let email = email.trim().to_lowercase();
    let row: Option<(String, String)> = conn
        .query_row(
            "SELECT id, password_hash FROM users WHERE email = ?1 AND is_deleted = 0",
            [&email],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )
        .optional()?;

    let Some((id, password_hash)) = row else {
        return Err(AccountError::InvalidCredentials);
    };
    if !verify_password(password, &password_hash) {
        tracing::debug!(user_id = %id, "password mismatch");
        return Err(AccountError::InvalidCredentials);
    }

    find_user_by_id(conn, &id)
}

/// Soft-deletes a user. Their sessions drop out of listings and they can no
/// longer authenticate.
pub fn delete_user(conn: &Connection, user_id: &str) -> Result<(), AccountError> {
    let now = now_timestamp();
    let updated = conn.execute(
        "UPDATE users SET is_deleted = 1, deleted_at = ?2, updated_at = ?2
         WHERE id = ?1 AND is_deleted = 0",
        params![user_id, now],
    )?;
    if updated == 0 {
        return Err(AccountError::NotFound(format!("user {user_id}")));
    }
    Ok(())
}

struct RawUser {
    id: String,
    name: String,
    email: String,
    phone: String,
    gamertag: String,
    created_at: String,
    updated_at: String,
}

impl RawUser {
    fn into_user(self) -> Result<User, AccountError> {
        Ok(User {
            created_at: parse_timestamp(&self.created_at)?,
            updated_at: parse_timestamp(&self.updated_at)?,
            id: self.id,
            name: self.name,
            email: self.email,
            phone: self.phone,
            gamertag: self.gamertag,
        })
    }
}

fn map_row_to_raw_user(row: &Row) -> rusqlite::Result<RawUser> {
    Ok(RawUser {
        id: row.get(0)?,
        name: row.get(1)?,
        email: row.get(2)?,
        phone: row.get(3)?,
        gamertag: row.get(4)?,
        created_at: row.get(5)?,
        updated_at: row.get(6)?,
    })
}
