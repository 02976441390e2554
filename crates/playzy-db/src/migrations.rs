//! Schema versioning.
//!
//! The schema version lives in SQLite's `user_version` header field. Step
//! `n` of [`SCHEMA`] upgrades a database from version `n` to `n + 1`; the
//! step's SQL and the version bump commit together, so a failed step
//! leaves the database at the previous version.

use rusqlite::Connection;
use thiserror::Error;

/// Ordered schema steps. Append only; never edit a shipped step.
const SCHEMA: &[(&str, &str)] = &[
    ("users", include_str!("migrations/001_users.sql")),
    ("sessions", include_str!("migrations/002_sessions.sql")),
    ("messages", include_str!("migrations/003_messages.sql")),
];

#[derive(Debug, Error)]
pub enum MigrationError {
    #[error("could not read schema version: {0}")]
    Version(#[source] rusqlite::Error),

    #[error("database schema version {found} is newer than this build supports ({supported})")]
    TooNew { found: u32, supported: u32 },

    #[error("schema step {version} ({name}) failed: {source}")]
    Step {
        version: u32,
        name: &'static str,
        source: rusqlite::Error,
    },
}

/// Version a fully migrated database reports.
pub fn latest_version() -> u32 {
    SCHEMA.len() as u32
}

/// Current `user_version` of the database behind `conn`.
pub fn schema_version(conn: &Connection) -> Result<u32, MigrationError> {
    conn.pragma_query_value(None, "user_version", |row| row.get(0))
        .map_err(MigrationError::Version)
}

/// Brings the schema up to [`latest_version`]. Returns how many steps ran.
///
/// Refuses to touch a database written by a newer build.
pub fn run_migrations(conn: &Connection) -> Result<usize, MigrationError> {
    apply(conn, SCHEMA)
}

fn apply(conn: &Connection, steps: &[(&'static str, &'static str)]) -> Result<usize, MigrationError> {
    let found = schema_version(conn)?;
    let supported = steps.len() as u32;
    if found > supported {
        return Err(MigrationError::TooNew { found, supported });
    }

    let pending = &steps[found as usize..];
    for (offset, &(name, sql)) in pending.iter().enumerate() {
        let version = found + offset as u32 + 1;
        let step_failed = |source| MigrationError::Step {
            version,
            name,
            source,
        };

        let tx = conn.unchecked_transaction().map_err(step_failed)?;
        tx.execute_batch(sql).map_err(step_failed)?;
        tx.pragma_update(None, "user_version", version)
            .map_err(step_failed)?;
        tx.commit().map_err(step_failed)?;

        tracing::info!(version, step = name, "schema upgraded");
    }

    Ok(pending.len())
}
