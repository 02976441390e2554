//! Opening the pooled database.
//!
//! [`open_pool`] hands back a pool whose schema is already current, so
//! nothing downstream runs migrations itself.

use r2d2::Pool;
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::{Connection, OpenFlags};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use thiserror::Error;

use crate::migrations::{self, MigrationError};

/// Path that selects a private in-memory database.
pub const IN_MEMORY: &str = ":memory:";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DbRuntimeSettings {
    /// How long a connection waits on a locked database, in milliseconds.
    pub busy_timeout_ms: u64,
    pub pool_max_size: u32,
}

impl Default for DbRuntimeSettings {
    fn default() -> Self {
        Self {
            busy_timeout_ms: 5_000,
            pool_max_size: 8,
        }
    }
}

pub type DbPool = Pool<SqliteConnectionManager>;

#[derive(Debug, Error)]
pub enum DbError {
    #[error("failed to open database pool: {0}")]
    Pool(#[from] r2d2::Error),
    #[error(transparent)]
    Migration(#[from] MigrationError),
}

static MEMORY_DATABASES: AtomicU64 = AtomicU64::new(0);

/// Opens `path` as a pool of connections and migrates it to the latest
/// schema.
///
/// [`IN_MEMORY`] gets a fresh shared-cache database that every connection
/// of the returned pool sees. It lives as long as the pool, which never
/// recycles those connections. Shared cache serializes writers at table
/// level, so in-memory pools suit tests rather than serving.
pub fn open_pool(path: &str, settings: DbRuntimeSettings) -> Result<DbPool, DbError> {
    let in_memory = path == IN_MEMORY;
    let mut flags = OpenFlags::SQLITE_OPEN_READ_WRITE
        | OpenFlags::SQLITE_OPEN_CREATE
        | OpenFlags::SQLITE_OPEN_FULL_MUTEX;

    let manager = if in_memory {
        flags |= OpenFlags::SQLITE_OPEN_URI;
        let n = MEMORY_DATABASES.fetch_add(1, Ordering::Relaxed);
        SqliteConnectionManager::file(format!(
            "file:playzy-mem-{}-{n}?mode=memory&cache=shared",
            std::process::id()
        ))
    } else {
        SqliteConnectionManager::file(path)
    };
    let busy_timeout = Duration::from_millis(settings.busy_timeout_ms);
    let manager = manager
        .with_flags(flags)
        .with_init(move |conn| configure(conn, busy_timeout));

    let mut builder = Pool::builder().max_size(settings.pool_max_size);
    if in_memory {
        // The database disappears with its last connection.
        builder = builder
            .min_idle(Some(settings.pool_max_size))
            .max_lifetime(None)
            .idle_timeout(None);
    }
    let pool = builder.build(manager)?;

    let conn = pool.get()?;
    let ran = migrations::run_migrations(&conn)?;
    tracing::info!(
        path,
        max_size = settings.pool_max_size,
        schema_version = migrations::latest_version(),
        steps_applied = ran,
        "database ready"
    );
    drop(conn);

    Ok(pool)
}

fn configure(conn: &mut Connection, busy_timeout: Duration) -> rusqlite::Result<()> {
    // Shared-cache memory databases answer "memory" and cannot use WAL.
    let mode: String =
        conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get(0))?;
    if !mode.eq_ignore_ascii_case("wal") && !mode.eq_ignore_ascii_case("memory") {
        tracing::warn!(journal_mode = %mode, "database refused WAL journal mode");
    }
    conn.pragma_update(None, "foreign_keys", true)?;
    conn.busy_timeout(busy_timeout)
}
