//! Database layer for playzy.
//!
//! [`open_pool`] returns an r2d2 pool of SQLite connections (WAL, foreign
//! keys, busy timeout) whose schema has been brought up to date: accounts,
//! LFG sessions and direct messages.

mod migrations;
mod pool;

pub use migrations::{latest_version, run_migrations, schema_version, MigrationError};
pub use pool::{open_pool, DbError, DbPool, DbRuntimeSettings, IN_MEMORY};
