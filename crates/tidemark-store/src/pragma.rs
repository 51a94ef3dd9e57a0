//! Per-connection PRAGMA setup
//!
//! Session settings, not migrations: they must be re-applied every time a
//! connection is opened. A store that cannot guarantee foreign-key
//! enforcement must not be used, so any failure here aborts the open.

use crate::config::StoreConfig;
use crate::error::StoreResult;
use rusqlite::Connection;
use tracing::debug;

/// Apply the session PRAGMAs for a freshly opened connection.
///
/// Idempotent, but designed to run exactly once per connection, from
/// [`SharedStore::open`](crate::SharedStore::open).
pub(crate) fn apply(conn: &Connection, config: &StoreConfig) -> StoreResult<()> {
    debug!("Configuring SQLite pragmas");

    // Foreign key enforcement is off by default in SQLite.
    if config.foreign_keys {
        conn.execute_batch("PRAGMA foreign_keys = ON;")?;
    }

    // WAL lets readers proceed while the single writer holds its lock.
    // NORMAL synchronous is durable enough under WAL; outside WAL we keep
    // the FULL default.
    if config.wal_mode {
        conn.execute_batch("PRAGMA journal_mode = WAL;")?;
        conn.execute_batch("PRAGMA synchronous = NORMAL;")?;
    } else {
        conn.execute_batch("PRAGMA synchronous = FULL;")?;
    }

    // How long SQLite itself waits for a lock before surfacing BUSY.
    conn.execute_batch(&format!(
        "PRAGMA busy_timeout = {};",
        config.busy_timeout_ms
    ))?;

    conn.execute_batch(&format!("PRAGMA cache_size = {};", config.cache_size))?;

    // Temp tables and indices stay off disk.
    conn.execute_batch("PRAGMA temp_store = MEMORY;")?;

    if config.mmap_size > 0 {
        conn.execute_batch(&format!("PRAGMA mmap_size = {};", config.mmap_size))?;
    }

    Ok(())
}
