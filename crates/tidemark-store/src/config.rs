//! Store configuration

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Configuration for the shared SQLite store.
///
/// The defaults are tuned for a desktop app: WAL journaling so readers do
/// not block the single writer, a busy timeout that absorbs short
/// contention inside SQLite itself, and a modest page cache.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Path to the database file (`:memory:` for an in-memory store)
    pub path: PathBuf,

    /// Use WAL journal mode (readers and the writer avoid blocking each other)
    pub wal_mode: bool,

    /// Enforce foreign key constraints
    pub foreign_keys: bool,

    /// How long SQLite waits internally for a lock before reporting busy
    pub busy_timeout_ms: u32,

    /// Page cache size in pages (negative values mean KiB, per SQLite)
    pub cache_size: i64,

    /// Memory-map budget in bytes (0 disables mmap)
    pub mmap_size: u64,
}

impl StoreConfig {
    /// Configuration for a store at the given path, with default tuning.
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            ..Self::default()
        }
    }

    /// Configuration for an in-memory store (tests, scratch work).
    pub fn memory() -> Self {
        Self::new(":memory:")
    }

    /// Whether this configuration targets an in-memory database.
    pub fn is_memory(&self) -> bool {
        self.path.to_str() == Some(":memory:")
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from(":memory:"),
            wal_mode: true,
            foreign_keys: true,
            busy_timeout_ms: 5_000,
            cache_size: -8_000, // 8 MiB
            mmap_size: 0,
        }
    }
}
