//! Shared SQLite connection ownership
//!
//! One process, one connection, one writer. [`SharedStore`] owns the only
//! `rusqlite::Connection` for the store file behind a mutex; every access
//! goes through a scoped [`AccessGuard`]. There is deliberately no pool:
//! SQLite supports a single writer at a time, so multiplexing write
//! connections buys nothing and invites SQLITE_BUSY.

use crate::config::StoreConfig;
use crate::error::{StoreError, StoreResult};
use crate::pragma;
use crate::retry::{self, RetryPolicy};
use crate::transaction::{transaction_with_conn, TxMode};
use rusqlite::Connection;
use std::cell::Cell;
use std::ops::Deref;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{debug, info};

struct StoreInner {
    conn: Mutex<Connection>,
    /// Kept for diagnostics only; the file is never reopened.
    path: PathBuf,
    /// Set when a rollback failed and the connection state can no longer
    /// be trusted. Checked on every acquire.
    tainted: AtomicBool,
}

/// Thread-safe owner of the single store connection.
///
/// Cloning is cheap and shares the same underlying connection; hand clones
/// to every component that needs store access. `acquire` (or the closure
/// entry points built on it) is the only path to the connection.
#[derive(Clone)]
pub struct SharedStore {
    inner: Arc<StoreInner>,
}

impl SharedStore {
    /// Open the store file and apply session pragmas.
    ///
    /// Creates parent directories as needed. Fails if any pragma cannot be
    /// applied: a store without foreign-key enforcement or sane contention
    /// behavior must not be used.
    pub fn open(config: StoreConfig) -> StoreResult<Self> {
        info!(path = ?config.path, "Opening shared store");

        let conn = if config.is_memory() {
            Connection::open_in_memory()?
        } else {
            if let Some(parent) = config.path.parent() {
                std::fs::create_dir_all(parent).map_err(|e| {
                    StoreError::Connection(format!("Failed to create directory: {e}"))
                })?;
            }
            Connection::open(&config.path)?
        };

        pragma::apply(&conn, &config)?;
        debug!("Shared store initialized");

        Ok(Self {
            inner: Arc::new(StoreInner {
                conn: Mutex::new(conn),
                path: config.path,
                tainted: AtomicBool::new(false),
            }),
        })
    }

    /// Open an in-memory store (tests, scratch work).
    pub fn memory() -> StoreResult<Self> {
        Self::open(StoreConfig::memory())
    }

    /// Path of the store file, for diagnostics.
    pub fn path(&self) -> &Path {
        &self.inner.path
    }

    /// Block until exclusive access to the connection is available.
    ///
    /// Fails with [`StoreError::LockPoisoned`] if a previous holder
    /// panicked while holding the lock, or if a failed rollback left the
    /// connection in an unverified state. In either case the connection's
    /// transactional state cannot be trusted and the process should
    /// restart rather than continue.
    ///
    /// Never call this while already holding an [`AccessGuard`] on the
    /// same call stack: the lock is not reentrant and the thread would
    /// block on itself forever. Helpers reachable under a held guard must
    /// take `&AccessGuard` instead (see the crate docs).
    pub fn acquire(&self) -> StoreResult<AccessGuard<'_>> {
        if self.inner.tainted.load(Ordering::Acquire) {
            return Err(StoreError::LockPoisoned(format!(
                "a failed rollback left {} in an unverified state",
                self.inner.path.display()
            )));
        }

        let inner = &*self.inner;
        let conn = inner.conn.lock().map_err(|_| {
            StoreError::LockPoisoned(format!(
                "a previous writer panicked while holding {}",
                inner.path.display()
            ))
        })?;

        Ok(AccessGuard {
            conn,
            inner,
            tx_depth: Cell::new(0),
        })
    }

    /// Acquire the connection, run `op`, release.
    ///
    /// The closure should contain store operations only; long-running work
    /// done while the guard is held serializes every other caller behind it.
    pub fn with_connection<T, F>(&self, op: F) -> StoreResult<T>
    where
        F: FnOnce(&AccessGuard<'_>) -> StoreResult<T>,
    {
        let guard = self.acquire()?;
        op(&guard)
    }

    /// Acquire the connection and run `op` inside a transaction.
    ///
    /// Commits when `op` returns `Ok`, rolls back otherwise (including on
    /// panic, via the scope's destructor). Use [`TxMode::Immediate`] when
    /// the closure writes, so the write lock is taken up front instead of
    /// being discovered contended mid-transaction.
    pub fn with_transaction<T, F>(&self, mode: TxMode, op: F) -> StoreResult<T>
    where
        F: FnOnce(&AccessGuard<'_>) -> StoreResult<T>,
    {
        let guard = self.acquire()?;
        transaction_with_conn(&guard, mode, op)
    }

    /// Run `op` on the blocking thread pool.
    ///
    /// Async-facing wrapper over [`with_connection`](Self::with_connection)
    /// so command handlers never block the runtime on the store lock.
    pub async fn run<T, F>(&self, op: F) -> StoreResult<T>
    where
        F: FnOnce(&AccessGuard<'_>) -> StoreResult<T> + Send + 'static,
        T: Send + 'static,
    {
        let store = self.clone();
        match tokio::task::spawn_blocking(move || store.with_connection(op)).await {
            Ok(result) => result,
            // A join error means the closure panicked while holding the
            // guard; the mutex is now poisoned.
            Err(join_err) => Err(StoreError::LockPoisoned(format!(
                "store task panicked: {join_err}"
            ))),
        }
    }

    /// Run `op` inside a transaction on the blocking thread pool.
    pub async fn run_transaction<T, F>(&self, mode: TxMode, op: F) -> StoreResult<T>
    where
        F: FnOnce(&AccessGuard<'_>) -> StoreResult<T> + Send + 'static,
        T: Send + 'static,
    {
        let store = self.clone();
        match tokio::task::spawn_blocking(move || store.with_transaction(mode, op)).await {
            Ok(result) => result,
            Err(join_err) => Err(StoreError::LockPoisoned(format!(
                "store task panicked: {join_err}"
            ))),
        }
    }

    /// Like [`run`](Self::run) but with bounded backoff on contention.
    ///
    /// The closure must be `Clone` so it can be re-run on retry. Only
    /// transient-busy errors are retried; everything else propagates on
    /// the first attempt.
    pub async fn run_with_retry<T, F>(&self, policy: &RetryPolicy, op: F) -> StoreResult<T>
    where
        F: FnOnce(&AccessGuard<'_>) -> StoreResult<T> + Clone + Send + 'static,
        T: Send + 'static,
    {
        retry::run_with_retry_async(policy, || self.run(op.clone())).await
    }

    /// Checkpoint and truncate the WAL. Call at orderly shutdown.
    pub fn checkpoint(&self) -> StoreResult<()> {
        self.with_connection(|conn| {
            conn.execute_batch("PRAGMA wal_checkpoint(TRUNCATE);")?;
            Ok(())
        })?;
        debug!("WAL checkpoint complete");
        Ok(())
    }

    /// Get database statistics
    pub fn stats(&self) -> StoreResult<DbStats> {
        self.with_connection(|conn| {
            let page_count: i64 = conn.query_row("PRAGMA page_count;", [], |row| row.get(0))?;
            let page_size: i64 = conn.query_row("PRAGMA page_size;", [], |row| row.get(0))?;
            let freelist_count: i64 =
                conn.query_row("PRAGMA freelist_count;", [], |row| row.get(0))?;

            Ok(DbStats {
                page_count: page_count as u64,
                page_size: page_size as u64,
                freelist_count: freelist_count as u64,
                total_size_bytes: (page_count * page_size) as u64,
            })
        })
    }
}

impl std::fmt::Debug for SharedStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SharedStore")
            .field("path", &self.inner.path)
            .field("tainted", &self.inner.tainted.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

/// Scoped proof of exclusive access to the store connection.
///
/// Derefs to [`rusqlite::Connection`]; the lock is released when the guard
/// drops, on every exit path. Helper functions that run while a guard is
/// held take `&AccessGuard` as a parameter (never a `SharedStore`) so they
/// cannot re-acquire a lock their caller already holds.
pub struct AccessGuard<'a> {
    conn: MutexGuard<'a, Connection>,
    inner: &'a StoreInner,
    /// Open transaction-scope depth on this guard; 0 means autocommit.
    tx_depth: Cell<u32>,
}

impl AccessGuard<'_> {
    pub(crate) fn tx_depth(&self) -> u32 {
        self.tx_depth.get()
    }

    pub(crate) fn set_tx_depth(&self, depth: u32) {
        self.tx_depth.set(depth);
    }

    /// Flag the store as untrustworthy after a failed rollback. Every
    /// subsequent acquire fails until the process restarts.
    pub(crate) fn mark_tainted(&self) {
        self.inner.tainted.store(true, Ordering::Release);
    }
}

impl Deref for AccessGuard<'_> {
    type Target = Connection;

    fn deref(&self) -> &Connection {
        &self.conn
    }
}

impl std::fmt::Debug for AccessGuard<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AccessGuard")
            .field("tx_depth", &self.tx_depth.get())
            .finish_non_exhaustive()
    }
}

/// Database statistics
#[derive(Debug, Clone)]
pub struct DbStats {
    pub page_count: u64,
    pub page_size: u64,
    pub freelist_count: u64,
    pub total_size_bytes: u64,
}
