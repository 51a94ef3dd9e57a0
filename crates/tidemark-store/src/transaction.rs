//! Scoped transactions with rollback-on-drop
//!
//! Manual BEGIN/COMMIT with a ROLLBACK remembered at every error path is
//! the bug class this module removes: a [`TransactionScope`] that is not
//! explicitly committed rolls back in its destructor, on every exit path
//! including unwinding.

use crate::connection::AccessGuard;
use crate::error::{StoreError, StoreResult};
use tracing::{debug, error};

/// How a top-level transaction takes its locks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxMode {
    /// Lazy locking for read-mostly work (`BEGIN DEFERRED`)
    Deferred,
    /// Take the write lock up front (`BEGIN IMMEDIATE`); contention is
    /// discovered at begin time instead of mid-transaction
    Immediate,
}

impl TxMode {
    fn begin_stmt(self) -> &'static str {
        match self {
            TxMode::Deferred => "BEGIN DEFERRED;",
            TxMode::Immediate => "BEGIN IMMEDIATE;",
        }
    }
}

/// A transaction demarcation on an already-held [`AccessGuard`].
///
/// Created by [`begin`](TransactionScope::begin); issues `ROLLBACK` from
/// its destructor unless [`commit`](TransactionScope::commit) or
/// [`rollback`](TransactionScope::rollback) consumed it first. A scope
/// begun while another is open on the same guard becomes a `SAVEPOINT`
/// with the same commit/rollback-on-drop behavior, since SQLite has no
/// nested top-level transactions on one connection.
///
/// Scopes on the same guard must be finished innermost-first; dropping an
/// outer scope while an inner one is alive rolls back the whole
/// transaction under the inner scope.
pub struct TransactionScope<'g, 'c> {
    guard: &'g AccessGuard<'c>,
    /// `None` for the top-level transaction, savepoint name when nested.
    savepoint: Option<String>,
    finished: bool,
}

impl<'g, 'c> TransactionScope<'g, 'c> {
    /// Begin a transaction (or a savepoint, when one is already open).
    ///
    /// `mode` only applies to the top-level begin; a savepoint inherits
    /// the locking of its enclosing transaction.
    pub fn begin(guard: &'g AccessGuard<'c>, mode: TxMode) -> StoreResult<Self> {
        let depth = guard.tx_depth();
        let savepoint = if depth == 0 {
            guard.execute_batch(mode.begin_stmt())?;
            None
        } else {
            let name = format!("sp_{depth}");
            guard.execute_batch(&format!("SAVEPOINT {name};"))?;
            Some(name)
        };
        guard.set_tx_depth(depth + 1);
        Ok(Self {
            guard,
            savepoint,
            finished: false,
        })
    }

    /// Commit the scope's work. Consumes the scope.
    ///
    /// A failed COMMIT leaves the scope unfinished, so the destructor
    /// still rolls back; the error (often transient-busy under WAL)
    /// propagates to the caller.
    pub fn commit(mut self) -> StoreResult<()> {
        match &self.savepoint {
            None => self.guard.execute_batch("COMMIT;")?,
            Some(name) => self.guard.execute_batch(&format!("RELEASE {name};"))?,
        }
        self.finish();
        Ok(())
    }

    /// Roll back explicitly.
    ///
    /// A rollback failure means the store's state can no longer be
    /// verified: the store is marked tainted (all later acquires fail)
    /// and [`StoreError::RollbackFailed`] is returned.
    pub fn rollback(mut self) -> StoreResult<()> {
        self.rollback_inner().map_err(|e| {
            self.guard.mark_tainted();
            StoreError::RollbackFailed(e)
        })
    }

    fn rollback_inner(&mut self) -> Result<(), rusqlite::Error> {
        let result = match &self.savepoint {
            None => self.guard.execute_batch("ROLLBACK;"),
            Some(name) => self
                .guard
                .execute_batch(&format!("ROLLBACK TO {name}; RELEASE {name};")),
        };
        self.finish();
        result
    }

    fn finish(&mut self) {
        self.finished = true;
        self.guard.set_tx_depth(self.guard.tx_depth().saturating_sub(1));
    }
}

impl Drop for TransactionScope<'_, '_> {
    fn drop(&mut self) {
        if self.finished {
            return;
        }
        if let Err(e) = self.rollback_inner() {
            self.guard.mark_tainted();
            error!(
                error = %e,
                "Implicit rollback failed; store state can no longer be trusted"
            );
        }
    }
}

/// Run `op` inside a transaction on an already-held guard.
///
/// This is the handle-accepting variant of
/// [`SharedStore::with_transaction`](crate::SharedStore::with_transaction):
/// call it from helpers that run under a guard their caller holds. Inside
/// an open transaction it nests as a savepoint, so a failing nested helper
/// rolls back only its own work.
pub fn transaction_with_conn<T, F>(conn: &AccessGuard<'_>, mode: TxMode, op: F) -> StoreResult<T>
where
    F: FnOnce(&AccessGuard<'_>) -> StoreResult<T>,
{
    let scope = TransactionScope::begin(conn, mode)?;
    match op(conn) {
        Ok(value) => {
            scope.commit()?;
            Ok(value)
        }
        Err(err) => {
            debug!(error = %err, "Rolling back transaction after operation failure");
            scope.rollback()?;
            Err(err)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StoreConfig;
    use crate::connection::SharedStore;
    use std::panic::AssertUnwindSafe;
    use tempfile::TempDir;

    fn store_with_table() -> SharedStore {
        let store = SharedStore::memory().unwrap();
        store
            .with_connection(|conn| {
                conn.execute_batch("CREATE TABLE moods (id INTEGER PRIMARY KEY, score INTEGER);")?;
                Ok(())
            })
            .unwrap();
        store
    }

    fn mood_count(store: &SharedStore) -> i64 {
        store
            .with_connection(|conn| {
                Ok(conn.query_row("SELECT COUNT(*) FROM moods", [], |row| row.get(0))?)
            })
            .unwrap()
    }

    #[test]
    fn committed_work_is_visible() {
        let store = store_with_table();

        store
            .with_transaction(TxMode::Immediate, |conn| {
                conn.execute("INSERT INTO moods (score) VALUES (?1)", [4])?;
                conn.execute("INSERT INTO moods (score) VALUES (?1)", [7])?;
                Ok(())
            })
            .unwrap();

        assert_eq!(mood_count(&store), 2);
    }

    #[test]
    fn dropped_scope_rolls_back() {
        let store = store_with_table();

        let guard = store.acquire().unwrap();
        let scope = TransactionScope::begin(&guard, TxMode::Immediate).unwrap();
        guard
            .execute("INSERT INTO moods (score) VALUES (?1)", [3])
            .unwrap();
        drop(scope);

        let count: i64 = guard
            .query_row("SELECT COUNT(*) FROM moods", [], |row| row.get(0))
            .unwrap();
        assert_eq!(count, 0);
    }

    #[test]
    fn operation_error_rolls_back_and_propagates() {
        let store = store_with_table();

        let result: StoreResult<()> = store.with_transaction(TxMode::Immediate, |conn| {
            conn.execute("INSERT INTO moods (score) VALUES (?1)", [1])?;
            conn.execute("INSERT INTO moods (score) VALUES (?1)", [2])?;
            Err(StoreError::Connection("simulated domain failure".into()))
        });

        assert!(matches!(result, Err(StoreError::Connection(_))));
        assert_eq!(mood_count(&store), 0);
    }

    #[test]
    fn explicit_rollback_discards_work() {
        let store = store_with_table();

        let guard = store.acquire().unwrap();
        let scope = TransactionScope::begin(&guard, TxMode::Deferred).unwrap();
        guard
            .execute("INSERT INTO moods (score) VALUES (?1)", [9])
            .unwrap();
        scope.rollback().unwrap();

        let count: i64 = guard
            .query_row("SELECT COUNT(*) FROM moods", [], |row| row.get(0))
            .unwrap();
        assert_eq!(count, 0);
    }

    #[test]
    fn failed_nested_helper_rolls_back_only_its_savepoint() {
        let store = store_with_table();

        store
            .with_transaction(TxMode::Immediate, |conn| {
                conn.execute("INSERT INTO moods (score) VALUES (?1)", [5])?;

                let nested: StoreResult<()> = transaction_with_conn(conn, TxMode::Immediate, |conn| {
                    conn.execute("INSERT INTO moods (score) VALUES (?1)", [8])?;
                    Err(StoreError::Connection("nested failure".into()))
                });
                assert!(nested.is_err());

                Ok(())
            })
            .unwrap();

        // The outer insert committed, the nested one rolled back.
        let scores: Vec<i64> = store
            .with_connection(|conn| {
                let mut stmt = conn.prepare("SELECT score FROM moods ORDER BY score")?;
                let rows = stmt.query_map([], |row| row.get(0))?;
                Ok(rows.filter_map(Result::ok).collect())
            })
            .unwrap();
        assert_eq!(scores, vec![5]);
    }

    #[test]
    fn nested_commit_is_folded_into_the_outer_transaction() {
        let store = store_with_table();

        let result: StoreResult<()> = store.with_transaction(TxMode::Immediate, |conn| {
            transaction_with_conn(conn, TxMode::Immediate, |conn| {
                conn.execute("INSERT INTO moods (score) VALUES (?1)", [6])?;
                Ok(())
            })?;
            // Outer failure discards the released savepoint's work too.
            Err(StoreError::Connection("outer failure".into()))
        });

        assert!(result.is_err());
        assert_eq!(mood_count(&store), 0);
    }

    #[test]
    fn panic_inside_transaction_rolls_back() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("panic.db");

        let store = SharedStore::open(StoreConfig::new(&path)).unwrap();
        store
            .with_connection(|conn| {
                conn.execute_batch("CREATE TABLE moods (id INTEGER PRIMARY KEY, score INTEGER);")?;
                Ok(())
            })
            .unwrap();

        let result = std::panic::catch_unwind(AssertUnwindSafe(|| {
            let _: StoreResult<()> = store.with_transaction(TxMode::Immediate, |conn| {
                conn.execute("INSERT INTO moods (score) VALUES (?1)", [2])?;
                panic!("simulated crash mid-transaction");
            });
        }));
        assert!(result.is_err());

        // The panicking holder poisoned the lock; this process must restart.
        assert!(store.acquire().is_err());

        // A fresh process (modeled by reopening the file) sees none of the
        // uncommitted work.
        drop(store);
        let reopened = SharedStore::open(StoreConfig::new(&path)).unwrap();
        let count: i64 = reopened
            .with_connection(|conn| {
                Ok(conn.query_row("SELECT COUNT(*) FROM moods", [], |row| row.get(0))?)
            })
            .unwrap();
        assert_eq!(count, 0);
    }
}
