//! Error types for the store access core

use thiserror::Error;

/// Store access error type
///
/// Every variant keeps its underlying cause so callers can decide
/// retry/report/restart without re-parsing messages.
#[derive(Error, Debug)]
pub enum StoreError {
    /// Opening the database file or its parent directory failed
    #[error("Connection error: {0}")]
    Connection(String),

    /// The connection lock was poisoned by a holder that panicked, or a
    /// failed rollback left the connection in an unverified state.
    ///
    /// The application is in an inconsistent state and should be restarted.
    #[error("Store lock poisoned, restart required: {0}")]
    LockPoisoned(String),

    /// SQLite reported contention (SQLITE_BUSY / SQLITE_LOCKED) that
    /// outlasted the connection's busy timeout. Retryable.
    #[error("Store busy: {0}")]
    Busy(#[source] rusqlite::Error),

    /// A ROLLBACK itself failed. The store may be in an indeterminate
    /// state; surface this as a restart-required condition.
    #[error("Rollback failed, store state unverified: {0}")]
    RollbackFailed(#[source] rusqlite::Error),

    /// A retried operation stayed busy through every allowed attempt.
    #[error("Store still busy after {attempts} attempts")]
    RetriesExhausted {
        /// How many times the operation was attempted
        attempts: u32,
        /// The transient error observed on the final attempt
        #[source]
        source: Box<StoreError>,
    },

    /// The underlying operation failed for a domain reason (constraint
    /// violation, type mismatch, ...). Propagated to the caller unchanged.
    #[error("SQLite error: {0}")]
    Sqlite(#[source] rusqlite::Error),
}

/// Result type for store operations
pub type StoreResult<T> = Result<T, StoreError>;

impl StoreError {
    /// Whether this error is contention that may clear if the caller
    /// backs off and retries.
    pub fn is_transient_busy(&self) -> bool {
        matches!(self, StoreError::Busy(_))
    }

    /// Whether this error means the process should stop trusting the
    /// connection and restart.
    pub fn requires_restart(&self) -> bool {
        matches!(
            self,
            StoreError::LockPoisoned(_) | StoreError::RollbackFailed(_)
        )
    }
}

impl From<rusqlite::Error> for StoreError {
    fn from(err: rusqlite::Error) -> Self {
        if is_busy(&err) {
            StoreError::Busy(err)
        } else {
            StoreError::Sqlite(err)
        }
    }
}

/// SQLITE_BUSY and SQLITE_LOCKED are the two contention codes SQLite
/// surfaces once the busy timeout runs out.
fn is_busy(err: &rusqlite::Error) -> bool {
    matches!(
        err,
        rusqlite::Error::SqliteFailure(e, _) if matches!(
            e.code,
            rusqlite::ErrorCode::DatabaseBusy | rusqlite::ErrorCode::DatabaseLocked
        )
    )
}
