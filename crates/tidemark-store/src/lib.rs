//! Single-writer SQLite access core for Tidemark
//!
//! Every Tidemark command (mood check-ins, activity logs, assessments)
//! funnels into one embedded SQLite file. This crate is the only layer
//! allowed to touch that file. It owns the single connection, serializes
//! access behind a guard, scopes transactions so rollback cannot be
//! forgotten, and retries transient contention with bounded backoff.
//!
//! ## Features
//!
//! - **SharedStore**: one long-lived owner of the only connection; scoped
//!   [`AccessGuard`] access, never a raw connection
//! - **TransactionScope**: BEGIN/COMMIT with rollback-on-drop, savepoint
//!   nesting for helpers that run inside an open transaction
//! - **Retry**: one [`RetryPolicy`]-driven executor for contention that
//!   outlasts SQLite's own busy timeout
//! - **WAL Mode**: readers and the single writer avoid blocking each other
//!
//! ## Usage
//!
//! ```rust,ignore
//! use tidemark_store::{SharedStore, StoreConfig, TxMode};
//!
//! let store = SharedStore::open(StoreConfig::new("./tidemark.db"))?;
//!
//! store.with_transaction(TxMode::Immediate, |conn| {
//!     conn.execute("INSERT INTO moods (score) VALUES (?1)", [4])?;
//!     Ok(())
//! })?;
//! ```
//!
//! ## Locking discipline: the `_with_conn` rule
//!
//! The connection lock is not reentrant. A function that calls
//! [`SharedStore::acquire`] (directly or through `with_connection` /
//! `with_transaction` / `run`) while its caller already holds an
//! [`AccessGuard`] blocks that thread forever on a lock it itself holds.
//!
//! Any helper reachable while a guard is held is therefore written in two
//! forms:
//!
//! 1. a public entry point that acquires the guard, and
//! 2. an internal variant, suffixed `_with_conn`, that takes
//!    `&AccessGuard<'_>` and performs no acquisition of its own.
//!
//! The guard parameter doubles as a compile-time witness: a `_with_conn`
//! function cannot be called without the lock already held. The suffix
//! keeps violations greppable in review. `_with_conn` functions
//! must never call `acquire`, and nothing may stash a connection
//! reference outside a guard's lifetime. [`transaction_with_conn`] is the
//! in-crate model of the convention.
//!
//! While a guard is held, do only store work: any network call, heavy
//! computation, or sleep inside the guard's scope serializes every other
//! caller behind it.

pub mod config;
pub mod connection;
pub mod error;
mod pragma;
pub mod retry;
pub mod transaction;

// Re-exports
pub use config::StoreConfig;
pub use connection::{AccessGuard, DbStats, SharedStore};
pub use error::{StoreError, StoreResult};
pub use retry::{run_with_retry, run_with_retry_async, RetryPolicy};
pub use transaction::{transaction_with_conn, TransactionScope, TxMode};
