//! # murmur-store
//!
//! SQLite persistence for murmur, backed by `rusqlite`.
//!
//! [`Database`] is a synchronous handle over one `rusqlite::Connection` with
//! typed helpers per table. [`SqliteStore`] puts it behind a mutex and
//! implements the core's async [`murmur_core::Store`] trait by running each
//! operation on the blocking thread pool.

pub mod calls;
pub mod database;
pub mod messages;
pub mod migrations;
pub mod sqlite;
pub mod users;

mod error;

pub use database::Database;
pub use error::SqliteError;
pub use sqlite::SqliteStore;
