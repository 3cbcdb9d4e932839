use murmur_core::StoreError;
use thiserror::Error;

/// Errors produced by the SQLite layer.
#[derive(Error, Debug)]
pub enum SqliteError {
    /// SQLite error.
    #[error("Database error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// Migration failure.
    #[error("Migration error: {0}")]
    Migration(String),

    /// A query expected exactly one row but found none.
    #[error("Record not found: {0}")]
    NotFound(String),

    /// A previous holder of the connection panicked.
    #[error("Database connection lock poisoned")]
    Poisoned,
}

impl From<SqliteError> for StoreError {
    fn from(err: SqliteError) -> Self {
        match err {
            SqliteError::NotFound(what) => StoreError::Missing(what),
            other => StoreError::Backend(Box::new(other)),
        }
    }
}

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, SqliteError>;
