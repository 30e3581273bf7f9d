//! Database error types.

use thiserror::Error;

/// Error type for all session-store persistence operations.
#[derive(Error, Debug)]
pub enum DatabaseError {
    /// SQLite error.
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// Connection pool error.
    #[error("connection error: {0}")]
    Connection(String),

    /// Migration error.
    #[error("migration error: {0}")]
    Migration(String),

    /// Record not found.
    #[error("not found: {0}")]
    NotFound(String),

    /// Attempted to claim an identifier already owned by another active record.
    #[error("conflict: {0}")]
    Conflict(String),

    /// JSON serialization error (config values are stored as JSON text).
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    /// IO error (e.g. creating the database directory).
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias using [`DatabaseError`].
pub type DatabaseResult<T> = Result<T, DatabaseError>;

pub(crate) fn from_r2d2(e: r2d2::Error) -> DatabaseError {
    DatabaseError::Connection(e.to_string())
}

pub(crate) fn from_tokio_rusqlite(e: tokio_rusqlite::Error) -> DatabaseError {
    match e {
        tokio_rusqlite::Error::Rusqlite(e) => DatabaseError::Sqlite(e),
        tokio_rusqlite::Error::Close(_) => {
            DatabaseError::Connection("connection closed".to_string())
        }
        other => DatabaseError::Connection(other.to_string()),
    }
}
