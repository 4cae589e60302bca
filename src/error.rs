// src/error.rs
// Standardized error types for hivemind

use thiserror::Error;

/// Main error type for the hivemind library
#[derive(Error, Debug)]
pub enum HivemindError {
    #[error("not initialized: call initialize() first")]
    NotInitialized,

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("database error: {0}")]
    Db(#[from] rusqlite::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("external provider unavailable: {0}")]
    External(String),

    #[error("task cancelled")]
    Cancelled,

    #[error("configuration error: {0}")]
    Config(String),

    #[error("unknown error: {0}")]
    Other(String),

    #[error(transparent)]
    Anyhow(#[from] anyhow::Error),
}

/// Convenience type alias for Result using HivemindError
pub type Result<T> = std::result::Result<T, HivemindError>;

impl HivemindError {
    /// Whether the error is a transient storage condition callers may retry.
    ///
    /// SQLITE_BUSY occurs with file-based databases under write contention;
    /// SQLITE_LOCKED with shared-cache in-memory databases. Everything else
    /// on the Db variant (schema mismatch, corruption) is fatal.
    pub fn is_transient(&self) -> bool {
        match self {
            HivemindError::Db(e) => is_sqlite_contention(e),
            HivemindError::Io(_) => true,
            _ => false,
        }
    }
}

/// Check if a rusqlite error is SQLITE_BUSY or SQLITE_LOCKED.
pub(crate) fn is_sqlite_contention(err: &rusqlite::Error) -> bool {
    use rusqlite::ffi;
    matches!(
        err,
        rusqlite::Error::SqliteFailure(
            ffi::Error {
                code: ffi::ErrorCode::DatabaseBusy | ffi::ErrorCode::DatabaseLocked,
                ..
            },
            _,
        )
    )
}

impl From<String> for HivemindError {
    fn from(s: String) -> Self {
        HivemindError::Other(s)
    }
}

impl From<tokio::task::JoinError> for HivemindError {
    fn from(err: tokio::task::JoinError) -> Self {
        if err.is_cancelled() {
            HivemindError::Cancelled
        } else {
            HivemindError::Other(err.to_string())
        }
    }
}
