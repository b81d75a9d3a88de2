//! Message store error types.

/// Errors produced by [`MessageStore`](crate::store::MessageStore) operations.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// Underlying `SQLite` failure.
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// File-system I/O failure (e.g. creating the database directory).
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    /// A payload could not be encoded for storage.
    #[error("payload is not valid json: {0}")]
    Json(#[from] serde_json::Error),

    /// Internal mutex was poisoned by a panicked thread.
    #[error("message store lock poisoned")]
    LockPoisoned,

    #[error("message store worker failed: {0}")]
    Join(#[from] tokio::task::JoinError),

    #[error("message '{0}' not found")]
    NotFound(String),
}

pub type Result<T> = std::result::Result<T, StoreError>;
