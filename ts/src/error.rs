//! Store error types

use thiserror::Error;

/// Errors that can occur against a stage's tile state store
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Unknown tile status value: {0}")]
    UnknownStatus(i64),

    #[error("Invalid timestamp in store: {0}")]
    InvalidTimestamp(String),

    #[error("Batch size must be greater than zero")]
    InvalidBatchSize,
}
