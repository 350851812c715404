//! Storage error types.

use thiserror::Error;

/// Storage location operation errors.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("file not found: {0}")]
    NotFound(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid path: {0}")]
    InvalidPath(String),

    #[error("invalid key: {0}")]
    InvalidKey(String),

    #[error("size mismatch for {checksum}: expected {expected} bytes, got {actual}")]
    SizeMismatch {
        checksum: String,
        expected: i64,
        actual: i64,
    },

    #[error("configuration error: {0}")]
    Config(String),

    #[error("unknown storage location: {0}")]
    UnknownLocation(String),
}

/// Result type for storage operations.
pub type StorageResult<T> = std::result::Result<T, StorageError>;
