//! Error types for the core domain.

use thiserror::Error;

/// Core domain error type.
#[derive(Debug, Error)]
pub enum Error {
    #[error("invalid request kind: {0}")]
    InvalidKind(String),

    #[error("invalid request status: {0}")]
    InvalidStatus(String),

    #[error("invalid storage type: {0}")]
    InvalidStorageType(String),

    #[error("invalid checksum: {0}")]
    InvalidChecksum(String),

    #[error("invalid batch: {0}")]
    InvalidBatch(String),
}

/// Result type alias for core operations.
pub type Result<T> = std::result::Result<T, Error>;
