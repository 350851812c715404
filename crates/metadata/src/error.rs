//! Metadata store error types.

use thiserror::Error;

/// Metadata store operation errors.
#[derive(Debug, Error)]
pub enum MetadataError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("already exists: {0}")]
    AlreadyExists(String),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Optimistic lock conflict: the row changed since it was read.
    #[error("stale write on {entity}: expected version {expected}, found {actual}")]
    StaleWrite {
        entity: String,
        expected: i64,
        actual: i64,
    },

    #[error("configuration error: {0}")]
    Config(String),

    #[error("constraint violation: {0}")]
    Constraint(String),

    #[error("corrupt row: {0}")]
    Corrupt(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl MetadataError {
    /// Whether the caller should re-read and retry its write.
    pub fn is_stale_write(&self) -> bool {
        matches!(self, Self::StaleWrite { .. })
    }
}

impl From<stowage_core::Error> for MetadataError {
    fn from(err: stowage_core::Error) -> Self {
        Self::Corrupt(err.to_string())
    }
}

impl From<serde_json::Error> for MetadataError {
    fn from(err: serde_json::Error) -> Self {
        Self::Corrupt(format!("invalid json column: {err}"))
    }
}

/// Result type for metadata operations.
pub type MetadataResult<T> = std::result::Result<T, MetadataError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stale_write_message() {
        let err = MetadataError::StaleWrite {
            entity: "request 7".to_string(),
            expected: 2,
            actual: 3,
        };
        assert!(err.is_stale_write());
        assert_eq!(
            err.to_string(),
            "stale write on request 7: expected version 2, found 3"
        );
    }

    #[test]
    fn test_core_error_maps_to_corrupt() {
        let err: MetadataError = stowage_core::Error::InvalidStatus("DONE".to_string()).into();
        assert!(matches!(err, MetadataError::Corrupt(_)));
        assert!(!err.is_stale_write());
    }
}
