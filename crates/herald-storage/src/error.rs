//! Storage error taxonomy
//!
//! Adapters map their native failures onto these variants so the
//! resilience layer can classify retryability uniformly.

use herald_common::ErrorKind;

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("entry not found: {0}")]
    NotFound(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("storage unavailable: {0}")]
    Unavailable(String),

    #[error("storage operation timed out: {0}")]
    Timeout(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("invalid operation: {0}")]
    Invalid(String),

    #[error("operation cancelled")]
    Cancelled,
}

impl StorageError {
    /// Whether the resilience policy may retry this failure.
    pub fn is_transient(&self) -> bool {
        matches!(self, StorageError::Unavailable(_) | StorageError::Timeout(_))
    }

    /// Map onto the shared processing-failure taxonomy.
    pub fn kind(&self) -> ErrorKind {
        match self {
            StorageError::NotFound(_) | StorageError::Invalid(_) => ErrorKind::Permanent,
            StorageError::Conflict(_) => ErrorKind::Concurrency,
            StorageError::Unavailable(_) => ErrorKind::Transient,
            StorageError::Timeout(_) => ErrorKind::Timeout,
            StorageError::Serialization(_) => ErrorKind::Permanent,
            StorageError::Cancelled => ErrorKind::Cancelled,
        }
    }
}

pub type StorageResult<T> = std::result::Result<T, StorageError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_variants() {
        assert!(StorageError::Unavailable("down".into()).is_transient());
        assert!(StorageError::Timeout("slow".into()).is_transient());
        assert!(!StorageError::Conflict("version".into()).is_transient());
        assert!(!StorageError::NotFound("x".into()).is_transient());
    }
}
