//! Error types for the collaborator interfaces and configuration.

use thiserror::Error;

use crate::VectorId;

/// Errors returned by a [`VectorSource`](crate::VectorSource).
#[derive(Debug, Error)]
pub enum SourceError {
    /// The source has no vector for this id
    #[error("Vector not found: {0}")]
    NotFound(VectorId),

    /// The source failed for another reason
    #[error("Vector source error: {0}")]
    Backend(String),
}

/// Errors returned by a [`BlobStore`](crate::BlobStore) or a commit log.
#[derive(Debug, Error)]
pub enum StoreError {
    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Key is not usable as a blob name
    #[error("Invalid key: {0}")]
    InvalidKey(String),
}

impl From<serde_json::Error> for StoreError {
    fn from(err: serde_json::Error) -> Self {
        StoreError::Serialization(err.to_string())
    }
}

/// Invalid or unloadable configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Config sources could not be loaded or deserialized
    #[error("Configuration load error: {0}")]
    Load(String),

    /// A value is out of its allowed range
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = SourceError::NotFound(42);
        assert!(err.to_string().contains("42"));

        let err = StoreError::InvalidKey("../etc".to_string());
        assert!(err.to_string().contains("Invalid key"));

        let err = ConfigError::Invalid("segments must be > 0".to_string());
        assert!(err.to_string().contains("segments"));
    }
}
