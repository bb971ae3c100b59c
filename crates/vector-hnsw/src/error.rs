//! Graph error types.

use thiserror::Error;
use vector_pq::PqError;
use vector_types::{SourceError, StoreError, VectorId};

/// Errors that can occur during graph operations.
#[derive(Debug, Error)]
pub enum GraphError {
    /// No retrievable vector for a referenced id
    #[error("Vector not found: {0}")]
    NotFound(VectorId),

    /// Id already occupies an arena slot
    #[error("Node already exists: {0}")]
    AlreadyExists(VectorId),

    /// Invalid caps, segment counts or call sequence
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Vector length differs from the index dimensionality
    #[error("Dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },

    /// Persisted state failed structural validation
    #[error("Corrupt state: {0}")]
    CorruptState(String),

    /// Operation aborted by the caller
    #[error("Operation cancelled")]
    Cancelled,

    /// Blob store or commit log failure
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    /// Vector source failure other than a missing id
    #[error("Vector source error: {0}")]
    Source(String),
}

impl From<SourceError> for GraphError {
    fn from(err: SourceError) -> Self {
        match err {
            SourceError::NotFound(id) => GraphError::NotFound(id),
            SourceError::Backend(msg) => GraphError::Source(msg),
        }
    }
}

impl From<PqError> for GraphError {
    fn from(err: PqError) -> Self {
        match err {
            PqError::Configuration(msg) => GraphError::Configuration(msg),
            PqError::DimensionMismatch { expected, actual } => {
                GraphError::DimensionMismatch { expected, actual }
            }
            PqError::CorruptState(msg) => GraphError::CorruptState(msg),
            PqError::Cancelled => GraphError::Cancelled,
        }
    }
}
