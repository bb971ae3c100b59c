//! Product quantization error types.

use thiserror::Error;

/// Errors that can occur while training, encoding or loading codebooks.
#[derive(Debug, Error)]
pub enum PqError {
    /// Segment or centroid counts do not fit the data
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Vector length differs from the trained dimensionality
    #[error("Dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },

    /// Persisted codebook blob failed validation
    #[error("Corrupt codebook: {0}")]
    CorruptState(String),

    /// Training aborted by the caller
    #[error("Training cancelled")]
    Cancelled,
}
