//! Error types for shard wiring.

use thiserror::Error;
use vector_cycle::CycleError;
use vector_hnsw::GraphError;

#[derive(Debug, Error)]
pub enum ShardError {
    /// Registering or controlling a maintenance callback failed
    #[error("Cycle error: {0}")]
    Cycle(#[from] CycleError),

    /// Graph operation failed
    #[error("Graph error: {0}")]
    Graph(#[from] GraphError),

    /// Invalid shard or store parameters
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// A blocking maintenance task panicked or was cancelled by the runtime
    #[error("Background task failed: {0}")]
    Task(String),
}

impl From<tokio::task::JoinError> for ShardError {
    fn from(err: tokio::task::JoinError) -> Self {
        ShardError::Task(err.to_string())
    }
}
