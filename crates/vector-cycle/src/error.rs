//! Error types for the cycle crate.

use thiserror::Error;

/// Errors raised while registering, controlling or running cycle callbacks.
#[derive(Debug, Error)]
pub enum CycleError {
    /// A callback with this id is already registered in the group
    #[error("Duplicate cycle callback id: {0}")]
    DuplicateId(String),

    /// No callback with this id
    #[error("Cycle callback not found: {0}")]
    NotFound(String),

    /// The callback was unregistered and can no longer be controlled
    #[error("Cycle callback unregistered: {0}")]
    Unregistered(String),

    /// An in-flight run did not finish in time
    #[error("Timed out after {timeout_ms}ms waiting for {id}")]
    Timeout { id: String, timeout_ms: u64 },

    /// Invalid group or ticker parameters
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Manager already started
    #[error("Cycle manager is already running")]
    AlreadyRunning,

    /// Manager not started
    #[error("Cycle manager is not running")]
    NotRunning,

    /// Several child controls failed at once
    #[error("{} cycle controls failed: {}", .0.len(), join(.0))]
    Combined(Vec<CycleError>),
}

fn join(errors: &[CycleError]) -> String {
    errors
        .iter()
        .map(|e| e.to_string())
        .collect::<Vec<_>>()
        .join("; ")
}

impl CycleError {
    pub(crate) fn timeout(id: &str, timeout: std::time::Duration) -> Self {
        CycleError::Timeout {
            id: id.to_string(),
            timeout_ms: timeout.as_millis() as u64,
        }
    }
}
