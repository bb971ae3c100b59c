//! Run status for the callbacks of one group.
//!
//! Every group keeps a `CycleRegistry` keyed by callback id. It is updated
//! by the group as callbacks start and finish, and read by operators and
//! tests.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

/// Outcome of one callback invocation.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RunOutcome {
    /// The callback reported that it did work
    Worked,
    /// The callback ran but had nothing to do
    Idle,
    /// The callback panicked
    Panicked,
    /// The previous run was still in flight
    Skipped,
}

/// Status of a registered callback.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CallbackStatus {
    pub callback_id: String,
    /// When the callback last started (if ever)
    pub last_run: Option<DateTime<Utc>>,
    pub last_duration_ms: Option<u64>,
    pub last_outcome: Option<RunOutcome>,
    /// Completed runs, panics included
    pub run_count: u64,
    /// Runs that panicked
    pub error_count: u64,
    /// Cycles skipped because the previous run was still going
    pub skip_count: u64,
    pub is_running: bool,
    pub is_active: bool,
}

impl CallbackStatus {
    /// Fresh status for a callback that has not run yet.
    pub fn new(callback_id: String, is_active: bool) -> Self {
        Self {
            callback_id,
            last_run: None,
            last_duration_ms: None,
            last_outcome: None,
            run_count: 0,
            error_count: 0,
            skip_count: 0,
            is_running: false,
            is_active,
        }
    }
}

/// Thread-safe map of callback id to [`CallbackStatus`].
///
/// # Example
///
/// ```
/// use vector_cycle::{CycleRegistry, RunOutcome};
///
/// let registry = CycleRegistry::new();
/// registry.register("flush", true);
/// registry.record_start("flush");
/// registry.record_complete("flush", RunOutcome::Worked, 12);
///
/// let status = registry.get_status("flush").unwrap();
/// assert_eq!(status.run_count, 1);
/// assert!(!status.is_running);
/// ```
#[derive(Debug, Default)]
pub struct CycleRegistry {
    callbacks: RwLock<HashMap<String, CallbackStatus>>,
}

impl CycleRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a callback. Returns `false` if the id is taken.
    pub fn register(&self, callback_id: &str, is_active: bool) -> bool {
        let mut callbacks = self.callbacks.write();
        if callbacks.contains_key(callback_id) {
            return false;
        }
        callbacks.insert(
            callback_id.to_string(),
            CallbackStatus::new(callback_id.to_string(), is_active),
        );
        true
    }

    /// Remove a callback, returning its last status.
    pub fn unregister(&self, callback_id: &str) -> Option<CallbackStatus> {
        self.callbacks.write().remove(callback_id)
    }

    /// Mark a callback as running. Unknown ids are ignored.
    pub fn record_start(&self, callback_id: &str) {
        if let Some(status) = self.callbacks.write().get_mut(callback_id) {
            status.is_running = true;
            status.last_run = Some(Utc::now());
        }
    }

    /// Record the end of a run.
    ///
    /// Bumps `run_count`, and `error_count` for a panicked run, and clears
    /// the running flag.
    pub fn record_complete(&self, callback_id: &str, outcome: RunOutcome, duration_ms: u64) {
        if let Some(status) = self.callbacks.write().get_mut(callback_id) {
            status.is_running = false;
            status.last_duration_ms = Some(duration_ms);
            status.last_outcome = Some(outcome);
            status.run_count += 1;
            if outcome == RunOutcome::Panicked {
                status.error_count += 1;
            }
        }
    }

    /// Count a cycle that skipped the callback because it was still running.
    pub fn record_skip(&self, callback_id: &str) {
        if let Some(status) = self.callbacks.write().get_mut(callback_id) {
            status.skip_count += 1;
            status.last_outcome = Some(RunOutcome::Skipped);
        }
    }

    /// Mirror the callback's active flag.
    pub fn set_active(&self, callback_id: &str, active: bool) {
        if let Some(status) = self.callbacks.write().get_mut(callback_id) {
            status.is_active = active;
        }
    }

    /// Status snapshot for one callback.
    pub fn get_status(&self, callback_id: &str) -> Option<CallbackStatus> {
        self.callbacks.read().get(callback_id).cloned()
    }

    /// All statuses, sorted by id.
    pub fn get_all_status(&self) -> Vec<CallbackStatus> {
        let mut all: Vec<_> = self.callbacks.read().values().cloned().collect();
        all.sort_by(|a, b| a.callback_id.cmp(&b.callback_id));
        all
    }

    /// Check if a callback is registered.
    pub fn is_registered(&self, callback_id: &str) -> bool {
        self.callbacks.read().contains_key(callback_id)
    }

    /// Number of registered callbacks.
    pub fn len(&self) -> usize {
        self.callbacks.read().len()
    }

    /// Whether no callback is registered.
    pub fn is_empty(&self) -> bool {
        self.callbacks.read().is_empty()
    }
}
