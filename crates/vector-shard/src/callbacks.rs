//! Index, store and shard callback groups.
//!
//! ```text
//! index groups (one manager each)
//! ├── store/<kind>/<path>          StoreCycleCallbacks
//! └── shard/<index>/<shard>/<kind> ShardCycleCallbacks
//!     └── hnsw, hnsw_compression   VectorShard
//! ```

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use tracing::{info, warn};
use vector_cycle::{
    CallbackCtrl, CombinedCtrl, CycleCallbackCtrl, CycleCallbackGroup, CycleError, CycleManager,
    CycleTicker,
};
use vector_types::CycleSettings;

use crate::cycle_id::{self, COMPACTION, FLUSH, VECTOR_COMMIT_LOGGER, VECTOR_TOMBSTONE_CLEANUP};
use crate::error::ShardError;

/// Backoff cap for the exponential tickers, as a multiple of the interval
const BACKOFF_FACTOR: u32 = 8;

/// Top-level groups shared by every store and shard of a process, each
/// driven by its own manager.
pub struct IndexCycleCallbacks {
    compaction: CycleCallbackGroup,
    flush: CycleCallbackGroup,
    vector_commit_logger: CycleCallbackGroup,
    vector_tombstone_cleanup: CycleCallbackGroup,
    managers: Vec<CycleManager>,
    routines_limit: usize,
    stop_timeout: Duration,
}

impl std::fmt::Debug for IndexCycleCallbacks {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IndexCycleCallbacks")
            .field("routines_limit", &self.routines_limit)
            .field("managers", &self.managers.len())
            .finish()
    }
}

impl IndexCycleCallbacks {
    /// Build the groups and managers. Nothing ticks until [`start`](Self::start).
    pub fn new(settings: &CycleSettings) -> Self {
        let limit = settings.routines_limit.max(1);
        let compaction = CycleCallbackGroup::new(COMPACTION, limit);
        let flush = CycleCallbackGroup::new(FLUSH, limit);
        let vector_commit_logger = CycleCallbackGroup::new(VECTOR_COMMIT_LOGGER, limit);
        let vector_tombstone_cleanup = CycleCallbackGroup::new(VECTOR_TOMBSTONE_CLEANUP, limit);

        let backoff = |ms: u64| {
            let min = Duration::from_millis(ms);
            CycleTicker::exponential(min, min * BACKOFF_FACTOR, 2)
        };
        let managers = vec![
            CycleManager::new(backoff(settings.compaction_interval_ms), compaction.as_callback())
                .with_name(COMPACTION),
            CycleManager::new(backoff(settings.flush_interval_ms), flush.as_callback())
                .with_name(FLUSH),
            CycleManager::new(
                CycleTicker::from_interval_ms(settings.commit_log_interval_ms),
                vector_commit_logger.as_callback(),
            )
            .with_name(VECTOR_COMMIT_LOGGER),
            CycleManager::new(
                CycleTicker::from_interval_ms(settings.tombstone_cleanup_interval_ms),
                vector_tombstone_cleanup.as_callback(),
            )
            .with_name(VECTOR_TOMBSTONE_CLEANUP),
        ];

        Self {
            compaction,
            flush,
            vector_commit_logger,
            vector_tombstone_cleanup,
            managers,
            routines_limit: limit,
            stop_timeout: Duration::from_millis(settings.stop_timeout_ms),
        }
    }

    /// Groups that accept registrations and never run them. No managers.
    pub fn noop() -> Self {
        Self {
            compaction: CycleCallbackGroup::noop(),
            flush: CycleCallbackGroup::noop(),
            vector_commit_logger: CycleCallbackGroup::noop(),
            vector_tombstone_cleanup: CycleCallbackGroup::noop(),
            managers: Vec::new(),
            routines_limit: 1,
            stop_timeout: Duration::ZERO,
        }
    }

    pub fn compaction(&self) -> &CycleCallbackGroup {
        &self.compaction
    }

    pub fn flush(&self) -> &CycleCallbackGroup {
        &self.flush
    }

    pub fn vector_commit_logger(&self) -> &CycleCallbackGroup {
        &self.vector_commit_logger
    }

    pub fn vector_tombstone_cleanup(&self) -> &CycleCallbackGroup {
        &self.vector_tombstone_cleanup
    }

    /// Concurrency cap handed down to store and shard groups.
    pub fn routines_limit(&self) -> usize {
        self.routines_limit
    }

    /// How long stop and unregister wait for an in-flight cycle.
    pub fn stop_timeout(&self) -> Duration {
        self.stop_timeout
    }

    /// Start every manager. Needs a tokio runtime.
    pub fn start(&self) -> Result<(), ShardError> {
        for manager in &self.managers {
            manager.start()?;
        }
        info!(managers = self.managers.len(), "Index cycles started");
        Ok(())
    }

    /// Stop every manager, waiting for in-flight cycles.
    pub async fn stop(&self) -> Result<(), ShardError> {
        let results =
            futures::future::join_all(self.managers.iter().map(|m| m.stop(self.stop_timeout))).await;
        let mut errors: Vec<CycleError> = results
            .into_iter()
            .filter_map(|r| r.err())
            .filter(|e| !matches!(e, CycleError::NotRunning))
            .collect();
        match errors.len() {
            0 => Ok(()),
            1 => Err(errors.remove(0).into()),
            _ => Err(CycleError::Combined(errors).into()),
        }
    }
}

/// Per-store compaction and flush groups, registered in the index groups.
#[derive(Debug)]
pub struct StoreCycleCallbacks {
    compaction: CycleCallbackGroup,
    flush: CycleCallbackGroup,
    ctrl: CombinedCtrl,
}

impl StoreCycleCallbacks {
    /// # Errors
    ///
    /// `CycleError::DuplicateId` if a store with the same directory is
    /// already registered. Groups registered before the failure are
    /// removed again.
    pub async fn init(
        store_dir: &Path,
        root_dir: &Path,
        parent: &IndexCycleCallbacks,
    ) -> Result<Self, ShardError> {
        let limit = parent.routines_limit();
        let compaction_id = cycle_id::store(store_dir, root_dir, COMPACTION);
        let flush_id = cycle_id::store(store_dir, root_dir, FLUSH);
        let compaction = CycleCallbackGroup::new(compaction_id.clone(), limit);
        let flush = CycleCallbackGroup::new(flush_id.clone(), limit);

        let compaction_ctrl = parent.compaction().register_group(compaction_id, true, &compaction)?;
        let flush_ctrl = match parent.flush().register_group(flush_id, true, &flush) {
            Ok(ctrl) => ctrl,
            Err(e) => {
                rollback(&[compaction_ctrl], parent.stop_timeout()).await;
                return Err(e.into());
            }
        };

        let ctrls: Vec<Arc<dyn CycleCallbackCtrl>> = vec![Arc::new(compaction_ctrl), Arc::new(flush_ctrl)];
        Ok(Self {
            compaction,
            flush,
            ctrl: CombinedCtrl::new(limit, ctrls),
        })
    }

    pub fn compaction(&self) -> &CycleCallbackGroup {
        &self.compaction
    }

    pub fn flush(&self) -> &CycleCallbackGroup {
        &self.flush
    }

    /// Control over both store groups.
    pub fn ctrl(&self) -> &CombinedCtrl {
        &self.ctrl
    }

    /// Remove both store groups from the index groups.
    pub async fn shutdown(&self, timeout: Duration) -> Result<(), ShardError> {
        self.ctrl.unregister(timeout).await?;
        Ok(())
    }
}

/// Per-shard groups registered in the index groups.
///
/// The commit logger and tombstone cleanup controls are combined so a
/// structural change to the shard's vector index can quiesce both at once.
pub struct ShardCycleCallbacks {
    index_id: String,
    shard_name: String,
    compaction: CycleCallbackGroup,
    flush: CycleCallbackGroup,
    vector_commit_logger: CycleCallbackGroup,
    vector_tombstone_cleanup: CycleCallbackGroup,
    vector_ctrl: Arc<CombinedCtrl>,
    all_ctrl: CombinedCtrl,
    stop_timeout: Duration,
}

impl std::fmt::Debug for ShardCycleCallbacks {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ShardCycleCallbacks")
            .field("index_id", &self.index_id)
            .field("shard_name", &self.shard_name)
            .finish()
    }
}

impl ShardCycleCallbacks {
    /// # Errors
    ///
    /// `ShardError::Configuration` for empty names, `CycleError::DuplicateId`
    /// if any of the shard's groups is already registered. Groups
    /// registered before the failure are removed again.
    pub async fn init(
        index_id: &str,
        shard_name: &str,
        parent: &IndexCycleCallbacks,
    ) -> Result<Self, ShardError> {
        if index_id.is_empty() || shard_name.is_empty() {
            return Err(ShardError::Configuration(
                "index id and shard name must not be empty".to_string(),
            ));
        }
        let limit = parent.routines_limit();
        let id = |kind: &str| cycle_id::shard(index_id, shard_name, &[kind]);

        let compaction = CycleCallbackGroup::new(id(COMPACTION), limit);
        let flush = CycleCallbackGroup::new(id(FLUSH), limit);
        let vector_commit_logger = CycleCallbackGroup::new(id(VECTOR_COMMIT_LOGGER), limit);
        let vector_tombstone_cleanup = CycleCallbackGroup::new(id(VECTOR_TOMBSTONE_CLEANUP), limit);

        let mut ctrls: Vec<CallbackCtrl> = Vec::with_capacity(4);
        let pairs = [
            (parent.compaction(), &compaction),
            (parent.flush(), &flush),
            (parent.vector_commit_logger(), &vector_commit_logger),
            (parent.vector_tombstone_cleanup(), &vector_tombstone_cleanup),
        ];
        for (parent_group, child) in pairs {
            match parent_group.register_group(child.id(), true, child) {
                Ok(ctrl) => ctrls.push(ctrl),
                Err(e) => {
                    rollback(&ctrls, parent.stop_timeout()).await;
                    return Err(e.into());
                }
            }
        }

        let ctrls: Vec<Arc<dyn CycleCallbackCtrl>> = ctrls
            .into_iter()
            .map(|c| Arc::new(c) as Arc<dyn CycleCallbackCtrl>)
            .collect();
        let vector_ctrl = Arc::new(CombinedCtrl::new(limit, vec![Arc::clone(&ctrls[2]), Arc::clone(&ctrls[3])]));
        info!(index = index_id, shard = shard_name, "Shard cycle callbacks registered");

        Ok(Self {
            index_id: index_id.to_string(),
            shard_name: shard_name.to_string(),
            compaction,
            flush,
            vector_commit_logger,
            vector_tombstone_cleanup,
            vector_ctrl,
            all_ctrl: CombinedCtrl::new(limit, ctrls),
            stop_timeout: parent.stop_timeout(),
        })
    }

    pub fn index_id(&self) -> &str {
        &self.index_id
    }

    pub fn shard_name(&self) -> &str {
        &self.shard_name
    }

    pub fn compaction(&self) -> &CycleCallbackGroup {
        &self.compaction
    }

    pub fn flush(&self) -> &CycleCallbackGroup {
        &self.flush
    }

    pub fn vector_commit_logger(&self) -> &CycleCallbackGroup {
        &self.vector_commit_logger
    }

    pub fn vector_tombstone_cleanup(&self) -> &CycleCallbackGroup {
        &self.vector_tombstone_cleanup
    }

    /// Combined control over the commit logger and tombstone cleanup groups.
    pub fn vector_ctrl(&self) -> Arc<CombinedCtrl> {
        Arc::clone(&self.vector_ctrl)
    }

    pub fn stop_timeout(&self) -> Duration {
        self.stop_timeout
    }

    /// Remove all four shard groups from the index groups.
    pub async fn shutdown(&self) -> Result<(), ShardError> {
        self.all_ctrl.unregister(self.stop_timeout).await?;
        info!(index = %self.index_id, shard = %self.shard_name, "Shard cycle callbacks unregistered");
        Ok(())
    }
}

/// Remove registrations made before a later one failed.
///
/// A manager may already be running a freshly registered callback, so each
/// unregister waits up to `timeout` for it. Failures are logged; the entry
/// is out of its group either way.
pub(crate) async fn rollback(ctrls: &[CallbackCtrl], timeout: Duration) {
    for ctrl in ctrls {
        if let Err(e) = ctrl.unregister(timeout).await {
            warn!(error = %e, "Cycle callback rollback did not finish cleanly");
        }
    }
}
