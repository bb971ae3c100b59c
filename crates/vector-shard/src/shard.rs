//! A vector index bound to its shard's maintenance cycles.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use vector_cycle::{boxed_callback, CombinedCtrl, CycleCallback, CycleCallbackCtrl, ShouldAbort};
use vector_hnsw::{Graph, GraphError};
use vector_pq::PqConfig;
use vector_types::PqSettings;

use crate::callbacks::{rollback, ShardCycleCallbacks};
use crate::error::ShardError;

/// Callback id of the graph inside the shard's vector groups
pub const HNSW_CALLBACK: &str = "hnsw";
/// Callback id of the automatic compression check in the shard's compaction group
pub const COMPRESSION_CALLBACK: &str = "hnsw_compression";

/// How often a blocking maintenance task checks for an abort request
const ABORT_POLL: Duration = Duration::from_millis(50);

/// Owns a graph and the callbacks that keep it tidy.
///
/// Registers tombstone cleanup, commit-log checkpointing and, when
/// `auto_compress_threshold` is set, automatic compression.
pub struct VectorShard {
    graph: Arc<Graph>,
    pq: PqSettings,
    vector_ctrl: Arc<CombinedCtrl>,
    compress_lock: Arc<tokio::sync::Mutex<()>>,
    ctrls: CombinedCtrl,
    stop_timeout: Duration,
}

impl std::fmt::Debug for VectorShard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VectorShard")
            .field("graph", &self.graph.name())
            .field("compressed", &self.graph.is_compressed())
            .finish()
    }
}

impl VectorShard {
    /// Register the graph's callbacks in the shard groups.
    ///
    /// # Errors
    ///
    /// `CycleError::DuplicateId` if the groups already hold a graph. Callbacks
    /// registered before the failure are removed again.
    pub async fn new(
        graph: Arc<Graph>,
        callbacks: &ShardCycleCallbacks,
        pq: PqSettings,
    ) -> Result<Self, ShardError> {
        let vector_ctrl = callbacks.vector_ctrl();
        let compress_lock = Arc::new(tokio::sync::Mutex::new(()));
        let stop_timeout = callbacks.stop_timeout();

        let cleanup = callbacks.vector_tombstone_cleanup().register(
            HNSW_CALLBACK,
            true,
            tombstone_cleanup_callback(Arc::clone(&graph)),
        )?;
        let checkpoint = match callbacks.vector_commit_logger().register(
            HNSW_CALLBACK,
            true,
            checkpoint_callback(Arc::clone(&graph)),
        ) {
            Ok(ctrl) => ctrl,
            Err(e) => {
                rollback(&[cleanup], stop_timeout).await;
                return Err(e.into());
            }
        };
        let compression = match callbacks.compaction().register(
            COMPRESSION_CALLBACK,
            pq.auto_compress_threshold > 0,
            compression_callback(
                Arc::clone(&graph),
                Arc::clone(&vector_ctrl),
                Arc::clone(&compress_lock),
                pq.clone(),
                stop_timeout,
            ),
        ) {
            Ok(ctrl) => ctrl,
            Err(e) => {
                rollback(&[cleanup, checkpoint], stop_timeout).await;
                return Err(e.into());
            }
        };

        let ctrls: Vec<Arc<dyn CycleCallbackCtrl>> =
            vec![Arc::new(cleanup), Arc::new(checkpoint), Arc::new(compression)];
        info!(
            graph = %graph.name(),
            shard = %callbacks.shard_name(),
            auto_compress_threshold = pq.auto_compress_threshold,
            "Vector shard registered"
        );
        Ok(Self {
            graph,
            pq,
            vector_ctrl,
            compress_lock,
            ctrls: CombinedCtrl::new(1, ctrls),
            stop_timeout,
        })
    }

    pub fn graph(&self) -> &Arc<Graph> {
        &self.graph
    }

    /// Compress with the shard's configured quantizer settings.
    pub async fn compress(&self) -> Result<(), ShardError> {
        self.compress_with(PqConfig::from_settings(&self.pq)).await
    }

    /// Quiesce the shard's commit logger and tombstone cleanup, compress,
    /// then let them run again.
    pub async fn compress_with(&self, config: PqConfig) -> Result<(), ShardError> {
        let _serial = self.compress_lock.lock().await;
        compress_quiesced(&self.graph, &self.vector_ctrl, config, self.stop_timeout).await
    }

    /// Unregister this shard's callbacks and write a final checkpoint if
    /// the commit log holds anything.
    pub async fn shutdown(&self) -> Result<(), ShardError> {
        self.ctrls.unregister(self.stop_timeout).await?;
        if self.graph.pending_ops() > 0 {
            let graph = Arc::clone(&self.graph);
            tokio::task::spawn_blocking(move || graph.checkpoint()).await??;
        }
        info!(graph = %self.graph.name(), "Vector shard shut down");
        Ok(())
    }
}

async fn compress_quiesced(
    graph: &Arc<Graph>,
    vector_ctrl: &CombinedCtrl,
    config: PqConfig,
    timeout: Duration,
) -> Result<(), ShardError> {
    // Cycles someone else paused stay paused afterwards
    let was_active = vector_ctrl.is_active();
    vector_ctrl.deactivate(timeout).await?;
    let task = {
        let graph = Arc::clone(graph);
        tokio::task::spawn_blocking(move || graph.compress(&config, &CancellationToken::new()))
    };
    let compressed = task.await;
    let reactivated = if was_active { vector_ctrl.activate() } else { Ok(()) };

    compressed??;
    reactivated?;
    Ok(())
}

/// Await a blocking task, cancelling it once `abort` is raised.
async fn run_abortable<T>(
    mut task: JoinHandle<T>,
    abort: &ShouldAbort,
    cancel: &CancellationToken,
) -> Result<T, tokio::task::JoinError> {
    let mut poll = tokio::time::interval(ABORT_POLL);
    loop {
        tokio::select! {
            result = &mut task => return result,
            _ = poll.tick() => {
                if abort.get() {
                    cancel.cancel();
                }
            }
        }
    }
}

fn tombstone_cleanup_callback(graph: Arc<Graph>) -> CycleCallback {
    boxed_callback(move |abort: ShouldAbort| {
        let graph = Arc::clone(&graph);
        async move {
            if graph.stats().tombstones == 0 {
                return false;
            }
            let cancel = CancellationToken::new();
            let task = {
                let graph = Arc::clone(&graph);
                let cancel = cancel.clone();
                tokio::task::spawn_blocking(move || graph.cleanup_tombstones(&cancel))
            };
            match run_abortable(task, &abort, &cancel).await {
                Ok(Ok(stats)) => {
                    debug!(graph = %graph.name(), removed = stats.removed, "Tombstone cleanup cycle");
                    stats.removed > 0
                }
                Ok(Err(GraphError::Cancelled)) => {
                    debug!(graph = %graph.name(), "Tombstone cleanup aborted");
                    false
                }
                Ok(Err(e)) => {
                    warn!(graph = %graph.name(), error = %e, "Tombstone cleanup failed");
                    false
                }
                Err(e) => {
                    warn!(graph = %graph.name(), error = %e, "Tombstone cleanup task failed");
                    false
                }
            }
        }
    })
}

fn checkpoint_callback(graph: Arc<Graph>) -> CycleCallback {
    boxed_callback(move |_| {
        let graph = Arc::clone(&graph);
        async move {
            let pending = graph.pending_ops();
            if pending == 0 {
                return false;
            }
            let task = {
                let graph = Arc::clone(&graph);
                tokio::task::spawn_blocking(move || graph.checkpoint())
            };
            match task.await {
                Ok(Ok(())) => {
                    debug!(graph = %graph.name(), pending, "Commit log checkpointed");
                    true
                }
                Ok(Err(e)) => {
                    warn!(graph = %graph.name(), error = %e, "Checkpoint failed");
                    false
                }
                Err(e) => {
                    warn!(graph = %graph.name(), error = %e, "Checkpoint task failed");
                    false
                }
            }
        }
    })
}

fn compression_callback(
    graph: Arc<Graph>,
    vector_ctrl: Arc<CombinedCtrl>,
    compress_lock: Arc<tokio::sync::Mutex<()>>,
    pq: PqSettings,
    timeout: Duration,
) -> CycleCallback {
    boxed_callback(move |_| {
        let graph = Arc::clone(&graph);
        let vector_ctrl = Arc::clone(&vector_ctrl);
        let compress_lock = Arc::clone(&compress_lock);
        let pq = pq.clone();
        async move {
            let threshold = pq.auto_compress_threshold;
            if threshold == 0 || graph.is_compressed() || graph.len() < threshold {
                return false;
            }
            let Ok(_serial) = compress_lock.try_lock() else {
                return false;
            };
            info!(graph = %graph.name(), live = graph.len(), threshold, "Compression threshold reached");
            match compress_quiesced(&graph, &vector_ctrl, PqConfig::from_settings(&pq), timeout).await {
                Ok(()) => true,
                Err(e) => {
                    warn!(graph = %graph.name(), error = %e, "Automatic compression failed");
                    false
                }
            }
        }
    })
}
