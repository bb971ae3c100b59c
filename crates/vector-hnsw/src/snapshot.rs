//! Structural snapshots, validation and crash recovery.
//!
//! A snapshot holds the node table and entry point as JSON. Codebooks are a
//! separate blob (`<name>.pq`). Recovery loads the last snapshot and replays
//! the commit log written since.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::Ordering;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use vector_pq::ProductQuantizer;
use vector_types::{BlobStore, CommitLog, CommitOp, DistanceKind, SourceError, VectorId, VectorSource};

use crate::config::HnswConfig;
use crate::error::GraphError;
use crate::graph::{EntryPoint, Graph};
use crate::node::{Node, NodeState};

const SNAPSHOT_VERSION: u32 = 1;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeSnapshot {
    pub id: VectorId,
    pub state: NodeState,
    /// One list per layer, layer 0 first
    pub neighbors: Vec<Vec<VectorId>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GraphSnapshot {
    pub version: u32,
    pub dimensions: usize,
    pub max_connections: usize,
    pub distance: DistanceKind,
    pub entry_point: Option<VectorId>,
    pub max_level: usize,
    pub compressed: bool,
    pub nodes: Vec<NodeSnapshot>,
}

/// What a commit log replay did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReplayStats {
    pub applied: usize,
    /// Records that no longer apply (vector gone, id already present)
    pub skipped: usize,
}

impl GraphSnapshot {
    /// Structural checks shared by restore and `Graph::validate_structure`.
    pub fn validate(&self) -> Result<(), GraphError> {
        let corrupt = |msg: String| Err(GraphError::CorruptState(msg));

        if self.version != SNAPSHOT_VERSION {
            return corrupt(format!("unsupported snapshot version {}", self.version));
        }
        let mut levels: HashMap<VectorId, (usize, NodeState)> = HashMap::with_capacity(self.nodes.len());
        for node in &self.nodes {
            if node.neighbors.is_empty() {
                return corrupt(format!("node {} has no layers", node.id));
            }
            if levels
                .insert(node.id, (node.neighbors.len() - 1, node.state))
                .is_some()
            {
                return corrupt(format!("duplicate node {}", node.id));
            }
        }

        for node in &self.nodes {
            for (layer, list) in node.neighbors.iter().enumerate() {
                let cap = if layer == 0 {
                    self.max_connections * 2
                } else {
                    self.max_connections
                };
                if list.len() > cap {
                    return corrupt(format!(
                        "node {} has {} neighbors on layer {layer}, cap is {cap}",
                        node.id,
                        list.len()
                    ));
                }
                let mut seen = HashSet::with_capacity(list.len());
                for neighbor in list {
                    if *neighbor == node.id {
                        return corrupt(format!("node {} links to itself", node.id));
                    }
                    if !seen.insert(*neighbor) {
                        return corrupt(format!("node {} lists {neighbor} twice", node.id));
                    }
                    match levels.get(neighbor) {
                        None => {
                            return corrupt(format!(
                                "node {} references missing node {neighbor}",
                                node.id
                            ))
                        }
                        Some((level, _)) if *level < layer => {
                            return corrupt(format!(
                                "node {} links to {neighbor} on layer {layer} above its level {level}",
                                node.id
                            ))
                        }
                        Some(_) => {}
                    }
                }
            }
        }

        let top_live = levels
            .values()
            .filter(|(_, state)| *state == NodeState::Live)
            .map(|(level, _)| *level)
            .max();
        match (self.entry_point, top_live) {
            (None, None) => Ok(()),
            (None, Some(_)) => corrupt("live nodes but no entry point".to_string()),
            (Some(ep), _) => match levels.get(&ep) {
                None => corrupt(format!("entry point {ep} is missing")),
                Some((_, NodeState::Tombstoned)) => corrupt(format!("entry point {ep} is tombstoned")),
                Some((level, _)) if *level != self.max_level => corrupt(format!(
                    "entry point level {level} differs from max level {}",
                    self.max_level
                )),
                Some((level, _)) if top_live.is_some_and(|top| top > *level) => {
                    corrupt(format!("entry point {ep} is below a live node"))
                }
                Some(_) => Ok(()),
            },
        }
    }
}

impl Graph {
    /// Consistent copy of the structure. Blocks inserts while it runs.
    pub fn snapshot(&self) -> GraphSnapshot {
        let _structure = self.structure.write();
        self.snapshot_locked()
    }

    fn snapshot_locked(&self) -> GraphSnapshot {
        let entry = *self.entry.read();
        let nodes = self
            .all_nodes()
            .iter()
            .map(|n| NodeSnapshot {
                id: n.id,
                state: n.state(),
                neighbors: (0..=n.level()).map(|l| n.neighbors(l)).collect(),
            })
            .collect();
        GraphSnapshot {
            version: SNAPSHOT_VERSION,
            dimensions: self.config.dimensions,
            max_connections: self.config.max_connections,
            distance: self.config.distance,
            entry_point: entry.id,
            max_level: entry.level,
            compressed: self.is_compressed(),
            nodes,
        }
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, GraphError> {
        serde_json::to_vec(&self.snapshot())
            .map_err(|e| GraphError::Store(vector_types::StoreError::from(e)))
    }

    /// Run the structural checks against the live graph.
    pub fn validate_structure(&self) -> Result<(), GraphError> {
        self.snapshot().validate()
    }

    /// Persist a snapshot, then truncate the commit log it covers.
    pub fn checkpoint(&self) -> Result<(), GraphError> {
        let _structure = self.structure.write();
        let snapshot = self.snapshot_locked();
        let bytes = serde_json::to_vec(&snapshot).map_err(vector_types::StoreError::from)?;
        self.store.store(&self.snapshot_key(), &bytes)?;
        self.commit_log.truncate()?;
        self.pending_ops.store(0, Ordering::Release);
        debug!(graph = %self.name, nodes = snapshot.nodes.len(), bytes = bytes.len(), "Checkpoint written");
        Ok(())
    }

    /// Rebuild a graph from snapshot bytes.
    ///
    /// A compressed snapshot also needs its codebook blob in `store`.
    pub fn restore(
        name: impl Into<String>,
        config: HnswConfig,
        source: Arc<dyn VectorSource>,
        store: Arc<dyn BlobStore>,
        bytes: &[u8],
    ) -> Result<Self, GraphError> {
        let snapshot: GraphSnapshot = serde_json::from_slice(bytes)
            .map_err(|e| GraphError::CorruptState(format!("unreadable snapshot: {e}")))?;
        if snapshot.dimensions != config.dimensions
            || snapshot.max_connections != config.max_connections
            || snapshot.distance != config.distance
        {
            return Err(GraphError::CorruptState(format!(
                "snapshot built for {} dims, M={}, {}; config has {} dims, M={}, {}",
                snapshot.dimensions,
                snapshot.max_connections,
                snapshot.distance,
                config.dimensions,
                config.max_connections,
                config.distance
            )));
        }
        snapshot.validate()?;
        if let Some(n) = snapshot.nodes.iter().find(|n| n.id > config.max_id) {
            return Err(GraphError::CorruptState(format!(
                "node {} exceeds max_id {}",
                n.id, config.max_id
            )));
        }

        let graph = Graph::new(name, config, source)?.with_store(store);
        {
            let mut nodes = graph.nodes.write();
            let len = snapshot
                .nodes
                .iter()
                .map(|n| n.id as usize + 1)
                .max()
                .unwrap_or(0);
            nodes.resize(len, None);
            for n in snapshot.nodes {
                nodes[n.id as usize] = Some(Arc::new(Node::from_parts(n.id, n.neighbors, n.state)));
            }
        }
        *graph.entry.write() = EntryPoint {
            id: snapshot.entry_point,
            level: snapshot.max_level,
        };

        if snapshot.compressed {
            let blob = graph.store.load(&graph.pq_key())?.ok_or_else(|| {
                GraphError::CorruptState(format!("codebook '{}' missing", graph.pq_key()))
            })?;
            let pq = ProductQuantizer::from_bytes(&blob)?;
            graph.install_quantizer(Arc::new(pq), false)?;
        }

        info!(graph = %graph.name, nodes = graph.stats().nodes, compressed = snapshot.compressed, "Graph restored");
        Ok(graph)
    }

    /// Load the last snapshot from `store` (or start empty) and replay `commit_log`.
    pub fn recover(
        name: impl Into<String>,
        config: HnswConfig,
        source: Arc<dyn VectorSource>,
        store: Arc<dyn BlobStore>,
        commit_log: Arc<dyn CommitLog>,
    ) -> Result<Self, GraphError> {
        let name = name.into();
        let key = format!("{name}.graph");
        let graph = match store.load(&key)? {
            Some(bytes) => Self::restore(name, config, source, store, &bytes)?,
            None => Self::new(name, config, source)?.with_store(store),
        }
        .with_commit_log(commit_log);

        let stats = graph.replay()?;
        info!(graph = %graph.name, applied = stats.applied, skipped = stats.skipped, "Commit log replayed");
        Ok(graph)
    }

    fn replay(&self) -> Result<ReplayStats, GraphError> {
        let mut stats = ReplayStats::default();
        let ops = self.commit_log.replay()?;
        // Replayed records stay in the log until the next checkpoint
        self.pending_ops.store(ops.len() as u64, Ordering::Release);
        for op in ops {
            match op {
                CommitOp::Insert { id, level } => {
                    let vector = match self.source.fetch_vector(id) {
                        Ok(v) => v,
                        Err(SourceError::NotFound(_)) => {
                            warn!(graph = %self.name, id, "Vector gone, skipping logged insert");
                            stats.skipped += 1;
                            continue;
                        }
                        Err(e) => return Err(e.into()),
                    };
                    match self.insert_at_level(id, &vector, level, false) {
                        Ok(()) => stats.applied += 1,
                        Err(GraphError::AlreadyExists(_)) => stats.skipped += 1,
                        Err(e) => return Err(e),
                    }
                }
                CommitOp::Delete { ids } => {
                    self.delete_inner(&ids, false)?;
                    stats.applied += 1;
                }
                CommitOp::Cleanup { ids } => {
                    let _pass = self.maintenance.lock();
                    let deleted: HashSet<VectorId> = ids
                        .into_iter()
                        .filter(|id| self.node(*id).is_some_and(|n| n.is_tombstoned()))
                        .collect();
                    self.cleanup_ids(deleted, &CancellationToken::new(), false)?;
                    stats.applied += 1;
                }
                CommitOp::Compress { .. } => {
                    if self.is_compressed() {
                        stats.skipped += 1;
                        continue;
                    }
                    let blob = self.store.load(&self.pq_key())?.ok_or_else(|| {
                        GraphError::CorruptState(format!("codebook '{}' missing", self.pq_key()))
                    })?;
                    let pq = ProductQuantizer::from_bytes(&blob)?;
                    let _pass = self.maintenance.lock();
                    self.install_quantizer(Arc::new(pq), false)?;
                    stats.applied += 1;
                }
            }
        }
        Ok(stats)
    }
}
