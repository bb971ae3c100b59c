//! Graph arena, vector access and the insert path.
//!
//! Nodes live in a flat table indexed by id. Neighbor lists hold ids, never
//! references, so removing a node is clearing its slot.
//!
//! Lock order: `maintenance` -> `structure` -> `entry` -> `nodes`. Node
//! neighbor locks are leaves and at most one is held at a time.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use arc_swap::ArcSwapOption;
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use vector_pq::{DistanceLookupTable, ProductQuantizer};
use vector_types::{
    normalize, BlobStore, CommitLog, CommitOp, DistanceProvider, MemoryBlobStore, NoopCommitLog,
    VectorId, VectorSource,
};

use crate::config::{HnswConfig, MAX_LEVEL};
use crate::error::GraphError;
use crate::node::Node;
use crate::search::Scored;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub(crate) struct EntryPoint {
    pub id: Option<VectorId>,
    pub level: usize,
}

/// Distance mode captured once per operation.
#[derive(Clone)]
pub(crate) enum Mode {
    Raw,
    Compressed(Arc<ProductQuantizer>),
}

/// What a node-to-node distance is computed from.
pub(crate) enum Payload {
    Raw(Arc<[f32]>),
    Code(Arc<[u8]>),
}

/// Query-side distance function.
pub(crate) enum QueryDistance {
    Raw(Vec<f32>),
    Compressed {
        table: DistanceLookupTable,
        pq: Arc<ProductQuantizer>,
    },
}

/// Point-in-time counters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct GraphStats {
    /// Occupied arena slots, tombstones included
    pub nodes: usize,
    pub tombstones: usize,
    pub max_level: usize,
    pub entry_point: Option<VectorId>,
    /// Nodes present on each layer, layer 0 first
    pub layer_counts: Vec<usize>,
    pub compressed: bool,
}

impl GraphStats {
    /// Nodes that searches can return.
    pub fn live(&self) -> usize {
        self.nodes - self.tombstones
    }
}

/// Concurrent HNSW graph.
pub struct Graph {
    pub(crate) name: String,
    pub(crate) config: HnswConfig,
    pub(crate) distance: Arc<dyn DistanceProvider>,
    pub(crate) source: Arc<dyn VectorSource>,
    pub(crate) store: Arc<dyn BlobStore>,
    pub(crate) commit_log: Arc<dyn CommitLog>,
    pub(crate) nodes: RwLock<Vec<Option<Arc<Node>>>>,
    pub(crate) entry: RwLock<EntryPoint>,
    /// Read by inserts and deletes, written by sweeps, compression and checkpoints
    pub(crate) structure: RwLock<()>,
    /// Serializes cleanup passes and compression
    pub(crate) maintenance: Mutex<()>,
    pub(crate) cache: DashMap<VectorId, Arc<[f32]>>,
    pub(crate) codes: DashMap<VectorId, Arc<[u8]>>,
    pub(crate) quantizer: ArcSwapOption<ProductQuantizer>,
    /// Commit log records written since the last checkpoint
    pub(crate) pending_ops: AtomicU64,
    rng: Mutex<StdRng>,
}

impl fmt::Debug for Graph {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Graph")
            .field("name", &self.name)
            .field("config", &self.config)
            .field("entry", &*self.entry.read())
            .field("compressed", &self.is_compressed())
            .finish()
    }
}

impl Graph {
    /// Empty graph with an in-memory store and no commit log.
    pub fn new(
        name: impl Into<String>,
        config: HnswConfig,
        source: Arc<dyn VectorSource>,
    ) -> Result<Self, GraphError> {
        config.validate()?;
        let name = name.into();
        if name.is_empty() {
            return Err(GraphError::Configuration("graph name must not be empty".into()));
        }
        Ok(Self {
            distance: config.distance.provider(),
            rng: Mutex::new(StdRng::seed_from_u64(config.seed)),
            name,
            config,
            source,
            store: Arc::new(MemoryBlobStore::new()),
            commit_log: Arc::new(NoopCommitLog),
            nodes: RwLock::new(Vec::new()),
            entry: RwLock::new(EntryPoint::default()),
            structure: RwLock::new(()),
            maintenance: Mutex::new(()),
            cache: DashMap::new(),
            codes: DashMap::new(),
            quantizer: ArcSwapOption::empty(),
            pending_ops: AtomicU64::new(0),
        })
    }

    /// Use `store` for snapshots and the codebook blob.
    pub fn with_store(mut self, store: Arc<dyn BlobStore>) -> Self {
        self.store = store;
        self
    }

    /// Append every structural change to `commit_log`.
    pub fn with_commit_log(mut self, commit_log: Arc<dyn CommitLog>) -> Self {
        self.commit_log = commit_log;
        self
    }

    /// Graph name, also the prefix of its blob keys.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Configuration the graph was built with.
    pub fn config(&self) -> &HnswConfig {
        &self.config
    }

    /// Whether a quantizer is installed.
    pub fn is_compressed(&self) -> bool {
        self.quantizer.load().is_some()
    }

    /// Installed quantizer, if compressed.
    pub fn quantizer(&self) -> Option<Arc<ProductQuantizer>> {
        self.quantizer.load_full()
    }

    /// Number of live nodes.
    pub fn len(&self) -> usize {
        self.nodes
            .read()
            .iter()
            .flatten()
            .filter(|n| !n.is_tombstoned())
            .count()
    }

    /// Whether no live node exists.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether `id` is present and not tombstoned.
    pub fn contains(&self, id: VectorId) -> bool {
        self.node(id).is_some_and(|n| !n.is_tombstoned())
    }

    /// Current entry point; `None` for an empty graph.
    pub fn entry_point(&self) -> Option<VectorId> {
        self.entry.read().id
    }

    /// Commit log records not yet covered by a checkpoint.
    pub fn pending_ops(&self) -> u64 {
        self.pending_ops.load(Ordering::Acquire)
    }

    pub(crate) fn log_op(&self, op: CommitOp) -> Result<(), GraphError> {
        self.commit_log.append(op)?;
        self.pending_ops.fetch_add(1, Ordering::AcqRel);
        Ok(())
    }

    pub(crate) fn snapshot_key(&self) -> String {
        format!("{}.graph", self.name)
    }

    pub(crate) fn pq_key(&self) -> String {
        format!("{}.pq", self.name)
    }

    pub(crate) fn node(&self, id: VectorId) -> Option<Arc<Node>> {
        let slot = usize::try_from(id).ok()?;
        self.nodes.read().get(slot).and_then(|n| n.clone())
    }

    /// Every occupied slot, tombstones included, in id order.
    pub(crate) fn all_nodes(&self) -> Vec<Arc<Node>> {
        self.nodes.read().iter().flatten().cloned().collect()
    }

    pub(crate) fn mode(&self) -> Mode {
        match self.quantizer.load_full() {
            Some(pq) => Mode::Compressed(pq),
            None => Mode::Raw,
        }
    }

    fn random_level(&self) -> usize {
        // 1 - [0, 1) keeps ln away from zero
        let r: f64 = 1.0 - self.rng.lock().gen::<f64>();
        let level = (-r.ln() * self.config.level_multiplier()).floor() as usize;
        level.min(MAX_LEVEL)
    }

    /// Check dimensionality and normalize when the provider needs it.
    pub(crate) fn prepare(&self, vector: &[f32]) -> Result<Vec<f32>, GraphError> {
        if vector.len() != self.config.dimensions {
            return Err(GraphError::DimensionMismatch {
                expected: self.config.dimensions,
                actual: vector.len(),
            });
        }
        let mut vector = vector.to_vec();
        if self.distance.requires_normalization() {
            normalize(&mut vector);
        }
        Ok(vector)
    }

    /// Cached vector, falling back to the source.
    pub(crate) fn vector(&self, id: VectorId) -> Result<Arc<[f32]>, GraphError> {
        if let Some(v) = self.cache.get(&id) {
            return Ok(Arc::clone(v.value()));
        }
        let mut vector = self.source.fetch_vector(id)?;
        if vector.len() != self.config.dimensions {
            return Err(GraphError::DimensionMismatch {
                expected: self.config.dimensions,
                actual: vector.len(),
            });
        }
        if self.distance.requires_normalization() {
            normalize(&mut vector);
        }
        let vector: Arc<[f32]> = vector.into();
        // Raw vectors are dropped once compressed
        if !self.is_compressed() {
            self.cache.insert(id, Arc::clone(&vector));
        }
        Ok(vector)
    }

    /// Stored code, encoding from the source on a miss.
    pub(crate) fn code(&self, id: VectorId, pq: &ProductQuantizer) -> Result<Arc<[u8]>, GraphError> {
        if let Some(c) = self.codes.get(&id) {
            return Ok(Arc::clone(c.value()));
        }
        let vector = self.vector(id)?;
        let code: Arc<[u8]> = pq.encode(&vector)?.into();
        self.codes.insert(id, Arc::clone(&code));
        Ok(code)
    }

    pub(crate) fn payload(&self, mode: &Mode, id: VectorId) -> Result<Payload, GraphError> {
        match mode {
            Mode::Raw => self.vector(id).map(Payload::Raw),
            Mode::Compressed(pq) => self.code(id, pq).map(Payload::Code),
        }
    }

    pub(crate) fn between(&self, mode: &Mode, a: &Payload, b: &Payload) -> f32 {
        match (mode, a, b) {
            (Mode::Raw, Payload::Raw(a), Payload::Raw(b)) => self.distance.distance(a, b),
            (Mode::Compressed(pq), Payload::Code(a), Payload::Code(b)) => {
                pq.distance_between_codes(a, b)
            }
            _ => unreachable!("payloads fetched under a different mode"),
        }
    }

    pub(crate) fn query(&self, mode: &Mode, vector: &[f32]) -> Result<QueryDistance, GraphError> {
        match mode {
            Mode::Raw => Ok(QueryDistance::Raw(vector.to_vec())),
            Mode::Compressed(pq) => Ok(QueryDistance::Compressed {
                table: pq.lookup_table(vector)?,
                pq: Arc::clone(pq),
            }),
        }
    }

    pub(crate) fn query_distance(&self, query: &QueryDistance, id: VectorId) -> Result<f32, GraphError> {
        match query {
            QueryDistance::Raw(q) => Ok(self.distance.distance(q, &self.vector(id)?)),
            QueryDistance::Compressed { table, pq } => Ok(table.distance(&self.code(id, pq)?)),
        }
    }

    /// Insert a node for `id`.
    ///
    /// Fails with `AlreadyExists` while the id occupies a slot, including
    /// a tombstoned slot that no cleanup pass has freed yet.
    pub fn insert(&self, id: VectorId, vector: &[f32]) -> Result<(), GraphError> {
        let level = self.random_level();
        self.insert_at_level(id, vector, level, true)
    }

    /// Insert in order, checking `cancel` between nodes.
    pub fn insert_batch(
        &self,
        items: &[(VectorId, Vec<f32>)],
        cancel: &CancellationToken,
    ) -> Result<usize, GraphError> {
        for (done, (id, vector)) in items.iter().enumerate() {
            if cancel.is_cancelled() {
                info!(graph = %self.name, inserted = done, total = items.len(), "Batch insert cancelled");
                return Err(GraphError::Cancelled);
            }
            self.insert(*id, vector)?;
        }
        Ok(items.len())
    }

    pub(crate) fn insert_at_level(
        &self,
        id: VectorId,
        vector: &[f32],
        level: usize,
        log: bool,
    ) -> Result<(), GraphError> {
        if id > self.config.max_id {
            return Err(GraphError::Configuration(format!(
                "id {id} exceeds max_id {}",
                self.config.max_id
            )));
        }
        let vector = self.prepare(vector)?;
        let level = level.min(MAX_LEVEL);

        let _structure = self.structure.read();
        let mode = self.mode();
        let code = match &mode {
            Mode::Raw => None,
            Mode::Compressed(pq) => Some(Arc::<[u8]>::from(pq.encode(&vector)?)),
        };

        if self.node(id).is_some() {
            return Err(GraphError::AlreadyExists(id));
        }
        if log {
            self.log_op(CommitOp::Insert { id, level })?;
        }

        let node = Arc::new(Node::new(id, level));
        {
            let mut nodes = self.nodes.write();
            let slot = id as usize;
            if nodes.get(slot).is_some_and(|n| n.is_some()) {
                return Err(GraphError::AlreadyExists(id));
            }
            match code {
                Some(code) => {
                    self.codes.insert(id, code);
                }
                None => {
                    self.cache.insert(id, vector.clone().into());
                }
            }
            if slot >= nodes.len() {
                nodes.resize(slot + 1, None);
            }
            nodes[slot] = Some(Arc::clone(&node));
        }

        let entry = loop {
            let current = *self.entry.read();
            if current.id.is_some() {
                break current;
            }
            let mut entry = self.entry.write();
            if entry.id.is_none() {
                *entry = EntryPoint { id: Some(id), level };
                debug!(graph = %self.name, id, level, "First node became entry point");
                return Ok(());
            }
        };

        if let Err(e) = self.connect(&mode, &node, &vector, entry) {
            // Never leave a half-linked node visible
            node.tombstone();
            warn!(graph = %self.name, id, error = %e, "Insert failed, node tombstoned");
            return Err(e);
        }

        if level > entry.level {
            let mut current = self.entry.write();
            if current.id.is_none() || level > current.level {
                *current = EntryPoint { id: Some(id), level };
                debug!(graph = %self.name, id, level, "New entry point");
            }
        }
        if node.is_tombstoned() {
            // Deleted while linking; the delete may have missed the entry swap
            self.repair_entry_point();
        }
        Ok(())
    }

    fn connect(
        &self,
        mode: &Mode,
        node: &Node,
        vector: &[f32],
        entry: EntryPoint,
    ) -> Result<(), GraphError> {
        let id = node.id;
        let level = node.level();
        let query = self.query(mode, vector)?;
        let Some(entry_id) = entry.id else {
            return Ok(());
        };

        let mut entry_points = vec![Scored {
            id: entry_id,
            distance: self.query_distance(&query, entry_id)?,
        }];

        for layer in (level + 1..=entry.level).rev() {
            let closest = self.search_layer(&query, &entry_points, 1, layer, &|_| true, None)?;
            if !closest.is_empty() {
                entry_points = closest;
            }
        }

        let eligible = |n: &Node| n.id != id && !n.is_tombstoned();
        for layer in (0..=level.min(entry.level)).rev() {
            let candidates = self.search_layer(
                &query,
                &entry_points,
                self.config.ef_construction,
                layer,
                &eligible,
                None,
            )?;
            let cap = self.config.max_connections_for(layer);
            let selected = self.select_neighbors(mode, &candidates, cap)?;
            node.set_neighbors(layer, selected.iter().map(|s| s.id).collect());
            for s in &selected {
                self.link(mode, s.id, id, layer)?;
            }
            if !candidates.is_empty() {
                entry_points = candidates;
            }
        }
        Ok(())
    }

    /// Add `new_id` to `neighbor`'s list at `layer`, keeping the closest
    /// when the list is over its cap.
    fn link(&self, mode: &Mode, neighbor: VectorId, new_id: VectorId, layer: usize) -> Result<(), GraphError> {
        let Some(node) = self.node(neighbor) else {
            return Ok(());
        };
        let cap = self.config.max_connections_for(layer);
        let Some(mut list) = node.layer_mut(layer) else {
            return Ok(());
        };
        if list.contains(&new_id) {
            return Ok(());
        }
        if list.len() < cap {
            list.push(new_id);
            return Ok(());
        }

        let origin = match self.payload(mode, neighbor) {
            Ok(p) => p,
            Err(GraphError::NotFound(_)) => return Ok(()),
            Err(e) => return Err(e),
        };
        let mut scored = Vec::with_capacity(list.len() + 1);
        for &other in list.iter().chain(std::iter::once(&new_id)) {
            match self.payload(mode, other) {
                Ok(p) => scored.push(Scored {
                    id: other,
                    distance: self.between(mode, &origin, &p),
                }),
                // Vector gone for a deleted neighbor: drop the edge
                Err(GraphError::NotFound(_)) => continue,
                Err(e) => return Err(e),
            }
        }
        scored.sort();
        scored.truncate(cap);
        *list = scored.into_iter().map(|s| s.id).collect();
        Ok(())
    }

    /// Point-in-time counters. Not atomic with respect to concurrent writers.
    pub fn stats(&self) -> GraphStats {
        let entry = *self.entry.read();
        let mut stats = GraphStats {
            entry_point: entry.id,
            max_level: entry.level,
            compressed: self.is_compressed(),
            ..Default::default()
        };
        for node in self.all_nodes() {
            stats.nodes += 1;
            if node.is_tombstoned() {
                stats.tombstones += 1;
            }
            if stats.layer_counts.len() <= node.level() {
                stats.layer_counts.resize(node.level() + 1, 0);
            }
            for count in &mut stats.layer_counts[..=node.level()] {
                *count += 1;
            }
        }
        stats
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use rand::Rng;
    use vector_types::InMemoryVectorSource;

    pub(crate) fn random_vectors(n: usize, dims: usize, seed: u64) -> Vec<Vec<f32>> {
        let mut rng = StdRng::seed_from_u64(seed);
        (0..n)
            .map(|_| (0..dims).map(|_| rng.gen::<f32>()).collect())
            .collect()
    }

    /// Graph over `n` random vectors, all inserted.
    pub(crate) fn build_graph(n: usize, dims: usize, config: HnswConfig) -> (Graph, Arc<InMemoryVectorSource>, Vec<Vec<f32>>) {
        let vectors = random_vectors(n, dims, 42);
        let source = Arc::new(InMemoryVectorSource::from_vectors(&vectors));
        let graph = Graph::new("test", config, source.clone()).unwrap();
        for (id, v) in vectors.iter().enumerate() {
            graph.insert(id as VectorId, v).unwrap();
        }
        (graph, source, vectors)
    }

    #[test]
    fn test_first_insert_becomes_entry_point() {
        let source = Arc::new(InMemoryVectorSource::new());
        let graph = Graph::new("g", HnswConfig::new(2), source).unwrap();
        assert!(graph.is_empty());
        graph.insert(3, &[0.1, 0.2]).unwrap();
        assert_eq!(graph.entry_point(), Some(3));
        assert_eq!(graph.len(), 1);
        assert!(graph.contains(3));
    }

    #[test]
    fn test_insert_rejects_duplicates_and_bad_dims() {
        let source = Arc::new(InMemoryVectorSource::new());
        let graph = Graph::new("g", HnswConfig::new(2), source).unwrap();
        graph.insert(1, &[0.1, 0.2]).unwrap();
        assert!(matches!(graph.insert(1, &[0.3, 0.4]), Err(GraphError::AlreadyExists(1))));
        assert!(matches!(
            graph.insert(2, &[0.3]),
            Err(GraphError::DimensionMismatch { expected: 2, actual: 1 })
        ));
    }

    #[test]
    fn test_insert_respects_max_id() {
        use crate::config::{DEFAULT_MAX_ID, MAX_NODE_ID};

        let source = Arc::new(InMemoryVectorSource::new());
        let graph = Graph::new("g", HnswConfig::new(2), source.clone()).unwrap();
        // Rejected before the arena grows
        for id in [DEFAULT_MAX_ID + 1, MAX_NODE_ID, u64::MAX] {
            assert!(matches!(
                graph.insert(id, &[0.1, 0.1]),
                Err(GraphError::Configuration(_))
            ));
        }
        assert!(graph.nodes.read().is_empty());

        let small = Graph::new("small", HnswConfig::new(2).with_max_id(100), source.clone()).unwrap();
        small.insert(100, &[0.1, 0.1]).unwrap();
        assert!(matches!(small.insert(101, &[0.2, 0.2]), Err(GraphError::Configuration(_))));
        assert_eq!(small.nodes.read().len(), 101);

        assert!(matches!(
            Graph::new("huge", HnswConfig::new(2).with_max_id(MAX_NODE_ID + 1), source),
            Err(GraphError::Configuration(_))
        ));
    }

    #[test]
    fn test_neighbor_caps_hold_after_inserts() {
        let config = HnswConfig::new(8).with_max_connections(4).with_ef_construction(32);
        let (graph, _, _) = build_graph(400, 8, config);
        for node in graph.all_nodes() {
            for layer in 0..=node.level() {
                let cap = graph.config.max_connections_for(layer);
                assert!(node.neighbors(layer).len() <= cap);
                assert!(!node.neighbors(layer).contains(&node.id));
            }
        }
        graph.validate_structure().unwrap();
    }

    #[test]
    fn test_stats_layer_counts() {
        let (graph, _, _) = build_graph(200, 4, HnswConfig::new(4).with_max_connections(4));
        let stats = graph.stats();
        assert_eq!(stats.nodes, 200);
        assert_eq!(stats.live(), 200);
        assert_eq!(stats.layer_counts[0], 200);
        assert_eq!(stats.layer_counts.len(), stats.max_level + 1);
        assert!(stats.layer_counts.windows(2).all(|w| w[0] >= w[1]));
        assert!(!stats.compressed);
    }

    #[test]
    fn test_insert_batch_honours_cancellation() {
        let source = Arc::new(InMemoryVectorSource::new());
        let graph = Graph::new("g", HnswConfig::new(2), source).unwrap();
        let items: Vec<_> = (0..5).map(|i| (i as VectorId, vec![i as f32, 0.0])).collect();
        assert_eq!(graph.insert_batch(&items[..2], &CancellationToken::new()).unwrap(), 2);

        let cancel = CancellationToken::new();
        cancel.cancel();
        assert!(matches!(graph.insert_batch(&items[2..], &cancel), Err(GraphError::Cancelled)));
        assert_eq!(graph.len(), 2);
        graph.validate_structure().unwrap();
    }

    #[test]
    fn test_concurrent_inserts() {
        let vectors = random_vectors(800, 6, 3);
        let source = Arc::new(InMemoryVectorSource::from_vectors(&vectors));
        let graph = Graph::new("g", HnswConfig::new(6).with_max_connections(6), source).unwrap();
        std::thread::scope(|scope| {
            for t in 0..4 {
                let graph = &graph;
                let vectors = &vectors;
                scope.spawn(move || {
                    for id in (t..vectors.len()).step_by(4) {
                        graph.insert(id as VectorId, &vectors[id]).unwrap();
                    }
                });
            }
        });
        assert_eq!(graph.len(), 800);
        graph.validate_structure().unwrap();
    }
}
