//! End-to-end test infrastructure for the vector index.
//!
//! Provides a shared TestHarness backed by a temp directory plus helpers
//! for synthetic data, parallel builds and brute-force ground truth.

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use vector_hnsw::{Graph, GraphError, HnswConfig};
use vector_types::{
    DistanceProvider, FileCommitLog, FsBlobStore, InMemoryVectorSource, VectorId,
};

/// Shared test harness for E2E tests.
///
/// Owns a temp directory holding the blob store and commit log, and the
/// in-memory vector source every graph built from it reads from.
pub struct TestHarness {
    /// Keeps temp dir alive for the lifetime of the harness
    pub _temp_dir: tempfile::TempDir,
    pub data_path: PathBuf,
    pub store: Arc<FsBlobStore>,
    pub source: Arc<InMemoryVectorSource>,
}

impl TestHarness {
    /// Create a harness with an empty source.
    pub fn new() -> Self {
        let temp_dir = tempfile::TempDir::new().expect("Failed to create temp dir");
        let data_path = temp_dir.path().join("data");
        let store = Arc::new(FsBlobStore::open(&data_path).expect("Failed to open blob store"));

        Self {
            _temp_dir: temp_dir,
            data_path,
            store,
            source: Arc::new(InMemoryVectorSource::new()),
        }
    }

    /// Create a harness whose source serves `vectors` under ids 0..n.
    pub fn with_vectors(vectors: &[Vec<f32>]) -> Self {
        let mut harness = Self::new();
        harness.source = Arc::new(InMemoryVectorSource::from_vectors(vectors));
        harness
    }

    /// Commit log file for graph `name`. Reopening appends to the same file.
    pub fn commit_log(&self, name: &str) -> Arc<FileCommitLog> {
        Arc::new(
            FileCommitLog::open(self.data_path.join(format!("{name}.log")))
                .expect("Failed to open commit log"),
        )
    }

    /// Empty graph wired to the harness store and a file commit log.
    pub fn graph(&self, name: &str, config: HnswConfig) -> Graph {
        Graph::new(name, config, self.source.clone())
            .expect("Failed to create graph")
            .with_store(self.store.clone())
            .with_commit_log(self.commit_log(name))
    }

    /// Rebuild graph `name` from its snapshot and commit log.
    pub fn recover(&self, name: &str, config: HnswConfig) -> Result<Graph, GraphError> {
        Graph::recover(
            name,
            config,
            self.source.clone(),
            self.store.clone(),
            self.commit_log(name),
        )
    }
}

impl Default for TestHarness {
    fn default() -> Self {
        Self::new()
    }
}

/// `n` vectors with components uniform in [0, 1).
pub fn random_vectors(n: usize, dims: usize, seed: u64) -> Vec<Vec<f32>> {
    let mut rng = StdRng::seed_from_u64(seed);
    (0..n)
        .map(|_| (0..dims).map(|_| rng.gen::<f32>()).collect())
        .collect()
}

/// Insert `vectors` under ids 0..n from `threads` threads.
pub fn insert_parallel(graph: &Graph, vectors: &[Vec<f32>], threads: usize) -> Result<(), GraphError> {
    let threads = threads.max(1);
    std::thread::scope(|scope| {
        let handles: Vec<_> = (0..threads)
            .map(|t| {
                scope.spawn(move || {
                    for id in (t..vectors.len()).step_by(threads) {
                        graph.insert(id as VectorId, &vectors[id])?;
                    }
                    Ok::<(), GraphError>(())
                })
            })
            .collect();
        handles
            .into_iter()
            .map(|h| h.join().expect("insert thread panicked"))
            .collect()
    })
}

/// Exact k nearest ids, skipping `excluded`.
pub fn brute_force(
    distance: &dyn DistanceProvider,
    vectors: &[Vec<f32>],
    query: &[f32],
    k: usize,
    excluded: &HashSet<VectorId>,
) -> Vec<VectorId> {
    let mut all: Vec<(f32, VectorId)> = vectors
        .iter()
        .enumerate()
        .map(|(id, v)| (distance.distance(query, v), id as VectorId))
        .filter(|(_, id)| !excluded.contains(id))
        .collect();
    all.sort_by(|a, b| a.0.total_cmp(&b.0).then(a.1.cmp(&b.1)));
    all.into_iter().take(k).map(|(_, id)| id).collect()
}

/// Fraction of `expected` present in `found`.
pub fn recall(found: &[(VectorId, f32)], expected: &[VectorId]) -> f64 {
    if expected.is_empty() {
        return 1.0;
    }
    let expected: HashSet<_> = expected.iter().collect();
    let hits = found.iter().filter(|(id, _)| expected.contains(id)).count();
    hits as f64 / expected.len() as f64
}
