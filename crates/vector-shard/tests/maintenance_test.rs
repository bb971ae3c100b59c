//! Managers driving a shard's maintenance while writers keep going.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use vector_cycle::CycleCallbackCtrl;
use vector_hnsw::{Graph, HnswConfig};
use vector_shard::{IndexCycleCallbacks, ShardCycleCallbacks, StoreCycleCallbacks, VectorShard};
use vector_types::{CycleSettings, InMemoryCommitLog, InMemoryVectorSource, PqSettings, VectorId};

fn random_vectors(n: usize, dims: usize, seed: u64) -> Vec<Vec<f32>> {
    let mut rng = StdRng::seed_from_u64(seed);
    (0..n)
        .map(|_| (0..dims).map(|_| rng.gen::<f32>()).collect())
        .collect()
}

fn fast_cycles() -> CycleSettings {
    CycleSettings {
        tombstone_cleanup_interval_ms: 20,
        commit_log_interval_ms: 20,
        compaction_interval_ms: 20,
        flush_interval_ms: 20,
        routines_limit: 2,
        stop_timeout_ms: 10_000,
    }
}

async fn wait_until(what: &str, check: impl Fn() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(10);
    while !check() {
        assert!(Instant::now() < deadline, "timed out waiting for {what}");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn managers_clean_checkpoint_and_compress() {
    let vectors = random_vectors(600, 8, 21);
    let source = Arc::new(InMemoryVectorSource::from_vectors(&vectors));
    let log = Arc::new(InMemoryCommitLog::new());
    let graph = Arc::new(
        Graph::new("articles", HnswConfig::new(8).with_max_connections(8), source)
            .unwrap()
            .with_commit_log(log.clone()),
    );

    let index = IndexCycleCallbacks::new(&fast_cycles());
    let root = PathBuf::from("/var/lib/vectors");
    let store = StoreCycleCallbacks::init(&root.join("articles/s1/lsm"), &root, &index).await.unwrap();
    let callbacks = ShardCycleCallbacks::init("articles", "s1", &index).await.unwrap();
    let pq = PqSettings {
        auto_compress_threshold: 500,
        segments: 4,
        centroids: 32,
        ..PqSettings::default()
    };
    let shard = VectorShard::new(Arc::clone(&graph), &callbacks, pq).await.unwrap();
    index.start().unwrap();

    let writer = {
        let graph = Arc::clone(&graph);
        let vectors = vectors.clone();
        tokio::task::spawn_blocking(move || {
            for (id, v) in vectors.iter().enumerate() {
                graph.insert(id as VectorId, v).unwrap();
                if id % 50 == 49 {
                    graph.delete(&[id as VectorId - 10]).unwrap();
                }
            }
        })
    };
    writer.await.unwrap();

    // Live count reaches the threshold, so the compaction cycle compresses
    wait_until("compression", || graph.is_compressed()).await;
    wait_until("tombstone cleanup", || graph.stats().tombstones == 0).await;
    wait_until("checkpoint", || graph.pending_ops() == 0).await;
    assert!(log.is_empty());
    assert!(callbacks.vector_ctrl().is_active());

    graph.validate_structure().unwrap();
    assert_eq!(graph.len(), 600 - 12);
    let found = graph.search_with_ef(&vectors[0], 10, 64, None).unwrap();
    assert_eq!(found.len(), 10);

    let status = callbacks
        .vector_tombstone_cleanup()
        .registry()
        .get_status(vector_shard::HNSW_CALLBACK)
        .unwrap();
    assert!(status.run_count >= 1);
    assert_eq!(status.error_count, 0);

    shard.shutdown().await.unwrap();
    callbacks.shutdown().await.unwrap();
    store.shutdown(Duration::from_secs(1)).await.unwrap();
    index.stop().await.unwrap();
    assert!(index.vector_commit_logger().callback_ids().is_empty());
}
