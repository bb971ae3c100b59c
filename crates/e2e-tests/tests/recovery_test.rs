//! Crash recovery from snapshot plus commit log on disk.

use pretty_assertions::assert_eq;
use tokio_util::sync::CancellationToken;

use e2e_tests::{random_vectors, TestHarness};
use vector_hnsw::{GraphError, GraphSnapshot, HnswConfig, NodeState};
use vector_pq::PqConfig;
use vector_types::{BlobStore, VectorId};

fn config() -> HnswConfig {
    HnswConfig::new(8).with_max_connections(8).with_ef_construction(48)
}

/// Id, state and layer count of every node, ordered by id.
fn layout(snapshot: &GraphSnapshot) -> Vec<(VectorId, NodeState, usize)> {
    let mut nodes: Vec<_> = snapshot
        .nodes
        .iter()
        .map(|n| (n.id, n.state, n.neighbors.len()))
        .collect();
    nodes.sort_by_key(|n| n.0);
    nodes
}

#[test]
fn test_recovered_graph_matches_original() {
    let vectors = random_vectors(800, 8, 31);
    let harness = TestHarness::with_vectors(&vectors);
    let graph = harness.graph("docs", config());

    for id in 0..400 {
        graph.insert(id, &vectors[id as usize]).unwrap();
    }
    graph.delete(&[3, 17, 250]).unwrap();
    graph.checkpoint().unwrap();

    // Everything below only exists in the commit log
    for id in 400..600 {
        graph.insert(id, &vectors[id as usize]).unwrap();
    }
    graph.cleanup_tombstones(&CancellationToken::new()).unwrap();
    graph.delete(&[5, 450]).unwrap();
    graph
        .compress(&PqConfig::new(4, 32), &CancellationToken::new())
        .unwrap();
    for id in 600..800 {
        graph.insert(id, &vectors[id as usize]).unwrap();
    }
    let expected = graph.snapshot();
    let expected_stats = graph.stats();
    drop(graph);

    let recovered = harness.recover("docs", config()).unwrap();
    recovered.validate_structure().unwrap();
    assert!(recovered.is_compressed());
    assert_eq!(layout(&recovered.snapshot()), layout(&expected));
    let stats = recovered.stats();
    assert_eq!(stats.nodes, expected_stats.nodes);
    assert_eq!(stats.tombstones, 2);
    assert_eq!(stats.layer_counts, expected_stats.layer_counts);
    assert_eq!(recovered.len(), 800 - 5);

    for id in [0 as VectorId, 399, 640] {
        let found = recovered.search(&vectors[id as usize], 1, None).unwrap();
        assert_eq!(found.len(), 1);
    }
}

#[test]
fn test_recover_without_snapshot_replays_whole_log() {
    let vectors = random_vectors(200, 8, 4);
    let harness = TestHarness::with_vectors(&vectors);
    let graph = harness.graph("fresh", config());
    for (id, v) in vectors.iter().enumerate() {
        graph.insert(id as VectorId, v).unwrap();
    }
    graph.delete(&[10]).unwrap();
    let expected = graph.snapshot();
    drop(graph);

    assert!(harness.store.load("fresh.graph").unwrap().is_none());
    let recovered = harness.recover("fresh", config()).unwrap();
    assert_eq!(layout(&recovered.snapshot()), layout(&expected));
    assert_eq!(recovered.pending_ops(), 201);

    // A checkpoint on the recovered graph folds the log into the snapshot
    recovered.checkpoint().unwrap();
    let checkpointed = recovered.snapshot();
    drop(recovered);
    let again = harness.recover("fresh", config()).unwrap();
    assert_eq!(again.snapshot(), checkpointed);
    assert_eq!(again.pending_ops(), 0);
}

#[test]
fn test_vectors_removed_from_source_are_skipped_on_replay() {
    let vectors = random_vectors(100, 8, 9);
    let harness = TestHarness::with_vectors(&vectors);
    let graph = harness.graph("gone", config());
    for (id, v) in vectors.iter().enumerate() {
        graph.insert(id as VectorId, v).unwrap();
    }
    drop(graph);

    harness.source.remove(42);
    let recovered = harness.recover("gone", config()).unwrap();
    assert_eq!(recovered.len(), 99);
    assert!(!recovered.contains(42));
    recovered.validate_structure().unwrap();
}

#[test]
fn test_corrupt_snapshot_is_rejected() {
    let harness = TestHarness::new();
    harness.store.store("broken.graph", b"{not json").unwrap();
    let err = harness.recover("broken", config()).unwrap_err();
    assert!(matches!(err, GraphError::CorruptState(_)));
}
