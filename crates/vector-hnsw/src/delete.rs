//! Two-phase delete: tombstone now, unlink and free in a cleanup pass.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Instant;

use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};
use vector_types::{CommitOp, VectorId};

use crate::error::GraphError;
use crate::graph::{EntryPoint, Graph, Mode};
use crate::node::Node;
use crate::search::Scored;

/// Outcome of a cleanup pass.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CleanupStats {
    /// Tombstoned nodes freed
    pub removed: usize,
    /// Neighbor lists rebuilt around removed nodes
    pub repaired_lists: usize,
    /// References to removed nodes dropped by the final sweep
    pub swept_references: usize,
    pub duration_ms: u64,
}

impl Graph {
    /// Tombstone `ids`. They disappear from searches immediately; unknown
    /// and already deleted ids are ignored. Returns how many were flipped.
    pub fn delete(&self, ids: &[VectorId]) -> Result<usize, GraphError> {
        self.delete_inner(ids, true)
    }

    pub(crate) fn delete_inner(&self, ids: &[VectorId], log: bool) -> Result<usize, GraphError> {
        let _structure = self.structure.read();

        let mut seen = HashSet::with_capacity(ids.len());
        let targets: Vec<Arc<Node>> = ids
            .iter()
            .filter(|id| seen.insert(**id))
            .filter_map(|&id| self.node(id))
            .filter(|n| !n.is_tombstoned())
            .collect();
        if targets.is_empty() {
            return Ok(0);
        }

        if log {
            self.log_op(CommitOp::Delete {
                ids: targets.iter().map(|n| n.id).collect(),
            })?;
        }
        let flipped = targets.iter().filter(|n| n.tombstone()).count();
        self.repair_entry_point();

        debug!(graph = %self.name, requested = ids.len(), flipped, "Tombstoned nodes");
        Ok(flipped)
    }

    /// Move the entry point off a tombstoned node: a live neighbor on the
    /// top layer if one exists, otherwise the live node with the highest level.
    pub(crate) fn repair_entry_point(&self) {
        loop {
            let current = *self.entry.read();
            let Some(entry_id) = current.id else {
                return;
            };
            let entry_node = self.node(entry_id);
            if entry_node.as_ref().is_some_and(|n| !n.is_tombstoned()) {
                return;
            }

            let replacement = entry_node
                .and_then(|n| {
                    n.neighbors(current.level)
                        .into_iter()
                        .filter_map(|id| self.node(id))
                        .find(|n| !n.is_tombstoned() && n.level() >= current.level)
                })
                .or_else(|| self.highest_live_node())
                .map(|n| EntryPoint {
                    id: Some(n.id),
                    level: n.level(),
                })
                .unwrap_or_default();

            let mut entry = self.entry.write();
            if *entry != current {
                // Moved concurrently; check the new one
                continue;
            }
            *entry = replacement;
            debug!(graph = %self.name, old = entry_id, new = ?replacement.id, "Replaced tombstoned entry point");
        }
    }

    fn highest_live_node(&self) -> Option<Arc<Node>> {
        self.all_nodes()
            .into_iter()
            .filter(|n| !n.is_tombstoned())
            // Last maximum wins, so walk ids backwards to prefer the lowest
            .rev()
            .max_by_key(|n| n.level())
    }

    /// Physically remove every tombstoned node.
    ///
    /// Neighbor lists pointing at removed nodes are rebuilt while inserts
    /// and searches continue. A short exclusive phase then drops references
    /// that appeared concurrently and frees the arena slots. Cancellation
    /// is honoured between nodes during the repair phase.
    pub fn cleanup_tombstones(&self, cancel: &CancellationToken) -> Result<CleanupStats, GraphError> {
        let _pass = self.maintenance.lock();
        let deleted: HashSet<VectorId> = self
            .all_nodes()
            .iter()
            .filter(|n| n.is_tombstoned())
            .map(|n| n.id)
            .collect();
        self.cleanup_ids(deleted, cancel, true)
    }

    /// Remove the given tombstoned ids. Caller holds `maintenance`.
    pub(crate) fn cleanup_ids(
        &self,
        deleted: HashSet<VectorId>,
        cancel: &CancellationToken,
        log: bool,
    ) -> Result<CleanupStats, GraphError> {
        let mut stats = CleanupStats::default();
        if deleted.is_empty() {
            return Ok(stats);
        }
        let started = Instant::now();
        let mode = self.mode();

        for node in self.all_nodes() {
            if deleted.contains(&node.id) {
                continue;
            }
            if cancel.is_cancelled() {
                info!(graph = %self.name, repaired = stats.repaired_lists, "Tombstone cleanup cancelled");
                return Err(GraphError::Cancelled);
            }
            for layer in 0..=node.level() {
                if self.repair_list(&mode, &node, layer, &deleted)? {
                    stats.repaired_lists += 1;
                }
            }
        }

        {
            let _structure = self.structure.write();
            for node in self.all_nodes() {
                if deleted.contains(&node.id) {
                    continue;
                }
                for layer in 0..=node.level() {
                    if let Some(mut list) = node.layer_mut(layer) {
                        let before = list.len();
                        list.retain(|id| !deleted.contains(id));
                        stats.swept_references += before - list.len();
                    }
                }
            }
            self.repair_entry_point();

            {
                let mut nodes = self.nodes.write();
                for &id in &deleted {
                    if let Some(slot) = nodes.get_mut(id as usize) {
                        *slot = None;
                    }
                }
            }
            for id in &deleted {
                self.cache.remove(id);
                self.codes.remove(id);
            }

            if log {
                let mut ids: Vec<VectorId> = deleted.iter().copied().collect();
                ids.sort_unstable();
                self.log_op(CommitOp::Cleanup { ids })?;
            }
        }

        stats.removed = deleted.len();
        stats.duration_ms = started.elapsed().as_millis() as u64;
        info!(
            graph = %self.name,
            removed = stats.removed,
            repaired = stats.repaired_lists,
            swept = stats.swept_references,
            duration_ms = stats.duration_ms,
            "Tombstone cleanup complete"
        );
        Ok(stats)
    }

    /// Rebuild `node`'s list at `layer` if it references a deleted id.
    ///
    /// Candidates are the surviving neighbors plus the live neighbors of the
    /// removed ones, re-selected with the diversity heuristic.
    fn repair_list(
        &self,
        mode: &Mode,
        node: &Node,
        layer: usize,
        deleted: &HashSet<VectorId>,
    ) -> Result<bool, GraphError> {
        let current = node.neighbors(layer);
        if !current.iter().any(|id| deleted.contains(id)) {
            return Ok(false);
        }

        let mut candidates: HashSet<VectorId> = current
            .iter()
            .copied()
            .filter(|id| !deleted.contains(id))
            .collect();
        for removed in current.iter().filter(|id| deleted.contains(id)) {
            let Some(removed_node) = self.node(*removed) else {
                continue;
            };
            for id in removed_node.neighbors(layer) {
                if id == node.id || deleted.contains(&id) {
                    continue;
                }
                if self
                    .node(id)
                    .is_some_and(|n| !n.is_tombstoned() && n.level() >= layer)
                {
                    candidates.insert(id);
                }
            }
        }

        let origin = self.payload(mode, node.id)?;
        let mut scored = Vec::with_capacity(candidates.len());
        for id in candidates {
            let payload = self.payload(mode, id)?;
            scored.push(Scored {
                id,
                distance: self.between(mode, &origin, &payload),
            });
        }
        let cap = self.config.max_connections_for(layer);
        let selected = self.select_neighbors(mode, &scored, cap)?;

        let Some(mut list) = node.layer_mut(layer) else {
            return Ok(false);
        };
        // Keep links added by inserts since `current` was read
        let mut merged: Vec<VectorId> = list
            .iter()
            .copied()
            .filter(|id| !current.contains(id) && !deleted.contains(id))
            .collect();
        for s in selected {
            if !merged.contains(&s.id) {
                merged.push(s.id);
            }
        }
        merged.truncate(cap);
        *list = merged;
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::HnswConfig;
    use crate::graph::tests::build_graph;
    use pretty_assertions::assert_eq;
    use vector_types::VectorSource;

    fn assert_no_references(graph: &Graph, deleted: &HashSet<VectorId>) {
        for node in graph.all_nodes() {
            assert!(!deleted.contains(&node.id));
            for layer in 0..=node.level() {
                let list = node.neighbors(layer);
                assert!(list.iter().all(|id| !deleted.contains(id)), "node {} layer {layer}", node.id);
                assert!(list.len() <= graph.config().max_connections_for(layer));
            }
        }
    }

    #[test]
    fn test_deleted_ids_never_returned() {
        let (graph, _, vectors) = build_graph(500, 6, HnswConfig::new(6).with_max_connections(8));
        let deleted: Vec<VectorId> = (0..500).step_by(3).collect();
        assert_eq!(graph.delete(&deleted).unwrap(), deleted.len());

        let deleted: HashSet<_> = deleted.into_iter().collect();
        for v in vectors.iter().take(50) {
            let found = graph.search_with_ef(v, 30, 64, None).unwrap();
            assert_eq!(found.len(), 30);
            assert!(found.iter().all(|(id, _)| !deleted.contains(id)));
        }
    }

    #[test]
    fn test_delete_is_idempotent_and_ignores_unknown() {
        let (graph, _, _) = build_graph(20, 3, HnswConfig::new(3));
        assert_eq!(graph.delete(&[1, 1, 2, 999]).unwrap(), 2);
        assert_eq!(graph.delete(&[1, 2]).unwrap(), 0);
        assert_eq!(graph.stats().tombstones, 2);
        assert_eq!(graph.len(), 18);
    }

    #[test]
    fn test_deleting_entry_point_picks_live_replacement() {
        let (graph, _, vectors) = build_graph(200, 4, HnswConfig::new(4).with_max_connections(4));
        for _ in 0..20 {
            let entry = graph.entry_point().unwrap();
            graph.delete(&[entry]).unwrap();
            let new_entry = graph.entry_point().unwrap();
            assert!(graph.contains(new_entry));
            let top_live = graph
                .all_nodes()
                .iter()
                .filter(|n| !n.is_tombstoned())
                .map(|n| n.level())
                .max()
                .unwrap();
            assert_eq!(graph.node(new_entry).unwrap().level(), top_live);
        }
        assert_eq!(graph.search(&vectors[0], 10, None).unwrap().len(), 10);
    }

    #[test]
    fn test_deleting_everything_clears_entry_point() {
        let (graph, _, _) = build_graph(10, 2, HnswConfig::new(2));
        graph.delete(&(0..10).collect::<Vec<_>>()).unwrap();
        assert_eq!(graph.entry_point(), None);
        assert!(graph.search(&[0.5, 0.5], 3, None).unwrap().is_empty());

        graph.cleanup_tombstones(&CancellationToken::new()).unwrap();
        assert_eq!(graph.stats().nodes, 0);
        graph.insert(3, &[0.1, 0.1]).unwrap();
        assert_eq!(graph.entry_point(), Some(3));
    }

    #[test]
    fn test_cleanup_removes_all_references() {
        let (graph, source, vectors) = build_graph(600, 6, HnswConfig::new(6).with_max_connections(6));
        let deleted: Vec<VectorId> = (0..600).filter(|id| id % 4 == 1).collect();
        graph.delete(&deleted).unwrap();
        let deleted: HashSet<_> = deleted.into_iter().collect();

        // Vectors of deleted ids may already be gone from the source
        for id in &deleted {
            source.remove(*id);
        }

        let stats = graph.cleanup_tombstones(&CancellationToken::new()).unwrap();
        assert_eq!(stats.removed, deleted.len());
        assert!(stats.repaired_lists > 0);
        assert_no_references(&graph, &deleted);
        graph.validate_structure().unwrap();

        let stats = graph.stats();
        assert_eq!(stats.nodes, 450);
        assert_eq!(stats.tombstones, 0);

        // Search quality survives the repair
        for (id, v) in vectors.iter().enumerate().filter(|(id, _)| id % 4 != 1).take(30) {
            let found = graph.search_with_ef(v, 1, 128, None).unwrap();
            assert_eq!(found[0].0, id as VectorId);
        }

        // Freed slots can be reused
        graph.insert(1, &vectors[1]).unwrap();
        assert!(graph.contains(1));
    }

    #[test]
    fn test_cleanup_missing_live_vector_is_not_found() {
        let (graph, source, _) = build_graph(100, 3, HnswConfig::new(3).with_max_connections(4));
        graph.delete(&[5]).unwrap();
        // Force refetches from the source, then lose a live vector
        graph.cache.clear();
        let live = graph
            .all_nodes()
            .into_iter()
            .find(|n| n.neighbors(0).contains(&5))
            .unwrap()
            .id;
        source.remove(live);
        assert!(source.fetch_vector(live).is_err());

        let result = graph.cleanup_tombstones(&CancellationToken::new());
        assert!(matches!(result, Err(GraphError::NotFound(id)) if id == live));
    }

    #[test]
    fn test_cancelled_cleanup_leaves_valid_graph() {
        let (graph, _, _) = build_graph(100, 3, HnswConfig::new(3));
        graph.delete(&[1, 2, 3]).unwrap();
        let cancel = CancellationToken::new();
        cancel.cancel();
        assert!(matches!(graph.cleanup_tombstones(&cancel), Err(GraphError::Cancelled)));
        graph.validate_structure().unwrap();
        assert_eq!(graph.stats().tombstones, 3);
    }

    #[test]
    fn test_concurrent_inserts_during_cleanup() {
        let (graph, _, vectors) = build_graph(400, 4, HnswConfig::new(4).with_max_connections(6));
        let extra = crate::graph::tests::random_vectors(200, 4, 8);
        let deleted: Vec<VectorId> = (0..400).step_by(2).collect();
        graph.delete(&deleted).unwrap();

        std::thread::scope(|scope| {
            scope.spawn(|| {
                for (i, v) in extra.iter().enumerate() {
                    graph.insert(1000 + i as VectorId, v).unwrap();
                }
            });
            scope.spawn(|| {
                graph.cleanup_tombstones(&CancellationToken::new()).unwrap();
            });
        });
        // Anything tombstoned after the pass started is handled by the next one
        graph.cleanup_tombstones(&CancellationToken::new()).unwrap();

        let deleted: HashSet<_> = deleted.into_iter().collect();
        assert_no_references(&graph, &deleted);
        graph.validate_structure().unwrap();
        assert_eq!(graph.len(), 400);
        assert_eq!(graph.search(&vectors[1], 5, None).unwrap().len(), 5);
    }
}
