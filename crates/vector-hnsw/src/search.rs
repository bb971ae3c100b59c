//! Layer search, neighbor selection and the public query API.

use std::cmp::{Ordering, Reverse};
use std::collections::{BinaryHeap, HashSet};

use tokio_util::sync::CancellationToken;
use tracing::trace;
use vector_types::VectorId;

use crate::error::GraphError;
use crate::graph::{Graph, Mode, QueryDistance};
use crate::node::Node;

/// Allow-list predicate applied to search results.
pub type Filter<'a> = &'a (dyn Fn(VectorId) -> bool + Sync);

/// How often a cancellable search checks its token, in expansions.
const CANCEL_CHECK_INTERVAL: usize = 64;

/// An id with its distance. Orders by distance, then id.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Scored {
    pub id: VectorId,
    pub distance: f32,
}

impl PartialEq for Scored {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Scored {}

impl Ord for Scored {
    fn cmp(&self, other: &Self) -> Ordering {
        self.distance
            .total_cmp(&other.distance)
            .then(self.id.cmp(&other.id))
    }
}

impl PartialOrd for Scored {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Graph {
    /// Best-first search on one layer.
    ///
    /// Every reachable node is traversed, but only nodes passing `accept`
    /// enter the result set. Returns up to `ef` accepted nodes, closest first.
    pub(crate) fn search_layer(
        &self,
        query: &QueryDistance,
        entry_points: &[Scored],
        ef: usize,
        layer: usize,
        accept: &dyn Fn(&Node) -> bool,
        cancel: Option<&CancellationToken>,
    ) -> Result<Vec<Scored>, GraphError> {
        let mut visited: HashSet<VectorId> = HashSet::with_capacity(ef * 4);
        let mut candidates: BinaryHeap<Reverse<Scored>> = BinaryHeap::with_capacity(ef);
        let mut results: BinaryHeap<Scored> = BinaryHeap::with_capacity(ef + 1);

        for &ep in entry_points {
            if !visited.insert(ep.id) {
                continue;
            }
            candidates.push(Reverse(ep));
            if self.node(ep.id).is_some_and(|n| accept(&n)) {
                results.push(ep);
                if results.len() > ef {
                    results.pop();
                }
            }
        }

        let mut expanded = 0usize;
        while let Some(Reverse(current)) = candidates.pop() {
            if results.len() >= ef && results.peek().is_some_and(|worst| current > *worst) {
                break;
            }
            expanded += 1;
            if let Some(cancel) = cancel {
                if expanded % CANCEL_CHECK_INTERVAL == 0 && cancel.is_cancelled() {
                    return Err(GraphError::Cancelled);
                }
            }

            let Some(node) = self.node(current.id) else {
                continue;
            };
            for neighbor in node.neighbors(layer) {
                if !visited.insert(neighbor) {
                    continue;
                }
                // Freed by a cleanup pass or not on this layer
                let Some(neighbor_node) = self.node(neighbor) else {
                    continue;
                };
                if neighbor_node.level() < layer {
                    continue;
                }
                let distance = match self.query_distance(query, neighbor) {
                    Ok(d) => d,
                    Err(GraphError::NotFound(_)) if neighbor_node.is_tombstoned() => continue,
                    Err(e) => return Err(e),
                };
                let scored = Scored {
                    id: neighbor,
                    distance,
                };
                if results.len() >= ef && results.peek().is_some_and(|worst| scored > *worst) {
                    continue;
                }
                candidates.push(Reverse(scored));
                if accept(&neighbor_node) {
                    results.push(scored);
                    if results.len() > ef {
                        results.pop();
                    }
                }
            }
        }

        Ok(results.into_sorted_vec())
    }

    /// Diversity heuristic: a candidate is kept only if it is closer to the
    /// target than to every neighbor kept so far. Short lists are topped up
    /// with the closest rejected candidates.
    pub(crate) fn select_neighbors(
        &self,
        mode: &Mode,
        candidates: &[Scored],
        m: usize,
    ) -> Result<Vec<Scored>, GraphError> {
        let mut sorted = candidates.to_vec();
        sorted.sort();
        sorted.dedup_by_key(|s| s.id);
        if sorted.len() <= m {
            return Ok(sorted);
        }

        let mut selected = Vec::with_capacity(m);
        let mut rejected = Vec::new();
        for candidate in sorted {
            if selected.len() >= m {
                break;
            }
            let payload = self.payload(mode, candidate.id)?;
            let diverse = selected
                .iter()
                .all(|(_, kept)| self.between(mode, &payload, kept) >= candidate.distance);
            if diverse {
                selected.push((candidate, payload));
            } else {
                rejected.push(candidate);
            }
        }

        let mut out: Vec<Scored> = selected.into_iter().map(|(s, _)| s).collect();
        let missing = m.saturating_sub(out.len());
        out.extend(rejected.into_iter().take(missing));
        out.sort();
        Ok(out)
    }

    /// Up to `k` nearest live ids, using the configured `ef`.
    ///
    /// Results are ordered by ascending distance, ties by ascending id.
    pub fn search(
        &self,
        query: &[f32],
        k: usize,
        filter: Option<Filter<'_>>,
    ) -> Result<Vec<(VectorId, f32)>, GraphError> {
        self.search_inner(query, k, self.config.ef, filter, None)
    }

    /// Like [`search`](Self::search) with an explicit `ef`, raised to `k` when smaller.
    pub fn search_with_ef(
        &self,
        query: &[f32],
        k: usize,
        ef: usize,
        filter: Option<Filter<'_>>,
    ) -> Result<Vec<(VectorId, f32)>, GraphError> {
        self.search_inner(query, k, ef, filter, None)
    }

    pub fn search_cancellable(
        &self,
        query: &[f32],
        k: usize,
        ef: usize,
        filter: Option<Filter<'_>>,
        cancel: &CancellationToken,
    ) -> Result<Vec<(VectorId, f32)>, GraphError> {
        self.search_inner(query, k, ef, filter, Some(cancel))
    }

    fn search_inner(
        &self,
        query: &[f32],
        k: usize,
        ef: usize,
        filter: Option<Filter<'_>>,
        cancel: Option<&CancellationToken>,
    ) -> Result<Vec<(VectorId, f32)>, GraphError> {
        let query = self.prepare(query)?;
        if k == 0 {
            return Ok(Vec::new());
        }
        let entry = *self.entry.read();
        let Some(entry_id) = entry.id else {
            return Ok(Vec::new());
        };

        let mode = self.mode();
        let query = self.query(&mode, &query)?;
        let ef = ef.max(k);

        let mut entry_points = vec![Scored {
            id: entry_id,
            distance: self.query_distance(&query, entry_id)?,
        }];
        for layer in (1..=entry.level).rev() {
            let closest =
                self.search_layer(&query, &entry_points, 1, layer, &|_: &Node| true, cancel)?;
            if !closest.is_empty() {
                entry_points = closest;
            }
        }

        let accept = |n: &Node| !n.is_tombstoned() && filter.map_or(true, |f| f(n.id));
        let mut found = self.search_layer(&query, &entry_points, ef, 0, &accept, cancel)?;
        found.truncate(k);

        trace!(graph = %self.name, k, ef, returned = found.len(), "Search complete");
        Ok(found.into_iter().map(|s| (s.id, s.distance)).collect())
    }
}
