//! Graph node.
//!
//! A node owns one neighbor list per layer it lives on, each behind its own
//! lock. Callers never hold two node locks at once.

use std::sync::atomic::{AtomicU8, Ordering};

use parking_lot::{RwLock, RwLockWriteGuard};
use serde::{Deserialize, Serialize};
use vector_types::VectorId;

/// Visibility of a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeState {
    Live,
    /// Deleted, still linked until the next cleanup pass
    Tombstoned,
}

impl NodeState {
    fn from_u8(v: u8) -> Self {
        if v == 0 {
            NodeState::Live
        } else {
            NodeState::Tombstoned
        }
    }

    fn as_u8(self) -> u8 {
        match self {
            NodeState::Live => 0,
            NodeState::Tombstoned => 1,
        }
    }
}

#[derive(Debug)]
pub struct Node {
    pub id: VectorId,
    layers: Vec<RwLock<Vec<VectorId>>>,
    state: AtomicU8,
}

impl Node {
    pub fn new(id: VectorId, level: usize) -> Self {
        Self {
            id,
            layers: (0..=level).map(|_| RwLock::new(Vec::new())).collect(),
            state: AtomicU8::new(NodeState::Live.as_u8()),
        }
    }

    pub(crate) fn from_parts(id: VectorId, neighbors: Vec<Vec<VectorId>>, state: NodeState) -> Self {
        Self {
            id,
            layers: neighbors.into_iter().map(RwLock::new).collect(),
            state: AtomicU8::new(state.as_u8()),
        }
    }

    /// Highest layer this node lives on.
    pub fn level(&self) -> usize {
        self.layers.len() - 1
    }

    pub fn state(&self) -> NodeState {
        NodeState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub fn is_tombstoned(&self) -> bool {
        self.state() == NodeState::Tombstoned
    }

    /// Flip to tombstoned. Returns false if it already was.
    pub fn tombstone(&self) -> bool {
        self.state
            .compare_exchange(
                NodeState::Live.as_u8(),
                NodeState::Tombstoned.as_u8(),
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }

    /// Copy of the neighbor list at `layer`; empty above the node's level.
    pub fn neighbors(&self, layer: usize) -> Vec<VectorId> {
        self.layers
            .get(layer)
            .map(|l| l.read().clone())
            .unwrap_or_default()
    }

    pub fn set_neighbors(&self, layer: usize, neighbors: Vec<VectorId>) {
        if let Some(l) = self.layers.get(layer) {
            *l.write() = neighbors;
        }
    }

    pub(crate) fn layer_mut(&self, layer: usize) -> Option<RwLockWriteGuard<'_, Vec<VectorId>>> {
        self.layers.get(layer).map(|l| l.write())
    }
}
