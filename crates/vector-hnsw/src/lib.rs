//! # vector-hnsw
//!
//! Hierarchical navigable small world graph for approximate nearest
//! neighbor search.
//!
//! ## Features
//! - Concurrent inserts with per-node neighbor locks
//! - Searches that never block on inserts
//! - Two-phase delete: tombstones hide nodes at once, a cleanup pass
//!   unlinks and frees them later
//! - One-way switch to product-quantized distances
//! - JSON snapshots plus commit-log replay for crash recovery
//!
//! ## Usage
//!
//! ```rust
//! use std::sync::Arc;
//! use vector_hnsw::{Graph, HnswConfig};
//! use vector_types::InMemoryVectorSource;
//!
//! let source = Arc::new(InMemoryVectorSource::new());
//! let graph = Graph::new("docs", HnswConfig::new(2), source).unwrap();
//! graph.insert(1, &[0.0, 1.0]).unwrap();
//! graph.insert(2, &[1.0, 0.0]).unwrap();
//!
//! let hits = graph.search(&[0.1, 0.9], 1, None).unwrap();
//! assert_eq!(hits[0].0, 1);
//! ```

pub mod compress;
pub mod config;
pub mod delete;
pub mod error;
pub mod graph;
pub mod node;
pub mod search;
pub mod snapshot;

pub use config::{HnswConfig, DEFAULT_MAX_ID, MAX_NODE_ID};
pub use delete::CleanupStats;
pub use error::GraphError;
pub use graph::{Graph, GraphStats};
pub use node::{Node, NodeState};
pub use search::Filter;
pub use snapshot::{GraphSnapshot, NodeSnapshot, ReplayStats};
