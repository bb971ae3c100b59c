//! # vector-types
//!
//! Shared domain types for the vector index workspace.
//!
//! This crate defines the pieces every other crate agrees on:
//! - Distance providers (squared L2, dot product, cosine)
//! - The external collaborators the index consumes: a vector source,
//!   an opaque blob store and an append-only commit log
//! - Layered `Settings` for index, quantizer and maintenance cycles
//!
//! ## Usage
//!
//! ```rust
//! use vector_types::{DistanceProvider, L2Squared};
//!
//! let d = L2Squared.distance(&[0.0, 0.0], &[3.0, 4.0]);
//! assert_eq!(d, 25.0);
//! ```

pub mod commit_log;
pub mod config;
pub mod distance;
pub mod error;
pub mod source;
pub mod store;

pub use commit_log::{CommitLog, CommitOp, FileCommitLog, InMemoryCommitLog, NoopCommitLog};
pub use config::{CycleSettings, IndexSettings, PqSettings, Settings};
pub use distance::{normalize, Cosine, DistanceKind, DistanceProvider, Dot, L2Squared};
pub use error::{ConfigError, SourceError, StoreError};
pub use source::{InMemoryVectorSource, VectorSource};
pub use store::{BlobStore, FsBlobStore, MemoryBlobStore};

/// External identifier of a vector. Doubles as the graph arena index.
pub type VectorId = u64;
