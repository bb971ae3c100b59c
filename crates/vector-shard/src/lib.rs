//! # vector-shard
//!
//! Binds vector indexes to the maintenance cycle hierarchy.
//!
//! One [`IndexCycleCallbacks`] per process owns the top-level groups and
//! their managers. Stores and shards register their own groups beneath
//! them with ids derived from where their data lives, and a
//! [`VectorShard`] registers its graph's tombstone cleanup, commit-log
//! checkpoint and compression check inside its shard's groups.

pub mod callbacks;
pub mod cycle_id;
pub mod error;
pub mod shard;

pub use callbacks::{IndexCycleCallbacks, ShardCycleCallbacks, StoreCycleCallbacks};
pub use error::ShardError;
pub use shard::{VectorShard, COMPRESSION_CALLBACK, HNSW_CALLBACK};
