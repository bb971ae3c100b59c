//! # vector-cycle
//!
//! Periodic maintenance for vector index shards.
//!
//! Background work (compaction, flush, commit logging, tombstone cleanup)
//! is registered as callbacks in named groups instead of each structure
//! spawning its own task. Groups nest, and a [`CycleManager`] ticks the
//! root of each tree on its own cadence.
//!
//! ## Usage
//!
//! ```rust
//! use std::time::Duration;
//! use vector_cycle::{boxed_callback, CycleCallbackCtrl, CycleCallbackGroup, ShouldAbort};
//!
//! let rt = tokio::runtime::Runtime::new().unwrap();
//! rt.block_on(async {
//!     let group = CycleCallbackGroup::new("flush", 1);
//!     let ctrl = group
//!         .register("shard-a", true, boxed_callback(|_| async { true }))
//!         .unwrap();
//!
//!     assert!(group.cycle_callback(ShouldAbort::never()).await);
//!     ctrl.deactivate(Duration::from_secs(1)).await.unwrap();
//!     assert!(!group.cycle_callback(ShouldAbort::never()).await);
//! });
//! ```

pub mod callbacks;
pub mod ctrl;
pub mod error;
pub mod manager;
pub mod overlap;
pub mod registry;

pub use callbacks::{boxed_callback, CallbackCtrl, CycleCallback, CycleCallbackGroup, ShouldAbort};
pub use ctrl::{CombinedCtrl, CycleCallbackCtrl};
pub use error::CycleError;
pub use manager::{CycleManager, CycleTicker};
pub use overlap::{OverlapGuard, RunGuard};
pub use registry::{CallbackStatus, CycleRegistry, RunOutcome};
