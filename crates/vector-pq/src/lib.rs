//! # vector-pq
//!
//! Product quantization for the vector index.
//!
//! A vector of `d` dimensions is split into `segments` contiguous
//! sub-vectors. Each segment gets its own codebook of up to 256 centroids,
//! trained with Lloyd's k-means, and a vector is stored as one `u8` code per
//! segment.
//!
//! ```text
//! Vector [f32; 20] -> 20 segments of 1 float
//!                  -> nearest centroid per segment
//! Code   [u8; 20]
//! ```
//!
//! Distances are computed asymmetrically: once per query, the distance from
//! each query segment to every centroid is tabulated, after which the
//! distance to any code is a sum of table lookups.

pub mod error;
pub mod kmeans;
pub mod persist;
pub mod quantizer;

pub use error::PqError;
pub use kmeans::{KMeans, Seeding};
pub use quantizer::{Codebook, DistanceLookupTable, PqConfig, ProductQuantizer};
