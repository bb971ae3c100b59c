//! Lloyd's k-means used to train one codebook per segment.
//!
//! Seeding defaults to uniform random components in `[0, 1)`. That choice
//! is cheap and deterministic for a given seed, but it converges slowly on
//! data far from the unit cube, so `Seeding::KMeansPlusPlus` is available as
//! an alternative. Switching seeding changes the trained centroids for a
//! fixed seed.
//!
//! Empty clusters are rescued by moving a random point out of a cluster that
//! has more than one member, which forces another iteration. Rescue attempts
//! and iterations are both capped, so configurations with more clusters
//! than distinct points terminate.

use std::sync::Arc;

use rand::Rng;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};
use vector_types::{DistanceProvider, L2Squared};

use crate::error::PqError;

/// Default fraction of reassignments below which training stops.
pub const DEFAULT_DELTA_THRESHOLD: f32 = 0.1;

/// Default iteration cap.
pub const DEFAULT_ITERATION_THRESHOLD: usize = 1000;

/// Initial centroid placement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Seeding {
    /// Uniform random components in `[0, 1)`
    #[default]
    Uniform,
    /// Distance-weighted sampling of data points
    KMeansPlusPlus,
}

/// Outcome of a partition run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PartitionStats {
    pub iterations: usize,
    /// Reassignments in the final iteration
    pub last_changes: usize,
    /// Empty clusters refilled from larger ones
    pub rescued: usize,
    /// Empty clusters no point could be moved into
    pub unrescued: usize,
}

/// K-means clusterer over fixed-length points.
#[derive(Debug, Clone)]
pub struct KMeans {
    pub k: usize,
    pub delta_threshold: f32,
    pub iteration_threshold: usize,
    pub seeding: Seeding,
    dimensions: usize,
    distance: Arc<dyn DistanceProvider>,
    /// Flattened `[k][dimensions]`
    centers: Vec<f32>,
}

impl KMeans {
    pub fn new(k: usize, dimensions: usize) -> Self {
        Self {
            k,
            delta_threshold: DEFAULT_DELTA_THRESHOLD,
            iteration_threshold: DEFAULT_ITERATION_THRESHOLD,
            seeding: Seeding::default(),
            dimensions,
            distance: Arc::new(L2Squared),
            centers: Vec::new(),
        }
    }

    /// Rebuild a trained clusterer from persisted centers.
    pub fn from_centers(k: usize, dimensions: usize, centers: Vec<f32>) -> Self {
        debug_assert_eq!(centers.len(), k * dimensions);
        Self {
            centers,
            ..Self::new(k, dimensions)
        }
    }

    pub fn with_distance(mut self, distance: Arc<dyn DistanceProvider>) -> Self {
        self.distance = distance;
        self
    }

    pub fn with_seeding(mut self, seeding: Seeding) -> Self {
        self.seeding = seeding;
        self
    }

    pub fn with_thresholds(mut self, delta: f32, iterations: usize) -> Self {
        self.delta_threshold = delta;
        self.iteration_threshold = iterations;
        self
    }

    pub fn dimensions(&self) -> usize {
        self.dimensions
    }

    pub fn centers(&self) -> &[f32] {
        &self.centers
    }

    pub fn into_centers(self) -> Vec<f32> {
        self.centers
    }

    pub fn centroid(&self, i: usize) -> &[f32] {
        &self.centers[i * self.dimensions..(i + 1) * self.dimensions]
    }

    /// Index of the closest centroid. Ties go to the lower index.
    pub fn nearest(&self, point: &[f32]) -> usize {
        let mut best = 0;
        let mut best_dist = f32::MAX;
        for c in 0..self.k {
            let d = self.distance.distance(point, self.centroid(c));
            if d < best_dist {
                best_dist = d;
                best = c;
            }
        }
        best
    }

    /// Indices of the `n` closest centroids, closest first.
    pub fn n_nearest(&self, point: &[f32], n: usize) -> Vec<usize> {
        let n = n.min(self.k);
        let mut mins: Vec<(usize, f32)> = Vec::with_capacity(n + 1);
        for c in 0..self.k {
            let d = self.distance.distance(point, self.centroid(c));
            let pos = mins.partition_point(|&(_, md)| md <= d);
            if pos < n {
                mins.insert(pos, (c, d));
                mins.truncate(n);
            }
        }
        mins.into_iter().map(|(c, _)| c).collect()
    }

    /// Cluster `points` into `k` groups.
    ///
    /// Fails with `Configuration` when `k` is zero or exceeds the number of
    /// points, and with `Cancelled` if `cancel` fires between iterations.
    pub fn partition<R: Rng>(
        &mut self,
        points: &[&[f32]],
        rng: &mut R,
        cancel: &CancellationToken,
    ) -> Result<PartitionStats, PqError> {
        let n = points.len();
        if self.k == 0 {
            return Err(PqError::Configuration("k must be > 0".to_string()));
        }
        if self.k > n {
            return Err(PqError::Configuration(format!(
                "{} centroids exceed {} training points",
                self.k, n
            )));
        }
        if let Some(bad) = points.iter().find(|p| p.len() != self.dimensions) {
            return Err(PqError::DimensionMismatch {
                expected: self.dimensions,
                actual: bad.len(),
            });
        }

        self.centers = match self.seeding {
            Seeding::Uniform => (0..self.k * self.dimensions)
                .map(|_| rng.gen::<f32>())
                .collect(),
            Seeding::KMeansPlusPlus => self.plus_plus_init(points, rng),
        };

        let mut assignment = vec![usize::MAX; n];
        let mut sizes = vec![0usize; self.k];
        let threshold = (n as f32 * self.delta_threshold) as usize;
        let mut stats = PartitionStats::default();

        for iteration in 0.. {
            if cancel.is_cancelled() {
                return Err(PqError::Cancelled);
            }

            sizes.iter_mut().for_each(|s| *s = 0);
            let mut changes = 0;
            for (p, point) in points.iter().enumerate() {
                let c = self.nearest(point);
                sizes[c] += 1;
                if assignment[p] != c {
                    assignment[p] = c;
                    changes += 1;
                }
            }

            for c in 0..self.k {
                if sizes[c] > 0 {
                    continue;
                }
                if self.rescue(c, &mut assignment, &mut sizes, rng) {
                    stats.rescued += 1;
                    changes = n;
                } else {
                    stats.unrescued += 1;
                }
            }

            self.recompute_centers(points, &assignment, &sizes);

            stats.iterations = iteration + 1;
            stats.last_changes = changes;
            trace!(iteration, changes, "k-means iteration");

            if changes == 0 || changes < threshold || iteration >= self.iteration_threshold {
                break;
            }
        }

        debug!(
            k = self.k,
            points = n,
            iterations = stats.iterations,
            rescued = stats.rescued,
            "k-means converged"
        );
        Ok(stats)
    }

    /// Move a random point from a cluster of size > 1 into empty cluster `c`.
    fn rescue<R: Rng>(
        &self,
        c: usize,
        assignment: &mut [usize],
        sizes: &mut [usize],
        rng: &mut R,
    ) -> bool {
        let n = assignment.len();
        for _ in 0..n.max(16) {
            let r = rng.gen_range(0..n);
            let from = assignment[r];
            if sizes[from] > 1 {
                sizes[from] -= 1;
                sizes[c] += 1;
                assignment[r] = c;
                return true;
            }
        }
        false
    }

    fn recompute_centers(&mut self, points: &[&[f32]], assignment: &[usize], sizes: &[usize]) {
        let dims = self.dimensions;
        let mut sums = vec![0.0f32; self.k * dims];
        for (point, &c) in points.iter().zip(assignment) {
            let sum = &mut sums[c * dims..(c + 1) * dims];
            for (s, x) in sum.iter_mut().zip(point.iter()) {
                *s += x;
            }
        }
        for (c, &size) in sizes.iter().enumerate() {
            // Unrescued clusters keep their previous center
            if size == 0 {
                continue;
            }
            let center = &mut self.centers[c * dims..(c + 1) * dims];
            for (dst, s) in center.iter_mut().zip(&sums[c * dims..(c + 1) * dims]) {
                *dst = s / size as f32;
            }
        }
    }

    fn plus_plus_init<R: Rng>(&self, points: &[&[f32]], rng: &mut R) -> Vec<f32> {
        let n = points.len();
        let dims = self.dimensions;
        let mut centers = vec![0.0f32; self.k * dims];

        let first = rng.gen_range(0..n);
        centers[..dims].copy_from_slice(points[first]);

        let mut min_dists = vec![f32::MAX; n];
        for c in 1..self.k {
            let last = &centers[(c - 1) * dims..c * dims];
            for (i, point) in points.iter().enumerate() {
                let d = self.distance.distance(point, last).max(0.0);
                if d < min_dists[i] {
                    min_dists[i] = d;
                }
            }

            let total: f64 = min_dists.iter().map(|&d| d as f64).sum();
            let chosen = if total <= 0.0 {
                rng.gen_range(0..n)
            } else {
                let threshold = rng.gen::<f64>() * total;
                let mut cumulative = 0.0f64;
                let mut chosen = n - 1;
                for (i, &d) in min_dists.iter().enumerate() {
                    cumulative += d as f64;
                    if cumulative >= threshold {
                        chosen = i;
                        break;
                    }
                }
                chosen
            };
            centers[c * dims..(c + 1) * dims].copy_from_slice(points[chosen]);
        }

        centers
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn clustered_points(rng: &mut StdRng) -> Vec<Vec<f32>> {
        // Three tight blobs inside the unit square
        let anchors = [[0.1, 0.1], [0.5, 0.9], [0.9, 0.2]];
        let mut points = Vec::new();
        for anchor in anchors {
            for _ in 0..50 {
                points.push(vec![
                    anchor[0] + rng.gen_range(-0.02..0.02),
                    anchor[1] + rng.gen_range(-0.02..0.02),
                ]);
            }
        }
        points
    }

    fn as_slices(points: &[Vec<f32>]) -> Vec<&[f32]> {
        points.iter().map(|p| p.as_slice()).collect()
    }

    #[test]
    fn test_partition_finds_blobs() {
        let mut rng = StdRng::seed_from_u64(7);
        let points = clustered_points(&mut rng);
        let slices = as_slices(&points);

        for seeding in [Seeding::Uniform, Seeding::KMeansPlusPlus] {
            let mut kmeans = KMeans::new(3, 2)
                .with_seeding(seeding)
                .with_thresholds(0.0, 100);
            kmeans
                .partition(&slices, &mut rng, &CancellationToken::new())
                .unwrap();

            // Points of the same blob share a centroid, blobs do not
            let a = kmeans.nearest(&points[0]);
            let b = kmeans.nearest(&points[50]);
            let c = kmeans.nearest(&points[100]);
            assert!(a != b && b != c && a != c, "{seeding:?}: {a} {b} {c}");
            for i in 0..50 {
                assert_eq!(kmeans.nearest(&points[i]), a);
                assert_eq!(kmeans.nearest(&points[50 + i]), b);
            }
        }
    }

    #[test]
    fn test_partition_deterministic_for_seed() {
        let mut data_rng = StdRng::seed_from_u64(1);
        let points = clustered_points(&mut data_rng);
        let slices = as_slices(&points);

        let run = || {
            let mut kmeans = KMeans::new(4, 2);
            let mut rng = StdRng::seed_from_u64(99);
            kmeans
                .partition(&slices, &mut rng, &CancellationToken::new())
                .unwrap();
            kmeans.into_centers()
        };
        assert_eq!(run(), run());
    }

    #[test]
    fn test_more_clusters_than_points_is_error() {
        let points = vec![vec![0.5, 0.5]; 3];
        let slices = as_slices(&points);
        let mut kmeans = KMeans::new(4, 2);
        let result = kmeans.partition(
            &slices,
            &mut StdRng::seed_from_u64(0),
            &CancellationToken::new(),
        );
        assert!(matches!(result, Err(PqError::Configuration(_))));
    }

    #[test]
    fn test_identical_points_terminate_at_cap() {
        // Every iteration empties clusters again, so only the cap stops it
        let points = vec![vec![0.3, 0.3]; 8];
        let slices = as_slices(&points);
        let mut kmeans = KMeans::new(8, 2).with_thresholds(0.0, 20);
        let stats = kmeans
            .partition(
                &slices,
                &mut StdRng::seed_from_u64(3),
                &CancellationToken::new(),
            )
            .unwrap();
        assert!(stats.iterations <= 21);
        assert!(stats.rescued > 0);
    }

    #[test]
    fn test_cancelled_partition() {
        let points = vec![vec![0.1, 0.2], vec![0.3, 0.4]];
        let slices = as_slices(&points);
        let cancel = CancellationToken::new();
        cancel.cancel();
        let mut kmeans = KMeans::new(2, 2);
        let result = kmeans.partition(&slices, &mut StdRng::seed_from_u64(0), &cancel);
        assert!(matches!(result, Err(PqError::Cancelled)));
    }

    #[test]
    fn test_dimension_mismatch() {
        let points = vec![vec![0.1, 0.2], vec![0.3]];
        let slices = as_slices(&points);
        let mut kmeans = KMeans::new(1, 2);
        let result = kmeans.partition(
            &slices,
            &mut StdRng::seed_from_u64(0),
            &CancellationToken::new(),
        );
        assert!(matches!(
            result,
            Err(PqError::DimensionMismatch {
                expected: 2,
                actual: 1
            })
        ));
    }

    #[test]
    fn test_n_nearest_orders_by_distance() {
        let centers = vec![0.0, 0.0, 1.0, 1.0, 0.2, 0.2, 5.0, 5.0];
        let kmeans = KMeans::from_centers(4, 2, centers);
        assert_eq!(kmeans.n_nearest(&[0.15, 0.15], 3), vec![2, 0, 1]);
        assert_eq!(kmeans.nearest(&[4.0, 4.0]), 3);
        assert_eq!(kmeans.n_nearest(&[0.0, 0.0], 10).len(), 4);
    }
}
