//! Segment codebooks, encoding and asymmetric distance tables.

use std::sync::Arc;
use std::time::Instant;

use rand::rngs::StdRng;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};
use vector_types::{DistanceKind, DistanceProvider, L2Squared, PqSettings};

use crate::error::PqError;
use crate::kmeans::{KMeans, Seeding};

/// Codes are `u8`, so no segment can have more centroids than this.
pub const MAX_CENTROIDS: usize = 256;

/// Quantizer training parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PqConfig {
    /// Number of segments; 0 means one segment per dimension
    #[serde(default)]
    pub segments: usize,

    /// Centroids per segment
    #[serde(default = "default_centroids")]
    pub centroids: usize,

    #[serde(default)]
    pub seeding: Seeding,

    /// Seed for centroid initialization and empty-cluster rescue
    #[serde(default = "default_seed")]
    pub seed: u64,

    /// Upper bound on the number of training samples used
    #[serde(default = "default_training_limit")]
    pub training_limit: usize,
}

fn default_centroids() -> usize {
    MAX_CENTROIDS
}

fn default_seed() -> u64 {
    0x5eed
}

fn default_training_limit() -> usize {
    100_000
}

impl Default for PqConfig {
    fn default() -> Self {
        Self {
            segments: 0,
            centroids: default_centroids(),
            seeding: Seeding::default(),
            seed: default_seed(),
            training_limit: default_training_limit(),
        }
    }
}

impl PqConfig {
    pub fn new(segments: usize, centroids: usize) -> Self {
        Self {
            segments,
            centroids,
            ..Default::default()
        }
    }

    pub fn from_settings(settings: &PqSettings) -> Self {
        Self {
            segments: settings.segments,
            centroids: settings.centroids,
            training_limit: settings.training_limit,
            ..Default::default()
        }
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    pub fn with_seeding(mut self, seeding: Seeding) -> Self {
        self.seeding = seeding;
        self
    }

    /// Segment count for `dimensions`, resolving the 0 shorthand.
    pub fn resolve_segments(&self, dimensions: usize) -> usize {
        if self.segments == 0 {
            dimensions
        } else {
            self.segments
        }
    }

    /// Check the config against the data it will be trained on.
    pub fn validate(&self, dimensions: usize, samples: usize) -> Result<(), PqError> {
        let segments = self.resolve_segments(dimensions);
        if dimensions == 0 || segments == 0 {
            return Err(PqError::Configuration(
                "dimensions and segments must be > 0".to_string(),
            ));
        }
        if dimensions % segments != 0 {
            return Err(PqError::Configuration(format!(
                "{dimensions} dimensions cannot be split into {segments} equal segments"
            )));
        }
        if self.centroids == 0 || self.centroids > MAX_CENTROIDS {
            return Err(PqError::Configuration(format!(
                "centroids must be 1-{MAX_CENTROIDS}, got {}",
                self.centroids
            )));
        }
        if self.training_limit == 0 {
            return Err(PqError::Configuration(
                "training_limit must be > 0".to_string(),
            ));
        }
        let usable = samples.min(self.training_limit);
        if self.centroids > usable {
            return Err(PqError::Configuration(format!(
                "{} centroids for {} training samples",
                self.centroids, usable
            )));
        }
        Ok(())
    }
}

/// Trained centroids of one segment.
#[derive(Debug, Clone)]
pub struct Codebook {
    kmeans: KMeans,
}

impl Codebook {
    pub fn len(&self) -> usize {
        self.kmeans.k
    }

    pub fn is_empty(&self) -> bool {
        self.kmeans.k == 0
    }

    pub fn centroid(&self, code: u8) -> &[f32] {
        self.kmeans.centroid(code as usize)
    }

    pub fn centers(&self) -> &[f32] {
        self.kmeans.centers()
    }

    fn nearest(&self, sub: &[f32]) -> u8 {
        self.kmeans.nearest(sub) as u8
    }
}

/// Trained product quantizer.
#[derive(Debug, Clone)]
pub struct ProductQuantizer {
    dimensions: usize,
    segment_len: usize,
    centroids: usize,
    distance: Arc<dyn DistanceProvider>,
    codebooks: Vec<Codebook>,
}

impl ProductQuantizer {
    /// Train one codebook per segment.
    ///
    /// Clustering always uses squared L2; `distance` only shapes the lookup
    /// tables built later. Samples beyond `config.training_limit` are
    /// skipped with a fixed stride. Segments are trained in parallel.
    pub fn train(
        samples: &[&[f32]],
        dimensions: usize,
        config: &PqConfig,
        distance: Arc<dyn DistanceProvider>,
        cancel: &CancellationToken,
    ) -> Result<Self, PqError> {
        config.validate(dimensions, samples.len())?;
        if let Some(bad) = samples.iter().find(|s| s.len() != dimensions) {
            return Err(PqError::DimensionMismatch {
                expected: dimensions,
                actual: bad.len(),
            });
        }

        let stride = samples.len().div_ceil(config.training_limit).max(1);
        let training: Vec<&[f32]> = samples.iter().step_by(stride).copied().collect();
        let segments = config.resolve_segments(dimensions);
        let segment_len = dimensions / segments;

        let started = Instant::now();
        let results: Vec<Result<KMeans, PqError>> = std::thread::scope(|scope| {
            let handles: Vec<_> = (0..segments)
                .map(|segment| {
                    let training = &training;
                    scope.spawn(move || {
                        let points: Vec<&[f32]> = training
                            .iter()
                            .map(|s| &s[segment * segment_len..(segment + 1) * segment_len])
                            .collect();
                        let mut rng = StdRng::seed_from_u64(config.seed.wrapping_add(segment as u64));
                        let mut kmeans = KMeans::new(config.centroids, segment_len)
                            .with_distance(Arc::new(L2Squared))
                            .with_seeding(config.seeding);
                        let stats = kmeans.partition(&points, &mut rng, cancel)?;
                        debug!(segment, iterations = stats.iterations, "Trained segment codebook");
                        Ok(kmeans)
                    })
                })
                .collect();
            handles
                .into_iter()
                .map(|h| h.join().unwrap_or_else(|panic| std::panic::resume_unwind(panic)))
                .collect()
        });

        let codebooks = results
            .into_iter()
            .map(|r| r.map(|kmeans| Codebook { kmeans }))
            .collect::<Result<Vec<_>, _>>()?;

        info!(
            dimensions,
            segments,
            centroids = config.centroids,
            samples = training.len(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Trained product quantizer"
        );

        Ok(Self {
            dimensions,
            segment_len,
            centroids: config.centroids,
            distance,
            codebooks,
        })
    }

    /// Rebuild from flattened per-segment centers. Lengths are checked by the caller.
    pub(crate) fn from_parts(
        dimensions: usize,
        segments: usize,
        centroids: usize,
        distance: Arc<dyn DistanceProvider>,
        centers: Vec<Vec<f32>>,
    ) -> Self {
        let segment_len = dimensions / segments;
        let codebooks = centers
            .into_iter()
            .map(|c| Codebook {
                kmeans: KMeans::from_centers(centroids, segment_len, c),
            })
            .collect();
        Self {
            dimensions,
            segment_len,
            centroids,
            distance,
            codebooks,
        }
    }

    pub fn dimensions(&self) -> usize {
        self.dimensions
    }

    pub fn segments(&self) -> usize {
        self.codebooks.len()
    }

    pub fn segment_len(&self) -> usize {
        self.segment_len
    }

    pub fn centroids(&self) -> usize {
        self.centroids
    }

    pub fn distance_kind(&self) -> DistanceKind {
        self.distance.kind()
    }

    pub fn codebook(&self, segment: usize) -> &Codebook {
        &self.codebooks[segment]
    }

    fn check_dimensions(&self, vector: &[f32]) -> Result<(), PqError> {
        if vector.len() != self.dimensions {
            return Err(PqError::DimensionMismatch {
                expected: self.dimensions,
                actual: vector.len(),
            });
        }
        Ok(())
    }

    fn segment<'a>(&self, vector: &'a [f32], s: usize) -> &'a [f32] {
        &vector[s * self.segment_len..(s + 1) * self.segment_len]
    }

    /// One code per segment: the index of the nearest centroid.
    pub fn encode(&self, vector: &[f32]) -> Result<Vec<u8>, PqError> {
        self.check_dimensions(vector)?;
        Ok(self
            .codebooks
            .iter()
            .enumerate()
            .map(|(s, book)| book.nearest(self.segment(vector, s)))
            .collect())
    }

    /// Concatenate the centroids a code points at.
    pub fn decode(&self, code: &[u8]) -> Result<Vec<f32>, PqError> {
        if code.len() != self.segments() {
            return Err(PqError::DimensionMismatch {
                expected: self.segments(),
                actual: code.len(),
            });
        }
        let mut out = Vec::with_capacity(self.dimensions);
        for (book, &c) in self.codebooks.iter().zip(code) {
            out.extend_from_slice(book.centroid(c));
        }
        Ok(out)
    }

    /// Tabulate the segment distances from `query` to every centroid.
    pub fn lookup_table(&self, query: &[f32]) -> Result<DistanceLookupTable, PqError> {
        self.check_dimensions(query)?;
        let mut table = Vec::with_capacity(self.segments() * self.centroids);
        for (s, book) in self.codebooks.iter().enumerate() {
            let sub = self.segment(query, s);
            for c in 0..self.centroids {
                table.push(self.distance.segment_distance(sub, book.centroid(c as u8)));
            }
        }
        Ok(DistanceLookupTable {
            table,
            centroids: self.centroids,
            distance: Arc::clone(&self.distance),
        })
    }

    /// Symmetric distance between two codes, centroid to centroid.
    pub fn distance_between_codes(&self, a: &[u8], b: &[u8]) -> f32 {
        let sum: f32 = self
            .codebooks
            .iter()
            .zip(a.iter().zip(b))
            .map(|(book, (&ca, &cb))| {
                self.distance
                    .segment_distance(book.centroid(ca), book.centroid(cb))
            })
            .sum();
        self.distance.finalize(sum)
    }
}

/// Per-query table of segment distances.
#[derive(Debug, Clone)]
pub struct DistanceLookupTable {
    /// Flattened `[segment][centroid]`
    table: Vec<f32>,
    centroids: usize,
    distance: Arc<dyn DistanceProvider>,
}

impl DistanceLookupTable {
    /// Approximate distance from the query to an encoded vector.
    pub fn distance(&self, code: &[u8]) -> f32 {
        let sum: f32 = code
            .iter()
            .enumerate()
            .map(|(s, &c)| self.table[s * self.centroids + c as usize])
            .sum();
        self.distance.finalize(sum)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::Rng;

    fn random_vectors(n: usize, dims: usize, seed: u64) -> Vec<Vec<f32>> {
        let mut rng = StdRng::seed_from_u64(seed);
        (0..n)
            .map(|_| (0..dims).map(|_| rng.gen::<f32>()).collect())
            .collect()
    }

    fn train(vectors: &[Vec<f32>], dims: usize, config: &PqConfig, kind: DistanceKind) -> ProductQuantizer {
        let slices: Vec<&[f32]> = vectors.iter().map(|v| v.as_slice()).collect();
        ProductQuantizer::train(&slices, dims, config, kind.provider(), &CancellationToken::new())
            .unwrap()
    }

    #[test]
    fn test_reconstruction_error_is_small() {
        let vectors = random_vectors(500, 4, 11);
        let pq = train(&vectors, 4, &PqConfig::new(4, 32), DistanceKind::L2Squared);

        let total: f32 = vectors
            .iter()
            .map(|v| {
                let decoded = pq.decode(&pq.encode(v).unwrap()).unwrap();
                L2Squared.distance(v, &decoded)
            })
            .sum();
        let mean = total / vectors.len() as f32;
        assert!(mean < 0.01, "mean squared reconstruction error {mean}");
    }

    #[test]
    fn test_lookup_table_matches_decoded_distance() {
        let vectors = random_vectors(300, 6, 5);
        for kind in [DistanceKind::L2Squared, DistanceKind::Dot] {
            let pq = train(&vectors, 6, &PqConfig::new(3, 16), kind);
            let query = &vectors[0];
            let table = pq.lookup_table(query).unwrap();
            for v in vectors.iter().take(20) {
                let code = pq.encode(v).unwrap();
                let expected = kind.provider().distance(query, &pq.decode(&code).unwrap());
                assert!((table.distance(&code) - expected).abs() < 1e-4, "{kind}");
            }
        }
    }

    #[test]
    fn test_distance_between_codes_is_symmetric() {
        let vectors = random_vectors(200, 4, 9);
        let pq = train(&vectors, 4, &PqConfig::new(2, 8), DistanceKind::L2Squared);
        let a = pq.encode(&vectors[1]).unwrap();
        let b = pq.encode(&vectors[2]).unwrap();
        assert_eq!(pq.distance_between_codes(&a, &b), pq.distance_between_codes(&b, &a));
        assert_eq!(pq.distance_between_codes(&a, &a), 0.0);
    }

    #[test]
    fn test_zero_segments_means_one_per_dimension() {
        let vectors = random_vectors(100, 5, 2);
        let pq = train(&vectors, 5, &PqConfig::new(0, 4), DistanceKind::L2Squared);
        assert_eq!(pq.segments(), 5);
        assert_eq!(pq.segment_len(), 1);
        assert_eq!(pq.encode(&vectors[0]).unwrap().len(), 5);
    }

    #[test]
    fn test_validate_rejects_bad_configs() {
        assert!(matches!(
            PqConfig::new(3, 16).validate(8, 100),
            Err(PqError::Configuration(_))
        ));
        assert!(PqConfig::new(4, 257).validate(8, 1000).is_err());
        assert!(PqConfig::new(4, 0).validate(8, 1000).is_err());
        // More centroids than samples
        assert!(PqConfig::new(4, 256).validate(8, 100).is_err());
        assert!(PqConfig::new(4, 256).validate(8, 256).is_ok());
    }

    #[test]
    fn test_training_limit_caps_samples() {
        let vectors = random_vectors(100, 2, 4);
        let mut config = PqConfig::new(2, 8);
        config.training_limit = 5;
        let slices: Vec<&[f32]> = vectors.iter().map(|v| v.as_slice()).collect();
        let result = ProductQuantizer::train(
            &slices,
            2,
            &config,
            Arc::new(L2Squared),
            &CancellationToken::new(),
        );
        assert!(matches!(result, Err(PqError::Configuration(_))));
    }

    #[test]
    fn test_encode_checks_dimensions() {
        let vectors = random_vectors(50, 4, 3);
        let pq = train(&vectors, 4, &PqConfig::new(2, 4), DistanceKind::L2Squared);
        assert!(matches!(
            pq.encode(&[0.1, 0.2]),
            Err(PqError::DimensionMismatch { expected: 4, actual: 2 })
        ));
        assert!(pq.decode(&[0]).is_err());
    }

    #[test]
    fn test_cancelled_training() {
        let vectors = random_vectors(50, 4, 3);
        let slices: Vec<&[f32]> = vectors.iter().map(|v| v.as_slice()).collect();
        let cancel = CancellationToken::new();
        cancel.cancel();
        let result = ProductQuantizer::train(
            &slices,
            4,
            &PqConfig::new(2, 4),
            Arc::new(L2Squared),
            &cancel,
        );
        assert!(matches!(result, Err(PqError::Cancelled)));
    }

    #[test]
    fn test_config_serde_defaults() {
        let config: PqConfig = serde_json::from_str(r#"{"segments": 4}"#).unwrap();
        assert_eq!(config.centroids, 256);
        assert_eq!(config.seeding, Seeding::Uniform);
        assert_eq!(config.training_limit, 100_000);
    }
}
