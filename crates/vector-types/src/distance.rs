//! Distance providers.
//!
//! Every provider is lower-is-better. Dot product is stored as the negative
//! similarity so the same comparison operators work for all metrics.
//!
//! Providers also expose a per-segment decomposition (`segment_distance` +
//! `finalize`) so product-quantization lookup tables can sum partial terms
//! and land on the same scale as the full distance.

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

/// Computes a scalar dissimilarity between two vectors.
///
/// Implementations must be thread-safe; one provider instance is shared by
/// every concurrent insert and search of an index.
pub trait DistanceProvider: Send + Sync + fmt::Debug {
    /// Full distance between `a` and `b`. Callers guarantee equal lengths.
    fn distance(&self, a: &[f32], b: &[f32]) -> f32;

    /// Contribution of one segment. Summing this over all segments and
    /// passing the sum to [`finalize`](Self::finalize) equals `distance`.
    fn segment_distance(&self, a: &[f32], b: &[f32]) -> f32;

    /// Turn a sum of segment terms into a distance.
    fn finalize(&self, sum: f32) -> f32 {
        sum
    }

    /// Whether vectors must be L2-normalized before they reach the provider.
    fn requires_normalization(&self) -> bool {
        false
    }

    fn kind(&self) -> DistanceKind;
}

/// Serializable name of a distance provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum DistanceKind {
    #[default]
    L2Squared,
    Dot,
    Cosine,
}

impl DistanceKind {
    pub fn provider(self) -> Arc<dyn DistanceProvider> {
        match self {
            DistanceKind::L2Squared => Arc::new(L2Squared),
            DistanceKind::Dot => Arc::new(Dot),
            DistanceKind::Cosine => Arc::new(Cosine),
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            DistanceKind::L2Squared => "l2-squared",
            DistanceKind::Dot => "dot",
            DistanceKind::Cosine => "cosine",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "l2-squared" => Some(DistanceKind::L2Squared),
            "dot" => Some(DistanceKind::Dot),
            "cosine" => Some(DistanceKind::Cosine),
            _ => None,
        }
    }
}

impl fmt::Display for DistanceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Squared Euclidean distance.
#[derive(Debug, Clone, Copy, Default)]
pub struct L2Squared;

impl DistanceProvider for L2Squared {
    #[inline]
    fn distance(&self, a: &[f32], b: &[f32]) -> f32 {
        l2_squared(a, b)
    }

    #[inline]
    fn segment_distance(&self, a: &[f32], b: &[f32]) -> f32 {
        l2_squared(a, b)
    }

    fn kind(&self) -> DistanceKind {
        DistanceKind::L2Squared
    }
}

/// Negative dot product. Not bounded below by zero.
#[derive(Debug, Clone, Copy, Default)]
pub struct Dot;

impl DistanceProvider for Dot {
    #[inline]
    fn distance(&self, a: &[f32], b: &[f32]) -> f32 {
        -dot(a, b)
    }

    #[inline]
    fn segment_distance(&self, a: &[f32], b: &[f32]) -> f32 {
        -dot(a, b)
    }

    fn kind(&self) -> DistanceKind {
        DistanceKind::Dot
    }
}

/// Cosine distance, `1 - cos(a, b)`, over normalized vectors.
///
/// The index normalizes inputs, so the provider only computes `1 - a·b`.
#[derive(Debug, Clone, Copy, Default)]
pub struct Cosine;

impl DistanceProvider for Cosine {
    #[inline]
    fn distance(&self, a: &[f32], b: &[f32]) -> f32 {
        (1.0 - dot(a, b)).max(0.0)
    }

    #[inline]
    fn segment_distance(&self, a: &[f32], b: &[f32]) -> f32 {
        -dot(a, b)
    }

    fn finalize(&self, sum: f32) -> f32 {
        (1.0 + sum).max(0.0)
    }

    fn requires_normalization(&self) -> bool {
        true
    }

    fn kind(&self) -> DistanceKind {
        DistanceKind::Cosine
    }
}

#[inline]
fn l2_squared(a: &[f32], b: &[f32]) -> f32 {
    a.iter()
        .zip(b.iter())
        .map(|(x, y)| {
            let d = x - y;
            d * d
        })
        .sum()
}

#[inline]
fn dot(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b.iter()).map(|(x, y)| x * y).sum()
}

/// L2-normalize a vector in place. Zero vectors are left untouched.
pub fn normalize(v: &mut [f32]) {
    let norm = dot(v, v).sqrt();
    if norm > 0.0 {
        for x in v.iter_mut() {
            *x /= norm;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_l2_squared() {
        assert_eq!(L2Squared.distance(&[0.0, 0.0], &[3.0, 4.0]), 25.0);
        assert_eq!(L2Squared.distance(&[1.0, 2.0], &[1.0, 2.0]), 0.0);
    }

    #[test]
    fn test_dot_is_negative_similarity() {
        let close = Dot.distance(&[1.0, 0.0], &[1.0, 0.0]);
        let far = Dot.distance(&[1.0, 0.0], &[0.0, 1.0]);
        assert!(close < far);
        assert_eq!(close, -1.0);
    }

    #[test]
    fn test_cosine_on_normalized() {
        let mut a = vec![3.0, 4.0];
        let mut b = vec![6.0, 8.0];
        normalize(&mut a);
        normalize(&mut b);
        assert!(Cosine.distance(&a, &b).abs() < 1e-6);
        assert!(Cosine.requires_normalization());
    }

    #[test]
    fn test_segment_decomposition_matches_full_distance() {
        let a = [0.1, 0.5, -0.3, 0.9, 0.2, -0.7];
        let b = [0.4, -0.1, 0.8, 0.3, -0.6, 0.5];
        for provider in [DistanceKind::L2Squared, DistanceKind::Dot].map(DistanceKind::provider) {
            let sum: f32 = (0..3)
                .map(|s| provider.segment_distance(&a[s * 2..s * 2 + 2], &b[s * 2..s * 2 + 2]))
                .sum();
            let full = provider.distance(&a, &b);
            assert!((provider.finalize(sum) - full).abs() < 1e-5);
        }
    }

    #[test]
    fn test_normalize_zero_vector() {
        let mut v = vec![0.0; 4];
        normalize(&mut v);
        assert_eq!(v, vec![0.0; 4]);
    }

    #[test]
    fn test_kind_roundtrip() {
        for kind in [DistanceKind::L2Squared, DistanceKind::Dot, DistanceKind::Cosine] {
            assert_eq!(DistanceKind::parse(kind.as_str()), Some(kind));
            assert_eq!(kind.provider().kind(), kind);
        }
        assert_eq!(DistanceKind::parse("manhattan"), None);
    }
}
