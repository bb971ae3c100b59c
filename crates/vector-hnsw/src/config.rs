//! Graph configuration.

use serde::{Deserialize, Serialize};
use vector_types::{DistanceKind, IndexSettings, VectorId};

use crate::error::GraphError;

/// Deepest layer a node can be assigned to.
pub const MAX_LEVEL: usize = 16;

/// Hard ceiling for `max_id`.
pub const MAX_NODE_ID: VectorId = u32::MAX as VectorId;

/// Default largest accepted id. The arena is dense, so this bounds its
/// size at 16M slots.
pub const DEFAULT_MAX_ID: VectorId = (1 << 24) - 1;

/// HNSW graph configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HnswConfig {
    /// Vector dimensionality, fixed per graph
    pub dimensions: usize,

    /// Max neighbors per upper layer (M); layer 0 allows 2M
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,

    /// Candidate pool size while inserting
    #[serde(default = "default_ef_construction")]
    pub ef_construction: usize,

    /// Candidate pool size while searching
    #[serde(default = "default_ef")]
    pub ef: usize,

    /// Level multiplier; `None` means 1/ln(M)
    #[serde(default)]
    pub level_multiplier: Option<f64>,

    /// Seed for layer assignment
    #[serde(default)]
    pub seed: u64,

    #[serde(default)]
    pub distance: DistanceKind,

    /// Largest id `insert` accepts; the arena holds `max_id + 1` slots at most
    #[serde(default = "default_max_id")]
    pub max_id: VectorId,
}

fn default_max_id() -> VectorId {
    DEFAULT_MAX_ID
}

fn default_max_connections() -> usize {
    32
}

fn default_ef_construction() -> usize {
    128
}

fn default_ef() -> usize {
    64
}

impl HnswConfig {
    pub fn new(dimensions: usize) -> Self {
        Self {
            dimensions,
            max_connections: default_max_connections(),
            ef_construction: default_ef_construction(),
            ef: default_ef(),
            level_multiplier: None,
            seed: 0,
            distance: DistanceKind::default(),
            max_id: DEFAULT_MAX_ID,
        }
    }

    pub fn from_settings(dimensions: usize, settings: &IndexSettings) -> Self {
        Self {
            max_connections: settings.max_connections,
            ef_construction: settings.ef_construction,
            ef: settings.ef,
            distance: settings.distance,
            ..Self::new(dimensions)
        }
    }

    pub fn with_max_connections(mut self, m: usize) -> Self {
        self.max_connections = m;
        self
    }

    pub fn with_ef_construction(mut self, ef_construction: usize) -> Self {
        self.ef_construction = ef_construction;
        self
    }

    pub fn with_ef(mut self, ef: usize) -> Self {
        self.ef = ef;
        self
    }

    pub fn with_distance(mut self, distance: DistanceKind) -> Self {
        self.distance = distance;
        self
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    /// Raise or lower the largest accepted id, up to [`MAX_NODE_ID`].
    pub fn with_max_id(mut self, max_id: VectorId) -> Self {
        self.max_id = max_id;
        self
    }

    pub fn validate(&self) -> Result<(), GraphError> {
        if self.dimensions == 0 {
            return Err(GraphError::Configuration("dimensions must be > 0".into()));
        }
        if self.max_connections < 2 {
            return Err(GraphError::Configuration(format!(
                "max_connections must be >= 2, got {}",
                self.max_connections
            )));
        }
        if self.ef_construction == 0 || self.ef == 0 {
            return Err(GraphError::Configuration(
                "ef and ef_construction must be > 0".into(),
            ));
        }
        if self.max_id > MAX_NODE_ID {
            return Err(GraphError::Configuration(format!(
                "max_id must be <= {MAX_NODE_ID}, got {}",
                self.max_id
            )));
        }
        if let Some(ml) = self.level_multiplier {
            if !(ml.is_finite() && ml > 0.0) {
                return Err(GraphError::Configuration(format!(
                    "level_multiplier must be positive, got {ml}"
                )));
            }
        }
        Ok(())
    }

    /// Neighbor cap for `layer`.
    pub fn max_connections_for(&self, layer: usize) -> usize {
        if layer == 0 {
            self.max_connections * 2
        } else {
            self.max_connections
        }
    }

    pub fn level_multiplier(&self) -> f64 {
        self.level_multiplier
            .unwrap_or_else(|| 1.0 / (self.max_connections as f64).ln())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_and_caps() {
        let config = HnswConfig::new(20).with_max_connections(16);
        assert!(config.validate().is_ok());
        assert_eq!(config.max_connections_for(0), 32);
        assert_eq!(config.max_connections_for(3), 16);
        assert!((config.level_multiplier() - 1.0 / 16f64.ln()).abs() < 1e-12);
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        assert!(HnswConfig::new(0).validate().is_err());
        assert!(HnswConfig::new(4).with_max_connections(1).validate().is_err());
        assert!(HnswConfig::new(4).with_ef_construction(0).validate().is_err());
        let mut config = HnswConfig::new(4);
        config.level_multiplier = Some(-1.0);
        assert!(matches!(config.validate(), Err(GraphError::Configuration(_))));
    }

    #[test]
    fn test_from_settings() {
        let settings = IndexSettings {
            distance: DistanceKind::Cosine,
            max_connections: 8,
            ef_construction: 40,
            ef: 10,
        };
        let config = HnswConfig::from_settings(3, &settings);
        assert_eq!(config.dimensions, 3);
        assert_eq!(config.max_connections, 8);
        assert_eq!(config.distance, DistanceKind::Cosine);
    }
}
