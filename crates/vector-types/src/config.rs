//! Configuration loading for the vector index.
//!
//! Layered config: defaults -> config file -> env vars. Callers apply CLI
//! flags on top of what `Settings::load` returns.

use std::path::PathBuf;

use config::{Config, Environment, File};
use directories::ProjectDirs;
use serde::{Deserialize, Serialize};

use crate::distance::DistanceKind;
use crate::error::ConfigError;

/// Graph construction and query parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexSettings {
    /// Distance provider
    #[serde(default)]
    pub distance: DistanceKind,

    /// Max neighbors per upper layer (M). Layer 0 allows twice as many.
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,

    /// Candidate pool size while inserting
    #[serde(default = "default_ef_construction")]
    pub ef_construction: usize,

    /// Candidate pool size while searching (raised to k when smaller)
    #[serde(default = "default_ef")]
    pub ef: usize,
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

impl Default for IndexSettings {
    fn default() -> Self {
        Self {
            distance: DistanceKind::default(),
            max_connections: default_max_connections(),
            ef_construction: default_ef_construction(),
            ef: default_ef(),
        }
    }
}

/// Product quantization parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PqSettings {
    /// Compress once the graph holds this many vectors (0 = never automatically)
    #[serde(default)]
    pub auto_compress_threshold: usize,

    /// Number of segments; 0 means one segment per dimension
    #[serde(default)]
    pub segments: usize,

    /// Centroids per segment (max 256)
    #[serde(default = "default_centroids")]
    pub centroids: usize,

    /// Upper bound on training samples
    #[serde(default = "default_training_limit")]
    pub training_limit: usize,
}

fn default_centroids() -> usize {
    256
}

fn default_training_limit() -> usize {
    100_000
}

impl Default for PqSettings {
    fn default() -> Self {
        Self {
            auto_compress_threshold: 0,
            segments: 0,
            centroids: default_centroids(),
            training_limit: default_training_limit(),
        }
    }
}

/// Maintenance cycle intervals.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CycleSettings {
    /// Tombstone cleanup interval in milliseconds
    #[serde(default = "default_tombstone_cleanup_interval")]
    pub tombstone_cleanup_interval_ms: u64,

    /// Commit log checkpoint interval in milliseconds
    #[serde(default = "default_commit_log_interval")]
    pub commit_log_interval_ms: u64,

    /// Compaction interval in milliseconds
    #[serde(default = "default_compaction_interval")]
    pub compaction_interval_ms: u64,

    /// Flush interval in milliseconds
    #[serde(default = "default_flush_interval")]
    pub flush_interval_ms: u64,

    /// Max callbacks run concurrently within one group
    #[serde(default = "default_routines_limit")]
    pub routines_limit: usize,

    /// How long a stop waits for an in-flight callback, in milliseconds
    #[serde(default = "default_stop_timeout")]
    pub stop_timeout_ms: u64,
}

fn default_tombstone_cleanup_interval() -> u64 {
    60_000
}

fn default_commit_log_interval() -> u64 {
    10_000
}

fn default_compaction_interval() -> u64 {
    5_000
}

fn default_flush_interval() -> u64 {
    100
}

fn default_routines_limit() -> usize {
    1
}

fn default_stop_timeout() -> u64 {
    30_000
}

impl Default for CycleSettings {
    fn default() -> Self {
        Self {
            tombstone_cleanup_interval_ms: default_tombstone_cleanup_interval(),
            commit_log_interval_ms: default_commit_log_interval(),
            compaction_interval_ms: default_compaction_interval(),
            flush_interval_ms: default_flush_interval(),
            routines_limit: default_routines_limit(),
            stop_timeout_ms: default_stop_timeout(),
        }
    }
}

/// Top-level settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    /// Root directory for snapshots, codebooks and commit logs
    #[serde(default = "default_data_path")]
    pub data_path: String,

    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,

    #[serde(default)]
    pub index: IndexSettings,

    #[serde(default)]
    pub pq: PqSettings,

    #[serde(default)]
    pub cycles: CycleSettings,
}

fn default_data_path() -> String {
    ProjectDirs::from("", "", "vector-index")
        .map(|p| p.data_local_dir().join("data"))
        .unwrap_or_else(|| PathBuf::from("./data"))
        .to_string_lossy()
        .to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            data_path: default_data_path(),
            log_level: default_log_level(),
            index: IndexSettings::default(),
            pq: PqSettings::default(),
            cycles: CycleSettings::default(),
        }
    }
}

impl Settings {
    /// Load settings with layered precedence:
    /// 1. Built-in defaults
    /// 2. Config file (~/.config/vector-index/config.toml)
    /// 3. Caller-specified config file (optional)
    /// 4. Environment variables (VECTOR_*, `__` separates nested keys)
    pub fn load(config_path: Option<&str>) -> Result<Self, ConfigError> {
        let config_dir = ProjectDirs::from("", "", "vector-index")
            .map(|p| p.config_dir().to_path_buf())
            .unwrap_or_else(|| PathBuf::from("."));
        let default_config_path = config_dir.join("config");

        let mut builder = Config::builder()
            .set_default("data_path", default_data_path())
            .map_err(|e| ConfigError::Load(e.to_string()))?
            .set_default("log_level", default_log_level())
            .map_err(|e| ConfigError::Load(e.to_string()))?
            .add_source(File::with_name(&default_config_path.to_string_lossy()).required(false));

        if let Some(path) = config_path {
            builder = builder.add_source(File::with_name(path).required(true));
        }

        // Format: VECTOR_LOG_LEVEL, VECTOR_INDEX__EF, VECTOR_PQ__CENTROIDS, ...
        builder = builder.add_source(
            Environment::with_prefix("VECTOR")
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        );

        let settings: Settings = builder
            .build()
            .map_err(|e| ConfigError::Load(e.to_string()))?
            .try_deserialize()
            .map_err(|e| ConfigError::Load(e.to_string()))?;

        settings.validate()?;
        Ok(settings)
    }

    /// Check value ranges that serde cannot express.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.index.max_connections < 2 {
            return Err(ConfigError::Invalid(format!(
                "max_connections must be >= 2, got {}",
                self.index.max_connections
            )));
        }
        if self.index.ef_construction == 0 || self.index.ef == 0 {
            return Err(ConfigError::Invalid(
                "ef and ef_construction must be > 0".to_string(),
            ));
        }
        if self.pq.centroids == 0 || self.pq.centroids > 256 {
            return Err(ConfigError::Invalid(format!(
                "centroids must be 1-256, got {}",
                self.pq.centroids
            )));
        }
        if self.cycles.routines_limit == 0 {
            return Err(ConfigError::Invalid(
                "routines_limit must be > 0".to_string(),
            ));
        }
        Ok(())
    }

    pub fn data_dir(&self) -> PathBuf {
        PathBuf::from(&self.data_path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_default_settings() {
        let settings = Settings::default();
        assert_eq!(settings.index.max_connections, 32);
        assert_eq!(settings.index.distance, DistanceKind::L2Squared);
        assert_eq!(settings.pq.centroids, 256);
        assert_eq!(settings.cycles.routines_limit, 1);
        assert!(settings.validate().is_ok());
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(
            file,
            "log_level = \"debug\"\n[index]\nmax_connections = 8\ndistance = \"cosine\"\n[pq]\nsegments = 4"
        )
        .unwrap();

        let settings = Settings::load(Some(&file.path().to_string_lossy())).unwrap();
        assert_eq!(settings.log_level, "debug");
        assert_eq!(settings.index.max_connections, 8);
        assert_eq!(settings.index.distance, DistanceKind::Cosine);
        assert_eq!(settings.index.ef, 64);
        assert_eq!(settings.pq.segments, 4);
        assert_eq!(settings.pq.centroids, 256);
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let mut settings = Settings::default();
        settings.index.max_connections = 1;
        assert!(matches!(settings.validate(), Err(ConfigError::Invalid(_))));

        let mut settings = Settings::default();
        settings.pq.centroids = 512;
        assert!(settings.validate().is_err());

        let mut settings = Settings::default();
        settings.cycles.routines_limit = 0;
        assert!(settings.validate().is_err());
    }

    #[test]
    fn test_serde_roundtrip() {
        let settings = Settings::default();
        let json = serde_json::to_string(&settings).unwrap();
        let parsed: Settings = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.index.ef, settings.index.ef);
        assert_eq!(
            parsed.cycles.tombstone_cleanup_interval_ms,
            settings.cycles.tombstone_cleanup_interval_ms
        );
    }
}
