//! Engine configuration.
//!
//! Loaded from a TOML file and validated; every section has defaults so an
//! empty file is a valid configuration.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{SegResult, SegmentationError};

/// Discovery never runs on fewer customers than this.
pub const MIN_POPULATION: usize = 100;

/// Hard cap on k-means iterations per run.
pub const MAX_ITERATION_CAP: u64 = 300;

/// Main configuration structure.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct EngineConfig {
    #[serde(default)]
    pub discovery: DiscoveryConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl EngineConfig {
    /// Load configuration from a TOML file.
    pub fn from_file(path: &Path) -> SegResult<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            SegmentationError::Config(format!(
                "Failed to read config file {}: {}",
                path.display(),
                e
            ))
        })?;
        Self::from_toml(&content)
    }

    pub fn from_toml(content: &str) -> SegResult<Self> {
        let config: EngineConfig = toml::from_str(content)
            .map_err(|e| SegmentationError::Config(format!("Failed to parse config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Validate configuration values.
    pub fn validate(&self) -> SegResult<()> {
        self.discovery.validate()
    }
}

/// Parameters for per-axis segment discovery.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct DiscoveryConfig {
    /// Minimum population; values below [`MIN_POPULATION`] are rejected.
    pub min_population: usize,
    /// k-means restarts per candidate k; the lowest-inertia run is kept.
    pub n_restarts: usize,
    pub max_iterations: u64,
    pub tolerance: f64,
    pub seed: u64,
    /// Candidates within this distance of the best silhouette prefer the smaller k.
    pub silhouette_tolerance: f64,
    /// Silhouette is computed on a deterministic sample of at most this many rows.
    pub silhouette_sample_size: usize,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            min_population: MIN_POPULATION,
            n_restarts: 10,
            max_iterations: MAX_ITERATION_CAP,
            tolerance: 1e-4,
            seed: 42,
            silhouette_tolerance: 0.02,
            silhouette_sample_size: 2000,
        }
    }
}

impl DiscoveryConfig {
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    pub fn validate(&self) -> SegResult<()> {
        if self.min_population < MIN_POPULATION {
            return Err(SegmentationError::Config(format!(
                "discovery.min_population must be at least {}",
                MIN_POPULATION
            )));
        }
        if self.n_restarts == 0 {
            return Err(SegmentationError::Config(
                "discovery.n_restarts must be greater than 0".into(),
            ));
        }
        if self.max_iterations == 0 || self.max_iterations > MAX_ITERATION_CAP {
            return Err(SegmentationError::Config(format!(
                "discovery.max_iterations must be in 1..={}",
                MAX_ITERATION_CAP
            )));
        }
        if !(self.tolerance.is_finite() && self.tolerance > 0.0) {
            return Err(SegmentationError::Config(
                "discovery.tolerance must be a finite positive number".into(),
            ));
        }
        if !(0.0..1.0).contains(&self.silhouette_tolerance) {
            return Err(SegmentationError::Config(
                "discovery.silhouette_tolerance must be in [0, 1)".into(),
            ));
        }
        if self.silhouette_sample_size < 2 {
            return Err(SegmentationError::Config(
                "discovery.silhouette_sample_size must be at least 2".into(),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct StorageConfig {
    /// One JSON file per axis definition.
    pub definitions_dir: PathBuf,
    /// JSON file holding every recorded snapshot.
    pub snapshots_path: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            definitions_dir: PathBuf::from("segments"),
            snapshots_path: PathBuf::from("snapshots.json"),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Default `tracing` filter when `RUST_LOG` is unset.
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}
