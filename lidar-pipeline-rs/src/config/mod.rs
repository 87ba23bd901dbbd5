//! Configuration types for the LiDAR pipeline.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Configuration for subtile extraction.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubtileConfig {
    /// Side length of the square subtile window in meters
    #[serde(default = "default_width_meters")]
    pub width_meters: f64,

    /// Fraction of the width shared by neighbouring subtiles, in [0, 1)
    #[serde(default)]
    pub overlap: f64,

    /// Subtiles with fewer points are dropped
    #[serde(default = "default_min_points")]
    pub min_points: usize,

    /// Random subtiles drawn from each tile per training pass
    #[serde(default = "default_train_subtiles_per_tile")]
    pub train_subtiles_per_tile: usize,
}

fn default_width_meters() -> f64 {
    50.0
}

fn default_min_points() -> usize {
    50
}

fn default_train_subtiles_per_tile() -> usize {
    4
}

impl Default for SubtileConfig {
    fn default() -> Self {
        Self {
            width_meters: default_width_meters(),
            overlap: 0.0,
            min_points: default_min_points(),
            train_subtiles_per_tile: default_train_subtiles_per_tile(),
        }
    }
}

/// Configuration for fixed-size point subsampling.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SamplingConfig {
    /// Number of points fed to the network per subtile
    #[serde(default = "default_input_cloud_size")]
    pub input_cloud_size: usize,

    /// Draw indices independently with replacement
    #[serde(default = "default_replace")]
    pub replace: bool,

    /// Without replacement, repeat whole permutations to reach the budget
    #[serde(default)]
    pub allow_duplicates: bool,

    /// Seed for reproducible sampling (random when absent)
    #[serde(default)]
    pub seed: Option<u64>,
}

fn default_input_cloud_size() -> usize {
    200_000
}

fn default_replace() -> bool {
    true
}

impl Default for SamplingConfig {
    fn default() -> Self {
        Self {
            input_cloud_size: default_input_cloud_size(),
            replace: default_replace(),
            allow_duplicates: false,
            seed: None,
        }
    }
}

/// Constants used to bring features and positions into network range.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NormalizationConfig {
    /// Maximum raw intensity value
    #[serde(default = "default_intensity_max")]
    pub intensity_max: f32,

    /// Maximum return number / number of returns
    #[serde(default = "default_return_num_max")]
    pub return_num_max: f32,

    /// Vertical extent mapped to one unit
    #[serde(default = "default_z_scale")]
    pub z_scale: f64,

    /// Factor keeping the largest horizontal coordinate strictly inside 1.0
    #[serde(default = "default_xy_margin")]
    pub xy_margin: f64,

    /// Measure horizontal coordinates from the subtile centre before scaling
    #[serde(default = "default_center_xy")]
    pub center_xy: bool,
}

fn default_intensity_max() -> f32 {
    32768.0
}

fn default_return_num_max() -> f32 {
    7.0
}

fn default_z_scale() -> f64 {
    100.0
}

fn default_xy_margin() -> f64 {
    0.999999
}

fn default_center_xy() -> bool {
    false
}

impl Default for NormalizationConfig {
    fn default() -> Self {
        Self {
            intensity_max: default_intensity_max(),
            return_num_max: default_return_num_max(),
            z_scale: default_z_scale(),
            xy_margin: default_xy_margin(),
            center_xy: default_center_xy(),
        }
    }
}

/// Configuration for reconstructing predictions onto full tiles.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReconstructionConfig {
    /// Directory receiving one output LAS per tile
    #[serde(default = "default_output_dir")]
    pub output_dir: PathBuf,

    /// Phase tag prefixed to output file names (e.g. "test", "predict")
    #[serde(default = "default_phase")]
    pub phase: String,

    /// Number of subtile items per batch
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
}

fn default_output_dir() -> PathBuf {
    PathBuf::from("predictions")
}

fn default_phase() -> String {
    "test".to_string()
}

fn default_batch_size() -> usize {
    8
}

impl Default for ReconstructionConfig {
    fn default() -> Self {
        Self {
            output_dir: default_output_dir(),
            phase: default_phase(),
            batch_size: default_batch_size(),
        }
    }
}

/// Raw LAS class codes, in the order of the dense class indices they map to.
///
/// An empty list keeps raw codes unchanged.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ClassMappingConfig {
    #[serde(default)]
    pub codes: Vec<u8>,
}

/// Main pipeline configuration combining all sub-configs.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PipelineConfig {
    #[serde(default)]
    pub subtile: SubtileConfig,

    #[serde(default)]
    pub sampling: SamplingConfig,

    #[serde(default)]
    pub normalization: NormalizationConfig,

    #[serde(default)]
    pub reconstruction: ReconstructionConfig,

    #[serde(default)]
    pub classes: ClassMappingConfig,
}

impl PipelineConfig {
    /// Load configuration from a YAML file.
    pub fn from_yaml<P: AsRef<Path>>(path: P) -> Result<Self, Box<dyn std::error::Error>> {
        let content = std::fs::read_to_string(path)?;
        let config: PipelineConfig = serde_yaml::from_str(&content)?;
        Ok(config)
    }

    /// Save configuration to a YAML file.
    pub fn to_yaml<P: AsRef<Path>>(&self, path: P) -> Result<(), Box<dyn std::error::Error>> {
        let content = serde_yaml::to_string(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_default_pipeline_config() {
        let config = PipelineConfig::default();
        assert_eq!(config.subtile.width_meters, 50.0);
        assert_eq!(config.subtile.min_points, 50);
        assert_eq!(config.subtile.train_subtiles_per_tile, 4);
        assert_eq!(config.sampling.input_cloud_size, 200_000);
        assert!(config.sampling.replace);
        assert!(!config.normalization.center_xy);
        assert_eq!(config.reconstruction.phase, "test");
        assert!(config.classes.codes.is_empty());
    }

    #[test]
    fn test_partial_yaml_uses_defaults() {
        let yaml = "subtile:\n  width_meters: 100.0\nsampling:\n  replace: false\n";
        let config: PipelineConfig = serde_yaml::from_str(yaml).unwrap();

        assert_eq!(config.subtile.width_meters, 100.0);
        assert_eq!(config.subtile.min_points, 50);
        assert!(!config.sampling.replace);
        assert_eq!(config.normalization.intensity_max, 32768.0);
    }

    #[test]
    fn test_yaml_round_trip() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.yaml");

        let mut config = PipelineConfig::default();
        config.classes.codes = vec![1, 2, 6];
        config.sampling.seed = Some(7);
        config.to_yaml(&path).unwrap();

        let loaded = PipelineConfig::from_yaml(&path).unwrap();
        assert_eq!(loaded.classes.codes, vec![1, 2, 6]);
        assert_eq!(loaded.sampling.seed, Some(7));
    }
}
