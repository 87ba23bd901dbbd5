//! LiDAR point cloud pipeline for neural-network classification.
//!
//! This crate provides tools for:
//! - Loading LAS tiles into index-aligned point arrays
//! - Cutting tiles into square subtiles and subsampling them to a fixed size
//! - Collating subtiles into batches that keep per-point provenance
//! - Streaming predictions back onto full-resolution tiles with two-stage
//!   nearest-neighbour interpolation (parallelized)
//!
//! # Example
//!
//! ```no_run
//! use lidar_pipeline::processors::{
//!     Classifier, LabelEcho, LasTileStore, ReconstructionEngine, TileStream,
//! };
//! use lidar_pipeline::PipelineConfig;
//!
//! let config = PipelineConfig::default();
//! let tiles = vec!["tile.las".into()];
//! let mut engine = ReconstructionEngine::new(LasTileStore::from_config(&config.reconstruction));
//! let mut model = LabelEcho;
//!
//! for batch in TileStream::from_config(tiles, &config).unwrap() {
//!     let batch = batch.unwrap();
//!     let predictions = model.classify(&batch).unwrap();
//!     engine.consume(&batch, &predictions).unwrap();
//! }
//! engine.finish().unwrap();
//! ```

pub mod cli;
pub mod config;
pub mod core;
pub mod processors;

pub use config::{
    ClassMappingConfig, NormalizationConfig, PipelineConfig, ReconstructionConfig, SamplingConfig,
    SubtileConfig,
};
pub use crate::core::loaders::{PointArrays, PointCloudRecord};

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
