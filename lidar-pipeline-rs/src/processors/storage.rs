//! Tile storage used by the reconstruction engine.

use std::path::{Path, PathBuf};

use thiserror::Error;

use crate::config::ReconstructionConfig;
use crate::core::loaders::{self, LoaderError, Position};
use crate::core::writers::{self, WriteError};

/// Errors raised by a tile store.
#[derive(Error, Debug)]
pub enum StorageError {
    #[error(transparent)]
    Load(#[from] LoaderError),

    #[error(transparent)]
    Write(#[from] WriteError),

    #[error("tile path '{0}' has no file name")]
    NoFileName(PathBuf),
}

/// Result type for storage operations.
pub type Result<T> = std::result::Result<T, StorageError>;

/// Reads tile geometry and persists per-point classes.
pub trait TileStore {
    /// Positions of every point of `tile`, in file order.
    fn load_geometry(&mut self, tile: &Path) -> Result<Vec<Position>>;

    /// Persists one class per point of `tile` and returns where it went.
    fn write_classification(&mut self, tile: &Path, classes: &[u8]) -> Result<PathBuf>;
}

/// LAS-backed store writing `<output_dir>/<phase>_<tile file name>`.
#[derive(Debug, Clone)]
pub struct LasTileStore {
    output_dir: PathBuf,
    phase: String,
}

impl LasTileStore {
    pub fn new<P: Into<PathBuf>>(output_dir: P, phase: impl Into<String>) -> Self {
        Self {
            output_dir: output_dir.into(),
            phase: phase.into(),
        }
    }

    pub fn from_config(config: &ReconstructionConfig) -> Self {
        Self::new(config.output_dir.clone(), config.phase.clone())
    }

    /// Output path for `tile`.
    pub fn output_path(&self, tile: &Path) -> Result<PathBuf> {
        let name = tile
            .file_name()
            .ok_or_else(|| StorageError::NoFileName(tile.to_path_buf()))?;
        Ok(self
            .output_dir
            .join(format!("{}_{}", self.phase, name.to_string_lossy())))
    }
}

impl TileStore for LasTileStore {
    fn load_geometry(&mut self, tile: &Path) -> Result<Vec<Position>> {
        Ok(loaders::load_geometry(tile)?)
    }

    fn write_classification(&mut self, tile: &Path, classes: &[u8]) -> Result<PathBuf> {
        let output = self.output_path(tile)?;
        writers::write_classified_las(tile, &output, classes)?;
        Ok(output)
    }
}
