//! Batch streams over a list of tiles.
//!
//! Tiles are loaded one at a time and every subtile centre of a tile is run
//! through the pipeline before the next tile is touched. A batch may straddle
//! two tiles, but items of one tile are always contiguous.
//!
//! The inference stream covers each tile with a grid of centres, keeps the
//! given tile order and never shuffles, which is what `ReconstructionEngine`
//! requires. The training stream shuffles the tile order and draws a fixed
//! number of centres per tile on randomly chosen points.

use std::collections::VecDeque;
use std::path::PathBuf;

use log::{info, warn};
use rand::seq::SliceRandom;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use thiserror::Error;

use super::collate::{collate, Batch, CollateError};
use super::pipeline::{PipelineStats, TransformPipeline};
use super::subtile::{random_center, subtile_centers, SubtileError};
use crate::config::PipelineConfig;
use crate::core::loaders::{load_las, LoaderError, PointCloudRecord};

/// Errors that end the stream.
#[derive(Error, Debug)]
pub enum StreamError {
    #[error(transparent)]
    Load(#[from] LoaderError),

    #[error(transparent)]
    Subtile(#[from] SubtileError),

    #[error(transparent)]
    Collate(#[from] CollateError),
}

/// Result type for stream operations.
pub type Result<T> = std::result::Result<T, StreamError>;

/// How subtile centres are chosen for each tile.
enum CenterPlan {
    /// Regular grid covering the whole tile.
    Grid { overlap: f64 },
    /// `per_tile` centres on uniformly drawn points.
    Random { per_tile: usize, rng: ChaCha8Rng },
}

impl CenterPlan {
    fn centers(&mut self, record: &PointCloudRecord, width: f64) -> Result<Vec<[f64; 2]>> {
        match self {
            CenterPlan::Grid { overlap } => {
                let Some(bounds) = record.points.horizontal_bounds() else {
                    return Ok(Vec::new());
                };
                Ok(subtile_centers(&bounds, width, *overlap)?)
            }
            CenterPlan::Random { per_tile, rng } => Ok((0..*per_tile)
                .filter_map(|_| random_center(record, rng))
                .collect()),
        }
    }
}

/// The tile currently being cut into subtiles.
struct OpenTile {
    record: PointCloudRecord,
    centers: Vec<[f64; 2]>,
    cursor: usize,
}

impl OpenTile {
    fn next_center(&mut self) -> Option<[f64; 2]> {
        let center = self.centers.get(self.cursor).copied()?;
        self.cursor += 1;
        Some(center)
    }
}

/// Iterator of collated batches over a list of tiles.
pub struct TileStream {
    tiles: VecDeque<PathBuf>,
    pipeline: TransformPipeline,
    plan: CenterPlan,
    batch_size: usize,
    open: Option<OpenTile>,
    stats: PipelineStats,
    tiles_loaded: usize,
}

impl TileStream {
    /// Inference stream: tiles in the given order, each covered by a grid of
    /// centres.
    pub fn new(tiles: Vec<PathBuf>, pipeline: TransformPipeline, overlap: f64, batch_size: usize) -> Self {
        Self::with_plan(tiles, pipeline, CenterPlan::Grid { overlap }, batch_size)
    }

    /// Training stream: tiles in shuffled order, `per_tile` random centres
    /// each. `seed = None` seeds from OS entropy.
    pub fn training(
        mut tiles: Vec<PathBuf>,
        pipeline: TransformPipeline,
        per_tile: usize,
        batch_size: usize,
        seed: Option<u64>,
    ) -> Self {
        let mut rng = match seed {
            Some(seed) => ChaCha8Rng::seed_from_u64(seed),
            None => ChaCha8Rng::from_entropy(),
        };
        tiles.shuffle(&mut rng);
        Self::with_plan(tiles, pipeline, CenterPlan::Random { per_tile, rng }, batch_size)
    }

    fn with_plan(tiles: Vec<PathBuf>, pipeline: TransformPipeline, plan: CenterPlan, batch_size: usize) -> Self {
        Self {
            tiles: tiles.into(),
            pipeline,
            plan,
            batch_size: batch_size.max(1),
            open: None,
            stats: PipelineStats::default(),
            tiles_loaded: 0,
        }
    }

    /// Stream with the canonical pipeline built from `config`.
    pub fn from_config(tiles: Vec<PathBuf>, config: &PipelineConfig) -> Result<Self> {
        let pipeline = TransformPipeline::canonical(config)?;
        Ok(Self::new(
            tiles,
            pipeline,
            config.subtile.overlap,
            config.reconstruction.batch_size,
        ))
    }

    /// Training stream with the canonical pipeline built from `config`.
    pub fn training_from_config(tiles: Vec<PathBuf>, config: &PipelineConfig) -> Result<Self> {
        let pipeline = TransformPipeline::canonical(config)?;
        Ok(Self::training(
            tiles,
            pipeline,
            config.subtile.train_subtiles_per_tile,
            config.reconstruction.batch_size,
            config.sampling.seed,
        ))
    }

    /// Outcomes of every subtile processed so far.
    #[inline]
    pub fn stats(&self) -> PipelineStats {
        self.stats
    }

    #[inline]
    pub fn tiles_loaded(&self) -> usize {
        self.tiles_loaded
    }

    /// Loads the next tile with at least one centre, or returns `None` when
    /// the list is exhausted.
    fn open_next_tile(&mut self) -> Result<Option<OpenTile>> {
        while let Some(path) = self.tiles.pop_front() {
            let record = load_las(&path)?;
            self.tiles_loaded += 1;

            let centers = self.plan.centers(&record, self.pipeline.sampler().width())?;
            if centers.is_empty() {
                warn!("{}: no subtile centres, skipping", path.display());
                continue;
            }
            info!(
                "{}: {} points, {} subtile centres",
                path.display(),
                record.len(),
                centers.len()
            );
            return Ok(Some(OpenTile {
                record,
                centers,
                cursor: 0,
            }));
        }
        Ok(None)
    }

    fn next_batch(&mut self) -> Result<Option<Batch>> {
        let mut items = Vec::with_capacity(self.batch_size);

        while items.len() < self.batch_size {
            let center = match self.open.as_mut().and_then(OpenTile::next_center) {
                Some(center) => center,
                None => match self.open_next_tile()? {
                    Some(tile) => {
                        self.open = Some(tile);
                        continue;
                    }
                    None => {
                        self.open = None;
                        break;
                    }
                },
            };

            if let Some(tile) = self.open.as_ref() {
                if let Some(item) = self.pipeline.run_counted(&tile.record, center, &mut self.stats) {
                    items.push(item);
                }
            }
        }

        if items.is_empty() {
            return Ok(None);
        }
        Ok(Some(collate(items)?))
    }
}

impl Iterator for TileStream {
    type Item = Result<Batch>;

    fn next(&mut self) -> Option<Self::Item> {
        match self.next_batch() {
            Ok(Some(batch)) => Some(Ok(batch)),
            Ok(None) => None,
            Err(e) => {
                // A failed tile ends the stream.
                self.tiles.clear();
                self.open = None;
                Some(Err(e))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::fixtures::{grid_points, write_test_las};
    use std::path::Path;
    use tempfile::TempDir;

    fn config(batch_size: usize) -> PipelineConfig {
        let mut config = PipelineConfig::default();
        config.subtile.width_meters = 10.0;
        config.subtile.min_points = 1;
        config.sampling.input_cloud_size = 16;
        config.sampling.seed = Some(11);
        config.reconstruction.batch_size = batch_size;
        config
    }

    fn write_tile(dir: &Path, name: &str, side: usize) -> PathBuf {
        let path = dir.join(name);
        write_test_las(&path, &grid_points([0.0, 0.0], side, |_, _| 1));
        path
    }

    #[test]
    fn test_items_of_a_tile_are_contiguous() {
        let dir = TempDir::new().unwrap();
        // 20x20 grid, 10 m windows: 2x2 centres per tile.
        let a = write_tile(dir.path(), "a.las", 20);
        let b = write_tile(dir.path(), "b.las", 20);

        let stream = TileStream::from_config(vec![a.clone(), b.clone()], &config(3)).unwrap();
        let batches: Vec<Batch> = stream.map(|b| b.unwrap()).collect();

        let sizes: Vec<usize> = batches.iter().map(Batch::num_items).collect();
        assert_eq!(sizes, vec![3, 3, 2]);

        let order: Vec<PathBuf> = batches
            .iter()
            .flat_map(|b| b.full_cloud_paths.iter().cloned())
            .collect();
        assert_eq!(order, vec![a.clone(), a.clone(), a.clone(), a, b.clone(), b.clone(), b.clone(), b]);
        assert!(batches.iter().all(|b| b.num_points() == b.num_items() * 16));
    }

    #[test]
    fn test_stats_and_skipped_windows() {
        let dir = TempDir::new().unwrap();
        let tile = write_tile(dir.path(), "tile.las", 20);

        let mut cfg = config(8);
        cfg.subtile.min_points = 1000;
        let mut stream = TileStream::from_config(vec![tile], &cfg).unwrap();
        assert!(stream.next().is_none());
        assert_eq!(stream.stats().dropped, 4);
        assert_eq!(stream.tiles_loaded(), 1);
    }

    #[test]
    fn test_training_stream_draws_random_centres() {
        let dir = TempDir::new().unwrap();
        let a = write_tile(dir.path(), "a.las", 20);
        let b = write_tile(dir.path(), "b.las", 20);

        let mut cfg = config(2);
        cfg.subtile.train_subtiles_per_tile = 3;
        let stream = TileStream::training_from_config(vec![a.clone(), b.clone()], &cfg).unwrap();
        let batches: Vec<Batch> = stream.map(|b| b.unwrap()).collect();

        let sizes: Vec<usize> = batches.iter().map(Batch::num_items).collect();
        assert_eq!(sizes, vec![2, 2, 2]);

        let order: Vec<PathBuf> = batches
            .iter()
            .flat_map(|b| b.full_cloud_paths.iter().cloned())
            .collect();
        assert_eq!(order.iter().filter(|p| **p == a).count(), 3);
        assert_eq!(order[0], order[1]);
        assert_eq!(order[1], order[2]);

        // Every centre sits on a grid point of the tile.
        for center in batches.iter().flat_map(|b| b.centers.iter()) {
            assert_eq!(center[0].fract(), 0.0);
            assert_eq!(center[1].fract(), 0.0);
            assert!((0.0..20.0).contains(&center[0]));
        }
    }

    #[test]
    fn test_training_stream_is_seeded() {
        let dir = TempDir::new().unwrap();
        let tiles: Vec<PathBuf> = (0..4).map(|i| write_tile(dir.path(), &format!("t{i}.las"), 8)).collect();

        let centres = || -> Vec<[f64; 2]> {
            TileStream::training_from_config(tiles.clone(), &config(4))
                .unwrap()
                .flat_map(|b| b.unwrap().centers)
                .collect()
        };
        assert_eq!(centres(), centres());
    }

    #[test]
    fn test_missing_tile_ends_stream() {
        let dir = TempDir::new().unwrap();
        let good = write_tile(dir.path(), "good.las", 5);

        let mut stream =
            TileStream::from_config(vec![dir.path().join("missing.las"), good], &config(2)).unwrap();
        assert!(matches!(stream.next(), Some(Err(StreamError::Load(_)))));
        assert!(stream.next().is_none());
    }
}
