//! Streaming reconstruction of dense per-point classes on full tiles.
//!
//! The engine consumes `(batch, predictions)` pairs in arrival order. Items
//! of one tile must arrive contiguously, possibly across several batches;
//! the engine keeps at most one tile open and flushes it as soon as an item
//! of another tile appears, or when the stream ends.
//!
//! A flush interpolates in two nearest-neighbour passes:
//! 1. every full-resolution copy point takes the class of its nearest
//!    predicted (subsampled) point
//! 2. every point of the original tile takes the class of its nearest
//!    full-resolution copy point
//!
//! Nearest-neighbour queries use a `kiddo` KD-tree and run in parallel with
//! `rayon`. Flushes themselves are sequential.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use kiddo::{ImmutableKdTree, SquaredEuclidean};
use log::{debug, info};
use rayon::prelude::*;
use thiserror::Error;

use super::collate::Batch;
use super::storage::{StorageError, TileStore};
use crate::core::loaders::Position;

/// Errors that abort a reconstruction run.
#[derive(Error, Debug)]
pub enum ReconstructionError {
    #[error("tile '{tile}' reappeared in batch {batch} (item {item}) after it was closed")]
    UnorderedStream {
        tile: PathBuf,
        batch: usize,
        item: usize,
    },

    #[error("tile '{tile}' has no accumulated points to flush")]
    EmptyTile { tile: PathBuf },

    #[error("batch {batch} has {expected} subsampled points but {actual} predictions")]
    PredictionCountMismatch {
        batch: usize,
        expected: usize,
        actual: usize,
    },

    #[error("batch {batch} is malformed: {reason}")]
    MalformedBatch { batch: usize, reason: String },

    #[error("storage failed for tile '{tile}': {source}")]
    Storage {
        tile: PathBuf,
        #[source]
        source: StorageError,
    },
}

/// Result type for reconstruction operations.
pub type Result<T> = std::result::Result<T, ReconstructionError>;

/// Predictions and positions gathered for the open tile.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TileAccumulator {
    /// The `full_cloud_path` being assembled.
    pub tile: PathBuf,
    /// Positions of every point of the original tile, in file order.
    pub geometry: Vec<Position>,
    /// Raw positions of the predicted (subsampled) points.
    pub predicted_positions: Vec<Position>,
    /// One class per predicted point.
    pub predictions: Vec<u8>,
    /// Raw positions of every full-resolution copy point.
    pub full_positions: Vec<Position>,
    /// Number of subtile items merged so far.
    pub items: usize,
}

impl TileAccumulator {
    pub fn new(tile: PathBuf, geometry: Vec<Position>) -> Self {
        Self {
            tile,
            geometry,
            ..Default::default()
        }
    }

    /// Appends one batch item given its subsampled and full-copy point indices.
    fn push_item(&mut self, batch: &Batch, predictions: &[u8], subsampled: &[usize], full: &[usize]) {
        self.predicted_positions
            .extend(subsampled.iter().map(|&i| batch.pos_copy_subsampled[i]));
        self.predictions.extend(subsampled.iter().map(|&i| predictions[i]));
        self.full_positions.extend(full.iter().map(|&i| batch.pos_copy[i]));
        self.items += 1;
    }
}

/// Engine state: no tile, or exactly one tile being accumulated.
#[derive(Debug, Default)]
pub enum EngineState {
    #[default]
    Idle,
    Accumulating(TileAccumulator),
}

/// Summary of one flushed tile.
#[derive(Debug, Clone, PartialEq)]
pub struct FlushReport {
    pub tile: PathBuf,
    pub output: PathBuf,
    /// Points written, equal to the original tile's point count.
    pub points: usize,
    pub items: usize,
    pub predicted_points: usize,
    pub full_points: usize,
}

/// Two-stage nearest-neighbour interpolation of one tile.
///
/// Returns one class per `geometry` point, or `None` when there are no
/// predicted points or no full-resolution copy points to interpolate from.
/// Identical positions are collapsed before building each tree, keeping the
/// first occurrence, so ties never depend on tree internals.
pub fn interpolate_tile(
    predicted_positions: &[Position],
    predictions: &[u8],
    full_positions: &[Position],
    geometry: &[Position],
) -> Option<Vec<u8>> {
    let dense = nearest_labels(predicted_positions, predictions, full_positions)?;
    nearest_labels(full_positions, &dense, geometry)
}

/// For every query point, the label of its nearest reference point.
fn nearest_labels(reference: &[Position], labels: &[u8], queries: &[Position]) -> Option<Vec<u8>> {
    debug_assert_eq!(reference.len(), labels.len());
    if reference.is_empty() {
        return None;
    }

    let (unique, unique_labels) = dedup_positions(reference, labels);
    let tree: ImmutableKdTree<f64, 3> = ImmutableKdTree::new_from_slice(&unique);

    Some(
        queries
            .par_iter()
            .map(|q| {
                let nn = tree.nearest_one::<SquaredEuclidean>(q);
                unique_labels[nn.item as usize]
            })
            .collect(),
    )
}

fn dedup_positions(positions: &[Position], labels: &[u8]) -> (Vec<Position>, Vec<u8>) {
    let mut seen: HashSet<[u64; 3]> = HashSet::with_capacity(positions.len());
    let mut unique = Vec::with_capacity(positions.len());
    let mut unique_labels = Vec::with_capacity(positions.len());

    for (p, &label) in positions.iter().zip(labels) {
        // +0.0 folds -0.0 onto 0.0 so both hash alike.
        let key = [(p[0] + 0.0).to_bits(), (p[1] + 0.0).to_bits(), (p[2] + 0.0).to_bits()];
        if seen.insert(key) {
            unique.push(*p);
            unique_labels.push(label);
        }
    }
    (unique, unique_labels)
}

fn check_alignment(batch: &Batch, batch_index: usize) -> Result<()> {
    let malformed = |reason: String| ReconstructionError::MalformedBatch {
        batch: batch_index,
        reason,
    };
    let n = batch.num_points();
    if batch.pos_copy_subsampled.len() != n || batch.index_subsampled.len() != n {
        return Err(malformed(format!(
            "{} points, {} subsampled copies, {} subsampled indices",
            n,
            batch.pos_copy_subsampled.len(),
            batch.index_subsampled.len()
        )));
    }
    if batch.index_full.len() != batch.num_full_points() {
        return Err(malformed(format!(
            "{} copy points, {} full indices",
            batch.num_full_points(),
            batch.index_full.len()
        )));
    }
    let items = batch.num_items();
    for (name, index) in [("subsampled", &batch.index_subsampled), ("full", &batch.index_full)] {
        if let Some((point, &item)) = index.iter().enumerate().find(|&(_, &item)| item >= items) {
            return Err(malformed(format!(
                "{} index of point {} names item {} of {}",
                name, point, item, items
            )));
        }
    }
    Ok(())
}

/// Streaming tile reconstruction over a `TileStore`.
pub struct ReconstructionEngine<S: TileStore> {
    store: S,
    state: EngineState,
    closed: HashSet<PathBuf>,
    batches: usize,
}

impl<S: TileStore> ReconstructionEngine<S> {
    pub fn new(store: S) -> Self {
        Self {
            store,
            state: EngineState::Idle,
            closed: HashSet::new(),
            batches: 0,
        }
    }

    #[inline]
    pub fn state(&self) -> &EngineState {
        &self.state
    }

    #[inline]
    pub fn store(&self) -> &S {
        &self.store
    }

    /// Number of batches consumed so far.
    #[inline]
    pub fn batches_consumed(&self) -> usize {
        self.batches
    }

    /// Consumes one batch and its per-point predictions.
    ///
    /// Returns the reports of tiles flushed while consuming, in order.
    ///
    /// # Errors
    ///
    /// `PredictionCountMismatch` if `predictions` is not aligned with the
    /// batch's subsampled points, `UnorderedStream` if an item belongs to an
    /// already closed tile, and any error raised by a flush.
    pub fn consume(&mut self, batch: &Batch, predictions: &[u8]) -> Result<Vec<FlushReport>> {
        let batch_index = self.batches;
        if predictions.len() != batch.num_points() {
            return Err(ReconstructionError::PredictionCountMismatch {
                batch: batch_index,
                expected: batch.num_points(),
                actual: predictions.len(),
            });
        }

        check_alignment(batch, batch_index)?;

        let subsampled = batch.subsampled_groups();
        let full = batch.full_groups();
        let mut reports = Vec::new();

        for (item, tile) in batch.full_cloud_paths.iter().enumerate() {
            let is_open = matches!(&self.state, EngineState::Accumulating(acc) if &acc.tile == tile);
            if !is_open {
                if self.closed.contains(tile) {
                    return Err(ReconstructionError::UnorderedStream {
                        tile: tile.clone(),
                        batch: batch_index,
                        item,
                    });
                }
                if let Some(report) = self.close_open_tile()? {
                    reports.push(report);
                }
                self.open(tile)?;
            }

            if let EngineState::Accumulating(acc) = &mut self.state {
                acc.push_item(batch, predictions, &subsampled[item], &full[item]);
            }
        }

        self.batches += 1;
        Ok(reports)
    }

    /// Flushes the open tile at end of stream.
    pub fn finish(&mut self) -> Result<Option<FlushReport>> {
        self.close_open_tile()
    }

    fn open(&mut self, tile: &Path) -> Result<()> {
        debug!("Opening tile {}", tile.display());
        let geometry = self
            .store
            .load_geometry(tile)
            .map_err(|source| ReconstructionError::Storage {
                tile: tile.to_path_buf(),
                source,
            })?;
        self.state = EngineState::Accumulating(TileAccumulator::new(tile.to_path_buf(), geometry));
        Ok(())
    }

    fn close_open_tile(&mut self) -> Result<Option<FlushReport>> {
        match std::mem::take(&mut self.state) {
            EngineState::Idle => Ok(None),
            EngineState::Accumulating(acc) => {
                self.closed.insert(acc.tile.clone());
                self.flush(acc).map(Some)
            }
        }
    }

    /// Interpolates and persists one tile, consuming its accumulator.
    pub fn flush(&mut self, acc: TileAccumulator) -> Result<FlushReport> {
        let classes = interpolate_tile(
            &acc.predicted_positions,
            &acc.predictions,
            &acc.full_positions,
            &acc.geometry,
        )
        .ok_or_else(|| ReconstructionError::EmptyTile {
            tile: acc.tile.clone(),
        })?;

        let output = self
            .store
            .write_classification(&acc.tile, &classes)
            .map_err(|source| ReconstructionError::Storage {
                tile: acc.tile.clone(),
                source,
            })?;

        let report = FlushReport {
            tile: acc.tile,
            output,
            points: classes.len(),
            items: acc.items,
            predicted_points: acc.predictions.len(),
            full_points: acc.full_positions.len(),
        };
        info!(
            "Flushed {} ({} items, {} predicted, {} copy points) -> {} ({} points)",
            report.tile.display(),
            report.items,
            report.predicted_points,
            report.full_points,
            report.output.display(),
            report.points
        );
        Ok(report)
    }
}
