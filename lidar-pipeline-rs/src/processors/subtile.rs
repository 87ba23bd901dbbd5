//! Square subtile windows over a tile.
//!
//! A subtile is every point whose Chebyshev distance (max of |dx|, |dy|) to a
//! horizontal centre is at most half the window width.

use rand::Rng;
use rayon::prelude::*;
use thiserror::Error;

use crate::config::SubtileConfig;
use crate::core::loaders::{HorizontalBounds, PointCloudRecord};
use crate::core::transforms::SubtileItem;

/// Errors for invalid window geometry.
#[derive(Error, Debug, PartialEq)]
pub enum SubtileError {
    #[error("subtile width must be positive and finite, got {0}")]
    InvalidWidth(f64),

    #[error("subtile overlap must be in [0, 1), got {0}")]
    InvalidOverlap(f64),
}

/// Result type for subtile operations.
pub type Result<T> = std::result::Result<T, SubtileError>;

/// Extracts fixed-width square windows from a loaded tile.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SubtileSampler {
    width: f64,
}

impl SubtileSampler {
    pub fn new(width: f64) -> Result<Self> {
        if !(width.is_finite() && width > 0.0) {
            return Err(SubtileError::InvalidWidth(width));
        }
        Ok(Self { width })
    }

    pub fn from_config(config: &SubtileConfig) -> Result<Self> {
        Self::new(config.width_meters)
    }

    #[inline]
    pub fn width(&self) -> f64 {
        self.width
    }

    /// Indices of the points of `record` inside the window centred at `center`.
    pub fn window_indices(&self, record: &PointCloudRecord, center: [f64; 2]) -> Vec<usize> {
        let half = self.width / 2.0;
        record
            .points
            .positions()
            .par_iter()
            .enumerate()
            .filter(|(_, p)| chebyshev_xy(p, center) <= half)
            .map(|(i, _)| i)
            .collect()
    }

    /// Cuts the window centred at `center` out of `record`.
    ///
    /// Returns `None` when the window holds no points. Points keep their
    /// relative file order.
    pub fn extract(&self, record: &PointCloudRecord, center: [f64; 2]) -> Option<SubtileItem> {
        let indices = self.window_indices(record, center);
        if indices.is_empty() {
            return None;
        }

        Some(SubtileItem {
            points: record.points.select(&indices),
            full_copy: None,
            pos_copy_subsampled: None,
            source_path: record.source_path.clone(),
            full_cloud_path: record.full_cloud_path.clone(),
            center,
        })
    }
}

#[inline]
fn chebyshev_xy(p: &[f64; 3], center: [f64; 2]) -> f64 {
    (p[0] - center[0]).abs().max((p[1] - center[1]).abs())
}

/// Regular grid of window centres covering `bounds`.
///
/// The first centre sits half a width inside the minimum corner and centres
/// advance by `width * (1 - overlap)` until a window reaches the maximum edge
/// on each axis. Centres are ordered by x, then y.
pub fn subtile_centers(bounds: &HorizontalBounds, width: f64, overlap: f64) -> Result<Vec<[f64; 2]>> {
    if !(width.is_finite() && width > 0.0) {
        return Err(SubtileError::InvalidWidth(width));
    }
    if !(0.0..1.0).contains(&overlap) {
        return Err(SubtileError::InvalidOverlap(overlap));
    }

    let stride = width * (1.0 - overlap);
    let xs = axis_centers(bounds.min_x, bounds.max_x, width, stride);
    let ys = axis_centers(bounds.min_y, bounds.max_y, width, stride);

    Ok(xs
        .iter()
        .flat_map(|&x| ys.iter().map(move |&y| [x, y]))
        .collect())
}

fn axis_centers(min: f64, max: f64, width: f64, stride: f64) -> Vec<f64> {
    let half = width / 2.0;
    let steps = ((max - min - width) / stride).max(0.0).ceil() as usize;
    (0..=steps).map(|i| min + half + i as f64 * stride).collect()
}

/// Horizontal position of a uniformly chosen point, or `None` for an empty cloud.
pub fn random_center<R: Rng + ?Sized>(record: &PointCloudRecord, rng: &mut R) -> Option<[f64; 2]> {
    let positions = record.points.positions();
    if positions.is_empty() {
        return None;
    }
    let p = positions[rng.gen_range(0..positions.len())];
    Some([p[0], p[1]])
}
