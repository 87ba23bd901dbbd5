//! Per-item transforms applied to subtiles before batching.
//!
//! A transform consumes a `SubtileItem` and either returns it (possibly
//! modified) as `Step::Keep`, or drops it with `Step::Drop`. Transforms that
//! hit a hard error for one item (e.g. not enough points to subsample
//! without replacement) return `Err`; callers report the error and drop the
//! item without stopping the rest of the stream.

use std::collections::HashMap;
use std::path::PathBuf;

use log::debug;
use rayon::prelude::*;
use thiserror::Error;

use super::loaders::{PointArrays, Position};
use crate::config::NormalizationConfig;
use crate::processors::sampling::SamplingError;

/// Half of the unit interval; features are centred on zero.
const HALF_UNIT: f32 = 0.5;

/// Errors that abort a single item.
#[derive(Error, Debug)]
pub enum TransformError {
    #[error(transparent)]
    Sampling(#[from] SamplingError),

    #[error("{field} has {actual} entries, expected {expected} (stage {stage})")]
    Misaligned {
        stage: &'static str,
        field: &'static str,
        expected: usize,
        actual: usize,
    },
}

/// Result type for transform operations.
pub type Result<T> = std::result::Result<T, TransformError>;

/// Why an item was dropped.
#[derive(Debug, Clone, PartialEq)]
pub enum DropReason {
    /// The subtile window contained no points.
    EmptyWindow,
    /// Fewer points than the configured minimum.
    TooFewPoints { count: usize, min: usize },
    /// A stage produced NaN or infinite values.
    NonFinite { stage: &'static str },
}

/// Outcome of one transform stage.
#[derive(Debug)]
pub enum Step {
    Keep(SubtileItem),
    Drop(DropReason),
}

/// Positions and labels of every subtile point, captured before subsampling.
#[derive(Debug, Clone, PartialEq)]
pub struct FullResolutionCopy {
    pos: Vec<Position>,
    labels: Option<Vec<u8>>,
}

impl FullResolutionCopy {
    /// Snapshot positions and labels of `points`; both stay index-aligned.
    pub fn capture(points: &PointArrays) -> Self {
        Self {
            pos: points.positions().to_vec(),
            labels: points.labels().map(<[u8]>::to_vec),
        }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.pos.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.pos.is_empty()
    }

    #[inline]
    pub fn positions(&self) -> &[Position] {
        &self.pos
    }

    #[inline]
    pub fn labels(&self) -> Option<&[u8]> {
        self.labels.as_deref()
    }

    #[inline]
    pub fn labels_mut(&mut self) -> Option<&mut [u8]> {
        self.labels.as_deref_mut()
    }
}

/// One sampled window of a tile, as it flows through the pipeline.
#[derive(Debug, Clone)]
pub struct SubtileItem {
    /// Points fed to the network (`pos`, `x`, `y`).
    pub points: PointArrays,
    /// Every subtile point before subsampling (`pos_copy`, `y_copy`).
    pub full_copy: Option<FullResolutionCopy>,
    /// Raw positions aligned 1:1 with `points`, captured right after subsampling.
    pub pos_copy_subsampled: Option<Vec<Position>>,
    /// File the points were read from.
    pub source_path: PathBuf,
    /// Full tile this item belongs to; never changed by transforms.
    pub full_cloud_path: PathBuf,
    /// Horizontal centre of the window.
    pub center: [f64; 2],
}

impl SubtileItem {
    /// Returns the number of (possibly subsampled) points.
    #[inline]
    pub fn len(&self) -> usize {
        self.points.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }
}

/// A pipeline stage.
pub trait Transform: Send {
    /// Short stage name used in logs and errors.
    fn name(&self) -> &'static str;

    fn apply(&mut self, item: SubtileItem) -> Result<Step>;
}

/// Drops almost empty subtiles.
#[derive(Debug, Clone)]
pub struct EmptySubtileFilter {
    pub min_points: usize,
}

impl Transform for EmptySubtileFilter {
    fn name(&self) -> &'static str {
        "filter-empty"
    }

    fn apply(&mut self, item: SubtileItem) -> Result<Step> {
        if item.len() < self.min_points {
            return Ok(Step::Drop(DropReason::TooFewPoints {
                count: item.len(),
                min: self.min_points,
            }));
        }
        Ok(Step::Keep(item))
    }
}

/// Captures positions and labels of the whole subtile for later interpolation.
#[derive(Debug, Clone, Default)]
pub struct CopyFullResolution;

impl Transform for CopyFullResolution {
    fn name(&self) -> &'static str {
        "copy-full-res"
    }

    fn apply(&mut self, mut item: SubtileItem) -> Result<Step> {
        item.full_copy = Some(FullResolutionCopy::capture(&item.points));
        Ok(Step::Keep(item))
    }
}

/// Captures raw positions of the subsampled points before normalization.
#[derive(Debug, Clone, Default)]
pub struct CopySubsampledPos;

impl Transform for CopySubsampledPos {
    fn name(&self) -> &'static str {
        "copy-subsampled-pos"
    }

    fn apply(&mut self, mut item: SubtileItem) -> Result<Step> {
        item.pos_copy_subsampled = Some(item.points.positions().to_vec());
        Ok(Step::Keep(item))
    }
}

/// Rescales each feature channel to span [-0.5, 0.5].
#[derive(Debug, Clone)]
pub struct NormalizeFeatures {
    pub intensity_max: f32,
    pub return_num_max: f32,
}

impl NormalizeFeatures {
    pub fn from_config(config: &NormalizationConfig) -> Self {
        Self {
            intensity_max: config.intensity_max,
            return_num_max: config.return_num_max,
        }
    }
}

impl Transform for NormalizeFeatures {
    fn name(&self) -> &'static str {
        "normalize-features"
    }

    fn apply(&mut self, mut item: SubtileItem) -> Result<Step> {
        let intensity_max = self.intensity_max;
        let return_span = self.return_num_max - 1.0;

        item.points.features_mut().par_iter_mut().for_each(|f| {
            f[0] = f[0] / intensity_max - HALF_UNIT;
            f[1] = (f[1] - 1.0) / return_span - HALF_UNIT;
            f[2] = (f[2] - 1.0) / return_span - HALF_UNIT;
        });

        Ok(Step::Keep(item))
    }
}

/// Rescales positions into network range.
///
/// Horizontal coordinates are scaled so the largest absolute value becomes
/// `xy_margin`, just under 1.0. By default that is the raw coordinate; with
/// `center_xy` it is measured from the subtile centre instead. Heights are
/// shifted to start at zero and divided by `z_scale`.
#[derive(Debug, Clone)]
pub struct NormalizeScale {
    pub z_scale: f64,
    pub xy_margin: f64,
    pub center_xy: bool,
}

impl NormalizeScale {
    pub fn from_config(config: &NormalizationConfig) -> Self {
        Self {
            z_scale: config.z_scale,
            xy_margin: config.xy_margin,
            center_xy: config.center_xy,
        }
    }
}

impl Default for NormalizeScale {
    fn default() -> Self {
        Self::from_config(&NormalizationConfig::default())
    }
}

impl Transform for NormalizeScale {
    fn name(&self) -> &'static str {
        "normalize-scale"
    }

    fn apply(&mut self, mut item: SubtileItem) -> Result<Step> {
        if item.is_empty() {
            return Ok(Step::Keep(item));
        }
        let origin = if self.center_xy { item.center } else { [0.0, 0.0] };
        let pos = item.points.positions_mut();

        let (max_abs_xy, min_z) = pos.iter().fold((0.0f64, f64::INFINITY), |(m, z), p| {
            let dx = (p[0] - origin[0]).abs();
            let dy = (p[1] - origin[1]).abs();
            (m.max(dx).max(dy), z.min(p[2]))
        });

        // Points stacked on the origin keep a zero horizontal extent.
        let xy_scale = if max_abs_xy > 0.0 {
            self.xy_margin / max_abs_xy
        } else {
            1.0
        };
        let z_scale = self.z_scale;

        pos.par_iter_mut().for_each(|p| {
            p[0] = (p[0] - origin[0]) * xy_scale;
            p[1] = (p[1] - origin[1]) * xy_scale;
            p[2] = (p[2] - min_z) / z_scale;
        });

        Ok(Step::Keep(item))
    }
}

/// Maps raw LAS class codes to dense class indices in `y` and `y_copy`.
#[derive(Debug, Clone)]
pub struct TargetTransform {
    mapping: HashMap<u8, u8>,
}

impl TargetTransform {
    /// `codes[i]` becomes class index `i`. Unknown codes map to index 0.
    pub fn new(codes: &[u8]) -> Self {
        let mapping = codes
            .iter()
            .enumerate()
            .map(|(index, &code)| (code, index as u8))
            .collect();
        Self { mapping }
    }

    fn remap(&self, labels: &mut [u8]) -> usize {
        let mut unknown = 0;
        for label in labels.iter_mut() {
            *label = match self.mapping.get(label) {
                Some(&index) => index,
                None => {
                    unknown += 1;
                    0
                }
            };
        }
        unknown
    }
}

impl Transform for TargetTransform {
    fn name(&self) -> &'static str {
        "target-transform"
    }

    fn apply(&mut self, mut item: SubtileItem) -> Result<Step> {
        let mut unknown = item.points.labels_mut().map_or(0, |y| self.remap(y));
        if let Some(copy) = item.full_copy.as_mut() {
            unknown += copy.labels_mut().map_or(0, |y| self.remap(y));
        }
        if unknown > 0 {
            debug!(
                "{}: {} labels with unmapped class codes set to index 0",
                item.source_path.display(),
                unknown
            );
        }
        Ok(Step::Keep(item))
    }
}

/// Final check that every per-point array is a well-formed tensor.
///
/// Copies must be aligned with the arrays they shadow, and positions and
/// features must be finite. Items with non-finite values are dropped.
#[derive(Debug, Clone, Default)]
pub struct ToTensor;

impl Transform for ToTensor {
    fn name(&self) -> &'static str {
        "to-tensor"
    }

    fn apply(&mut self, item: SubtileItem) -> Result<Step> {
        if let Some(copy) = &item.pos_copy_subsampled {
            if copy.len() != item.len() {
                return Err(TransformError::Misaligned {
                    stage: self.name(),
                    field: "pos_copy_subsampled",
                    expected: item.len(),
                    actual: copy.len(),
                });
            }
        }

        let finite = item
            .points
            .positions()
            .par_iter()
            .all(|p| p.iter().all(|v| v.is_finite()))
            && item
                .points
                .features()
                .par_iter()
                .all(|f| f.iter().all(|v| v.is_finite()));

        if !finite {
            return Ok(Step::Drop(DropReason::NonFinite { stage: self.name() }));
        }
        Ok(Step::Keep(item))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn item_from(pos: Vec<Position>, labels: Option<Vec<u8>>) -> SubtileItem {
        let features = pos.iter().map(|_| [16384.0, 1.0, 7.0]).collect();
        SubtileItem {
            points: PointArrays::new(pos, features, labels).unwrap(),
            full_copy: None,
            pos_copy_subsampled: None,
            source_path: PathBuf::from("tile.las"),
            full_cloud_path: PathBuf::from("tile.las"),
            center: [0.0, 0.0],
        }
    }

    fn keep(step: Step) -> SubtileItem {
        match step {
            Step::Keep(item) => item,
            Step::Drop(reason) => panic!("item dropped: {:?}", reason),
        }
    }

    #[test]
    fn test_empty_subtile_filter() {
        let mut filter = EmptySubtileFilter { min_points: 3 };

        let small = item_from(vec![[0.0; 3]; 2], None);
        match filter.apply(small).unwrap() {
            Step::Drop(reason) => {
                assert_eq!(reason, DropReason::TooFewPoints { count: 2, min: 3 })
            }
            Step::Keep(_) => panic!("expected drop"),
        }

        let enough = item_from(vec![[0.0; 3]; 3], None);
        assert!(matches!(filter.apply(enough).unwrap(), Step::Keep(_)));
    }

    #[test]
    fn test_copies_are_independent_of_later_mutation() {
        let item = item_from(vec![[10.0, 20.0, 5.0], [30.0, 40.0, 6.0]], Some(vec![2, 6]));
        let item = keep(CopyFullResolution.apply(item).unwrap());
        let item = keep(CopySubsampledPos.apply(item).unwrap());
        let item = keep(NormalizeScale::default().apply(item).unwrap());

        let copy = item.full_copy.as_ref().unwrap();
        assert_eq!(copy.positions()[1], [30.0, 40.0, 6.0]);
        assert_eq!(copy.labels(), Some(&[2u8, 6][..]));
        assert_eq!(item.pos_copy_subsampled.as_ref().unwrap()[0], [10.0, 20.0, 5.0]);
        assert_ne!(item.points.positions()[0], [10.0, 20.0, 5.0]);
    }

    #[test]
    fn test_normalize_features() {
        let item = item_from(vec![[0.0; 3]], None);
        let mut normalize = NormalizeFeatures::from_config(&NormalizationConfig::default());
        let item = keep(normalize.apply(item).unwrap());

        let f = item.points.features()[0];
        assert!((f[0] - 0.0).abs() < 1e-6); // 16384 / 32768 - 0.5
        assert!((f[1] + 0.5).abs() < 1e-6); // first return
        assert!((f[2] - 0.5).abs() < 1e-6); // seven returns
    }

    #[test]
    fn test_normalize_scale_symmetric_extent() {
        let item = item_from(
            vec![[-50.0, 10.0, 200.0], [50.0, -20.0, 250.0], [0.0, 50.0, 220.0]],
            None,
        );
        let item = keep(NormalizeScale::default().apply(item).unwrap());

        let max_abs = item
            .points
            .positions()
            .iter()
            .flat_map(|p| [p[0].abs(), p[1].abs()])
            .fold(0.0f64, f64::max);
        assert!(max_abs < 1.0);
        assert!(max_abs > 0.999);

        let z: Vec<f64> = item.points.positions().iter().map(|p| p[2]).collect();
        assert_eq!(z[0], 0.0);
        assert!((z[1] - 0.5).abs() < 1e-12);
        assert!((z[2] - 0.2).abs() < 1e-12);
    }

    #[test]
    fn test_normalize_scale_uses_raw_coordinates_by_default() {
        let mut item = item_from(vec![[1000.0, 2000.0, 0.0], [1010.0, 1500.0, 0.0]], None);
        item.center = [1005.0, 2000.0];
        let item = keep(NormalizeScale::default().apply(item).unwrap());

        let p = item.points.positions();
        assert!((p[0][1] - 0.999999).abs() < 1e-9);
        assert!((p[1][1] - 0.75 * 0.999999).abs() < 1e-9);
        assert!((p[0][0] - 0.5 * 0.999999).abs() < 1e-9);
    }

    #[test]
    fn test_normalize_scale_centers_on_subtile() {
        let mut item = item_from(vec![[1000.0, 2000.0, 0.0], [1010.0, 2005.0, 0.0]], None);
        item.center = [1005.0, 2000.0];
        let mut normalize = NormalizeScale {
            center_xy: true,
            ..NormalizeScale::default()
        };
        let item = keep(normalize.apply(item).unwrap());

        let p = item.points.positions();
        assert!((p[0][0] + 0.999999).abs() < 1e-9);
        assert!((p[1][0] - 0.999999).abs() < 1e-9);
    }

    #[test]
    fn test_target_transform() {
        let mut item = item_from(vec![[0.0; 3]; 3], Some(vec![6, 2, 9]));
        item.full_copy = Some(FullResolutionCopy::capture(&item.points));

        let mut target = TargetTransform::new(&[2, 6]);
        let item = keep(target.apply(item).unwrap());

        assert_eq!(item.points.labels(), Some(&[1u8, 0, 0][..]));
        assert_eq!(item.full_copy.unwrap().labels(), Some(&[1u8, 0, 0][..]));
    }

    #[test]
    fn test_to_tensor_drops_non_finite() {
        let item = item_from(vec![[f64::NAN, 0.0, 0.0]], None);
        match ToTensor.apply(item).unwrap() {
            Step::Drop(DropReason::NonFinite { stage }) => assert_eq!(stage, "to-tensor"),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_to_tensor_rejects_misaligned_copy() {
        let mut item = item_from(vec![[0.0; 3]; 2], None);
        item.pos_copy_subsampled = Some(vec![[0.0; 3]]);
        assert!(matches!(
            ToTensor.apply(item),
            Err(TransformError::Misaligned { expected: 2, actual: 1, .. })
        ));
    }
}
