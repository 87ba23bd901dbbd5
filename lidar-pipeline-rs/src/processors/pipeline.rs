//! Ordered, short-circuiting chain of per-item transforms.

use log::{debug, warn};
use thiserror::Error;

use super::sampling::FixedPoints;
use super::subtile::{SubtileError, SubtileSampler};
use crate::config::PipelineConfig;
use crate::core::loaders::PointCloudRecord;
use crate::core::transforms::{
    CopyFullResolution, CopySubsampledPos, DropReason, EmptySubtileFilter, NormalizeFeatures,
    NormalizeScale, Step, SubtileItem, TargetTransform, ToTensor, Transform, TransformError,
};

/// A stage failed for one item.
#[derive(Error, Debug)]
#[error("stage '{stage}' failed: {source}")]
pub struct PipelineError {
    pub stage: &'static str,
    #[source]
    pub source: TransformError,
}

/// Result type for pipeline operations.
pub type Result<T> = std::result::Result<T, PipelineError>;

/// Counts of what happened to the items of a run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PipelineStats {
    pub kept: usize,
    pub dropped: usize,
    pub failed: usize,
}

impl PipelineStats {
    pub fn merge(&mut self, other: PipelineStats) {
        self.kept += other.kept;
        self.dropped += other.dropped;
        self.failed += other.failed;
    }

    pub fn total(&self) -> usize {
        self.kept + self.dropped + self.failed
    }
}

/// Subtile selection followed by a list of item transforms.
pub struct TransformPipeline {
    sampler: SubtileSampler,
    stages: Vec<Box<dyn Transform>>,
}

impl TransformPipeline {
    pub fn new(sampler: SubtileSampler) -> Self {
        Self {
            sampler,
            stages: Vec::new(),
        }
    }

    /// Appends a stage.
    pub fn with_stage<T: Transform + 'static>(mut self, stage: T) -> Self {
        self.stages.push(Box::new(stage));
        self
    }

    /// The ordering used for training and inference:
    /// select-subtile, filter-empty, copy-full-res, [target-transform],
    /// subsample, copy-subsampled-pos, normalize-features, normalize-scale,
    /// to-tensor.
    ///
    /// Target remapping runs right after the full-resolution copy so `y` and
    /// `y_copy` share one class space; it is skipped when no codes are
    /// configured.
    pub fn canonical(config: &PipelineConfig) -> std::result::Result<Self, SubtileError> {
        let mut pipeline = Self::new(SubtileSampler::from_config(&config.subtile)?)
            .with_stage(EmptySubtileFilter {
                min_points: config.subtile.min_points,
            })
            .with_stage(CopyFullResolution);

        if !config.classes.codes.is_empty() {
            pipeline = pipeline.with_stage(TargetTransform::new(&config.classes.codes));
        }

        Ok(pipeline
            .with_stage(FixedPoints::from_config(&config.sampling))
            .with_stage(CopySubsampledPos)
            .with_stage(NormalizeFeatures::from_config(&config.normalization))
            .with_stage(NormalizeScale::from_config(&config.normalization))
            .with_stage(ToTensor))
    }

    #[inline]
    pub fn sampler(&self) -> &SubtileSampler {
        &self.sampler
    }

    /// Stage names in execution order, excluding subtile selection.
    pub fn stage_names(&self) -> Vec<&'static str> {
        self.stages.iter().map(|s| s.name()).collect()
    }

    /// Runs every stage on `item`, stopping at the first drop.
    pub fn apply(&mut self, mut item: SubtileItem) -> Result<Step> {
        for stage in self.stages.iter_mut() {
            item = match stage.apply(item) {
                Ok(Step::Keep(item)) => item,
                Ok(Step::Drop(reason)) => return Ok(Step::Drop(reason)),
                Err(source) => {
                    return Err(PipelineError {
                        stage: stage.name(),
                        source,
                    })
                }
            };
        }
        Ok(Step::Keep(item))
    }

    /// Selects the subtile centred at `center` and runs the stages on it.
    pub fn run(&mut self, record: &PointCloudRecord, center: [f64; 2]) -> Result<Step> {
        match self.sampler.extract(record, center) {
            Some(item) => self.apply(item),
            None => Ok(Step::Drop(DropReason::EmptyWindow)),
        }
    }

    /// Runs one centre, logging drops at debug level and failures as warnings.
    ///
    /// Returns the item when it survives; `stats` records the outcome.
    pub fn run_counted(
        &mut self,
        record: &PointCloudRecord,
        center: [f64; 2],
        stats: &mut PipelineStats,
    ) -> Option<SubtileItem> {
        match self.run(record, center) {
            Ok(Step::Keep(item)) => {
                stats.kept += 1;
                Some(item)
            }
            Ok(Step::Drop(reason)) => {
                stats.dropped += 1;
                debug!(
                    "{}: dropped subtile at ({:.2}, {:.2}): {:?}",
                    record.source_path.display(),
                    center[0],
                    center[1],
                    reason
                );
                None
            }
            Err(e) => {
                stats.failed += 1;
                warn!(
                    "{}: subtile at ({:.2}, {:.2}) skipped: {}",
                    record.source_path.display(),
                    center[0],
                    center[1],
                    e
                );
                None
            }
        }
    }

    /// Runs every centre independently, keeping the surviving items in order.
    pub fn run_all(&mut self, record: &PointCloudRecord, centers: &[[f64; 2]]) -> (Vec<SubtileItem>, PipelineStats) {
        let mut stats = PipelineStats::default();
        let items = centers
            .iter()
            .filter_map(|&center| self.run_counted(record, center, &mut stats))
            .collect();
        (items, stats)
    }
}
