//! Fixed-size point subsampling.
//!
//! Three modes, selected by `replace` and `allow_duplicates`:
//! - with replacement: independent uniform draws
//! - without replacement: the first `num` entries of one random permutation
//! - without replacement, duplicates allowed: whole permutations concatenated
//!   and truncated, so every point is used once before any point repeats

use log::debug;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use thiserror::Error;

use crate::config::SamplingConfig;
use crate::core::loaders::PointArrays;
use crate::core::transforms::{self, Step, SubtileItem, Transform};

/// Errors that can occur while subsampling.
#[derive(Error, Debug, PartialEq)]
pub enum SamplingError {
    #[error("cannot draw {requested} distinct points from {available}")]
    InsufficientPoints { requested: usize, available: usize },

    #[error("cannot draw {requested} points from an empty set")]
    EmptyInput { requested: usize },
}

/// Result type for sampling operations.
pub type Result<T> = std::result::Result<T, SamplingError>;

/// Draws a fixed number of point indices.
#[derive(Debug, Clone)]
pub struct PointSubsampler {
    num: usize,
    replace: bool,
    allow_duplicates: bool,
    rng: ChaCha8Rng,
}

impl PointSubsampler {
    /// Creates a subsampler; `seed = None` seeds from OS entropy.
    pub fn new(num: usize, replace: bool, allow_duplicates: bool, seed: Option<u64>) -> Self {
        let rng = match seed {
            Some(seed) => ChaCha8Rng::seed_from_u64(seed),
            None => ChaCha8Rng::from_entropy(),
        };
        Self {
            num,
            replace,
            allow_duplicates,
            rng,
        }
    }

    pub fn from_config(config: &SamplingConfig) -> Self {
        Self::new(
            config.input_cloud_size,
            config.replace,
            config.allow_duplicates,
            config.seed,
        )
    }

    /// Target point count.
    #[inline]
    pub fn num(&self) -> usize {
        self.num
    }

    /// Draws `num` indices into `0..available`.
    ///
    /// # Errors
    ///
    /// `EmptyInput` when points are requested from an empty set, and
    /// `InsufficientPoints` when sampling without replacement or duplicates
    /// asks for more points than exist.
    pub fn sample_indices(&mut self, available: usize) -> Result<Vec<usize>> {
        let requested = self.num;
        if requested == 0 {
            return Ok(Vec::new());
        }
        if available == 0 {
            return Err(SamplingError::EmptyInput { requested });
        }

        if self.replace {
            return Ok((0..requested)
                .map(|_| self.rng.gen_range(0..available))
                .collect());
        }

        if !self.allow_duplicates {
            if requested > available {
                return Err(SamplingError::InsufficientPoints {
                    requested,
                    available,
                });
            }
            let mut perm: Vec<usize> = (0..available).collect();
            perm.shuffle(&mut self.rng);
            perm.truncate(requested);
            return Ok(perm);
        }

        let rounds = requested.div_ceil(available);
        let mut indices = Vec::with_capacity(rounds * available);
        for _ in 0..rounds {
            let start = indices.len();
            indices.extend(0..available);
            indices[start..].shuffle(&mut self.rng);
        }
        indices.truncate(requested);
        Ok(indices)
    }

    /// Gathers `num` points of `points` according to the sampling mode.
    pub fn subsample(&mut self, points: &PointArrays) -> Result<PointArrays> {
        let indices = self.sample_indices(points.len())?;
        Ok(points.select(&indices))
    }
}

/// Pipeline stage reducing every item to the subsampler's point count.
#[derive(Debug, Clone)]
pub struct FixedPoints {
    sampler: PointSubsampler,
}

impl FixedPoints {
    pub fn new(sampler: PointSubsampler) -> Self {
        Self { sampler }
    }

    pub fn from_config(config: &SamplingConfig) -> Self {
        Self::new(PointSubsampler::from_config(config))
    }
}

impl Transform for FixedPoints {
    fn name(&self) -> &'static str {
        "subsample"
    }

    fn apply(&mut self, mut item: SubtileItem) -> transforms::Result<Step> {
        let before = item.len();
        item.points = self.sampler.subsample(&item.points)?;
        debug!(
            "{}: subsampled {} -> {} points",
            item.source_path.display(),
            before,
            item.len()
        );
        Ok(Step::Keep(item))
    }
}
