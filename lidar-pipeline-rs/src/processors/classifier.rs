//! The model seam: anything that turns a batch into one class per subsampled point.

use thiserror::Error;

use super::collate::Batch;

/// Errors raised by a classifier.
#[derive(Error, Debug, PartialEq)]
pub enum ClassifierError {
    #[error("batch carries no labels to echo")]
    Unlabelled,

    #[error("score buffer of length {len} is not a multiple of {num_classes} classes")]
    ScoreShape { len: usize, num_classes: usize },

    #[error("model failed: {0}")]
    Model(String),
}

/// Result type for classifier operations.
pub type Result<T> = std::result::Result<T, ClassifierError>;

/// Per-point classification of a batch.
pub trait Classifier {
    /// Returns one class id per subsampled point of `batch`, index-aligned
    /// with `batch.pos`.
    fn classify(&mut self, batch: &Batch) -> Result<Vec<u8>>;
}

/// Predicts each point's own label. Useful for dry runs and checks of the
/// reconstruction path.
#[derive(Debug, Clone, Copy, Default)]
pub struct LabelEcho;

impl Classifier for LabelEcho {
    fn classify(&mut self, batch: &Batch) -> Result<Vec<u8>> {
        batch.y.clone().ok_or(ClassifierError::Unlabelled)
    }
}

/// Converts row-major raw scores (`num_points x num_classes`) to class ids.
///
/// Ties resolve to the lowest class; NaN scores never win.
pub fn argmax_scores(scores: &[f32], num_classes: usize) -> Result<Vec<u8>> {
    if num_classes == 0 || num_classes > usize::from(u8::MAX) + 1 || scores.len() % num_classes != 0 {
        return Err(ClassifierError::ScoreShape {
            len: scores.len(),
            num_classes,
        });
    }

    Ok(scores
        .chunks_exact(num_classes)
        .map(|row| {
            let mut best = 0;
            for (class, &score) in row.iter().enumerate() {
                if score > row[best] || (row[best].is_nan() && !score.is_nan()) {
                    best = class;
                }
            }
            best as u8
        })
        .collect())
}
