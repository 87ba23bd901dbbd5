//! Subtile sampling, batching and reconstruction.

pub mod classifier;
pub mod collate;
pub mod loader;
pub mod pipeline;
pub mod reconstruction;
pub mod sampling;
pub mod storage;
pub mod subtile;

// Re-export key types for convenience
pub use classifier::{argmax_scores, Classifier, ClassifierError, LabelEcho};
pub use collate::{collate, Batch, CollateError};
pub use loader::{StreamError, TileStream};
pub use pipeline::{PipelineError, PipelineStats, TransformPipeline};
pub use reconstruction::{
    interpolate_tile, EngineState, FlushReport, ReconstructionEngine, ReconstructionError,
    TileAccumulator,
};
pub use sampling::{FixedPoints, PointSubsampler, SamplingError};
pub use storage::{LasTileStore, StorageError, TileStore};
pub use subtile::{random_center, subtile_centers, SubtileError, SubtileSampler};
