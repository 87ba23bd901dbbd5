//! Core data types and I/O operations.

pub mod loaders;
pub mod transforms;
pub mod writers;

#[cfg(test)]
pub(crate) mod fixtures;

pub use loaders::{load_geometry, load_las, PointArrays, PointCloudRecord, Position};
pub use transforms::{DropReason, Step, SubtileItem, Transform, TransformError};
pub use writers::{write_classified_las, WriteError};
