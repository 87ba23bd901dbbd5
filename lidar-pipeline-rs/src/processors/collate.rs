//! Merging transformed subtile items into batches.
//!
//! Per-point arrays are concatenated along the point dimension. Two
//! independent item indices record where every point came from: one for the
//! subsampled points and one for the full-resolution copies. Per-item values
//! (paths, centres) are carried as ordered lists.

use std::path::PathBuf;

use thiserror::Error;

use crate::core::loaders::{Features, Position};
use crate::core::transforms::SubtileItem;

/// Errors that can occur while collating.
#[derive(Error, Debug, PartialEq)]
pub enum CollateError {
    #[error("cannot collate an empty list of items")]
    EmptyBatch,

    #[error("item {item} has no full-resolution or subsampled position copy")]
    MissingCopy { item: usize },

    #[error("item {item} disagrees with the first item about carrying labels")]
    InconsistentLabels { item: usize },
}

/// Result type for collate operations.
pub type Result<T> = std::result::Result<T, CollateError>;

/// Several subtile items concatenated along the point dimension.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Batch {
    /// Normalized positions fed to the model.
    pub pos: Vec<[f32; 3]>,
    /// Normalized features fed to the model.
    pub x: Vec<Features>,
    /// Class indices of the subsampled points, when labelled.
    pub y: Option<Vec<u8>>,
    /// Raw positions aligned with `pos`.
    pub pos_copy_subsampled: Vec<Position>,
    /// Raw positions of every pre-subsampling point.
    pub pos_copy: Vec<Position>,
    /// Class indices aligned with `pos_copy`, when labelled.
    pub y_copy: Option<Vec<u8>>,
    /// Source item of each subsampled point.
    pub index_subsampled: Vec<usize>,
    /// Source item of each full-resolution copy point.
    pub index_full: Vec<usize>,
    pub source_paths: Vec<PathBuf>,
    pub full_cloud_paths: Vec<PathBuf>,
    pub centers: Vec<[f64; 2]>,
}

impl Batch {
    /// Number of items merged into this batch.
    #[inline]
    pub fn num_items(&self) -> usize {
        self.full_cloud_paths.len()
    }

    /// Number of subsampled points.
    #[inline]
    pub fn num_points(&self) -> usize {
        self.pos.len()
    }

    /// Number of full-resolution copy points.
    #[inline]
    pub fn num_full_points(&self) -> usize {
        self.pos_copy.len()
    }

    /// Subsampled point indices of each item, in order of appearance.
    pub fn subsampled_groups(&self) -> Vec<Vec<usize>> {
        group_by_item(&self.index_subsampled, self.num_items())
    }

    /// Full-resolution copy point indices of each item, in order of appearance.
    pub fn full_groups(&self) -> Vec<Vec<usize>> {
        group_by_item(&self.index_full, self.num_items())
    }
}

fn group_by_item(index: &[usize], num_items: usize) -> Vec<Vec<usize>> {
    let mut groups = vec![Vec::new(); num_items];
    for (point, &item) in index.iter().enumerate() {
        if let Some(group) = groups.get_mut(item) {
            group.push(point);
        }
    }
    groups
}

/// Concatenates `items` into one batch.
///
/// Every item must carry both position copies. Labels are kept only when
/// every item has them; a mix of labelled and unlabelled items is an error.
pub fn collate(items: Vec<SubtileItem>) -> Result<Batch> {
    let Some(first) = items.first() else {
        return Err(CollateError::EmptyBatch);
    };
    let labelled = first.points.labels().is_some();

    let num_points: usize = items.iter().map(SubtileItem::len).sum();
    let num_full: usize = items
        .iter()
        .map(|item| item.full_copy.as_ref().map_or(0, |c| c.len()))
        .sum();

    let mut batch = Batch {
        pos: Vec::with_capacity(num_points),
        x: Vec::with_capacity(num_points),
        y: labelled.then(|| Vec::with_capacity(num_points)),
        pos_copy_subsampled: Vec::with_capacity(num_points),
        pos_copy: Vec::with_capacity(num_full),
        y_copy: labelled.then(|| Vec::with_capacity(num_full)),
        index_subsampled: Vec::with_capacity(num_points),
        index_full: Vec::with_capacity(num_full),
        source_paths: Vec::with_capacity(items.len()),
        full_cloud_paths: Vec::with_capacity(items.len()),
        centers: Vec::with_capacity(items.len()),
    };

    for (i, item) in items.into_iter().enumerate() {
        let (Some(full), Some(subsampled)) = (item.full_copy, item.pos_copy_subsampled) else {
            return Err(CollateError::MissingCopy { item: i });
        };
        if item.points.labels().is_some() != labelled || full.labels().is_some() != labelled {
            return Err(CollateError::InconsistentLabels { item: i });
        }

        let n = item.points.len();
        batch.pos.extend(
            item.points
                .positions()
                .iter()
                .map(|p| [p[0] as f32, p[1] as f32, p[2] as f32]),
        );
        batch.x.extend_from_slice(item.points.features());
        if let (Some(y), Some(labels)) = (batch.y.as_mut(), item.points.labels()) {
            y.extend_from_slice(labels);
        }
        batch.pos_copy_subsampled.extend(subsampled);
        batch.index_subsampled.extend(std::iter::repeat(i).take(n));

        batch.pos_copy.extend_from_slice(full.positions());
        if let (Some(y_copy), Some(labels)) = (batch.y_copy.as_mut(), full.labels()) {
            y_copy.extend_from_slice(labels);
        }
        batch.index_full.extend(std::iter::repeat(i).take(full.len()));

        batch.source_paths.push(item.source_path);
        batch.full_cloud_paths.push(item.full_cloud_path);
        batch.centers.push(item.center);
    }

    Ok(batch)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::core::loaders::PointArrays;
    use crate::core::transforms::FullResolutionCopy;

    /// A fully transformed item with `n` subsampled and `full` copy points.
    pub(crate) fn item(tile: &str, n: usize, full: usize, label: Option<u8>) -> SubtileItem {
        let full_pos: Vec<Position> = (0..full).map(|i| [i as f64, 0.0, 0.0]).collect();
        let full_points = PointArrays::new(
            full_pos,
            vec![[0.0; 3]; full],
            label.map(|l| vec![l; full]),
        )
        .unwrap();
        let subsampled: Vec<Position> = (0..n).map(|i| [(i % full.max(1)) as f64, 0.0, 0.0]).collect();

        SubtileItem {
            points: PointArrays::new(subsampled.clone(), vec![[0.0; 3]; n], label.map(|l| vec![l; n])).unwrap(),
            full_copy: Some(FullResolutionCopy::capture(&full_points)),
            pos_copy_subsampled: Some(subsampled),
            source_path: PathBuf::from(tile),
            full_cloud_path: PathBuf::from(tile),
            center: [0.0, 0.0],
        }
    }

    #[test]
    fn test_index_subsampled_counts() {
        let batch = collate(vec![
            item("a.las", 10, 12, Some(1)),
            item("a.las", 7, 9, Some(1)),
            item("b.las", 5, 30, Some(2)),
        ])
        .unwrap();

        let mut expected = vec![0; 10];
        expected.extend(vec![1; 7]);
        expected.extend(vec![2; 5]);
        assert_eq!(batch.index_subsampled, expected);

        assert_eq!(batch.num_items(), 3);
        assert_eq!(batch.num_points(), 22);
        assert_eq!(batch.num_full_points(), 51);
        assert_eq!(batch.index_full.iter().filter(|&&i| i == 2).count(), 30);
        assert_eq!(batch.pos_copy_subsampled.len(), 22);
        assert_eq!(batch.y.as_ref().unwrap().len(), 22);
        assert_eq!(batch.y_copy.as_ref().unwrap().len(), 51);
        assert_eq!(
            batch.full_cloud_paths,
            vec![PathBuf::from("a.las"), PathBuf::from("a.las"), PathBuf::from("b.las")]
        );
    }

    #[test]
    fn test_groups() {
        let batch = collate(vec![item("a.las", 2, 3, None), item("a.las", 1, 1, None)]).unwrap();
        assert_eq!(batch.subsampled_groups(), vec![vec![0, 1], vec![2]]);
        assert_eq!(batch.full_groups(), vec![vec![0, 1, 2], vec![3]]);
        assert!(batch.y.is_none());
        assert!(batch.y_copy.is_none());
    }

    #[test]
    fn test_empty_batch() {
        assert_eq!(collate(Vec::new()), Err(CollateError::EmptyBatch));
    }

    #[test]
    fn test_missing_copy() {
        let mut bad = item("a.las", 2, 2, None);
        bad.full_copy = None;
        assert_eq!(
            collate(vec![item("a.las", 2, 2, None), bad]),
            Err(CollateError::MissingCopy { item: 1 })
        );
    }

    #[test]
    fn test_inconsistent_labels() {
        assert_eq!(
            collate(vec![item("a.las", 2, 2, Some(1)), item("a.las", 2, 2, None)]),
            Err(CollateError::InconsistentLabels { item: 1 })
        );
    }
}
