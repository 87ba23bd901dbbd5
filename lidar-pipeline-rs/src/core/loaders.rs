//! Point cloud containers and LAS loaders.
//!
//! This module provides:
//! - `PointArrays`, a struct-of-arrays container whose per-point fields can
//!   never disagree in length
//! - `PointCloudRecord`, one loaded tile (or partial tile) with its provenance
//! - LAS loading of positions, features and classification
//! - Resolution of derived subtile file names to their full tile

use std::fs;
use std::path::{Path, PathBuf};

use log::debug;
use regex::Regex;
use thiserror::Error;

/// Names of the per-point feature channels, in column order.
pub const FEATURE_NAMES: [&str; FEATURE_COUNT] = ["intensity", "return_number", "number_of_returns"];

/// Number of feature channels per point.
pub const FEATURE_COUNT: usize = 3;

/// World-space position (x, y, z).
pub type Position = [f64; 3];

/// Feature vector, ordered as `FEATURE_NAMES`.
pub type Features = [f32; FEATURE_COUNT];

/// Errors that can occur while loading point clouds.
#[derive(Error, Debug)]
pub enum LoaderError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to read LAS file '{path}': {source}")]
    Las {
        path: PathBuf,
        #[source]
        source: las::Error,
    },

    #[error("per-point arrays disagree in length: {positions} positions, {features} features, {labels} labels")]
    LengthMismatch {
        positions: usize,
        features: usize,
        labels: usize,
    },

    #[error("cannot resolve full tile for '{0}': not enough parent directories")]
    UnresolvablePath(PathBuf),

    #[error("invalid file name pattern: {0}")]
    Pattern(#[from] regex::Error),
}

/// Result type for loader operations.
pub type Result<T> = std::result::Result<T, LoaderError>;

/// Axis-aligned horizontal extent of a set of points.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct HorizontalBounds {
    pub min_x: f64,
    pub min_y: f64,
    pub max_x: f64,
    pub max_y: f64,
}

/// Index-aligned per-point arrays.
///
/// Every field holds exactly one entry per point. The constructor checks the
/// lengths and the only mutable access is through fixed-length slices, so a
/// value of this type always satisfies the alignment invariant.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PointArrays {
    pos: Vec<Position>,
    features: Vec<Features>,
    labels: Option<Vec<u8>>,
}

impl PointArrays {
    /// Creates point arrays, failing if the fields disagree in length.
    pub fn new(pos: Vec<Position>, features: Vec<Features>, labels: Option<Vec<u8>>) -> Result<Self> {
        let labels_len = labels.as_ref().map_or(pos.len(), Vec::len);
        if features.len() != pos.len() || labels_len != pos.len() {
            return Err(LoaderError::LengthMismatch {
                positions: pos.len(),
                features: features.len(),
                labels: labels_len,
            });
        }
        Ok(Self {
            pos,
            features,
            labels,
        })
    }

    /// Returns the number of points.
    #[inline]
    pub fn len(&self) -> usize {
        self.pos.len()
    }

    /// Returns true if there are no points.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.pos.is_empty()
    }

    #[inline]
    pub fn positions(&self) -> &[Position] {
        &self.pos
    }

    #[inline]
    pub fn features(&self) -> &[Features] {
        &self.features
    }

    #[inline]
    pub fn labels(&self) -> Option<&[u8]> {
        self.labels.as_deref()
    }

    #[inline]
    pub fn positions_mut(&mut self) -> &mut [Position] {
        &mut self.pos
    }

    #[inline]
    pub fn features_mut(&mut self) -> &mut [Features] {
        &mut self.features
    }

    #[inline]
    pub fn labels_mut(&mut self) -> Option<&mut [u8]> {
        self.labels.as_deref_mut()
    }

    /// Gathers the points at `indices`, in that order. Indices may repeat.
    ///
    /// # Panics
    ///
    /// Panics if an index is out of bounds.
    pub fn select(&self, indices: &[usize]) -> Self {
        Self {
            pos: indices.iter().map(|&i| self.pos[i]).collect(),
            features: indices.iter().map(|&i| self.features[i]).collect(),
            labels: self
                .labels
                .as_ref()
                .map(|labels| indices.iter().map(|&i| labels[i]).collect()),
        }
    }

    /// Keeps the points whose mask entry is true, preserving order.
    pub fn filter_mask(&self, mask: &[bool]) -> Self {
        debug_assert_eq!(mask.len(), self.len(), "mask must cover every point");
        let indices: Vec<usize> = mask
            .iter()
            .enumerate()
            .filter_map(|(i, &keep)| keep.then_some(i))
            .collect();
        self.select(&indices)
    }

    /// Horizontal extent of the points, or `None` when empty.
    pub fn horizontal_bounds(&self) -> Option<HorizontalBounds> {
        let first = self.pos.first()?;
        let init = HorizontalBounds {
            min_x: first[0],
            min_y: first[1],
            max_x: first[0],
            max_y: first[1],
        };
        Some(self.pos.iter().fold(init, |b, p| HorizontalBounds {
            min_x: b.min_x.min(p[0]),
            min_y: b.min_y.min(p[1]),
            max_x: b.max_x.max(p[0]),
            max_y: b.max_y.max(p[1]),
        }))
    }

    /// Splits into the owned per-point vectors.
    pub fn into_parts(self) -> (Vec<Position>, Vec<Features>, Option<Vec<u8>>) {
        (self.pos, self.features, self.labels)
    }
}

/// One loaded point cloud with its provenance.
#[derive(Debug, Clone)]
pub struct PointCloudRecord {
    /// Positions, features and labels.
    pub points: PointArrays,
    /// File this cloud was read from.
    pub source_path: PathBuf,
    /// Original, un-tiled file the points belong to.
    pub full_cloud_path: PathBuf,
}

impl PointCloudRecord {
    /// Wraps point arrays read from `source_path`, resolving the full tile path.
    pub fn new(points: PointArrays, source_path: PathBuf) -> Result<Self> {
        let full_cloud_path = resolve_full_cloud_path(&source_path)?;
        Ok(Self {
            points,
            source_path,
            full_cloud_path,
        })
    }

    /// Returns the number of points in the cloud.
    #[inline]
    pub fn len(&self) -> usize {
        self.points.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }
}

/// Resolve the full tile a (possibly derived) LAS file belongs to.
///
/// Subtile files are named `<tile_id>_SUB<n>.las` and live four directory
/// levels below the dataset root, e.g. `root/data/test/tile_id/tile_id_SUB12.las`
/// resolves to `root/colorized/tile_id.las`. Any file whose name does not carry
/// the `_SUB` marker is already a full tile and resolves to itself.
pub fn resolve_full_cloud_path(path: &Path) -> Result<PathBuf> {
    let sub_pattern = Regex::new(r"^(?P<stem>.+?)_SUB")?;

    let file_name = path
        .file_name()
        .and_then(|s| s.to_str())
        .unwrap_or_default();

    let Some(captures) = sub_pattern.captures(file_name) else {
        return Ok(path.to_path_buf());
    };

    let root = path
        .ancestors()
        .nth(4)
        .ok_or_else(|| LoaderError::UnresolvablePath(path.to_path_buf()))?;

    Ok(root
        .join("colorized")
        .join(format!("{}.las", &captures["stem"])))
}

/// Load a LAS file (format 1.2 assumed) with positions, features and labels.
///
/// Features are `[intensity, return_number, number_of_returns]` as raw values;
/// labels are the raw classification codes.
///
/// # Errors
///
/// Returns an error if the file cannot be opened or a point cannot be decoded.
pub fn load_las<P: AsRef<Path>>(path: P) -> Result<PointCloudRecord> {
    let path = path.as_ref();
    debug!("Loading {}", path.display());

    let las_error = |source| LoaderError::Las {
        path: path.to_path_buf(),
        source,
    };

    let mut reader = las::Reader::from_path(path).map_err(las_error)?;
    let point_count = reader.header().number_of_points() as usize;

    let mut pos = Vec::with_capacity(point_count);
    let mut features = Vec::with_capacity(point_count);
    let mut labels = Vec::with_capacity(point_count);

    for point_result in reader.points() {
        let point = point_result.map_err(las_error)?;
        pos.push([point.x, point.y, point.z]);
        features.push([
            f32::from(point.intensity),
            f32::from(point.return_number),
            f32::from(point.number_of_returns),
        ]);
        labels.push(u8::from(point.classification));
    }

    let points = PointArrays::new(pos, features, Some(labels))?;
    PointCloudRecord::new(points, path.to_path_buf())
}

/// Load only the point positions of a LAS file, in file order.
pub fn load_geometry<P: AsRef<Path>>(path: P) -> Result<Vec<Position>> {
    let path = path.as_ref();
    let las_error = |source| LoaderError::Las {
        path: path.to_path_buf(),
        source,
    };

    let mut reader = las::Reader::from_path(path).map_err(las_error)?;
    let mut positions = Vec::with_capacity(reader.header().number_of_points() as usize);
    for point_result in reader.points() {
        let point = point_result.map_err(las_error)?;
        positions.push([point.x, point.y, point.z]);
    }
    Ok(positions)
}

/// List the LAS files directly inside a directory, sorted by path.
pub fn find_las_files(directory: &Path) -> Result<Vec<PathBuf>> {
    let mut files: Vec<PathBuf> = fs::read_dir(directory)?
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.path())
        .filter(|path| {
            path.is_file()
                && path
                    .extension()
                    .map(|ext| ext.eq_ignore_ascii_case("las"))
                    .unwrap_or(false)
        })
        .collect();

    files.sort();
    Ok(files)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::fixtures::{write_test_las, TestPoint};
    use tempfile::TempDir;

    #[test]
    fn test_point_arrays_length_check() {
        let ok = PointArrays::new(vec![[0.0; 3]; 2], vec![[0.0; 3]; 2], Some(vec![1, 2]));
        assert!(ok.is_ok());

        let bad = PointArrays::new(vec![[0.0; 3]; 2], vec![[0.0; 3]; 3], None);
        assert!(matches!(
            bad,
            Err(LoaderError::LengthMismatch {
                positions: 2,
                features: 3,
                labels: 2
            })
        ));

        let bad_labels = PointArrays::new(vec![[0.0; 3]; 2], vec![[0.0; 3]; 2], Some(vec![1]));
        assert!(bad_labels.is_err());
    }

    #[test]
    fn test_select_and_filter() {
        let points = PointArrays::new(
            vec![[0.0, 0.0, 0.0], [1.0, 1.0, 1.0], [2.0, 2.0, 2.0]],
            vec![[0.0; 3], [1.0; 3], [2.0; 3]],
            Some(vec![10, 11, 12]),
        )
        .unwrap();

        let selected = points.select(&[2, 0, 2]);
        assert_eq!(selected.len(), 3);
        assert_eq!(selected.labels(), Some(&[12u8, 10, 12][..]));
        assert_eq!(selected.positions()[0], [2.0, 2.0, 2.0]);

        let filtered = points.filter_mask(&[true, false, true]);
        assert_eq!(filtered.labels(), Some(&[10u8, 12][..]));
        assert_eq!(filtered.features()[1], [2.0; 3]);
    }

    #[test]
    fn test_horizontal_bounds() {
        let points = PointArrays::new(
            vec![[1.0, -2.0, 0.0], [-3.0, 4.0, 9.0]],
            vec![[0.0; 3]; 2],
            None,
        )
        .unwrap();
        let bounds = points.horizontal_bounds().unwrap();
        assert_eq!(bounds.min_x, -3.0);
        assert_eq!(bounds.max_y, 4.0);
        assert!(PointArrays::default().horizontal_bounds().is_none());
    }

    #[test]
    fn test_resolve_full_cloud_path_subtile() {
        let path = Path::new("/data/lidar/test/tile_42/tile_42_SUB0017.las");
        let resolved = resolve_full_cloud_path(path).unwrap();
        assert_eq!(resolved, PathBuf::from("/data/colorized/tile_42.las"));
    }

    #[test]
    fn test_resolve_full_cloud_path_predict_mode() {
        let path = Path::new("/data/tiles/tile_42.las");
        assert_eq!(resolve_full_cloud_path(path).unwrap(), path);
    }

    #[test]
    fn test_resolve_full_cloud_path_too_shallow() {
        let path = Path::new("tile_SUB1.las");
        assert!(matches!(
            resolve_full_cloud_path(path),
            Err(LoaderError::UnresolvablePath(_))
        ));
    }

    #[test]
    fn test_load_las() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("tile.las");
        write_test_las(
            &path,
            &[
                TestPoint::new([10.0, 20.0, 30.0], 2).with_returns(1, 2).with_intensity(100),
                TestPoint::new([11.5, 21.25, 31.0], 6),
            ],
        );

        let record = load_las(&path).unwrap();
        assert_eq!(record.len(), 2);
        assert_eq!(record.full_cloud_path, path);
        assert_eq!(record.points.labels(), Some(&[2u8, 6][..]));
        assert_eq!(record.points.features()[0], [100.0, 1.0, 2.0]);

        let p = record.points.positions()[1];
        assert!((p[0] - 11.5).abs() < 1e-6);
        assert!((p[1] - 21.25).abs() < 1e-6);

        let geometry = load_geometry(&path).unwrap();
        assert_eq!(geometry, record.points.positions());
    }

    #[test]
    fn test_find_las_files() {
        let dir = TempDir::new().unwrap();
        write_test_las(&dir.path().join("b.las"), &[TestPoint::new([0.0; 3], 1)]);
        write_test_las(&dir.path().join("a.LAS"), &[TestPoint::new([0.0; 3], 1)]);
        std::fs::write(dir.path().join("notes.txt"), "x").unwrap();

        let files = find_las_files(dir.path()).unwrap();
        assert_eq!(files.len(), 2);
        assert!(files[0].ends_with("a.LAS"));
        assert!(files[1].ends_with("b.las"));
    }
}
