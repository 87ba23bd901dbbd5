//! LAS writer for reconstructed classifications.
//!
//! Output files are copies of their source tile with the classification
//! channel replaced by the predicted class, plus an `i32` extra-bytes
//! dimension named `PredictedClassification` holding the same value.
//! The extra-bytes dimension always carries the exact prediction. Class 12
//! goes to the overlap flag, and classes the point format cannot store keep
//! the source classification.
//! Files are written to a temporary path next to the destination and only
//! persisted once every point has been written.

use std::fs;
use std::path::{Path, PathBuf};

use las::point::Classification;
use las::{Builder, Point, Reader, Vlr, Writer};
use log::warn;
use thiserror::Error;

/// Name of the extra-bytes dimension carrying predictions.
pub const PREDICTED_CLASSIFICATION: &str = "PredictedClassification";

const EXTRA_BYTES_USER_ID: &str = "LASF_Spec";
const EXTRA_BYTES_RECORD_ID: u16 = 4;
const DESCRIPTOR_LEN: usize = 192;
const NAME_OFFSET: usize = 4;
const NAME_LEN: usize = 32;
const DESCRIPTION_OFFSET: usize = 160;

/// LAS extra-bytes data type code for a signed 32-bit integer.
const DATA_TYPE_I32: u8 = 6;

/// Class code stored through the overlap flag.
const OVERLAP_CLASS: u8 = 12;

/// Largest class code of point formats 0 to 5.
const LEGACY_CLASS_MAX: u8 = 31;

/// Errors that can occur during write operations.
#[derive(Error, Debug)]
pub enum WriteError {
    /// Failed to create parent directories.
    #[error("failed to create parent directories for '{path}': {source}")]
    CreateDirectory {
        path: String,
        #[source]
        source: std::io::Error,
    },

    /// Failed to create the temporary output file.
    #[error("failed to create temporary file in '{path}': {source}")]
    CreateFile {
        path: String,
        #[source]
        source: std::io::Error,
    },

    /// Failed to move the finished file into place.
    #[error("failed to persist '{path}': {source}")]
    Persist {
        path: String,
        #[source]
        source: std::io::Error,
    },

    /// LAS encoding or decoding error.
    #[error("LAS error for '{path}': {source}")]
    Las {
        path: String,
        #[source]
        source: las::Error,
    },

    /// The source tile has an extra-bytes layout this writer cannot extend.
    #[error("unsupported extra bytes layout in '{path}': {reason}")]
    ExtraBytes { path: String, reason: String },

    /// Mismatched point and class counts.
    #[error("point count mismatch: source has {points} points, {classes} classes given")]
    LengthMismatch { points: usize, classes: usize },
}

/// Result type for write operations.
pub type Result<T> = std::result::Result<T, WriteError>;

/// Creates parent directories for a file path if they don't exist.
fn ensure_parent_dirs(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() && !parent.exists() {
            fs::create_dir_all(parent).map_err(|e| WriteError::CreateDirectory {
                path: parent.display().to_string(),
                source: e,
            })?;
        }
    }
    Ok(())
}

/// Builds a `map_err` adapter tagging LAS errors with a path.
fn las_error(path: &str) -> impl FnOnce(las::Error) -> WriteError + '_ {
    move |source| WriteError::Las {
        path: path.to_string(),
        source,
    }
}

/// Byte width of one value of an extra-bytes data type.
fn data_type_size(data_type: u8, options: u8) -> Option<usize> {
    let base = match data_type {
        0 => return Some(usize::from(options)),
        1..=30 => (data_type - 1) % 10 + 1,
        _ => return None,
    };
    let count = usize::from((data_type - 1) / 10 + 1);
    let width = match base {
        1 | 2 => 1,
        3 | 4 => 2,
        5 | 6 | 9 => 4,
        _ => 8,
    };
    Some(width * count)
}

/// Where the prediction lives inside each point's extra bytes.
#[derive(Debug, Clone, Copy, PartialEq)]
struct PredictionSlot {
    offset: usize,
    data_type: u8,
    width: usize,
    appended: bool,
}

impl PredictionSlot {
    fn encode(&self, class: u8, extra_bytes: &mut Vec<u8>) {
        let value = i64::from(class);
        let bytes: Vec<u8> = match self.data_type {
            9 => (value as f32).to_le_bytes().to_vec(),
            10 => (value as f64).to_le_bytes().to_vec(),
            _ => value.to_le_bytes()[..self.width.min(8)].to_vec(),
        };
        if self.appended {
            extra_bytes.extend_from_slice(&bytes);
        } else {
            extra_bytes[self.offset..self.offset + bytes.len()].copy_from_slice(&bytes);
        }
    }
}

/// Build the 192-byte descriptor for the prediction dimension.
fn prediction_descriptor() -> Vec<u8> {
    let mut descriptor = vec![0u8; DESCRIPTOR_LEN];
    descriptor[2] = DATA_TYPE_I32;
    let name = PREDICTED_CLASSIFICATION.as_bytes();
    descriptor[NAME_OFFSET..NAME_OFFSET + name.len()].copy_from_slice(name);
    let description = b"predicted class code";
    descriptor[DESCRIPTION_OFFSET..DESCRIPTION_OFFSET + description.len()]
        .copy_from_slice(description);
    descriptor
}

fn descriptor_name(descriptor: &[u8]) -> &[u8] {
    let raw = &descriptor[NAME_OFFSET..NAME_OFFSET + NAME_LEN];
    let end = raw.iter().position(|&b| b == 0).unwrap_or(NAME_LEN);
    &raw[..end]
}

/// Locate the prediction dimension in an extra-bytes VLR, or plan to append it.
fn locate_prediction_slot(
    vlr_data: Option<&[u8]>,
    extra_bytes_len: usize,
    path: &Path,
) -> Result<PredictionSlot> {
    let layout_error = |reason: String| WriteError::ExtraBytes {
        path: path.display().to_string(),
        reason,
    };

    let data = vlr_data.unwrap_or(&[]);
    if data.len() % DESCRIPTOR_LEN != 0 {
        return Err(layout_error(format!(
            "descriptor block of {} bytes is not a multiple of {}",
            data.len(),
            DESCRIPTOR_LEN
        )));
    }

    let mut offset = 0usize;
    for descriptor in data.chunks_exact(DESCRIPTOR_LEN) {
        let (data_type, options) = (descriptor[2], descriptor[3]);
        let width = data_type_size(data_type, options)
            .ok_or_else(|| layout_error(format!("unknown data type {}", data_type)))?;
        if descriptor_name(descriptor) == PREDICTED_CLASSIFICATION.as_bytes() {
            if data_type == 0 {
                return Err(layout_error(format!(
                    "{} is declared as untyped bytes",
                    PREDICTED_CLASSIFICATION
                )));
            }
            return Ok(PredictionSlot {
                offset,
                data_type,
                width,
                appended: false,
            });
        }
        offset += width;
    }

    if offset != extra_bytes_len {
        return Err(layout_error(format!(
            "descriptors cover {} bytes but points carry {}",
            offset, extra_bytes_len
        )));
    }

    Ok(PredictionSlot {
        offset,
        data_type: DATA_TYPE_I32,
        width: 4,
        appended: true,
    })
}

/// Put `class` in the point's classification channel.
///
/// Returns `false` when the point format cannot hold `class`, leaving the
/// point untouched.
fn apply_class(point: &mut Point, class: u8, extended: bool) -> bool {
    if class == OVERLAP_CLASS {
        point.is_overlap = true;
        point.classification = Classification::Unclassified;
        return true;
    }
    if !extended && class > LEGACY_CLASS_MAX {
        return false;
    }
    let Ok(classification) = Classification::new(class) else {
        return false;
    };
    // Legacy formats encode overlap as class 12.
    if !extended {
        point.is_overlap = false;
    }
    point.classification = classification;
    true
}

/// Write `source` to `output` with every point's classification replaced.
///
/// `classes` must hold exactly one entry per source point, in source order.
/// The output header is a copy of the source header, extended with the
/// `PredictedClassification` extra-bytes dimension when the source lacks it.
///
/// # Errors
///
/// Returns an error if the source cannot be read, the class count does not
/// match the point count, or the output cannot be written. On error no file
/// is left at `output`. Classes the point format cannot represent are not an
/// error: they are logged and survive in the extra-bytes dimension.
pub fn write_classified_las(source: &Path, output: &Path, classes: &[u8]) -> Result<u64> {
    let source_str = source.display().to_string();
    let output_str = output.display().to_string();
    let mut reader = Reader::from_path(source).map_err(las_error(&source_str))?;
    let header = reader.header().clone();

    let point_count = header.number_of_points() as usize;
    if point_count != classes.len() {
        return Err(WriteError::LengthMismatch {
            points: point_count,
            classes: classes.len(),
        });
    }

    let extra_bytes_vlr = header
        .vlrs()
        .iter()
        .position(|vlr| vlr.user_id == EXTRA_BYTES_USER_ID && vlr.record_id == EXTRA_BYTES_RECORD_ID);
    let slot = locate_prediction_slot(
        extra_bytes_vlr.map(|i| header.vlrs()[i].data.as_slice()),
        usize::from(header.point_format().extra_bytes),
        source,
    )?;

    let vlrs = header.vlrs().clone();
    let evlrs = header.evlrs().clone();
    let raw_header = header.into_raw().map_err(las_error(&source_str))?;
    let mut builder = Builder::new(raw_header).map_err(las_error(&source_str))?;
    builder.vlrs = vlrs;
    builder.evlrs = evlrs;
    if slot.appended {
        builder.point_format.extra_bytes += slot.width as u16;
        match extra_bytes_vlr {
            Some(i) => builder.vlrs[i].data.extend(prediction_descriptor()),
            None => builder.vlrs.push(Vlr {
                user_id: EXTRA_BYTES_USER_ID.to_string(),
                record_id: EXTRA_BYTES_RECORD_ID,
                description: "Extra bytes".to_string(),
                data: prediction_descriptor(),
            }),
        }
    }
    let out_header = builder.into_header().map_err(las_error(&output_str))?;
    let point_format = *out_header.point_format();

    ensure_parent_dirs(output)?;
    let out_dir = output
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .map(Path::to_path_buf)
        .unwrap_or_else(|| PathBuf::from("."));
    let staging = tempfile::Builder::new()
        .prefix(".lidar-pipeline")
        .suffix(".las.part")
        .tempfile_in(&out_dir)
        .map_err(|e| WriteError::CreateFile {
            path: out_dir.display().to_string(),
            source: e,
        })?;

    let mut written = 0u64;
    let mut unrepresentable = 0usize;
    {
        let mut writer =
            Writer::from_path(staging.path(), out_header).map_err(las_error(&output_str))?;
        for (point_result, &class) in reader.points().zip(classes) {
            let mut point = point_result.map_err(las_error(&source_str))?;
            if !apply_class(&mut point, class, point_format.is_extended) {
                unrepresentable += 1;
            }
            slot.encode(class, &mut point.extra_bytes);
            writer.write_point(point).map_err(las_error(&output_str))?;
            written += 1;
        }
        writer.close().map_err(las_error(&output_str))?;
    }

    if unrepresentable > 0 {
        warn!(
            "{}: {} points have classes {} cannot store, kept source classification",
            output_str,
            unrepresentable,
            point_format
        );
    }

    if written as usize != classes.len() {
        return Err(WriteError::LengthMismatch {
            points: written as usize,
            classes: classes.len(),
        });
    }

    staging.persist(output).map_err(|e| WriteError::Persist {
        path: output_str,
        source: e.error,
    })?;

    Ok(written)
}
