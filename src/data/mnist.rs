//! MNIST in the IDX file format.
//!
//! ```text
//! images: u32 magic (2051) | u32 count | u32 rows | u32 cols | count·rows·cols u8
//! labels: u32 magic (2049) | u32 count | count u8
//! ```
//!
//! All integers are big-endian. Pixels are scaled from `0..=255` to `[0, 1]`.

use super::dataset::InMemoryDataset;
use ndarray::{ArrayD, IxDyn};
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::info;

pub const TRAIN_IMAGES: &str = "train-images-idx3-ubyte";
pub const TRAIN_LABELS: &str = "train-labels-idx1-ubyte";

const IMAGES_MAGIC: u32 = 2051;
const LABELS_MAGIC: u32 = 2049;

#[derive(Error, Debug)]
pub enum DatasetError {
    #[error("cannot read {path}: {source}")]
    Io { path: PathBuf, source: std::io::Error },

    #[error("bad magic number: expected {expected}, found {found}")]
    BadMagic { expected: u32, found: u32 },

    #[error("file is truncated: expected {expected} bytes, found {actual}")]
    Truncated { expected: usize, actual: usize },

    #[error("header sizes overflow: {dims:?}")]
    Overflow { dims: Vec<usize> },

    #[error("{images} images but {labels} labels")]
    CountMismatch { images: usize, labels: usize },

    #[error("dataset is empty")]
    Empty,

    #[error("examples of shape {found:?} cannot be reshaped to {expected:?}")]
    Shape { expected: Vec<usize>, found: Vec<usize> },
}

pub type Result<T> = std::result::Result<T, DatasetError>;

fn read_u32(bytes: &[u8], offset: usize) -> Result<u32> {
    bytes
        .get(offset..offset + 4)
        .map(|b| u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
        .ok_or(DatasetError::Truncated { expected: offset + 4, actual: bytes.len() })
}

fn check_magic(bytes: &[u8], expected: u32) -> Result<()> {
    let found = read_u32(bytes, 0)?;
    if found != expected {
        return Err(DatasetError::BadMagic { expected, found });
    }
    Ok(())
}

/// Product of the header dimensions, or `Overflow` if it does not fit.
fn element_count(dims: &[usize]) -> Result<usize> {
    dims.iter()
        .try_fold(1usize, |acc, &d| acc.checked_mul(d))
        .ok_or_else(|| DatasetError::Overflow { dims: dims.to_vec() })
}

fn payload(bytes: &[u8], header: usize, len: usize) -> Result<&[u8]> {
    let end = header.checked_add(len).ok_or(DatasetError::Overflow { dims: vec![header, len] })?;
    bytes.get(header..end).ok_or(DatasetError::Truncated { expected: end, actual: bytes.len() })
}

/// Parses an IDX image file into `[count, rows, cols, 1]` pixels in `[0, 1]`.
pub fn parse_images(bytes: &[u8]) -> Result<ArrayD<f32>> {
    check_magic(bytes, IMAGES_MAGIC)?;
    let count = read_u32(bytes, 4)? as usize;
    let rows = read_u32(bytes, 8)? as usize;
    let cols = read_u32(bytes, 12)? as usize;

    let pixels = payload(bytes, 16, element_count(&[count, rows, cols])?)?;
    let data = pixels.iter().map(|&p| p as f32 / 255.0).collect();
    ArrayD::from_shape_vec(IxDyn(&[count, rows, cols, 1]), data).map_err(|_| DatasetError::Shape {
        expected: vec![count, rows, cols, 1],
        found: vec![pixels.len()],
    })
}

/// Parses an IDX label file into `[count]` digit values.
pub fn parse_labels(bytes: &[u8]) -> Result<ArrayD<f32>> {
    check_magic(bytes, LABELS_MAGIC)?;
    let count = read_u32(bytes, 4)? as usize;
    let labels = payload(bytes, 8, count)?;
    ArrayD::from_shape_vec(IxDyn(&[count]), labels.iter().map(|&l| l as f32).collect())
        .map_err(|_| DatasetError::Shape { expected: vec![count], found: vec![labels.len()] })
}

fn read(path: &Path) -> Result<Vec<u8>> {
    fs::read(path).map_err(|source| DatasetError::Io { path: path.to_path_buf(), source })
}

/// Loads the MNIST training set from `dir`.
pub fn load_training_set<P: AsRef<Path>>(dir: P) -> Result<InMemoryDataset> {
    let dir = dir.as_ref();
    let images = parse_images(&read(&dir.join(TRAIN_IMAGES))?)?;
    let labels = parse_labels(&read(&dir.join(TRAIN_LABELS))?)?;

    let (n_images, n_labels) = (images.shape()[0], labels.shape()[0]);
    if n_images == 0 {
        return Err(DatasetError::Empty);
    }
    let dataset = InMemoryDataset::new(images, labels)
        .ok_or(DatasetError::CountMismatch { images: n_images, labels: n_labels })?;
    info!(examples = n_images, dir = %dir.display(), "loaded MNIST training set");
    Ok(dataset)
}
