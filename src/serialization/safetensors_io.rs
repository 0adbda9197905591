//! Reading and writing named tensors in the SafeTensors format.

use crate::asg::Value;
use ndarray::{ArrayD, IxDyn};
use safetensors::serialize_to_file;
use safetensors::tensor::{SafeTensors, TensorView};
use std::collections::HashMap;
use std::fs;
use std::path::Path;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum SafeTensorsError {
    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("SafeTensors error: {0}")]
    SafeTensorsError(#[from] safetensors::SafeTensorError),

    #[error("unsupported dtype: {0}")]
    UnsupportedDtype(String),

    #[error("tensor '{name}' has shape {shape:?} but {elements} elements")]
    ShapeMismatch { name: String, shape: Vec<usize>, elements: usize },
}

type Result<T> = std::result::Result<T, SafeTensorsError>;

/// Writes every value of `tensors` as little-endian F32. Scalars are stored
/// as 0-d tensors.
pub fn save_safetensors<P: AsRef<Path>>(path: P, tensors: &HashMap<String, Value>) -> Result<()> {
    let mut names: Vec<&String> = tensors.keys().collect();
    names.sort();

    let mut encoded: Vec<(&str, Vec<usize>, Vec<u8>)> = Vec::with_capacity(names.len());
    for name in names {
        let value = &tensors[name];
        let bytes = match value {
            Value::Tensor(arr) => arr.iter().flat_map(|x| x.to_le_bytes()).collect(),
            Value::ScalarF32(v) => v.to_le_bytes().to_vec(),
        };
        encoded.push((name.as_str(), value.shape(), bytes));
    }

    let mut views: Vec<(&str, TensorView<'_>)> = Vec::with_capacity(encoded.len());
    for (name, shape, bytes) in &encoded {
        views.push((*name, TensorView::new(safetensors::Dtype::F32, shape.clone(), bytes)?));
    }

    serialize_to_file(views, &None, path.as_ref())?;
    Ok(())
}

/// Reads every tensor of a SafeTensors file. F64 data is narrowed to F32.
pub fn load_safetensors<P: AsRef<Path>>(path: P) -> Result<HashMap<String, Value>> {
    let buffer = fs::read(path)?;
    let tensors = SafeTensors::deserialize(&buffer)?;

    let mut result = HashMap::new();
    for (name, tensor) in tensors.tensors() {
        let shape = tensor.shape().to_vec();
        let floats: Vec<f32> = match tensor.dtype() {
            safetensors::Dtype::F32 => tensor
                .data()
                .chunks_exact(4)
                .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
                .collect(),
            safetensors::Dtype::F64 => tensor
                .data()
                .chunks_exact(8)
                .map(|c| f64::from_le_bytes([c[0], c[1], c[2], c[3], c[4], c[5], c[6], c[7]]) as f32)
                .collect(),
            other => return Err(SafeTensorsError::UnsupportedDtype(format!("{:?}", other))),
        };

        let elements = floats.len();
        let arr = ArrayD::from_shape_vec(IxDyn(&shape), floats)
            .map_err(|_| SafeTensorsError::ShapeMismatch { name: name.clone(), shape: shape.clone(), elements })?;
        result.insert(name, Value::Tensor(arr));
    }
    Ok(result)
}

/// Names of the tensors stored in a SafeTensors file.
pub fn list_tensors<P: AsRef<Path>>(path: P) -> Result<Vec<String>> {
    let buffer = fs::read(path)?;
    let tensors = SafeTensors::deserialize(&buffer)?;
    Ok(tensors.names().iter().map(|s| s.to_string()).collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn save_and_load_preserve_shapes_and_values() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("weights.safetensors");

        let mut weights = HashMap::new();
        weights.insert(
            "generator.0.weights".to_string(),
            Value::Tensor(ArrayD::from_shape_vec(IxDyn(&[2, 3]), vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0]).unwrap()),
        );
        weights.insert("generator.0.bias".to_string(), Value::Tensor(ArrayD::zeros(IxDyn(&[1, 3]))));
        weights.insert("step".to_string(), Value::ScalarF32(0.5));

        save_safetensors(&path, &weights).unwrap();
        let loaded = load_safetensors(&path).unwrap();

        assert_eq!(loaded.len(), 3);
        assert_eq!(loaded["generator.0.weights"], weights["generator.0.weights"]);
        assert_eq!(loaded["generator.0.bias"].shape(), vec![1, 3]);
        assert_eq!(loaded["step"].scalar(), Some(0.5));

        let mut names = list_tensors(&path).unwrap();
        names.sort();
        assert_eq!(names, vec!["generator.0.bias", "generator.0.weights", "step"]);
    }

    #[test]
    fn missing_file_is_an_io_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = load_safetensors(dir.path().join("absent.safetensors")).unwrap_err();
        assert!(matches!(err, SafeTensorsError::IoError(_)));
    }
}
