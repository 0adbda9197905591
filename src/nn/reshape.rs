//! Parameter-free layers that only rearrange or resample their input.

use crate::nn::module::Module;
use crate::tensor::Tensor;

/// Reinterprets every example as `shape`; the batch axis is kept.
#[derive(Debug, Clone, PartialEq)]
pub struct Reshape {
    pub shape: Vec<usize>,
}

impl Reshape {
    pub fn new(shape: &[usize]) -> Self {
        Self { shape: shape.to_vec() }
    }
}

impl Module for Reshape {
    fn forward(&self, inputs: &Tensor) -> Tensor {
        inputs.reshape(&self.shape)
    }

    fn parameters(&self) -> Vec<Tensor> {
        Vec::new()
    }
}

/// Bilinear resize of an NHWC batch to `(height, width)`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Resize {
    pub size: (usize, usize),
}

impl Resize {
    pub fn new(height: usize, width: usize) -> Self {
        Self { size: (height, width) }
    }
}

impl Module for Resize {
    fn forward(&self, inputs: &Tensor) -> Tensor {
        inputs.resize_bilinear(self.size)
    }

    fn parameters(&self) -> Vec<Tensor> {
        Vec::new()
    }
}
