//! The `Module` trait shared by every layer.

use crate::asg::Shape;
use crate::runtime::session::ParameterMap;
use crate::tensor::Tensor;
use rand::RngCore;

/// A component that adds a fixed pattern of operations and parameters to the
/// graph.
pub trait Module {
    /// Symbolic forward pass: records the layer's operations on `inputs`.
    fn forward(&self, inputs: &Tensor) -> Tensor;

    /// Trainable parameters owned by this module, in declaration order.
    fn parameters(&self) -> Vec<Tensor>;

    /// Name and shape of every trainable parameter, in declaration order.
    fn parameter_shapes(&self) -> Vec<(String, Shape)> {
        Vec::new()
    }

    /// Freshly initialized values for every trainable parameter.
    fn init_parameters(&self, _rng: &mut dyn RngCore) -> ParameterMap {
        ParameterMap::new()
    }
}
