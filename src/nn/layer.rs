//! The closed set of layers a [`Network`](super::Network) is built from.

use super::conv::Conv2d;
use super::linear::Linear;
use super::module::Module;
use super::reshape::{Reshape, Resize};
use crate::asg::Shape;
use crate::runtime::session::ParameterMap;
use crate::tensor::Tensor;
use rand::RngCore;

pub enum Layer {
    FullyConnected(Linear),
    Reshape(Reshape),
    Resize(Resize),
    Convolution(Conv2d),
}

impl Layer {
    fn module(&self) -> &dyn Module {
        match self {
            Layer::FullyConnected(l) => l,
            Layer::Reshape(l) => l,
            Layer::Resize(l) => l,
            Layer::Convolution(l) => l,
        }
    }
}

impl Module for Layer {
    fn forward(&self, inputs: &Tensor) -> Tensor {
        self.module().forward(inputs)
    }

    fn parameters(&self) -> Vec<Tensor> {
        self.module().parameters()
    }

    fn parameter_shapes(&self) -> Vec<(String, Shape)> {
        self.module().parameter_shapes()
    }

    fn init_parameters(&self, rng: &mut dyn RngCore) -> ParameterMap {
        self.module().init_parameters(rng)
    }
}

impl From<Linear> for Layer {
    fn from(layer: Linear) -> Self {
        Layer::FullyConnected(layer)
    }
}

impl From<Reshape> for Layer {
    fn from(layer: Reshape) -> Self {
        Layer::Reshape(layer)
    }
}

impl From<Resize> for Layer {
    fn from(layer: Resize) -> Self {
        Layer::Resize(layer)
    }
}

impl From<Conv2d> for Layer {
    fn from(layer: Conv2d) -> Self {
        Layer::Convolution(layer)
    }
}
