//! Activation applied at the end of a parameterized layer.

use crate::tensor::Tensor;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Activation {
    /// `max(0, x)`
    #[default]
    ReLU,
    /// No activation; the layer outputs its pre-activation.
    Identity,
}

impl Activation {
    pub fn apply(&self, pre_activation: &Tensor) -> Tensor {
        match self {
            Activation::ReLU => pre_activation.relu(),
            Activation::Identity => pre_activation.clone(),
        }
    }
}
