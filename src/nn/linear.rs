//! Fully connected layer.

use super::activations::Activation;
use super::init;
use crate::asg::Shape;
use crate::nn::module::Module;
use crate::runtime::session::ParameterMap;
use crate::tensor::{GraphContext, Tensor};
use rand::RngCore;
use std::cell::RefCell;
use std::rc::Rc;

/// Fully connected layer: `activation(x · W + b)`.
///
/// Holds no data. `weights` (`[in, out]`) and `bias` (`[1, out]`) are
/// `Parameter` nodes named `<name>.weights` and `<name>.bias`; their values
/// live in the session.
pub struct Linear {
    pub weights: Tensor,
    pub bias: Tensor,
    pub in_features: usize,
    pub out_features: usize,
    pub activation: Activation,
}

impl Linear {
    pub fn new(context: &Rc<RefCell<GraphContext>>, name: &str, in_features: usize, out_features: usize) -> Self {
        let weights = Tensor::new_parameter(context, &format!("{}.weights", name));
        let bias = Tensor::new_parameter(context, &format!("{}.bias", name));
        Self { weights, bias, in_features, out_features, activation: Activation::ReLU }
    }

    /// Outputs the pre-activation instead.
    pub fn without_activation(mut self) -> Self {
        self.activation = Activation::Identity;
        self
    }

    fn weight_name(&self) -> String {
        self.weights.name().unwrap_or_default()
    }

    fn bias_name(&self) -> String {
        self.bias.name().unwrap_or_default()
    }
}

impl Module for Linear {
    fn forward(&self, inputs: &Tensor) -> Tensor {
        let pre_activation = &inputs.dot(&self.weights) + &self.bias;
        self.activation.apply(&pre_activation)
    }

    fn parameters(&self) -> Vec<Tensor> {
        vec![self.weights.clone(), self.bias.clone()]
    }

    fn parameter_shapes(&self) -> Vec<(String, Shape)> {
        vec![
            (self.weight_name(), vec![self.in_features, self.out_features]),
            (self.bias_name(), vec![1, self.out_features]),
        ]
    }

    /// `W ~ N(0, 1/√in)`, `b = 0`.
    fn init_parameters(&self, rng: &mut dyn RngCore) -> ParameterMap {
        let stddev = 1.0 / (self.in_features as f32).sqrt();
        let mut params = ParameterMap::new();
        params.insert(self.weight_name(), init::normal(&[self.in_features, self.out_features], stddev, rng));
        params.insert(self.bias_name(), init::zeros(&[1, self.out_features]));
        params
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn declares_named_parameters_with_shapes() {
        let ctx = GraphContext::shared();
        let fc = Linear::new(&ctx, "generator.0", 100, 196);
        assert_eq!(
            fc.parameter_shapes(),
            vec![("generator.0.weights".to_string(), vec![100, 196]), ("generator.0.bias".to_string(), vec![1, 196])]
        );

        let params = fc.init_parameters(&mut StdRng::seed_from_u64(7));
        let w = params["generator.0.weights"].as_tensor().unwrap();
        assert_eq!(w.shape(), &[100, 196]);
        let std = (w.iter().map(|v| v * v).sum::<f32>() / w.len() as f32).sqrt();
        assert!((std - 0.1).abs() < 0.01, "stddev {}", std);
        assert!(params["generator.0.bias"].as_tensor().unwrap().iter().all(|&b| b == 0.0));
    }
}
