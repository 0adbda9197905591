//! 2D convolution layer over NHWC image batches.

use super::activations::Activation;
use super::init;
use crate::asg::Shape;
use crate::nn::module::Module;
use crate::runtime::session::ParameterMap;
use crate::tensor::{GraphContext, Tensor};
use rand::RngCore;
use std::cell::RefCell;
use std::rc::Rc;

/// Configuration for [`Conv2d`].
#[derive(Debug, Clone, PartialEq)]
pub struct Conv2dConfig {
    pub in_channels: usize,
    /// Number of filters.
    pub out_channels: usize,
    pub kernel_size: (usize, usize),
    pub stride: (usize, usize),
    pub activation: Activation,
}

impl Default for Conv2dConfig {
    fn default() -> Self {
        Self {
            in_channels: 1,
            out_channels: 1,
            kernel_size: (3, 3),
            stride: (1, 1),
            activation: Activation::ReLU,
        }
    }
}

impl Conv2dConfig {
    /// 3x3 kernel, stride 1, ReLU.
    pub fn new(in_channels: usize, out_channels: usize) -> Self {
        Self { in_channels, out_channels, ..Default::default() }
    }

    pub fn with_stride(mut self, stride: (usize, usize)) -> Self {
        self.stride = stride;
        self
    }

    pub fn without_activation(mut self) -> Self {
        self.activation = Activation::Identity;
        self
    }

    fn filter_shape(&self) -> Shape {
        vec![self.kernel_size.0, self.kernel_size.1, self.in_channels, self.out_channels]
    }
}

/// SAME-padded convolution: `activation(conv(x, F) + b)`.
///
/// Input `[N, H, W, C_in]`, output `[N, ceil(H/sh), ceil(W/sw), C_out]`.
/// The filter is `[kH, kW, C_in, C_out]` and the bias `[1, C_out]`,
/// broadcast over every pixel.
pub struct Conv2d {
    pub filter: Tensor,
    pub bias: Tensor,
    pub config: Conv2dConfig,
}

impl Conv2d {
    pub fn new(context: &Rc<RefCell<GraphContext>>, name: &str, in_channels: usize, out_channels: usize) -> Self {
        Self::from_config(context, name, Conv2dConfig::new(in_channels, out_channels))
    }

    pub fn from_config(context: &Rc<RefCell<GraphContext>>, name: &str, config: Conv2dConfig) -> Self {
        let filter = Tensor::new_parameter(context, &format!("{}.weights", name));
        let bias = Tensor::new_parameter(context, &format!("{}.bias", name));
        Self { filter, bias, config }
    }
}

impl Module for Conv2d {
    fn forward(&self, inputs: &Tensor) -> Tensor {
        let conv_out = inputs.conv2d(&self.filter, self.config.stride);
        let pre_activation = &conv_out + &self.bias;
        self.config.activation.apply(&pre_activation)
    }

    fn parameters(&self) -> Vec<Tensor> {
        vec![self.filter.clone(), self.bias.clone()]
    }

    fn parameter_shapes(&self) -> Vec<(String, Shape)> {
        vec![
            (self.filter.name().unwrap_or_default(), self.config.filter_shape()),
            (self.bias.name().unwrap_or_default(), vec![1, self.config.out_channels]),
        ]
    }

    /// `F ~ N(0, 1/√(kH·kW·C_in))`, `b = 0`.
    fn init_parameters(&self, rng: &mut dyn RngCore) -> ParameterMap {
        let fan_in = self.config.kernel_size.0 * self.config.kernel_size.1 * self.config.in_channels;
        let stddev = 1.0 / (fan_in as f32).sqrt();
        let mut params = ParameterMap::new();
        params.insert(
            self.filter.name().unwrap_or_default(),
            init::normal(&self.config.filter_shape(), stddev, rng),
        );
        params.insert(self.bias.name().unwrap_or_default(), init::zeros(&[1, self.config.out_channels]));
        params
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn filter_follows_hwio_layout() {
        let ctx = GraphContext::shared();
        let conv = Conv2d::from_config(&ctx, "discriminator.0", Conv2dConfig::new(1, 16).with_stride((2, 2)));
        assert_eq!(
            conv.parameter_shapes(),
            vec![
                ("discriminator.0.weights".to_string(), vec![3, 3, 1, 16]),
                ("discriminator.0.bias".to_string(), vec![1, 16]),
            ]
        );
        assert_eq!(conv.parameters().len(), 2);
    }
}
