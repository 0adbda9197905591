//! The Wasserstein GAN: a generator, a critic, and their objectives.
//!
//! ```text
//! generator     noise [B, n] → FC 196 → FC 196 → FC 196 → [14, 14, 1]
//!               → resize 28×28 → conv 16 → conv 32 → conv 32 → conv 1 → sigmoid
//! discriminator image [B, 28, 28, 1] → conv 16 /2 → conv 32 → conv 16 /2
//!               → [784] → FC 256 → FC 256 → FC 1
//! ```

use crate::asg::Shape;
use crate::nn::{Conv2d, Conv2dConfig, Linear, Module, Network, Reshape, Resize};
use crate::runtime::session::ParameterMap;
use crate::tensor::{GraphContext, Tensor};
use rand::RngCore;
use std::cell::RefCell;
use std::rc::Rc;
use thiserror::Error;

pub const GENERATOR: &str = "generator";
pub const DISCRIMINATOR: &str = "discriminator";

#[derive(Error, Debug, Clone, PartialEq)]
pub enum GanError {
    #[error("no value for parameter '{0}'")]
    MissingParameter(String),
    #[error("parameter '{name}' has shape {found:?}, the model expects {expected:?}")]
    ShapeMismatch { name: String, expected: Shape, found: Shape },
    #[error("parameter '{0}' is not a tensor")]
    NotATensor(String),
}

pub struct Gan {
    pub generator: Network,
    pub discriminator: Network,
}

fn layer_name(network: &str, index: usize) -> String {
    format!("{}.{}", network, index)
}

fn build_generator(ctx: &Rc<RefCell<GraphContext>>, noise_size: usize) -> Network {
    let name = |i| layer_name(GENERATOR, i);
    Network::new(vec![
        Linear::new(ctx, &name(0), noise_size, 196).into(),
        Linear::new(ctx, &name(1), 196, 196).into(),
        Linear::new(ctx, &name(2), 196, 196).into(),
        Reshape::new(&[14, 14, 1]).into(),
        Resize::new(28, 28).into(),
        Conv2d::new(ctx, &name(5), 1, 16).into(),
        Conv2d::new(ctx, &name(6), 16, 32).into(),
        Conv2d::new(ctx, &name(7), 32, 32).into(),
        Conv2d::from_config(ctx, &name(8), Conv2dConfig::new(32, 1).without_activation()).into(),
    ])
}

fn build_discriminator(ctx: &Rc<RefCell<GraphContext>>) -> Network {
    let name = |i| layer_name(DISCRIMINATOR, i);
    Network::new(vec![
        Conv2d::from_config(ctx, &name(0), Conv2dConfig::new(1, 16).with_stride((2, 2))).into(),
        Conv2d::new(ctx, &name(1), 16, 32).into(),
        Conv2d::from_config(ctx, &name(2), Conv2dConfig::new(32, 16).with_stride((2, 2))).into(),
        Reshape::new(&[784]).into(),
        Linear::new(ctx, &name(4), 784, 256).into(),
        Linear::new(ctx, &name(5), 256, 256).into(),
        Linear::new(ctx, &name(6), 256, 1).without_activation().into(),
    ])
}

impl Gan {
    /// Declares both networks in `context`. Parameter values are not created
    /// here; see [`init_parameters`](Self::init_parameters).
    pub fn new(context: &Rc<RefCell<GraphContext>>, noise_size: usize) -> Self {
        Self {
            generator: build_generator(context, noise_size),
            discriminator: build_discriminator(context),
        }
    }

    /// Images in `[0, 1]`, `[B, 28, 28, 1]`.
    pub fn generate(&self, noise: &Tensor) -> Tensor {
        self.generator.apply(noise).sigmoid()
    }

    /// Raw critic score, `[B, 1]`.
    pub fn discriminate(&self, images: &Tensor) -> Tensor {
        self.discriminator.apply(images)
    }

    /// `-mean(D(G(z)))`
    pub fn generator_objective(&self, noise: &Tensor) -> Tensor {
        -&self.discriminate(&self.generate(noise)).mean()
    }

    /// `mean(D(G(z)) - D(x))`
    pub fn discriminator_objective(&self, noise: &Tensor, images: &Tensor) -> Tensor {
        let fake = self.discriminate(&self.generate(noise));
        let real = self.discriminate(images);
        (&fake - &real).mean()
    }

    pub fn generator_vars(&self) -> Vec<Tensor> {
        self.generator.variables()
    }

    pub fn discriminator_vars(&self) -> Vec<Tensor> {
        self.discriminator.variables()
    }

    /// Clamps every discriminator parameter into `[-magnitude, magnitude]`.
    /// Fails, leaving the remaining parameters unclipped, if one is missing.
    pub fn clip_discriminator(&self, parameters: &mut ParameterMap, magnitude: f32) -> Result<(), GanError> {
        for var in self.discriminator_vars() {
            let name = var.name().ok_or_else(|| GanError::MissingParameter(format!("node {}", var.node_id)))?;
            let value = parameters.get_mut(&name).ok_or_else(|| GanError::MissingParameter(name.clone()))?;
            let arr = value.as_tensor_mut().ok_or(GanError::NotATensor(name))?;
            arr.mapv_inplace(|v| v.clamp(-magnitude, magnitude));
        }
        Ok(())
    }

    /// Name and shape of every parameter of both networks.
    pub fn parameter_shapes(&self) -> Vec<(String, Shape)> {
        let mut shapes = self.generator.parameter_shapes();
        shapes.extend(self.discriminator.parameter_shapes());
        shapes
    }

    pub fn init_parameters(&self, rng: &mut dyn RngCore) -> ParameterMap {
        let mut params = self.generator.init_parameters(rng);
        params.extend(self.discriminator.init_parameters(rng));
        params
    }

    /// Checks that `parameters` holds a value of the right shape for every
    /// parameter of the model.
    pub fn validate_parameters(&self, parameters: &ParameterMap) -> Result<(), GanError> {
        for (name, expected) in self.parameter_shapes() {
            let value = parameters.get(&name).ok_or_else(|| GanError::MissingParameter(name.clone()))?;
            let found = value.shape();
            if found != expected {
                return Err(GanError::ShapeMismatch { name, expected, found });
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::asg::Value;
    use ndarray::{ArrayD, IxDyn};
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn parameters_are_named_by_network_and_layer() {
        let ctx = GraphContext::shared();
        let gan = Gan::new(&ctx, 100);
        let names: Vec<String> = gan.generator_vars().iter().filter_map(|t| t.name()).collect();
        assert_eq!(names.len(), 14);
        assert_eq!(names[0], "generator.0.weights");
        assert_eq!(names[13], "generator.8.bias");

        let shapes: std::collections::HashMap<_, _> = gan.parameter_shapes().into_iter().collect();
        assert_eq!(shapes["generator.0.weights"], vec![100, 196]);
        assert_eq!(shapes["generator.8.weights"], vec![3, 3, 32, 1]);
        assert_eq!(shapes["discriminator.4.weights"], vec![784, 256]);
        assert_eq!(shapes["discriminator.6.bias"], vec![1, 1]);
        assert_eq!(gan.discriminator_vars().len(), 12);
    }

    #[test]
    fn clipping_is_idempotent_and_keeps_small_values() {
        let ctx = GraphContext::shared();
        let gan = Gan::new(&ctx, 4);
        let mut params = gan.init_parameters(&mut StdRng::seed_from_u64(0));
        params.insert(
            "discriminator.0.bias".to_string(),
            Value::Tensor(ArrayD::from_shape_vec(IxDyn(&[1, 4]), vec![0.005, -0.5, 0.02, -0.01]).unwrap()),
        );
        let generator_before = params["generator.0.weights"].clone();

        gan.clip_discriminator(&mut params, 0.01).unwrap();
        let once = params.clone();
        gan.clip_discriminator(&mut params, 0.01).unwrap();
        assert_eq!(params, once);

        let bias = params["discriminator.0.bias"].as_tensor().unwrap();
        assert_eq!(bias.iter().copied().collect::<Vec<_>>(), vec![0.005, -0.01, 0.01, -0.01]);
        assert_eq!(params["generator.0.weights"], generator_before);
        for var in gan.discriminator_vars() {
            let value = &params[&var.name().unwrap()];
            assert!(value.as_tensor().unwrap().iter().all(|v| v.abs() <= 0.01));
        }
    }

    #[test]
    fn clipping_reports_missing_and_scalar_parameters() {
        let ctx = GraphContext::shared();
        let gan = Gan::new(&ctx, 4);
        let mut params = gan.init_parameters(&mut StdRng::seed_from_u64(3));

        params.insert("discriminator.2.bias".to_string(), Value::ScalarF32(0.5));
        assert_eq!(
            gan.clip_discriminator(&mut params, 0.01),
            Err(GanError::NotATensor("discriminator.2.bias".to_string()))
        );

        params.remove("discriminator.5.weights");
        params.insert("discriminator.2.bias".to_string(), Value::Tensor(ArrayD::zeros(IxDyn(&[1, 16]))));
        assert_eq!(
            gan.clip_discriminator(&mut params, 0.01),
            Err(GanError::MissingParameter("discriminator.5.weights".to_string()))
        );
    }

    #[test]
    fn validation_reports_missing_and_misshapen_parameters() {
        let ctx = GraphContext::shared();
        let gan = Gan::new(&ctx, 8);
        let mut params = gan.init_parameters(&mut StdRng::seed_from_u64(1));
        assert_eq!(gan.validate_parameters(&params), Ok(()));

        params.insert("generator.1.bias".to_string(), Value::Tensor(ArrayD::zeros(IxDyn(&[1, 3]))));
        assert!(matches!(gan.validate_parameters(&params), Err(GanError::ShapeMismatch { .. })));

        params.remove("discriminator.2.weights");
        params.remove("generator.1.bias");
        assert!(matches!(gan.validate_parameters(&params), Err(GanError::MissingParameter(_))));
    }
}
