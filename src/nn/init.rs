//! Parameter initializers.

use crate::asg::Value;
use ndarray::{ArrayD, IxDyn};
use ndarray_rand::rand_distr::StandardNormal;
use ndarray_rand::RandomExt;
use rand::RngCore;

/// Samples from N(0, stddev²).
pub fn normal(shape: &[usize], stddev: f32, rng: &mut dyn RngCore) -> Value {
    let sample: ArrayD<f32> = ArrayD::random_using(IxDyn(shape), StandardNormal, rng);
    Value::Tensor(sample * stddev)
}

pub fn zeros(shape: &[usize]) -> Value {
    Value::Tensor(ArrayD::zeros(IxDyn(shape)))
}
