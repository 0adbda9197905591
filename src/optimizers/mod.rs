//! Optimizers that update parameter values from computed gradients.
//!
//! Optimizers work on concrete host values (`Value`), outside the graph.

use crate::asg::Value;
use crate::serialization::checkpoint::OptimizerState;
use ndarray::{ArrayD, Zip};
use std::collections::HashMap;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum OptimizerError {
    #[error("gradient for unknown parameter '{0}'")]
    MissingParameter(String),
    #[error("parameter '{name}' has shape {param:?} but its gradient has shape {grad:?}")]
    ShapeMismatch { name: String, param: Vec<usize>, grad: Vec<usize> },
    #[error("cannot restore optimizer state: {0}")]
    InvalidState(String),
}

pub trait Optimizer {
    /// Applies one update to every parameter that has a gradient.
    fn step(
        &mut self,
        parameters: &mut HashMap<String, Value>,
        gradients: &HashMap<String, Value>,
    ) -> Result<(), OptimizerError>;

    /// Hyper-parameters, step counter and per-parameter slots.
    fn state(&self) -> OptimizerState;

    /// Restores slots, step counter and the other hyper-parameters. The
    /// learning rate stays as configured.
    fn load_state(&mut self, state: &OptimizerState) -> Result<(), OptimizerError>;
}

/// Adam, with the bias correction folded into the step size:
///
/// ```text
/// lr_t = lr · √(1 − β2^t) / (1 − β1^t)
/// m    = β1·m + (1 − β1)·g
/// v    = β2·v + (1 − β2)·g²
/// p   -= lr_t · m / (√v + ε)
/// ```
#[derive(Debug, Clone)]
pub struct Adam {
    lr: f32,
    beta1: f32,
    beta2: f32,
    epsilon: f32,
    t: u64,
    m: HashMap<String, ArrayD<f32>>,
    v: HashMap<String, ArrayD<f32>>,
}

impl Adam {
    pub const TYPE: &'static str = "Adam";

    /// β1 = 0.9, β2 = 0.999, ε = 1e-8.
    pub fn new(lr: f32) -> Self {
        Self { lr, beta1: 0.9, beta2: 0.999, epsilon: 1e-8, t: 0, m: HashMap::new(), v: HashMap::new() }
    }

    pub fn learning_rate(&self) -> f32 {
        self.lr
    }

    /// Number of updates applied so far.
    pub fn steps(&self) -> u64 {
        self.t
    }
}

impl Optimizer for Adam {
    fn step(
        &mut self,
        parameters: &mut HashMap<String, Value>,
        gradients: &HashMap<String, Value>,
    ) -> Result<(), OptimizerError> {
        self.t += 1;
        let t = self.t.min(i32::MAX as u64) as i32;
        let (beta1, beta2, epsilon) = (self.beta1, self.beta2, self.epsilon);
        let lr_t = self.lr * (1.0 - beta2.powi(t)).sqrt() / (1.0 - beta1.powi(t));

        for (name, grad) in gradients {
            let param = match parameters.get_mut(name) {
                Some(Value::Tensor(p)) => p,
                Some(Value::ScalarF32(_)) | None => return Err(OptimizerError::MissingParameter(name.clone())),
            };
            let grad = grad.clone().into_array();
            if param.shape() != grad.shape() {
                return Err(OptimizerError::ShapeMismatch {
                    name: name.clone(),
                    param: param.shape().to_vec(),
                    grad: grad.shape().to_vec(),
                });
            }

            let m = self.m.entry(name.clone()).or_insert_with(|| ArrayD::zeros(param.raw_dim()));
            let v = self.v.entry(name.clone()).or_insert_with(|| ArrayD::zeros(param.raw_dim()));
            if m.shape() != param.shape() || v.shape() != param.shape() {
                return Err(OptimizerError::InvalidState(format!("slot shape mismatch for '{}'", name)));
            }

            Zip::from(param).and(m).and(v).and(&grad).for_each(|p, m, v, &g| {
                *m = beta1 * *m + (1.0 - beta1) * g;
                *v = beta2 * *v + (1.0 - beta2) * g * g;
                *p -= lr_t * *m / (v.sqrt() + epsilon);
            });
        }
        Ok(())
    }

    fn state(&self) -> OptimizerState {
        let mut state = OptimizerState::new(Self::TYPE);
        state.params.insert("lr".to_string(), self.lr as f64);
        state.params.insert("beta1".to_string(), self.beta1 as f64);
        state.params.insert("beta2".to_string(), self.beta2 as f64);
        state.params.insert("epsilon".to_string(), self.epsilon as f64);
        state.step = self.t;
        for (name, m) in &self.m {
            state.slots.insert(format!("m/{}", name), Value::Tensor(m.clone()));
        }
        for (name, v) in &self.v {
            state.slots.insert(format!("v/{}", name), Value::Tensor(v.clone()));
        }
        state
    }

    fn load_state(&mut self, state: &OptimizerState) -> Result<(), OptimizerError> {
        if state.optimizer_type != Self::TYPE {
            return Err(OptimizerError::InvalidState(format!(
                "expected {} state, found {}",
                Self::TYPE,
                state.optimizer_type
            )));
        }
        let param = |key: &str, current: f32| state.params.get(key).map(|&v| v as f32).unwrap_or(current);
        self.beta1 = param("beta1", self.beta1);
        self.beta2 = param("beta2", self.beta2);
        self.epsilon = param("epsilon", self.epsilon);
        self.t = state.step;

        self.m.clear();
        self.v.clear();
        for (key, value) in &state.slots {
            let Some((slot, name)) = key.split_once('/') else {
                return Err(OptimizerError::InvalidState(format!("malformed slot key '{}'", key)));
            };
            let target = match slot {
                "m" => &mut self.m,
                "v" => &mut self.v,
                _ => return Err(OptimizerError::InvalidState(format!("unknown slot '{}'", slot))),
            };
            target.insert(name.to_string(), value.clone().into_array());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::{array, IxDyn};

    #[test]
    fn first_step_moves_by_learning_rate_against_gradient_sign() {
        let mut params = HashMap::from([("w".to_string(), Value::Tensor(array![1.0f32, -2.0, 0.5].into_dyn()))]);
        let grads = HashMap::from([("w".to_string(), Value::Tensor(array![0.3f32, -4.0, 0.0].into_dyn()))]);

        let mut adam = Adam::new(1e-2);
        adam.step(&mut params, &grads).unwrap();

        let w = params["w"].as_tensor().unwrap();
        assert!((w[0] - 0.99).abs() < 1e-5);
        assert!((w[1] + 1.99).abs() < 1e-5);
        assert_eq!(w[2], 0.5);
        assert_eq!(adam.steps(), 1);
    }

    #[test]
    fn state_round_trip_continues_identically() {
        let grads = HashMap::from([("w".to_string(), Value::Tensor(ArrayD::from_elem(IxDyn(&[2, 2]), 0.7)))]);
        let mut params_a = HashMap::from([("w".to_string(), Value::Tensor(ArrayD::zeros(IxDyn(&[2, 2]))))]);

        let mut adam = Adam::new(1e-3);
        adam.step(&mut params_a, &grads).unwrap();
        let mut params_b = params_a.clone();

        let mut restored = Adam::new(1e-3);
        restored.load_state(&adam.state()).unwrap();

        adam.step(&mut params_a, &grads).unwrap();
        restored.step(&mut params_b, &grads).unwrap();
        assert_eq!(params_a, params_b);
    }

    #[test]
    fn restoring_keeps_the_configured_learning_rate() {
        let grads = HashMap::from([("w".to_string(), Value::Tensor(ArrayD::from_elem(IxDyn(&[2]), 1.0)))]);
        let mut params = HashMap::from([("w".to_string(), Value::Tensor(ArrayD::zeros(IxDyn(&[2]))))]);
        let mut adam = Adam::new(1e-3);
        adam.step(&mut params, &grads).unwrap();

        let mut restored = Adam::new(5e-2);
        restored.load_state(&adam.state()).unwrap();
        assert_eq!(restored.learning_rate(), 5e-2);
        assert_eq!(restored.steps(), 1);
    }

    #[test]
    fn gradient_for_unknown_parameter_is_an_error() {
        let mut params = HashMap::new();
        let grads = HashMap::from([("ghost".to_string(), Value::ScalarF32(1.0))]);
        let err = Adam::new(1e-4).step(&mut params, &grads).unwrap_err();
        assert_eq!(err, OptimizerError::MissingParameter("ghost".to_string()));
    }
}
