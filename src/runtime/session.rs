//! `Session`: the explicit execution context.
//!
//! A session owns a backend and the current values of every trainable
//! parameter. Graphs recorded through a [`GraphContext`] are compiled once
//! into programs (shape-checked, and differentiated when gradients are
//! wanted) and then run any number of times with a feed of named inputs.

use super::backend::{Backend, Memo, RuntimeError};
use super::cpu_backend::CpuBackend;
use crate::analysis::shape_inference::{ShapeInference, ShapeInferenceError};
use crate::asg::{Asg, NodeId, NodeType, Shape, Value};
use crate::autograd::{AutogradError, Gradients};
use crate::tensor::{GraphContext, Tensor};
use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;
use thiserror::Error;
use tracing::debug;

/// Parameter values by name.
pub type ParameterMap = HashMap<String, Value>;

#[derive(Error, Debug)]
pub enum SessionError {
    #[error("shape inference failed: {0}")]
    Shape(#[from] ShapeInferenceError),
    #[error("autograd failed: {0}")]
    Autograd(#[from] AutogradError),
    #[error("execution failed: {0}")]
    Runtime(#[from] RuntimeError),
    #[error("node {0} is not a parameter")]
    NotAParameter(NodeId),
    #[error("program produced no value for its output")]
    MissingOutput,
}

pub type SessionResult<T> = Result<T, SessionError>;

/// A shape-checked graph with fixed outputs.
#[derive(Debug, Clone)]
pub struct Program {
    pub graph: Asg,
}

/// A scalar loss together with the graph of its gradients.
#[derive(Debug, Clone)]
pub struct GradientProgram {
    pub forward: Asg,
    pub gradients: Asg,
    /// Parameter names, in the order of the gradient graph outputs.
    pub parameters: Vec<String>,
}

pub struct Session<B: Backend = CpuBackend> {
    backend: B,
    parameters: ParameterMap,
}

impl Session<CpuBackend> {
    pub fn cpu() -> Self {
        Self::new(CpuBackend::new())
    }
}

impl<B: Backend> Session<B> {
    pub fn new(backend: B) -> Self {
        Self { backend, parameters: HashMap::new() }
    }

    pub fn parameters(&self) -> &ParameterMap {
        &self.parameters
    }

    pub fn parameters_mut(&mut self) -> &mut ParameterMap {
        &mut self.parameters
    }

    pub fn set_parameters(&mut self, parameters: ParameterMap) {
        self.parameters = parameters;
    }

    /// Snapshot of the graph recorded so far, with `outputs` as its outputs,
    /// shape-checked against `input_shapes` and the current parameter values.
    pub fn compile(
        &self,
        context: &Rc<RefCell<GraphContext>>,
        outputs: &[&Tensor],
        input_shapes: &HashMap<String, Shape>,
    ) -> SessionResult<Program> {
        let mut graph = context.borrow().main_graph().clone();
        graph.set_outputs(outputs.iter().map(|t| t.node_id).collect());
        ShapeInference::run(&mut graph, &self.initial_shapes(input_shapes))?;
        debug!(nodes = graph.nodes.len(), outputs = graph.outputs.len(), "compiled program");
        Ok(Program { graph })
    }

    /// Like [`compile`](Self::compile) for a scalar `loss`, and additionally
    /// derives the gradient graph of `loss` with respect to `wrt`, which must
    /// all be parameters.
    pub fn compile_gradients(
        &self,
        context: &Rc<RefCell<GraphContext>>,
        loss: &Tensor,
        wrt: &[Tensor],
        input_shapes: &HashMap<String, Shape>,
    ) -> SessionResult<GradientProgram> {
        let Program { graph: mut forward } = self.compile(context, &[loss], input_shapes)?;

        let mut parameters = Vec::with_capacity(wrt.len());
        for param in wrt {
            match forward.nodes.get(&param.node_id).map(|n| &n.node_type) {
                Some(NodeType::Parameter { name }) => parameters.push(name.clone()),
                _ => return Err(SessionError::NotAParameter(param.node_id)),
            }
        }

        // Parameters outside the loss's reach still need a shape for their
        // zero gradient.
        let shapes = self.initial_shapes(input_shapes);
        for (param, name) in wrt.iter().zip(&parameters) {
            let Some(node) = forward.nodes.get_mut(&param.node_id) else {
                continue;
            };
            if node.shape.is_none() {
                let shape = shapes
                    .get(name)
                    .cloned()
                    .ok_or_else(|| ShapeInferenceError::MissingInitialShape(name.clone()))?;
                node.shape = Some(shape);
            }
        }

        let wrt_ids: Vec<NodeId> = wrt.iter().map(|t| t.node_id).collect();
        let gradients = Gradients::new(forward.clone()).build(loss.node_id, &wrt_ids)?;
        debug!(
            forward_nodes = forward.nodes.len(),
            gradient_nodes = gradients.nodes.len(),
            "compiled gradient program"
        );
        Ok(GradientProgram { forward, gradients, parameters })
    }

    /// Evaluates the outputs of `program`.
    pub fn run(&self, program: &Program, feed: &HashMap<String, Value>) -> SessionResult<Vec<Value>> {
        let memo = self.initial_memo(&program.graph, feed)?;
        let (outputs, _) = self.backend.run(&program.graph, memo)?;
        Ok(self.backend.retrieve_data(&outputs)?)
    }

    /// Evaluates the loss and its gradient for every parameter of `program`.
    pub fn run_with_gradients(
        &self,
        program: &GradientProgram,
        feed: &HashMap<String, Value>,
    ) -> SessionResult<(Value, ParameterMap)> {
        let memo = self.initial_memo(&program.forward, feed)?;
        let (outputs, memo) = self.backend.run(&program.forward, memo)?;
        let loss = self
            .backend
            .retrieve_data(&outputs)?
            .into_iter()
            .next()
            .ok_or(SessionError::MissingOutput)?;

        let (grad_outputs, _) = self.backend.run(&program.gradients, memo)?;
        let grads = self.backend.retrieve_data(&grad_outputs)?;
        let grads = program.parameters.iter().cloned().zip(grads).collect();
        Ok((loss, grads))
    }

    fn initial_shapes(&self, input_shapes: &HashMap<String, Shape>) -> HashMap<String, Shape> {
        let mut shapes = input_shapes.clone();
        for (name, value) in &self.parameters {
            shapes.entry(name.clone()).or_insert_with(|| value.shape());
        }
        shapes
    }

    /// Seeds the memo with the value of every input and parameter node of
    /// `graph` that is fed or known. Missing ones surface when evaluated.
    fn initial_memo(&self, graph: &Asg, feed: &HashMap<String, Value>) -> SessionResult<Memo<B::DeviceData>> {
        let mut host = HashMap::new();
        let mut slots = Vec::new();
        for node in graph.nodes.values() {
            let value = match &node.node_type {
                NodeType::Input { name } => feed.get(name),
                NodeType::Parameter { name } => feed.get(name).or_else(|| self.parameters.get(name)),
                _ => continue,
            };
            if let (Some(value), Some(name)) = (value, graph.feed_name(node.id)) {
                host.entry(name.to_string()).or_insert_with(|| value.clone());
                slots.push((node.id, name.to_string()));
            }
        }

        let device = self.backend.load_data(&host)?;
        let mut memo = HashMap::with_capacity(slots.len());
        for (node_id, name) in slots {
            if let Some(data) = device.get(&name) {
                memo.insert((graph.id, node_id), data.clone());
            }
        }
        Ok(memo)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::{array, ArrayD, IxDyn};

    #[test]
    fn runs_program_with_feed_and_parameters() {
        let ctx = GraphContext::shared();
        let x = Tensor::new_input(&ctx, "x");
        let w = Tensor::new_parameter(&ctx, "w");
        let y = x.dot(&w);

        let mut session = Session::cpu();
        session.parameters_mut().insert("w".into(), Value::Tensor(array![[2.0f32], [3.0]].into_dyn()));
        let shapes = HashMap::from([("x".to_string(), vec![1, 2])]);
        let program = session.compile(&ctx, &[&y], &shapes).unwrap();

        let feed = HashMap::from([("x".to_string(), Value::Tensor(array![[1.0f32, 1.0]].into_dyn()))]);
        let out = session.run(&program, &feed).unwrap();
        assert_eq!(out[0].scalar(), Some(5.0));
    }

    #[test]
    fn gradients_are_keyed_by_parameter_name() {
        let ctx = GraphContext::shared();
        let x = Tensor::new_input(&ctx, "x");
        let w = Tensor::new_parameter(&ctx, "w");
        let loss = (&x * &w).sum();

        let mut session = Session::cpu();
        session.parameters_mut().insert("w".into(), Value::Tensor(ArrayD::from_elem(IxDyn(&[1, 3]), 0.5)));
        let shapes = HashMap::from([("x".to_string(), vec![2, 3])]);
        let program = session.compile_gradients(&ctx, &loss, &[w.clone()], &shapes).unwrap();

        let x_val = array![[1.0f32, 2.0, 3.0], [4.0, 5.0, 6.0]].into_dyn();
        let feed = HashMap::from([("x".to_string(), Value::Tensor(x_val))]);
        let (loss_val, grads) = session.run_with_gradients(&program, &feed).unwrap();

        assert_eq!(loss_val.scalar(), Some(10.5));
        let gw = grads["w"].as_tensor().unwrap();
        assert_eq!(gw, &array![[5.0f32, 7.0, 9.0]].into_dyn());
    }

    #[test]
    fn non_parameter_wrt_is_rejected() {
        let ctx = GraphContext::shared();
        let x = Tensor::new_input(&ctx, "x");
        let loss = x.sum();
        let session = Session::cpu();
        let shapes = HashMap::from([("x".to_string(), vec![2])]);
        let err = session.compile_gradients(&ctx, &loss, &[x.clone()], &shapes).unwrap_err();
        assert!(matches!(err, SessionError::NotAParameter(_)));
    }
}
