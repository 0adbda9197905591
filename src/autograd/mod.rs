//! Autograd: builds the graph of d(loss)/d(node).
//!
//! Algorithm:
//!  - walk the forward graph in reverse topological order from the loss;
//!  - for every node that has an incoming dL/dY, emit its contribution to each
//!    operand and accumulate (sum) contributions;
//!  - everything is emitted into a separate gradient ASG. Forward values are
//!    referenced through `External` nodes, so the gradient graph is executed
//!    with the memo left behind by the forward run.
//!
//! Only nodes that depend on one of the requested `wrt` nodes are
//! differentiated. The discriminator objective, for instance, runs the
//! generator forward but never backpropagates into it when only the
//! discriminator parameters are requested.
//!
//! The forward graph must have been through shape inference.

use crate::analysis::shape_inference::{ShapeInference, ShapeInferenceError};
use crate::asg::{Asg, AsgError, NodeId, NodeType, Shape, Value};
use ndarray::{ArrayD, IxDyn};
use std::collections::{HashMap, HashSet};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum AutogradError {
    #[error("ASG: {0}")]
    Asg(#[from] AsgError),
    #[error("shape: {0}")]
    Shape(#[from] ShapeInferenceError),
}

pub type AutogradResult<T> = Result<T, AutogradError>;

/// Builder of gradient graphs.
pub struct Gradients {
    /// Forward graph, with shapes.
    src: Asg,
    /// Gradient graph under construction.
    grad: Asg,
    /// Forward node -> accumulated gradient node in `grad`.
    gmap: HashMap<NodeId, NodeId>,
    /// Forward node -> `External` node in `grad` that reads its value.
    externals: HashMap<NodeId, NodeId>,
}

impl Gradients {
    pub fn new(src: Asg) -> Self {
        let grad = Asg::new(src.id + 1);
        Self { src, grad, gmap: HashMap::new(), externals: HashMap::new() }
    }

    /// Builds the gradient graph. Its outputs are d(loss)/d(wrt[i]), in
    /// order; a `wrt` node the loss does not depend on gets zeros.
    pub fn build(mut self, loss_id: NodeId, wrt: &[NodeId]) -> AutogradResult<Asg> {
        let order = ShapeInference::sort_from(&self.src, &[loss_id])?;

        let wrt_set: HashSet<NodeId> = wrt.iter().copied().collect();
        let mut requires: HashSet<NodeId> = HashSet::new();
        for &id in &order {
            let node = self.src.get_node(id)?;
            if wrt_set.contains(&id) || node.node_type.operands().iter().any(|op| requires.contains(op)) {
                requires.insert(id);
            }
        }

        if requires.contains(&loss_id) {
            let seed = self.seed(loss_id)?;
            self.gmap.insert(loss_id, seed);
        }

        for &id in order.iter().rev() {
            if !requires.contains(&id) {
                continue;
            }
            let Some(g_out) = self.gmap.get(&id).copied() else {
                continue;
            };
            let node_type = self.src.get_node(id)?.node_type.clone();
            let needs = |x: &NodeId| requires.contains(x);

            match node_type {
                // Leaves: dL/dX is already accumulated.
                NodeType::Input { .. }
                | NodeType::Parameter { .. }
                | NodeType::Literal(_)
                | NodeType::External { .. } => {}

                // -------- binary --------
                NodeType::Add(a, b) => {
                    if needs(&a) {
                        let ga = self.reduce_to(g_out, id, a)?;
                        self.acc(a, ga);
                    }
                    if needs(&b) {
                        let gb = self.reduce_to(g_out, id, b)?;
                        self.acc(b, gb);
                    }
                }
                NodeType::Subtract(a, b) => {
                    if needs(&a) {
                        let ga = self.reduce_to(g_out, id, a)?;
                        self.acc(a, ga);
                    }
                    if needs(&b) {
                        let neg = self.add_node(NodeType::Negate(g_out));
                        let gb = self.reduce_to(neg, id, b)?;
                        self.acc(b, gb);
                    }
                }
                NodeType::Multiply(a, b) => {
                    if needs(&a) {
                        let b_val = self.external(b)?;
                        let prod = self.add_node(NodeType::Multiply(g_out, b_val));
                        let ga = self.reduce_to(prod, id, a)?;
                        self.acc(a, ga);
                    }
                    if needs(&b) {
                        let a_val = self.external(a)?;
                        let prod = self.add_node(NodeType::Multiply(g_out, a_val));
                        let gb = self.reduce_to(prod, id, b)?;
                        self.acc(b, gb);
                    }
                }
                NodeType::MatrixMultiply(a, b) => {
                    // g_a = g @ b^T, g_b = a^T @ g
                    if needs(&a) {
                        let b_val = self.external(b)?;
                        let bt = self.add_node(NodeType::Transpose(b_val, 0, 1));
                        let ga = self.add_node(NodeType::MatrixMultiply(g_out, bt));
                        self.acc(a, ga);
                    }
                    if needs(&b) {
                        let a_val = self.external(a)?;
                        let at = self.add_node(NodeType::Transpose(a_val, 0, 1));
                        let gb = self.add_node(NodeType::MatrixMultiply(at, g_out));
                        self.acc(b, gb);
                    }
                }
                // Comparisons have zero derivative.
                NodeType::GreaterThan(_, _) => {}

                // -------- unary --------
                NodeType::Negate(x) => {
                    let gx = self.add_node(NodeType::Negate(g_out));
                    self.acc(x, gx);
                }
                NodeType::ReLU(x) => {
                    let zero = self.lit_scalar(0.0);
                    let x_val = self.external(x)?;
                    let mask = self.add_node(NodeType::GreaterThan(x_val, zero));
                    let gx = self.add_node(NodeType::Multiply(g_out, mask));
                    self.acc(x, gx);
                }
                NodeType::Sigmoid(x) => {
                    // dy/dx = y * (1 - y), with y read back from the forward pass.
                    let y = self.external(id)?;
                    let one = self.lit_scalar(1.0);
                    let one_minus_y = self.add_node(NodeType::Subtract(one, y));
                    let slope = self.add_node(NodeType::Multiply(y, one_minus_y));
                    let gx = self.add_node(NodeType::Multiply(g_out, slope));
                    self.acc(x, gx);
                }

                // -------- reductions --------
                NodeType::Sum(x) => {
                    let x_val = self.external(x)?;
                    let gx = self.add_node(NodeType::Broadcast(g_out, x_val));
                    self.acc(x, gx);
                }
                NodeType::Mean(x) => {
                    let n = self.src.shape_of(x)?.iter().product::<usize>().max(1);
                    let inv_n = self.lit_scalar(1.0 / n as f32);
                    let scaled = self.add_node(NodeType::Multiply(g_out, inv_n));
                    let x_val = self.external(x)?;
                    let gx = self.add_node(NodeType::Broadcast(scaled, x_val));
                    self.acc(x, gx);
                }

                // -------- transformations --------
                NodeType::Reshape(x, _) | NodeType::ReshapeLike(x, _) => {
                    let x_val = self.external(x)?;
                    let gx = self.add_node(NodeType::ReshapeLike(g_out, x_val));
                    self.acc(x, gx);
                }
                NodeType::Transpose(x, a1, a2) => {
                    let gx = self.add_node(NodeType::Transpose(g_out, a1, a2));
                    self.acc(x, gx);
                }
                NodeType::Broadcast(x, _) => {
                    let x_val = self.external(x)?;
                    let gx = self.add_node(NodeType::ReduceSumTo(g_out, x_val));
                    self.acc(x, gx);
                }
                NodeType::ReduceSumTo(x, _) => {
                    let x_val = self.external(x)?;
                    let gx = self.add_node(NodeType::Broadcast(g_out, x_val));
                    self.acc(x, gx);
                }

                // -------- images --------
                NodeType::Conv2d { input, filter, stride } => {
                    if needs(&input) {
                        let f_val = self.external(filter)?;
                        let in_val = self.external(input)?;
                        let gi = self.add_node(NodeType::Conv2dBackpropInput {
                            grad_output: g_out,
                            filter: f_val,
                            input: in_val,
                            stride,
                        });
                        self.acc(input, gi);
                    }
                    if needs(&filter) {
                        let in_val = self.external(input)?;
                        let f_val = self.external(filter)?;
                        let gf = self.add_node(NodeType::Conv2dBackpropFilter {
                            grad_output: g_out,
                            input: in_val,
                            filter: f_val,
                            stride,
                        });
                        self.acc(filter, gf);
                    }
                }
                NodeType::ResizeBilinear { input, .. } => {
                    let in_val = self.external(input)?;
                    let gi = self.add_node(NodeType::ResizeBilinearGrad { grad_output: g_out, input: in_val });
                    self.acc(input, gi);
                }

                // Gradient-only operations never appear in a forward pass.
                other @ (NodeType::Conv2dBackpropInput { .. }
                | NodeType::Conv2dBackpropFilter { .. }
                | NodeType::ResizeBilinearGrad { .. }) => {
                    return Err(AsgError::UnsupportedOperation(format!("gradient of {:?}", other)).into());
                }
            }
        }

        let mut outputs = Vec::with_capacity(wrt.len());
        for &w in wrt {
            let g = match self.gmap.get(&w) {
                Some(&g) => g,
                None => {
                    let shape = self.src.shape_of(w)?.clone();
                    self.zeros(&shape)
                }
            };
            outputs.push(g);
        }
        self.grad.set_outputs(outputs);

        ShapeInference::run(&mut self.grad, &HashMap::new())?;
        Ok(self.grad)
    }

    /// dL/dL: a scalar one, or ones shaped like a non-scalar loss.
    fn seed(&mut self, loss_id: NodeId) -> AutogradResult<NodeId> {
        let one = self.lit_scalar(1.0);
        if self.src.shape_of(loss_id)?.is_empty() {
            return Ok(one);
        }
        let loss_val = self.external(loss_id)?;
        Ok(self.add_node(NodeType::Broadcast(one, loss_val)))
    }

    fn add_node(&mut self, node_type: NodeType) -> NodeId {
        self.grad.add_node(None, node_type)
    }

    fn lit_scalar(&mut self, v: f32) -> NodeId {
        self.grad.add_node(None, NodeType::Literal(Value::ScalarF32(v)))
    }

    fn zeros(&mut self, shape: &Shape) -> NodeId {
        let arr = ArrayD::zeros(IxDyn(shape));
        self.grad.add_node(None, NodeType::Literal(Value::Tensor(arr)))
    }

    /// Node in the gradient graph that reads the forward value of `src_id`.
    fn external(&mut self, src_id: NodeId) -> AutogradResult<NodeId> {
        if let Some(&existing) = self.externals.get(&src_id) {
            return Ok(existing);
        }
        let shape = self.src.shape_of(src_id)?.clone();
        let name = format!("external_{}_{}", self.src.id, src_id);
        let id = self.grad.add_node(
            Some(name.clone()),
            NodeType::External { name, source_asg_id: self.src.id, source_node_id: src_id },
        );
        self.grad.get_node_mut(id)?.shape = Some(shape);
        self.externals.insert(src_id, id);
        Ok(id)
    }

    /// dL/d(target) += contrib
    fn acc(&mut self, target: NodeId, contrib: NodeId) {
        let next = match self.gmap.get(&target).copied() {
            Some(prev) => self.add_node(NodeType::Add(prev, contrib)),
            None => contrib,
        };
        self.gmap.insert(target, next);
    }

    /// Sums a gradient shaped like forward node `out` down to the shape of its
    /// operand `src`, undoing any broadcast.
    fn reduce_to(&mut self, g: NodeId, out: NodeId, src: NodeId) -> AutogradResult<NodeId> {
        if self.src.shape_of(out)? == self.src.shape_of(src)? {
            return Ok(g);
        }
        let src_val = self.external(src)?;
        Ok(self.add_node(NodeType::ReduceSumTo(g, src_val)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tensor::{GraphContext, Tensor};

    #[test]
    fn only_requested_branches_are_differentiated() {
        let ctx = GraphContext::shared();
        let x = Tensor::new_input(&ctx, "x");
        let a = Tensor::new_parameter(&ctx, "a");
        let b = Tensor::new_parameter(&ctx, "b");
        let loss = (&x.dot(&a).relu().dot(&b)).mean();

        let mut forward = ctx.borrow().main_graph().clone();
        forward.set_output(loss.node_id);
        let shapes = HashMap::from([
            ("x".to_string(), vec![2, 3]),
            ("a".to_string(), vec![3, 4]),
            ("b".to_string(), vec![4, 1]),
        ]);
        ShapeInference::run(&mut forward, &shapes).unwrap();

        let grad = Gradients::new(forward).build(loss.node_id, &[b.node_id]).unwrap();
        assert_eq!(grad.outputs.len(), 1);
        assert_eq!(grad.shape_of(grad.outputs[0]).unwrap(), &vec![4, 1]);
        // No ReLU mask means nothing flowed back past `b`.
        assert!(!grad.nodes.values().any(|n| matches!(n.node_type, NodeType::GreaterThan(_, _))));
    }

    #[test]
    fn unrelated_parameter_gets_zero_gradient() {
        let ctx = GraphContext::shared();
        let x = Tensor::new_input(&ctx, "x");
        let unused = Tensor::new_parameter(&ctx, "unused");
        let loss = x.sum();

        let mut forward = ctx.borrow().main_graph().clone();
        forward.set_output(loss.node_id);
        let shapes = HashMap::from([("x".to_string(), vec![2]), ("unused".to_string(), vec![5, 5])]);
        forward.set_outputs(vec![loss.node_id, unused.node_id]);
        ShapeInference::run(&mut forward, &shapes).unwrap();

        let grad = Gradients::new(forward).build(loss.node_id, &[unused.node_id]).unwrap();
        let out = &grad.nodes[&grad.outputs[0]];
        match &out.node_type {
            NodeType::Literal(Value::Tensor(arr)) => {
                assert_eq!(arr.shape(), &[5, 5]);
                assert!(arr.iter().all(|&v| v == 0.0));
            }
            other => panic!("expected a zero literal, got {:?}", other),
        }
    }
}
