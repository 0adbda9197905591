//! `Tensor` and `GraphContext`.
//!
//! A `Tensor` holds no data. It is a lightweight handle to a node of the
//! abstract semantic graph, and every operation on it appends a new node to
//! the graph instead of computing anything. `GraphContext` owns the graph
//! being built.

use crate::asg::{Asg, NodeId, NodeType, Value};
use ndarray::ArrayD;
use std::cell::RefCell;
use std::ops::{Add, Mul, Neg, Sub};
use std::rc::Rc;

/// Owns the main graph that symbolic tensors are recorded into.
///
/// Shared between tensor handles through `Rc<RefCell<_>>`; create one per
/// model and pass it explicitly, there is no process-wide graph.
#[derive(Debug, Clone)]
pub struct GraphContext {
    main_graph: Asg,
}

impl GraphContext {
    pub fn new() -> Self {
        Self { main_graph: Asg::new(0) }
    }

    /// Convenience for the usual shared form.
    pub fn shared() -> Rc<RefCell<Self>> {
        Rc::new(RefCell::new(Self::new()))
    }

    pub fn main_graph_mut(&mut self) -> &mut Asg {
        &mut self.main_graph
    }

    pub fn main_graph(&self) -> &Asg {
        &self.main_graph
    }
}

impl Default for GraphContext {
    fn default() -> Self {
        Self::new()
    }
}

/// Symbolic handle to a node in the graph.
#[derive(Debug, Clone)]
pub struct Tensor {
    pub node_id: NodeId,
    pub context: Rc<RefCell<GraphContext>>,
}

impl Tensor {
    /// Creates an input node, to be fed with real data at execution time.
    pub fn new_input(context: &Rc<RefCell<GraphContext>>, name: &str) -> Self {
        let mut ctx = context.borrow_mut();
        let graph = ctx.main_graph_mut();
        let node_id = graph.add_node(Some(name.to_string()), NodeType::Input { name: name.to_string() });
        graph.inputs.push(node_id);
        Self { node_id, context: Rc::clone(context) }
    }

    /// Creates a trainable parameter node. Its value lives in the session's
    /// parameter map under `name`.
    pub fn new_parameter(context: &Rc<RefCell<GraphContext>>, name: &str) -> Self {
        let node_id = context
            .borrow_mut()
            .main_graph_mut()
            .add_node(Some(name.to_string()), NodeType::Parameter { name: name.to_string() });
        Self { node_id, context: Rc::clone(context) }
    }

    /// Embeds constant data into the graph.
    pub fn new_literal(context: &Rc<RefCell<GraphContext>>, data: ArrayD<f32>, name: &str) -> Self {
        let node_id = context
            .borrow_mut()
            .main_graph_mut()
            .add_node(Some(name.to_string()), NodeType::Literal(Value::Tensor(data)));
        Self { node_id, context: Rc::clone(context) }
    }

    /// Name of the node, if it has one.
    pub fn name(&self) -> Option<String> {
        let ctx = self.context.borrow();
        ctx.main_graph().nodes.get(&self.node_id).and_then(|n| n.name.clone())
    }

    fn push(&self, node_type: NodeType) -> Self {
        let node_id = self.context.borrow_mut().main_graph_mut().add_node(None, node_type);
        Self { node_id, context: Rc::clone(&self.context) }
    }

    pub fn dot(&self, other: &Tensor) -> Self {
        self.push(NodeType::MatrixMultiply(self.node_id, other.node_id))
    }

    pub fn relu(&self) -> Self {
        self.push(NodeType::ReLU(self.node_id))
    }

    pub fn sigmoid(&self) -> Self {
        self.push(NodeType::Sigmoid(self.node_id))
    }

    pub fn sum(&self) -> Self {
        self.push(NodeType::Sum(self.node_id))
    }

    /// Mean over every element.
    pub fn mean(&self) -> Self {
        self.push(NodeType::Mean(self.node_id))
    }

    /// Reshapes each example of the batch, leaving the batch axis alone.
    pub fn reshape(&self, shape: &[usize]) -> Self {
        self.push(NodeType::Reshape(self.node_id, shape.to_vec()))
    }

    /// SAME-padded 2D convolution of an NHWC batch with an HWIO filter.
    pub fn conv2d(&self, filter: &Tensor, stride: (usize, usize)) -> Self {
        self.push(NodeType::Conv2d { input: self.node_id, filter: filter.node_id, stride })
    }

    /// Bilinear resize of an NHWC batch to `(height, width)`.
    pub fn resize_bilinear(&self, size: (usize, usize)) -> Self {
        self.push(NodeType::ResizeBilinear { input: self.node_id, size })
    }
}

impl Add<&Tensor> for &Tensor {
    type Output = Tensor;
    fn add(self, rhs: &Tensor) -> Self::Output {
        self.push(NodeType::Add(self.node_id, rhs.node_id))
    }
}

impl Sub<&Tensor> for &Tensor {
    type Output = Tensor;
    fn sub(self, rhs: &Tensor) -> Self::Output {
        self.push(NodeType::Subtract(self.node_id, rhs.node_id))
    }
}

impl Mul<&Tensor> for &Tensor {
    type Output = Tensor;
    fn mul(self, rhs: &Tensor) -> Self::Output {
        self.push(NodeType::Multiply(self.node_id, rhs.node_id))
    }
}

impl Neg for &Tensor {
    type Output = Tensor;
    fn neg(self) -> Self::Output {
        self.push(NodeType::Negate(self.node_id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn operations_append_nodes() {
        let ctx = GraphContext::shared();
        let x = Tensor::new_input(&ctx, "x");
        let w = Tensor::new_parameter(&ctx, "w");
        let y = -&(&x.dot(&w) - &x).relu().mean();

        let graph = ctx.borrow().main_graph().clone();
        assert_eq!(graph.inputs, vec![x.node_id]);
        assert_eq!(graph.nodes.len(), 7);
        assert!(matches!(graph.nodes[&y.node_id].node_type, NodeType::Negate(_)));
        assert_eq!(w.name().as_deref(), Some("w"));
    }
}
