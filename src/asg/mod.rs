//! ASG: the abstract semantic graph that every model is lowered to.
//!
//! Symbolic [`Tensor`](crate::tensor::Tensor) handles append [`Node`]s to an
//! [`Asg`]; analysis passes fill in shapes, autograd derives a second graph
//! for gradients, and a backend evaluates either one.

use ndarray::{ArrayD, IxDyn};
use std::collections::HashMap;
use thiserror::Error;

/// Node identifier, unique within one graph.
pub type NodeId = usize;
/// Graph identifier, used to address values across graphs.
pub type AsgId = usize;
/// Tensor shape.
pub type Shape = Vec<usize>;

pub type AsgResult<T> = std::result::Result<T, AsgError>;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum AsgError {
    #[error("node {0} not found")]
    NodeNotFound(NodeId),
    #[error("node {0} has no shape; run shape inference first")]
    InvalidShape(NodeId),
    #[error("unsupported operation: {0}")]
    UnsupportedOperation(String),
}

#[derive(Debug, Clone, PartialEq)]
pub struct Node {
    /// Duplicates the map key so passes can carry nodes around on their own.
    pub id: NodeId,
    pub name: Option<String>,
    pub node_type: NodeType,
    pub shape: Option<Shape>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum NodeType {
    // Data
    Input { name: String },
    Parameter { name: String },
    Literal(Value),
    /// Value of a node living in another graph (the forward pass, for gradients).
    External { name: String, source_asg_id: AsgId, source_node_id: NodeId },

    // Binary, numpy-style broadcasting
    Add(NodeId, NodeId),
    Subtract(NodeId, NodeId),
    Multiply(NodeId, NodeId),
    MatrixMultiply(NodeId, NodeId),
    GreaterThan(NodeId, NodeId),

    // Unary
    Negate(NodeId),
    ReLU(NodeId),
    Sigmoid(NodeId),

    // Reductions over every element, producing a scalar
    Sum(NodeId),
    Mean(NodeId),

    // Transformations
    /// Reshape every example to the given shape; the batch axis is kept.
    Reshape(NodeId, Shape),
    /// Reshape the first operand to the shape of the second.
    ReshapeLike(NodeId, NodeId),
    Transpose(NodeId, usize, usize),
    Broadcast(NodeId, NodeId),
    ReduceSumTo(NodeId, NodeId),

    // Images, NHWC layout with HWIO filters and SAME padding
    Conv2d { input: NodeId, filter: NodeId, stride: (usize, usize) },
    Conv2dBackpropInput { grad_output: NodeId, filter: NodeId, input: NodeId, stride: (usize, usize) },
    Conv2dBackpropFilter { grad_output: NodeId, input: NodeId, filter: NodeId, stride: (usize, usize) },
    ResizeBilinear { input: NodeId, size: (usize, usize) },
    ResizeBilinearGrad { grad_output: NodeId, input: NodeId },
}

impl NodeType {
    /// Operands of this node, in evaluation order.
    pub fn operands(&self) -> Vec<NodeId> {
        match self {
            NodeType::Input { .. }
            | NodeType::Parameter { .. }
            | NodeType::Literal(_)
            | NodeType::External { .. } => vec![],

            NodeType::Add(a, b)
            | NodeType::Subtract(a, b)
            | NodeType::Multiply(a, b)
            | NodeType::MatrixMultiply(a, b)
            | NodeType::GreaterThan(a, b)
            | NodeType::ReshapeLike(a, b)
            | NodeType::Broadcast(a, b)
            | NodeType::ReduceSumTo(a, b) => vec![*a, *b],

            NodeType::Negate(x)
            | NodeType::ReLU(x)
            | NodeType::Sigmoid(x)
            | NodeType::Sum(x)
            | NodeType::Mean(x)
            | NodeType::Reshape(x, _)
            | NodeType::Transpose(x, _, _) => vec![*x],

            NodeType::Conv2d { input, filter, .. } => vec![*input, *filter],
            NodeType::Conv2dBackpropInput { grad_output, filter, input, .. } => {
                vec![*grad_output, *filter, *input]
            }
            NodeType::Conv2dBackpropFilter { grad_output, input, filter, .. } => {
                vec![*grad_output, *input, *filter]
            }
            NodeType::ResizeBilinear { input, .. } => vec![*input],
            NodeType::ResizeBilinearGrad { grad_output, input } => vec![*grad_output, *input],
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Tensor(ArrayD<f32>),
    ScalarF32(f32),
}

impl Value {
    pub fn shape(&self) -> Shape {
        match self {
            Value::Tensor(arr) => arr.shape().to_vec(),
            Value::ScalarF32(_) => vec![],
        }
    }

    pub fn as_tensor(&self) -> Option<&ArrayD<f32>> {
        match self {
            Value::Tensor(arr) => Some(arr),
            Value::ScalarF32(_) => None,
        }
    }

    pub fn as_tensor_mut(&mut self) -> Option<&mut ArrayD<f32>> {
        match self {
            Value::Tensor(arr) => Some(arr),
            Value::ScalarF32(_) => None,
        }
    }

    /// Scalars become 0-d arrays.
    pub fn into_array(self) -> ArrayD<f32> {
        match self {
            Value::Tensor(arr) => arr,
            Value::ScalarF32(v) => ArrayD::from_elem(IxDyn(&[]), v),
        }
    }

    /// The single element of a scalar or one-element tensor.
    pub fn scalar(&self) -> Option<f32> {
        match self {
            Value::ScalarF32(v) => Some(*v),
            Value::Tensor(arr) if arr.len() == 1 => arr.iter().next().copied(),
            Value::Tensor(_) => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Asg {
    pub id: AsgId,
    pub nodes: HashMap<NodeId, Node>,
    pub inputs: Vec<NodeId>,
    pub outputs: Vec<NodeId>,
}

impl Asg {
    pub fn new(id: AsgId) -> Self {
        Self { id, nodes: HashMap::new(), inputs: vec![], outputs: vec![] }
    }

    pub fn add_node(&mut self, name: Option<String>, node_type: NodeType) -> NodeId {
        let new_id = self.nodes.len();
        // Literals know their shape up front.
        let shape = match &node_type {
            NodeType::Literal(value) => Some(value.shape()),
            _ => None,
        };
        let node = Node { id: new_id, name, node_type, shape };
        self.nodes.insert(new_id, node);
        new_id
    }

    pub fn set_outputs(&mut self, outputs: Vec<NodeId>) {
        self.outputs = outputs;
    }

    pub fn set_output(&mut self, output: NodeId) {
        self.set_outputs(vec![output]);
    }

    pub fn get_node(&self, id: NodeId) -> AsgResult<&Node> {
        self.nodes.get(&id).ok_or(AsgError::NodeNotFound(id))
    }

    pub fn get_node_mut(&mut self, id: NodeId) -> AsgResult<&mut Node> {
        self.nodes.get_mut(&id).ok_or(AsgError::NodeNotFound(id))
    }

    pub fn shape_of(&self, id: NodeId) -> AsgResult<&Shape> {
        self.get_node(id)?.shape.as_ref().ok_or(AsgError::InvalidShape(id))
    }

    /// Name of an `Input` or `Parameter` node.
    pub fn feed_name(&self, id: NodeId) -> Option<&str> {
        match &self.nodes.get(&id)?.node_type {
            NodeType::Input { name } | NodeType::Parameter { name } => Some(name),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn literal_nodes_carry_their_shape() {
        let mut asg = Asg::new(0);
        let t = asg.add_node(None, NodeType::Literal(Value::Tensor(ArrayD::zeros(IxDyn(&[2, 3])))));
        let s = asg.add_node(None, NodeType::Literal(Value::ScalarF32(1.0)));
        let x = asg.add_node(Some("x".into()), NodeType::Input { name: "x".into() });

        assert_eq!(asg.shape_of(t).unwrap(), &vec![2, 3]);
        assert_eq!(asg.shape_of(s).unwrap(), &Vec::<usize>::new());
        assert_eq!(asg.shape_of(x), Err(AsgError::InvalidShape(x)));
        assert_eq!(asg.feed_name(x), Some("x"));
    }

    #[test]
    fn value_scalar_access() {
        assert_eq!(Value::ScalarF32(2.5).scalar(), Some(2.5));
        let one = Value::Tensor(ArrayD::from_elem(IxDyn(&[1, 1]), 3.0));
        assert_eq!(one.scalar(), Some(3.0));
        let many = Value::Tensor(ArrayD::zeros(IxDyn(&[2])));
        assert_eq!(many.scalar(), None);
        assert_eq!(Value::ScalarF32(1.0).into_array().ndim(), 0);
    }
}
