//! Shape inference.
//!
//! Walks the graph in topological order and fills in the output shape of
//! every node reachable from the graph outputs, based on the operand shapes
//! and the operation. This is where misconfigured layer chains surface, before
//! anything is executed.

use crate::asg::{Asg, AsgError, Node, NodeId, NodeType, Shape};
use std::collections::{HashMap, HashSet};
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ShapeInferenceError {
    #[error("graph error: {0}")]
    AsgError(#[from] AsgError),

    #[error("incompatible shapes for '{op}': {shape1:?} and {shape2:?}")]
    IncompatibleShapes { op: String, shape1: Shape, shape2: Shape },

    #[error("shape missing for node {0}; the graph may contain a cycle")]
    MissingShapeInfo(NodeId),

    #[error("initial shape not specified for '{0}'")]
    MissingInitialShape(String),

    #[error("invalid rank for node {node_id}: expected {expected}D, got {actual}D")]
    InvalidRank { node_id: NodeId, expected: usize, actual: usize },

    #[error("cannot broadcast {0:?} and {1:?} to a common shape")]
    BroadcastError(Shape, Shape),

    #[error("cannot reshape {from:?} into {to:?}: element counts differ")]
    ReshapeError { from: Shape, to: Shape },
}

type Result<T> = std::result::Result<T, ShapeInferenceError>;

/// Numpy-style broadcast of two shapes, aligned on the trailing axis.
pub fn broadcast_shapes(a: &[usize], b: &[usize]) -> Option<Shape> {
    let rank = a.len().max(b.len());
    let mut out = vec![0; rank];
    for i in 0..rank {
        let da = if i < rank - a.len() { 1 } else { a[i - (rank - a.len())] };
        let db = if i < rank - b.len() { 1 } else { b[i - (rank - b.len())] };
        out[i] = match (da, db) {
            (x, y) if x == y => x,
            (1, y) => y,
            (x, 1) => x,
            _ => return None,
        };
    }
    Some(out)
}

/// Output size of a SAME-padded window along one axis.
pub fn same_output_size(input: usize, stride: usize) -> usize {
    (input + stride - 1) / stride
}

pub struct ShapeInference;

impl ShapeInference {
    /// Fills the `shape` of every node reachable from `asg.outputs` (or of
    /// every node, when the graph has no outputs yet).
    ///
    /// `initial_shapes` must cover every `Input` and `Parameter` node that is
    /// reached, keyed by node name.
    pub fn run(asg: &mut Asg, initial_shapes: &HashMap<String, Shape>) -> Result<()> {
        let sorted_nodes = Self::topological_sort(asg)?;

        for node_id in sorted_nodes {
            let node = asg.get_node(node_id)?;
            let shape = Self::infer_node_shape(asg, node, initial_shapes)?;
            asg.get_node_mut(node_id)?.shape = Some(shape);
        }

        Ok(())
    }

    fn infer_node_shape(asg: &Asg, node: &Node, initial_shapes: &HashMap<String, Shape>) -> Result<Shape> {
        match &node.node_type {
            NodeType::Input { name } | NodeType::Parameter { name } => initial_shapes
                .get(name)
                .cloned()
                .ok_or_else(|| ShapeInferenceError::MissingInitialShape(name.clone())),

            NodeType::External { name, .. } => match &node.shape {
                Some(shape) => Ok(shape.clone()),
                None => initial_shapes
                    .get(name)
                    .cloned()
                    .ok_or_else(|| ShapeInferenceError::MissingInitialShape(name.clone())),
            },

            NodeType::Literal(value) => Ok(value.shape()),

            NodeType::Add(l, r)
            | NodeType::Subtract(l, r)
            | NodeType::Multiply(l, r)
            | NodeType::GreaterThan(l, r) => {
                let ls = Self::get_shape(asg, *l)?;
                let rs = Self::get_shape(asg, *r)?;
                broadcast_shapes(&ls, &rs).ok_or(ShapeInferenceError::BroadcastError(ls, rs))
            }

            NodeType::MatrixMultiply(l, r) => {
                let ls = Self::get_shape(asg, *l)?;
                let rs = Self::get_shape(asg, *r)?;
                if ls.len() != 2 || rs.len() != 2 {
                    return Err(ShapeInferenceError::InvalidRank {
                        node_id: node.id,
                        expected: 2,
                        actual: if ls.len() != 2 { ls.len() } else { rs.len() },
                    });
                }
                if ls[1] != rs[0] {
                    return Err(ShapeInferenceError::IncompatibleShapes {
                        op: "MatrixMultiply".to_string(),
                        shape1: ls,
                        shape2: rs,
                    });
                }
                Ok(vec![ls[0], rs[1]])
            }

            NodeType::Negate(id) | NodeType::ReLU(id) | NodeType::Sigmoid(id) => Self::get_shape(asg, *id),

            NodeType::Sum(_) | NodeType::Mean(_) => Ok(vec![]),

            NodeType::Reshape(id, per_example) => {
                let shape = Self::get_shape(asg, *id)?;
                let Some((&batch, rest)) = shape.split_first() else {
                    return Err(ShapeInferenceError::InvalidRank { node_id: node.id, expected: 1, actual: 0 });
                };
                let mut target = vec![batch];
                target.extend_from_slice(per_example);
                if rest.iter().product::<usize>() != per_example.iter().product::<usize>() {
                    return Err(ShapeInferenceError::ReshapeError { from: shape, to: target });
                }
                Ok(target)
            }

            NodeType::ReshapeLike(id, like) => {
                let shape = Self::get_shape(asg, *id)?;
                let target = Self::get_shape(asg, *like)?;
                if shape.iter().product::<usize>() != target.iter().product::<usize>() {
                    return Err(ShapeInferenceError::ReshapeError { from: shape, to: target });
                }
                Ok(target)
            }

            NodeType::Transpose(id, axis1, axis2) => {
                let mut shape = Self::get_shape(asg, *id)?;
                if *axis1 >= shape.len() || *axis2 >= shape.len() {
                    return Err(ShapeInferenceError::InvalidRank {
                        node_id: node.id,
                        expected: axis1.max(axis2) + 1,
                        actual: shape.len(),
                    });
                }
                shape.swap(*axis1, *axis2);
                Ok(shape)
            }

            NodeType::Broadcast(id, target) => {
                let shape = Self::get_shape(asg, *id)?;
                let target = Self::get_shape(asg, *target)?;
                match broadcast_shapes(&shape, &target) {
                    Some(out) if out == target => Ok(target),
                    _ => Err(ShapeInferenceError::BroadcastError(shape, target)),
                }
            }

            NodeType::ReduceSumTo(_, target) => Self::get_shape(asg, *target),

            NodeType::Conv2d { input, filter, stride } => {
                let is = Self::get_rank4(asg, node.id, *input)?;
                let fs = Self::get_rank4(asg, node.id, *filter)?;
                if is[3] != fs[2] {
                    return Err(ShapeInferenceError::IncompatibleShapes {
                        op: "Conv2d".to_string(),
                        shape1: is,
                        shape2: fs,
                    });
                }
                Ok(vec![
                    is[0],
                    same_output_size(is[1], stride.0),
                    same_output_size(is[2], stride.1),
                    fs[3],
                ])
            }

            NodeType::Conv2dBackpropInput { input, .. } => Self::get_shape(asg, *input),
            NodeType::Conv2dBackpropFilter { filter, .. } => Self::get_shape(asg, *filter),

            NodeType::ResizeBilinear { input, size } => {
                let is = Self::get_rank4(asg, node.id, *input)?;
                Ok(vec![is[0], size.0, size.1, is[3]])
            }

            NodeType::ResizeBilinearGrad { input, .. } => Self::get_shape(asg, *input),
        }
    }

    fn get_shape(asg: &Asg, id: NodeId) -> Result<Shape> {
        asg.get_node(id)?
            .shape
            .clone()
            .ok_or(ShapeInferenceError::MissingShapeInfo(id))
    }

    fn get_rank4(asg: &Asg, node_id: NodeId, operand: NodeId) -> Result<Shape> {
        let shape = Self::get_shape(asg, operand)?;
        if shape.len() != 4 {
            return Err(ShapeInferenceError::InvalidRank { node_id, expected: 4, actual: shape.len() });
        }
        Ok(shape)
    }

    /// Operands-first ordering of the nodes reachable from the outputs.
    pub fn topological_sort(asg: &Asg) -> Result<Vec<NodeId>> {
        if asg.outputs.is_empty() {
            let mut all: Vec<NodeId> = asg.nodes.keys().copied().collect();
            all.sort_unstable();
            Self::sort_from(asg, &all)
        } else {
            Self::sort_from(asg, &asg.outputs)
        }
    }

    /// Operands-first ordering of the nodes reachable from `roots`.
    pub fn sort_from(asg: &Asg, roots: &[NodeId]) -> Result<Vec<NodeId>> {
        let mut sorted = Vec::new();
        let mut visited = HashSet::new();
        for &root in roots {
            Self::build_sorted_graph(root, asg, &mut visited, &mut sorted)?;
        }
        Ok(sorted)
    }

    fn build_sorted_graph(
        node_id: NodeId,
        asg: &Asg,
        visited: &mut HashSet<NodeId>,
        sorted: &mut Vec<NodeId>,
    ) -> Result<()> {
        if !visited.insert(node_id) {
            return Ok(());
        }
        for operand in asg.get_node(node_id)?.node_type.operands() {
            Self::build_sorted_graph(operand, asg, visited, sorted)?;
        }
        sorted.push(node_id);
        Ok(())
    }
}
