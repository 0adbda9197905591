//! The interface every execution backend implements.

use crate::asg::{Asg, AsgId, NodeId, Value};
use std::collections::HashMap;
use thiserror::Error;

/// Errors raised while evaluating a graph. Shared by all backends.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum RuntimeError {
    #[error("node {0} not found in graph {1}")]
    NodeNotFound(NodeId, AsgId),

    #[error("no value for input '{0}' (node {1})")]
    MissingInput(String, NodeId),

    #[error("no value for parameter '{0}' (node {1})")]
    MissingParameter(String, NodeId),

    #[error("external '{name}' refers to node {node_id} of graph {asg_id}, which has not been evaluated")]
    MissingExternal { name: String, asg_id: AsgId, node_id: NodeId },

    #[error("shape error: {0}")]
    ShapeError(String),
}

/// Values computed so far, keyed by (graph, node).
pub type Memo<T> = HashMap<(AsgId, NodeId), T>;

/// Something that can take an ASG plus data and evaluate it.
pub trait Backend {
    /// Device-side representation of a value.
    type DeviceData: std::fmt::Debug + Clone;

    /// Moves host values to the device.
    fn load_data(&self, data: &HashMap<String, Value>) -> Result<HashMap<String, Self::DeviceData>, RuntimeError>;

    /// Evaluates the outputs of `main_asg`.
    ///
    /// `initial_memo` holds the fed inputs and parameters, and the values of
    /// previously run graphs that `External` nodes refer to. Returns the
    /// outputs in order, together with the memo extended by every node
    /// evaluated here.
    fn run(
        &self,
        main_asg: &Asg,
        initial_memo: Memo<Self::DeviceData>,
    ) -> Result<(Vec<Self::DeviceData>, Memo<Self::DeviceData>), RuntimeError>;

    /// Copies device values back to the host.
    fn retrieve_data(&self, device_data: &[Self::DeviceData]) -> Result<Vec<Value>, RuntimeError>;
}
