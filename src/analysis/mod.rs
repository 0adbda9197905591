//! # Graph Analysis
//!
//! Passes that process the ASG before execution.
//!
//! - [`ShapeInference`](shape_inference::ShapeInference): propagates tensor
//!   shapes through the graph, so that mismatched layers are reported when a
//!   program is compiled rather than in the middle of a training step.
//!
//! ```text
//! ASG (untyped) -> Shape Inference -> ASG (with shapes)
//! ```
//!
//! Autograd relies on these shapes: gradient nodes are created with the shape
//! of the forward node they flow into.

pub mod shape_inference;
