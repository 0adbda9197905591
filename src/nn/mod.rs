//! # Neural network layers
//!
//! Each layer is a constructor for a fixed pattern of graph nodes. Layers
//! declare their trainable parameters as named `Parameter` nodes and know
//! how to initialize values for them; the values themselves live in a
//! [`Session`](crate::runtime::session::Session).
//!
//! - [`Linear`]: fully connected, `relu(x · W + b)`
//! - [`Conv2d`]: SAME-padded 3x3 convolution, NHWC
//! - [`Reshape`], [`Resize`]: parameter-free shape changes
//! - [`Layer`]: the closed set of the above
//! - [`Network`]: an ordered sequence of layers

pub mod activations;
pub mod conv;
pub mod init;
pub mod layer;
pub mod linear;
pub mod module;
pub mod network;
pub mod reshape;

pub use activations::Activation;
pub use conv::{Conv2d, Conv2dConfig};
pub use layer::Layer;
pub use linear::Linear;
pub use module::Module;
pub use network::Network;
pub use reshape::{Reshape, Resize};
