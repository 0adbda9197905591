//! # mnist-wgan: a Wasserstein GAN for handwritten digits
//!
//! The model is built on a small graph engine: operations on symbolic
//! [`Tensor`](tensor::Tensor) handles are recorded into an **Abstract
//! Semantic Graph (ASG)**, shape-checked, differentiated into a separate
//! gradient graph, and executed by a CPU backend inside an explicit
//! [`Session`](runtime::session::Session).
//!
//! ## Usage Example
//!
//! ```no_run
//! use std::collections::HashMap;
//! use mnist_wgan::gan::Gan;
//! use mnist_wgan::runtime::session::Session;
//! use mnist_wgan::tensor::{GraphContext, Tensor};
//!
//! // 1. Declare the networks in a graph context
//! let context = GraphContext::shared();
//! let gan = Gan::new(&context, 100);
//!
//! // 2. Build the symbolic objective
//! let noise = Tensor::new_input(&context, "noise");
//! let loss = gan.generator_objective(&noise);
//!
//! // 3. Compile its gradients against concrete parameter values
//! let mut session = Session::cpu();
//! session.set_parameters(gan.init_parameters(&mut rand::thread_rng()));
//! let shapes = HashMap::from([("noise".to_string(), vec![16, 100])]);
//! let program = session
//!     .compile_gradients(&context, &loss, &gan.generator_vars(), &shapes)
//!     .unwrap();
//! ```

pub mod analysis;
pub mod asg;
pub mod autograd;
pub mod config;
pub mod data;
pub mod gan;
pub mod generate;
pub mod nn;
pub mod optimizers;
pub mod render;
pub mod runtime;
pub mod serialization;
pub mod tensor;
pub mod train;
