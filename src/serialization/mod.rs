//! Persistence of model state.
//!
//! - **SafeTensors** for tensors (weights, optimizer slots)
//! - **JSON** for metadata and optimizer hyper-parameters
//! - **Checkpoint**: a directory combining both

pub mod checkpoint;
pub mod safetensors_io;

pub use checkpoint::{load_checkpoint, save_checkpoint, Checkpoint, CheckpointConfig, CheckpointError, OptimizerState};
pub use safetensors_io::{load_safetensors, save_safetensors, SafeTensorsError};
