//! # Data loading
//!
//! - [`Dataset`]: indexable source of examples, [`InMemoryDataset`] for
//!   data that fits in memory
//! - [`RandomSampler`]: epoch-shuffled indices, reshuffled on exhaustion
//! - [`mnist`]: reader for the MNIST IDX files
//! - [`Samples`]: paired batches of real images and latent noise, fed to the
//!   `images` and `noise` graph inputs

pub mod dataset;
pub mod mnist;
pub mod sampler;
pub mod samples;

pub use dataset::{Dataset, InMemoryDataset};
pub use mnist::{load_training_set, DatasetError};
pub use sampler::RandomSampler;
pub use samples::{Samples, IMAGES, NOISE};
