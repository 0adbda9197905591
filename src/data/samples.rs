//! Paired batches of real images and latent noise.

use super::dataset::{Dataset, InMemoryDataset};
use super::mnist::DatasetError;
use super::sampler::RandomSampler;
use crate::asg::{Shape, Value};
use crate::tensor::{GraphContext, Tensor};
use ndarray::{ArrayD, IxDyn};
use ndarray_rand::rand_distr::StandardNormal;
use ndarray_rand::RandomExt;
use rand::rngs::StdRng;
use rand::SeedableRng;
use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;

/// Feed name of the real image batch.
pub const IMAGES: &str = "images";
/// Feed name of the noise batch.
pub const NOISE: &str = "noise";

pub const IMAGE_SHAPE: [usize; 3] = [28, 28, 1];

/// Owns the `images` and `noise` inputs of the graph and produces matching
/// feeds of a fixed batch size.
pub struct Samples {
    pub images: Tensor,
    pub noise: Tensor,
    batch_size: usize,
    noise_size: usize,
    dataset: InMemoryDataset,
    sampler: RandomSampler,
    rng: StdRng,
}

impl Samples {
    pub fn new(
        context: &Rc<RefCell<GraphContext>>,
        dataset: InMemoryDataset,
        batch_size: usize,
        noise_size: usize,
        seed: Option<u64>,
    ) -> Self {
        let (sampler, rng) = match seed {
            Some(seed) => (RandomSampler::with_seed(dataset.len(), seed), StdRng::seed_from_u64(seed ^ 0x5eed)),
            None => (RandomSampler::new(dataset.len()), StdRng::from_entropy()),
        };
        Self {
            images: Tensor::new_input(context, IMAGES),
            noise: Tensor::new_input(context, NOISE),
            batch_size,
            noise_size,
            dataset,
            sampler,
            rng,
        }
    }

    /// Completed passes over the dataset.
    pub fn epoch(&self) -> u64 {
        self.sampler.epoch()
    }

    /// Shapes of both inputs, for compiling programs against them.
    pub fn input_shapes(&self) -> HashMap<String, Shape> {
        let mut image_shape = vec![self.batch_size];
        image_shape.extend(IMAGE_SHAPE);
        HashMap::from([
            (IMAGES.to_string(), image_shape),
            (NOISE.to_string(), vec![self.batch_size, self.noise_size]),
        ])
    }

    /// Draws the next batch of real images and fresh standard-normal noise.
    pub fn sample(&mut self) -> Result<HashMap<String, Value>, DatasetError> {
        let indices = self.sampler.next_batch(self.batch_size);
        if indices.is_empty() {
            return Err(DatasetError::Empty);
        }
        let batch = self.dataset.get_features_batch(&indices);

        let mut image_shape = vec![self.batch_size];
        image_shape.extend(IMAGE_SHAPE);
        let found = batch.shape().to_vec();
        let images = batch
            .into_shape(IxDyn(&image_shape))
            .map_err(|_| DatasetError::Shape { expected: image_shape.clone(), found })?;

        Ok(HashMap::from([
            (IMAGES.to_string(), Value::Tensor(images)),
            (NOISE.to_string(), Value::Tensor(self.sample_noise())),
        ]))
    }

    fn sample_noise(&mut self) -> ArrayD<f32> {
        ArrayD::random_using(IxDyn(&[self.batch_size, self.noise_size]), StandardNormal, &mut self.rng)
    }
}
