//! Sampling digits from a trained checkpoint.

use crate::asg::Value;
use crate::config::TrainConfig;
use crate::data::NOISE;
use crate::gan::Gan;
use crate::render;
use crate::runtime::session::{Session, SessionError};
use crate::serialization::load_checkpoint;
use crate::tensor::{GraphContext, Tensor};
use crate::train::{rng_from, TrainResult};
use ndarray::{ArrayD, IxDyn};
use ndarray_rand::rand_distr::StandardNormal;
use ndarray_rand::RandomExt;
use std::collections::HashMap;
use std::path::Path;
use tracing::info;

/// Runs the generator of the checkpoint at `config.checkpoint` on
/// `config.sample_count` standard-normal noise vectors. Returns
/// `[sample_count, 28, 28, 1]` images in `[0, 1]`. The checkpoint is not
/// modified.
pub fn generate(config: &TrainConfig) -> TrainResult<ArrayD<f32>> {
    config.validate()?;
    let checkpoint = load_checkpoint(&config.checkpoint)?;

    let context = GraphContext::shared();
    let gan = Gan::new(&context, config.noise_size);
    gan.validate_parameters(&checkpoint.model_weights)?;
    let noise = Tensor::new_input(&context, NOISE);
    let images = gan.generate(&noise);

    let mut session = Session::cpu();
    session.set_parameters(checkpoint.model_weights);
    let noise_shape = vec![config.sample_count, config.noise_size];
    let shapes = HashMap::from([(NOISE.to_string(), noise_shape.clone())]);
    let program = session.compile(&context, &[&images], &shapes)?;

    let z: ArrayD<f32> = ArrayD::random_using(IxDyn(&noise_shape), StandardNormal, &mut rng_from(config.seed));
    let feed = HashMap::from([(NOISE.to_string(), Value::Tensor(z))]);
    let output = session.run(&program, &feed)?.into_iter().next().ok_or(SessionError::MissingOutput)?;
    Ok(output.into_array())
}

/// [`generate`], then writes the images stacked top to bottom as a PNG.
pub fn generate_to_file<P: AsRef<Path>>(config: &TrainConfig, output: P) -> TrainResult<()> {
    let images = generate(config)?;
    let tiled = render::tile_vertically(&images)?;
    render::save_png(&tiled, output.as_ref())?;
    info!(samples = config.sample_count, path = %output.as_ref().display(), "wrote samples");
    Ok(())
}
