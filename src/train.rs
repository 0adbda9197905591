//! Creating a model and training it.
//!
//! Every outer iteration runs `critic_steps` critic updates, each followed by
//! weight clipping, then one generator update, and finally persists the
//! full training state to the checkpoint directory.

use crate::asg::Value;
use crate::config::{ConfigError, TrainConfig};
use crate::data::{DatasetError, InMemoryDataset, Samples};
use crate::gan::{Gan, GanError, DISCRIMINATOR, GENERATOR};
use crate::optimizers::{Adam, Optimizer, OptimizerError};
use crate::render::RenderError;
use crate::runtime::session::{GradientProgram, Session, SessionError};
use crate::serialization::{load_checkpoint, save_checkpoint, Checkpoint, CheckpointConfig, CheckpointError};
use crate::tensor::GraphContext;
use rand::rngs::StdRng;
use rand::SeedableRng;
use std::sync::atomic::{AtomicBool, Ordering};
use thiserror::Error;
use tracing::{debug, info, warn};

pub const MODEL_NAME: &str = "mnist_wgan";

#[derive(Error, Debug)]
pub enum TrainError {
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),
    #[error("dataset error: {0}")]
    Dataset(#[from] DatasetError),
    #[error("checkpoint error: {0}")]
    Checkpoint(#[from] CheckpointError),
    #[error("checkpoint does not match the model: {0}")]
    Model(#[from] GanError),
    #[error("session error: {0}")]
    Session(#[from] SessionError),
    #[error("optimizer error: {0}")]
    Optimizer(#[from] OptimizerError),
    #[error("render error: {0}")]
    Render(#[from] RenderError),
    #[error("loss evaluated to a non-scalar of shape {0:?}")]
    NonScalarLoss(Vec<usize>),
}

pub type TrainResult<T> = Result<T, TrainError>;

/// Losses of one outer iteration.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct IterationStats {
    /// Iterations completed, including this one.
    pub iteration: u64,
    /// Mean critic objective over the iteration's critic steps.
    pub disc_loss: f32,
    /// Generator objective before its update.
    pub gen_loss: f32,
}

pub(crate) fn rng_from(seed: Option<u64>) -> StdRng {
    match seed {
        Some(seed) => StdRng::seed_from_u64(seed),
        None => StdRng::from_entropy(),
    }
}

fn scalar(loss: &Value) -> TrainResult<f32> {
    loss.scalar().ok_or_else(|| TrainError::NonScalarLoss(loss.shape()))
}

fn checkpoint_config(config: &TrainConfig) -> CheckpointConfig {
    CheckpointConfig::new()
        .with_model_name(MODEL_NAME)
        .with_learning_rate(config.discriminator_learning_rate)
        .with_metadata("discriminator_learning_rate", &config.discriminator_learning_rate.to_string())
        .with_metadata("generator_learning_rate", &config.generator_learning_rate.to_string())
        .with_metadata("noise_size", &config.noise_size.to_string())
        .with_metadata("batch_size", &config.batch_size.to_string())
}

/// Initializes fresh parameters for both networks and writes them to
/// `config.checkpoint`, replacing any previous training state.
pub fn create(config: &TrainConfig) -> TrainResult<()> {
    config.validate()?;
    let context = GraphContext::shared();
    let gan = Gan::new(&context, config.noise_size);
    let parameters = gan.init_parameters(&mut rng_from(config.seed));
    let count = parameters.len();

    save_checkpoint(&config.checkpoint, &Checkpoint::new(parameters, checkpoint_config(config)))?;
    info!(path = %config.checkpoint.display(), parameters = count, "created model");
    Ok(())
}

/// Alternating WGAN optimization over a loaded checkpoint.
pub struct Trainer {
    config: TrainConfig,
    gan: Gan,
    samples: Samples,
    session: Session,
    discriminator_program: GradientProgram,
    generator_program: GradientProgram,
    discriminator_optimizer: Adam,
    generator_optimizer: Adam,
    iteration: u64,
    global_step: u64,
}

impl Trainer {
    /// Restores the model, and the optimizers when the checkpoint carries
    /// their state, from `config.checkpoint`.
    pub fn new(config: TrainConfig, dataset: InMemoryDataset) -> TrainResult<Self> {
        config.validate()?;
        let checkpoint = load_checkpoint(&config.checkpoint)?;

        let context = GraphContext::shared();
        let gan = Gan::new(&context, config.noise_size);
        gan.validate_parameters(&checkpoint.model_weights)?;

        let samples = Samples::new(&context, dataset, config.batch_size, config.noise_size, config.seed);
        let disc_objective = gan.discriminator_objective(&samples.noise, &samples.images);
        let gen_objective = gan.generator_objective(&samples.noise);

        let mut session = Session::cpu();
        session.set_parameters(checkpoint.model_weights);
        let shapes = samples.input_shapes();
        let discriminator_program =
            session.compile_gradients(&context, &disc_objective, &gan.discriminator_vars(), &shapes)?;
        let generator_program = session.compile_gradients(&context, &gen_objective, &gan.generator_vars(), &shapes)?;

        let mut discriminator_optimizer = Adam::new(config.discriminator_learning_rate);
        let mut generator_optimizer = Adam::new(config.generator_learning_rate);
        for (name, optimizer) in [(DISCRIMINATOR, &mut discriminator_optimizer), (GENERATOR, &mut generator_optimizer)] {
            match checkpoint.optimizer_states.get(name) {
                Some(state) => {
                    optimizer.load_state(state)?;
                    debug!(optimizer = name, step = state.step, "restored optimizer state");
                    if let Some(&saved) = state.params.get("lr") {
                        if saved as f32 != optimizer.learning_rate() {
                            info!(
                                optimizer = name,
                                saved,
                                configured = optimizer.learning_rate(),
                                "using configured learning rate"
                            );
                        }
                    }
                }
                None => debug!(optimizer = name, "starting with a fresh optimizer"),
            }
        }

        info!(
            iteration = checkpoint.config.iteration,
            global_step = checkpoint.config.global_step,
            "loaded checkpoint from {}",
            config.checkpoint.display()
        );
        Ok(Self {
            iteration: checkpoint.config.iteration,
            global_step: checkpoint.config.global_step,
            config,
            gan,
            samples,
            session,
            discriminator_program,
            generator_program,
            discriminator_optimizer,
            generator_optimizer,
        })
    }

    /// Completed outer iterations, counting those of earlier runs.
    pub fn iteration(&self) -> u64 {
        self.iteration
    }

    pub fn global_step(&self) -> u64 {
        self.global_step
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    pub fn gan(&self) -> &Gan {
        &self.gan
    }

    /// Trains until `stop` is raised or `config.max_iterations` iterations
    /// have run, checkpointing after every iteration. The flag is polled
    /// between iterations only, so the checkpoint is always consistent.
    pub fn run(&mut self, stop: &AtomicBool) -> TrainResult<Option<IterationStats>> {
        let mut last = None;
        let mut completed = 0u64;
        loop {
            if stop.load(Ordering::Relaxed) {
                info!(iteration = self.iteration, "stop requested");
                break;
            }
            if self.config.max_iterations.is_some_and(|max| completed >= max) {
                break;
            }

            let stats = self.train_iteration()?;
            self.save(&stats)?;
            if !(stats.disc_loss.is_finite() && stats.gen_loss.is_finite()) {
                warn!(iteration = stats.iteration, "loss is not finite");
            }
            info!(iteration = stats.iteration, "disc={:.6} gen={:.6}", stats.disc_loss, stats.gen_loss);

            completed += 1;
            last = Some(stats);
        }
        Ok(last)
    }

    /// One outer iteration, without persisting it.
    pub fn train_iteration(&mut self) -> TrainResult<IterationStats> {
        let mut disc_total = 0.0;
        for step in 0..self.config.critic_steps {
            let feed = self.samples.sample()?;
            let (loss, grads) = self.session.run_with_gradients(&self.discriminator_program, &feed)?;
            self.discriminator_optimizer.step(self.session.parameters_mut(), &grads)?;
            self.gan.clip_discriminator(self.session.parameters_mut(), self.config.clip_magnitude)?;
            self.global_step += 1;

            let loss = scalar(&loss)?;
            debug!(step, loss, "critic update");
            disc_total += loss;
        }

        let feed = self.samples.sample()?;
        let (loss, grads) = self.session.run_with_gradients(&self.generator_program, &feed)?;
        self.generator_optimizer.step(self.session.parameters_mut(), &grads)?;
        self.global_step += 1;
        let gen_loss = scalar(&loss)?;
        debug!(loss = gen_loss, "generator update");

        self.iteration += 1;
        Ok(IterationStats {
            iteration: self.iteration,
            disc_loss: disc_total / self.config.critic_steps as f32,
            gen_loss,
        })
    }

    /// Writes the parameters, both optimizer states and the counters.
    pub fn save(&self, stats: &IterationStats) -> TrainResult<()> {
        let metadata = checkpoint_config(&self.config)
            .with_iteration(self.iteration)
            .with_global_step(self.global_step)
            .with_losses(stats.disc_loss, stats.gen_loss);
        let checkpoint = Checkpoint::new(self.session.parameters().clone(), metadata)
            .with_optimizer_state(DISCRIMINATOR, self.discriminator_optimizer.state())
            .with_optimizer_state(GENERATOR, self.generator_optimizer.state());
        save_checkpoint(&self.config.checkpoint, &checkpoint)?;
        debug!(path = %self.config.checkpoint.display(), "saved checkpoint");
        Ok(())
    }
}
