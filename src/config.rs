//! Training configuration.

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("cannot read config {path}: {source}")]
    Io { path: PathBuf, source: std::io::Error },
    #[error("invalid config: {0}")]
    Json(#[from] serde_json::Error),
    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Every knob of the `create`, `train` and `generate` commands.
///
/// Fields left out of a JSON config keep their default.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrainConfig {
    pub batch_size: usize,
    /// Length of the latent vector fed to the generator.
    pub noise_size: usize,
    /// Critic updates per generator update.
    pub critic_steps: usize,
    pub generator_learning_rate: f32,
    pub discriminator_learning_rate: f32,
    /// Critic weights are clamped to `[-clip, clip]` after every update.
    pub clip_magnitude: f32,
    pub checkpoint: PathBuf,
    pub data_dir: PathBuf,
    /// Images drawn by `generate`.
    pub sample_count: usize,
    pub seed: Option<u64>,
    /// Stop after this many iterations; `None` trains until interrupted.
    pub max_iterations: Option<u64>,
}

impl Default for TrainConfig {
    fn default() -> Self {
        Self {
            batch_size: 128,
            noise_size: 100,
            critic_steps: 30,
            generator_learning_rate: 1e-4,
            discriminator_learning_rate: 1e-4,
            clip_magnitude: 0.01,
            checkpoint: PathBuf::from("gan.ckpt"),
            data_dir: PathBuf::from("MNIST_data"),
            sample_count: 4,
            seed: None,
            max_iterations: None,
        }
    }
}

impl TrainConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_json_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = fs::read_to_string(path).map_err(|source| ConfigError::Io { path: path.to_path_buf(), source })?;
        let config: Self = serde_json::from_str(&text)?;
        config.validate()?;
        Ok(config)
    }

    /// Rejects sizes the model cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let positive = [
            ("batch_size", self.batch_size),
            ("noise_size", self.noise_size),
            ("critic_steps", self.critic_steps),
            ("sample_count", self.sample_count),
        ];
        for (field, value) in positive {
            if value == 0 {
                return Err(ConfigError::Invalid(format!("{} must be positive", field)));
            }
        }
        if self.clip_magnitude.is_nan() || self.clip_magnitude <= 0.0 {
            return Err(ConfigError::Invalid("clip_magnitude must be positive".to_string()));
        }
        Ok(())
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    pub fn with_noise_size(mut self, noise_size: usize) -> Self {
        self.noise_size = noise_size;
        self
    }

    pub fn with_critic_steps(mut self, steps: usize) -> Self {
        self.critic_steps = steps;
        self
    }

    /// Same rate for both optimizers.
    pub fn with_learning_rate(mut self, lr: f32) -> Self {
        self.generator_learning_rate = lr;
        self.discriminator_learning_rate = lr;
        self
    }

    pub fn with_clip_magnitude(mut self, magnitude: f32) -> Self {
        self.clip_magnitude = magnitude;
        self
    }

    pub fn with_checkpoint<P: Into<PathBuf>>(mut self, path: P) -> Self {
        self.checkpoint = path.into();
        self
    }

    pub fn with_data_dir<P: Into<PathBuf>>(mut self, dir: P) -> Self {
        self.data_dir = dir.into();
        self
    }

    pub fn with_sample_count(mut self, count: usize) -> Self {
        self.sample_count = count;
        self
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }

    pub fn with_max_iterations(mut self, iterations: u64) -> Self {
        self.max_iterations = Some(iterations);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_the_reference_training_setup() {
        let config = TrainConfig::default();
        assert_eq!(config.batch_size, 128);
        assert_eq!(config.noise_size, 100);
        assert_eq!(config.critic_steps, 30);
        assert_eq!(config.clip_magnitude, 0.01);
        assert_eq!(config.checkpoint, PathBuf::from("gan.ckpt"));
        assert!(config.max_iterations.is_none());
    }

    #[test]
    fn partial_json_keeps_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("train.json");
        fs::write(&path, r#"{ "batch_size": 16, "seed": 7 }"#).unwrap();

        let config = TrainConfig::from_json_file(&path).unwrap();
        assert_eq!(config, TrainConfig::new().with_batch_size(16).with_seed(7));
    }

    #[test]
    fn zero_sizes_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("train.json");
        fs::write(&path, r#"{ "critic_steps": 0 }"#).unwrap();
        assert!(matches!(TrainConfig::from_json_file(&path), Err(ConfigError::Invalid(_))));
    }
}
