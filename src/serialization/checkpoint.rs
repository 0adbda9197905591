//! Checkpoint directories.
//!
//! A checkpoint holds:
//! - the model weights (SafeTensors),
//! - the state of every optimizer (JSON plus SafeTensors for the slots),
//! - training metadata (iteration, step, last losses).

use super::safetensors_io::{load_safetensors, save_safetensors, SafeTensorsError};
use crate::asg::Value;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::ffi::OsString;
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::warn;

const CONFIG_FILE: &str = "config.json";
const WEIGHTS_FILE: &str = "model.safetensors";
const OPTIMIZER_FILE: &str = "optimizer.json";
const OPTIMIZER_SLOTS_FILE: &str = "optimizer.safetensors";

#[derive(Error, Debug)]
pub enum CheckpointError {
    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("SafeTensors error: {0}")]
    SafeTensorsError(#[from] SafeTensorsError),

    #[error("JSON error: {0}")]
    JsonError(#[from] serde_json::Error),

    #[error("checkpoint directory does not exist: {0}")]
    DirectoryNotFound(PathBuf),

    #[error("checkpoint file not found: {0}")]
    FileNotFound(PathBuf),

    #[error("malformed optimizer slot key '{0}'")]
    InvalidSlotKey(String),
}

type Result<T> = std::result::Result<T, CheckpointError>;

/// Training metadata, stored as `config.json`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckpointConfig {
    pub version: String,
    pub model_name: Option<String>,
    /// Completed outer training iterations.
    pub iteration: u64,
    /// Completed optimizer updates over both networks.
    pub global_step: u64,
    pub learning_rate: f32,
    /// Mean critic loss of the last iteration.
    pub last_disc_loss: Option<f32>,
    /// Generator loss of the last iteration.
    pub last_gen_loss: Option<f32>,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

impl Default for CheckpointConfig {
    fn default() -> Self {
        Self {
            version: "1.0".to_string(),
            model_name: None,
            iteration: 0,
            global_step: 0,
            learning_rate: 1e-4,
            last_disc_loss: None,
            last_gen_loss: None,
            metadata: HashMap::new(),
        }
    }
}

impl CheckpointConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_model_name(mut self, name: &str) -> Self {
        self.model_name = Some(name.to_string());
        self
    }

    pub fn with_iteration(mut self, iteration: u64) -> Self {
        self.iteration = iteration;
        self
    }

    pub fn with_global_step(mut self, step: u64) -> Self {
        self.global_step = step;
        self
    }

    pub fn with_learning_rate(mut self, lr: f32) -> Self {
        self.learning_rate = lr;
        self
    }

    pub fn with_losses(mut self, disc: f32, gen: f32) -> Self {
        self.last_disc_loss = Some(disc);
        self.last_gen_loss = Some(gen);
        self
    }

    pub fn with_metadata(mut self, key: &str, value: &str) -> Self {
        self.metadata.insert(key.to_string(), value.to_string());
        self
    }
}

/// Optimizer state. The slots (moment estimates and the like) are not part of
/// the JSON; they go to `optimizer.safetensors`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OptimizerState {
    pub optimizer_type: String,
    /// Hyper-parameters.
    pub params: HashMap<String, f64>,
    /// Updates applied so far.
    pub step: u64,
    /// Slot tensors keyed `<slot>/<parameter>`.
    #[serde(skip)]
    pub slots: HashMap<String, Value>,
}

impl OptimizerState {
    pub fn new(optimizer_type: &str) -> Self {
        Self { optimizer_type: optimizer_type.to_string(), params: HashMap::new(), step: 0, slots: HashMap::new() }
    }
}

/// Full snapshot of a model and its training.
#[derive(Debug, Clone)]
pub struct Checkpoint {
    pub config: CheckpointConfig,
    pub model_weights: HashMap<String, Value>,
    /// Optimizer states by optimizer name.
    pub optimizer_states: BTreeMap<String, OptimizerState>,
}

impl Checkpoint {
    pub fn new(weights: HashMap<String, Value>, config: CheckpointConfig) -> Self {
        Self { config, model_weights: weights, optimizer_states: BTreeMap::new() }
    }

    pub fn with_optimizer_state(mut self, name: &str, state: OptimizerState) -> Self {
        self.optimizer_states.insert(name.to_string(), state);
        self
    }
}

/// Writes a checkpoint directory:
///
/// ```text
/// checkpoint_dir/
/// ├── config.json            # metadata
/// ├── model.safetensors      # weights
/// ├── optimizer.json         # optimizer hyper-parameters and steps (optional)
/// └── optimizer.safetensors  # optimizer slots (optional)
/// ```
///
/// Optimizer slot tensors are stored under `<optimizer>/<slot>/<parameter>`.
///
/// The files are written to a sibling `<dir>.tmp` directory which then
/// replaces `dir`, so an interrupted save leaves the previous checkpoint
/// intact. The previous directory is parked at `<dir>.old` during the swap.
pub fn save_checkpoint<P: AsRef<Path>>(path: P, checkpoint: &Checkpoint) -> Result<()> {
    let dir = path.as_ref();
    let staging = sibling(dir, ".tmp");
    let backup = sibling(dir, ".old");

    if staging.exists() {
        fs::remove_dir_all(&staging)?;
    }
    fs::create_dir_all(&staging)?;
    write_files(&staging, checkpoint)?;

    if dir.exists() {
        if backup.exists() {
            fs::remove_dir_all(&backup)?;
        }
        fs::rename(dir, &backup)?;
    }
    fs::rename(&staging, dir)?;
    if backup.exists() {
        fs::remove_dir_all(&backup)?;
    }
    Ok(())
}

/// `config.json` goes last: a directory with metadata has everything else.
fn write_files(dir: &Path, checkpoint: &Checkpoint) -> Result<()> {
    save_safetensors(dir.join(WEIGHTS_FILE), &checkpoint.model_weights)?;

    if !checkpoint.optimizer_states.is_empty() {
        let mut slots = HashMap::new();
        for (opt_name, state) in &checkpoint.optimizer_states {
            for (key, value) in &state.slots {
                slots.insert(format!("{}/{}", opt_name, key), value.clone());
            }
        }
        save_safetensors(dir.join(OPTIMIZER_SLOTS_FILE), &slots)?;
        fs::write(dir.join(OPTIMIZER_FILE), serde_json::to_string_pretty(&checkpoint.optimizer_states)?)?;
    }

    fs::write(dir.join(CONFIG_FILE), serde_json::to_string_pretty(&checkpoint.config)?)?;
    Ok(())
}

fn sibling(dir: &Path, suffix: &str) -> PathBuf {
    let mut name = dir.file_name().map(OsString::from).unwrap_or_else(|| OsString::from("checkpoint"));
    name.push(suffix);
    dir.with_file_name(name)
}

/// Reads a checkpoint directory written by [`save_checkpoint`].
///
/// If `path` is missing because a save was interrupted mid-swap, the parked
/// `<dir>.old` copy is read instead.
pub fn load_checkpoint<P: AsRef<Path>>(path: P) -> Result<Checkpoint> {
    let mut dir = path.as_ref().to_path_buf();
    if !dir.is_dir() {
        let backup = sibling(&dir, ".old");
        if !backup.is_dir() {
            return Err(CheckpointError::DirectoryNotFound(dir));
        }
        warn!(path = %backup.display(), "reading checkpoint left over from an interrupted save");
        dir = backup;
    }

    let config_path = dir.join(CONFIG_FILE);
    if !config_path.exists() {
        return Err(CheckpointError::FileNotFound(config_path));
    }
    let config: CheckpointConfig = serde_json::from_str(&fs::read_to_string(&config_path)?)?;

    let weights_path = dir.join(WEIGHTS_FILE);
    if !weights_path.exists() {
        return Err(CheckpointError::FileNotFound(weights_path));
    }
    let model_weights = load_safetensors(&weights_path)?;

    let opt_path = dir.join(OPTIMIZER_FILE);
    let mut optimizer_states: BTreeMap<String, OptimizerState> = if opt_path.exists() {
        serde_json::from_str(&fs::read_to_string(&opt_path)?)?
    } else {
        BTreeMap::new()
    };

    let slots_path = dir.join(OPTIMIZER_SLOTS_FILE);
    if !optimizer_states.is_empty() && slots_path.exists() {
        for (key, value) in load_safetensors(&slots_path)? {
            let Some((opt_name, slot_key)) = key.split_once('/') else {
                return Err(CheckpointError::InvalidSlotKey(key.clone()));
            };
            match optimizer_states.get_mut(opt_name) {
                Some(state) => {
                    state.slots.insert(slot_key.to_string(), value);
                }
                None => return Err(CheckpointError::InvalidSlotKey(key.clone())),
            }
        }
    }

    Ok(Checkpoint { config, model_weights, optimizer_states })
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::{ArrayD, IxDyn};

    fn weights() -> HashMap<String, Value> {
        HashMap::from([(
            "discriminator.0.weights".to_string(),
            Value::Tensor(ArrayD::from_shape_vec(IxDyn(&[2, 2]), vec![1.0, 2.0, 3.0, 4.0]).unwrap()),
        )])
    }

    #[test]
    fn config_builder() {
        let config = CheckpointConfig::new()
            .with_model_name("mnist_wgan")
            .with_iteration(10)
            .with_global_step(310)
            .with_losses(-0.25, 0.5)
            .with_metadata("noise_size", "100");

        assert_eq!(config.model_name.as_deref(), Some("mnist_wgan"));
        assert_eq!(config.iteration, 10);
        assert_eq!(config.global_step, 310);
        assert_eq!(config.last_disc_loss, Some(-0.25));
        assert_eq!(config.metadata["noise_size"], "100");
    }

    #[test]
    fn save_and_load_with_optimizer_slots() {
        let dir = tempfile::tempdir().unwrap();
        let mut adam = OptimizerState::new("Adam");
        adam.params.insert("beta1".to_string(), 0.5);
        adam.step = 3;
        adam.slots.insert("m/discriminator.0.weights".to_string(), Value::Tensor(ArrayD::from_elem(IxDyn(&[2, 2]), 0.5)));

        let checkpoint = Checkpoint::new(weights(), CheckpointConfig::new().with_iteration(5))
            .with_optimizer_state("discriminator", adam.clone());
        save_checkpoint(dir.path(), &checkpoint).unwrap();

        let loaded = load_checkpoint(dir.path()).unwrap();
        assert_eq!(loaded.config.iteration, 5);
        assert_eq!(loaded.model_weights, weights());
        assert_eq!(loaded.optimizer_states["discriminator"], adam);
    }

    #[test]
    fn saving_without_optimizers_drops_stale_state() {
        let dir = tempfile::tempdir().unwrap();
        let with_opt = Checkpoint::new(weights(), CheckpointConfig::new())
            .with_optimizer_state("generator", OptimizerState::new("Adam"));
        save_checkpoint(dir.path(), &with_opt).unwrap();
        save_checkpoint(dir.path(), &Checkpoint::new(weights(), CheckpointConfig::new())).unwrap();

        assert!(load_checkpoint(dir.path()).unwrap().optimizer_states.is_empty());
    }

    #[test]
    fn interrupted_save_keeps_previous_checkpoint() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("gan.ckpt");
        save_checkpoint(&path, &Checkpoint::new(weights(), CheckpointConfig::new().with_iteration(1))).unwrap();

        // Killed while writing the next one: a half-written staging directory.
        let staging = dir.path().join("gan.ckpt.tmp");
        fs::create_dir_all(&staging).unwrap();
        let bytes = fs::read(path.join(WEIGHTS_FILE)).unwrap();
        fs::write(staging.join(WEIGHTS_FILE), &bytes[..bytes.len() / 2]).unwrap();
        assert_eq!(load_checkpoint(&path).unwrap().config.iteration, 1);

        // Killed between the two renames.
        fs::rename(&path, dir.path().join("gan.ckpt.old")).unwrap();
        let loaded = load_checkpoint(&path).unwrap();
        assert_eq!(loaded.config.iteration, 1);
        assert_eq!(loaded.model_weights, weights());

        // The next save cleans up both leftovers.
        save_checkpoint(&path, &Checkpoint::new(weights(), CheckpointConfig::new().with_iteration(2))).unwrap();
        assert_eq!(load_checkpoint(&path).unwrap().config.iteration, 2);
        assert!(!staging.exists());
        assert!(!dir.path().join("gan.ckpt.old").exists());
    }

    #[test]
    fn missing_directory_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let err = load_checkpoint(dir.path().join("gan.ckpt")).unwrap_err();
        assert!(matches!(err, CheckpointError::DirectoryNotFound(_)));
    }
}
