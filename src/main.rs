//! `mnist_gan`: create, train and sample a Wasserstein GAN on MNIST.

use clap::{Parser, Subcommand};
use mnist_wgan::config::TrainConfig;
use mnist_wgan::data::load_training_set;
use mnist_wgan::generate::generate_to_file;
use mnist_wgan::train::{create, Trainer};
use std::path::PathBuf;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use tracing::Level;
use tracing_subscriber::FmtSubscriber;

const USAGE: &str = "Usage: mnist_gan <create | train | generate>";

#[derive(Parser, Debug)]
#[command(name = "mnist_gan", author, version, about = "Wasserstein GAN for MNIST digits", long_about = None)]
struct Cli {
    /// Checkpoint directory
    #[arg(long, global = true)]
    checkpoint: Option<PathBuf>,

    /// JSON file overriding the training configuration
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Initialize a fresh model and write it to the checkpoint
    Create,

    /// Train the model in the checkpoint, saving after every iteration
    Train {
        /// Stop after this many iterations
        #[arg(short, long)]
        iterations: Option<u64>,

        /// Directory holding the MNIST IDX files
        #[arg(long)]
        data_dir: Option<PathBuf>,
    },

    /// Render samples of the model in the checkpoint to a PNG
    Generate {
        /// Output image
        #[arg(short, long, default_value = "samples.png")]
        output: PathBuf,
    },
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(err) if matches!(err.kind(), clap::error::ErrorKind::DisplayHelp | clap::error::ErrorKind::DisplayVersion) => {
            err.print()?;
            return Ok(());
        }
        Err(_) => {
            println!("{}", USAGE);
            return Ok(());
        }
    };

    let log_level = if cli.verbose { Level::DEBUG } else { Level::INFO };
    let subscriber = FmtSubscriber::builder().with_max_level(log_level).finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let mut config = match &cli.config {
        Some(path) => TrainConfig::from_json_file(path)?,
        None => TrainConfig::default(),
    };
    if let Some(checkpoint) = cli.checkpoint {
        config = config.with_checkpoint(checkpoint);
    }

    match cli.command {
        Command::Create => create(&config)?,
        Command::Train { iterations, data_dir } => {
            if let Some(iterations) = iterations {
                config = config.with_max_iterations(iterations);
            }
            if let Some(dir) = data_dir {
                config = config.with_data_dir(dir);
            }
            let dataset = load_training_set(&config.data_dir)?;
            let stop = Arc::new(AtomicBool::new(false));
            let mut trainer = Trainer::new(config, dataset)?;
            trainer.run(&stop)?;
        }
        Command::Generate { output } => generate_to_file(&config, &output)?,
    }
    Ok(())
}
