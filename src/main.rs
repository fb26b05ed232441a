use anyhow::{Context, Result};
use burn::{backend::Autodiff, config::Config};
use clap::{Parser, ValueEnum};
use pix2pix::{
    files::InputHalf,
    training::{TrainingConfig, run_inference, run_training},
};
use std::path::PathBuf;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[cfg(feature = "cuda")]
mod backend {
    pub use burn::backend::{Cuda as Inner, cuda::CudaDevice as Device};
}

#[cfg(not(feature = "cuda"))]
mod backend {
    pub use burn::backend::{NdArray as Inner, ndarray::NdArrayDevice as Device};
}

type Backend = Autodiff<backend::Inner>;

#[derive(Clone, Copy, Debug, ValueEnum)]
enum Mode {
    Training,
    Inference,
}

#[derive(Debug, Parser)]
#[command(version, about)]
struct Args {
    #[arg(value_enum, env = "MODE", ignore_case = true)]
    mode: Mode,
    #[arg(long, default_value = "facades")]
    dataset_root: String,
    /// JSON training config to start from instead of the defaults.
    #[arg(long)]
    config: Option<PathBuf>,
    #[arg(long)]
    epochs: Option<usize>,
    #[arg(long)]
    checkpoint_dir: Option<String>,
    #[arg(long)]
    artifact_dir: Option<String>,
    /// Binary cache of the decoded training split.
    #[arg(long)]
    cache: Option<String>,
    #[arg(long, value_enum)]
    input_half: Option<InputHalf>,
    /// Continue from the latest checkpoint.
    #[arg(long)]
    resume: bool,
    #[arg(long, default_value_t = 5)]
    samples: usize,
}

impl Args {
    fn training_config(&self) -> Result<TrainingConfig> {
        let mut config = match &self.config {
            Some(path) => TrainingConfig::load(path)
                .with_context(|| format!("loading config {}", path.display()))?,
            None => TrainingConfig::with_defaults(),
        };

        config.dataset.root = self.dataset_root.clone();
        if let Some(epochs) = self.epochs {
            config.num_epochs = epochs;
        }
        if let Some(dir) = &self.checkpoint_dir {
            config.checkpoint_dir = dir.clone();
        }
        if let Some(dir) = &self.artifact_dir {
            config.artifact_dir = dir.clone();
        }
        if let Some(cache) = &self.cache {
            config.dataset.cache = Some(cache.clone());
        }
        if let Some(half) = self.input_half {
            config.dataset.input_half = half;
        }
        Ok(config)
    }
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let args = Args::parse();
    let config = args.training_config()?;
    let device = backend::Device::default();

    match args.mode {
        Mode::Training => {
            let report = run_training::<Backend>(config, device, args.resume)
                .context("training failed")?;
            info!(
                "finished at epoch {} after {} steps, {} checkpoint(s) kept",
                report.state.epoch,
                report.state.step,
                report.checkpoints.len()
            );
        }
        Mode::Inference => {
            let written = run_inference::<Backend>(config, device, args.samples)
                .context("inference failed")?;
            for path in written {
                info!("{}", path.display());
            }
        }
    }

    Ok(())
}
