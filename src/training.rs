use crate::augment::denormalize;
use crate::checkpoint::{
    CheckpointManager, DISCRIMINATOR, DISCRIMINATOR_OPTIMIZER, GENERATOR, GENERATOR_OPTIMIZER,
    TrainingState, load_module, load_optimizer, read_state,
};
use crate::consts::{
    ADAM_EPSILON, ARTIFACT_DIR, BETA_1, CHECKPOINT_DIR, CHECKPOINT_EVERY, CHECKPOINT_PREFIX,
    CHANNELS, EPOCHS, LAMBDA, LEARNING_RATE, SAMPLES_DIR,
};
use crate::dataset::{DatasetConfig, PairBatch, PairLoader, build_datasets, build_eval_loader};
use crate::error::{Pix2PixError, Pix2PixResult};
use crate::loss::{RealLossSource, discriminator_loss, generator_loss};
use crate::network::{Discriminator, Generator, NetworkConfig};
use burn::{
    config::Config,
    optim::{AdamConfig, GradientsParams, Optimizer},
    prelude::*,
    tensor::backend::AutodiffBackend,
};
use image::{Rgb, RgbImage};
use std::{
    fs::create_dir_all,
    path::{Path, PathBuf},
    time::Instant,
};
use tracing::{debug, info};

#[derive(Debug, Config)]
pub struct TrainingConfig {
    pub model: NetworkConfig,
    pub optimizer: AdamConfig,
    pub dataset: DatasetConfig,
    #[config(default = "EPOCHS")]
    pub num_epochs: usize,
    #[config(default = 5)]
    pub seed: u64,
    #[config(default = "LEARNING_RATE")]
    pub lr: f64,
    #[config(default = "LAMBDA")]
    pub lambda: f32,
    #[config(default = "CHECKPOINT_EVERY")]
    pub checkpoint_every: usize,
    #[config(default = "CHECKPOINT_DIR.to_string()")]
    pub checkpoint_dir: String,
    pub max_to_keep: Option<usize>,
    #[config(default = "ARTIFACT_DIR.to_string()")]
    pub artifact_dir: String,
    #[config(default = "RealLossSource::RealPair")]
    pub real_loss_source: RealLossSource,
    #[config(default = true)]
    pub preview: bool,
}

pub fn default_optimizer() -> AdamConfig {
    AdamConfig::new()
        .with_beta_1(BETA_1)
        .with_epsilon(ADAM_EPSILON)
}

impl TrainingConfig {
    pub fn with_defaults() -> Self {
        Self::new(NetworkConfig::new(), default_optimizer(), DatasetConfig::new())
    }

    pub fn validate(&self) -> Pix2PixResult<()> {
        self.model.validate()?;
        self.dataset.validate()?;

        if self.checkpoint_every == 0 {
            return Err(Pix2PixError::InvalidConfig(
                "checkpoint_every must be positive".into(),
            ));
        }

        if self.model.input_channels != CHANNELS || self.model.output_channels != CHANNELS {
            return Err(Pix2PixError::InvalidConfig(format!(
                "image pairs are RGB; input_channels and output_channels must be {CHANNELS}"
            )));
        }

        let divisor = 1 << self.model.generator_channels.len();
        if self.dataset.image_size % divisor != 0 {
            return Err(Pix2PixError::InvalidConfig(format!(
                "image_size {} is not divisible by {divisor}",
                self.dataset.image_size
            )));
        }
        Ok(())
    }

    fn samples_dir(&self) -> PathBuf {
        Path::new(&self.artifact_dir).join(SAMPLES_DIR)
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct StepLosses {
    pub generator: f32,
    pub adversarial: f32,
    pub l1: f32,
    pub discriminator: f32,
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct EpochSummary {
    pub epoch: usize,
    pub seconds: f32,
    pub batches: usize,
    pub mean: StepLosses,
}

#[derive(Debug)]
pub struct TrainingReport {
    pub epochs: Vec<EpochSummary>,
    pub checkpoints: Vec<PathBuf>,
    pub state: TrainingState,
}

/// Generator, discriminator, their optimizers and the checkpoint manager of
/// one training run.
pub struct TrainingSession<B, OG, OD>
where
    B: AutodiffBackend,
    OG: Optimizer<Generator<B>, B>,
    OD: Optimizer<Discriminator<B>, B>,
{
    pub generator: Generator<B>,
    pub discriminator: Discriminator<B>,
    optim_g: OG,
    optim_d: OD,
    checkpoints: CheckpointManager,
    config: TrainingConfig,
    state: TrainingState,
    device: B::Device,
}

pub fn init_session<B: AutodiffBackend>(
    config: TrainingConfig,
    device: B::Device,
) -> Pix2PixResult<
    TrainingSession<B, impl Optimizer<Generator<B>, B>, impl Optimizer<Discriminator<B>, B>>,
> {
    config.validate()?;

    let (generator, discriminator) = config.model.init::<B>(&device);
    let optim_g = config.optimizer.init::<B, Generator<B>>();
    let optim_d = config.optimizer.init::<B, Discriminator<B>>();
    let checkpoints =
        CheckpointManager::new(&config.checkpoint_dir, CHECKPOINT_PREFIX, config.max_to_keep)?;

    Ok(TrainingSession {
        generator,
        discriminator,
        optim_g,
        optim_d,
        checkpoints,
        config,
        state: TrainingState::default(),
        device,
    })
}

impl<B, OG, OD> TrainingSession<B, OG, OD>
where
    B: AutodiffBackend,
    OG: Optimizer<Generator<B>, B>,
    OD: Optimizer<Discriminator<B>, B>,
{
    pub fn state(&self) -> TrainingState {
        self.state
    }

    pub fn checkpoints(&self) -> &CheckpointManager {
        &self.checkpoints
    }

    /// One update of both networks, both computed from the networks as they
    /// were before the step.
    pub fn train_step(&mut self, batch: PairBatch<B>) -> StepLosses {
        let PairBatch { input, target } = batch;

        let generated = self.generator.forward(input.clone());

        // The discriminator branch sees a detached copy so its graph does not
        // reach into the generator.
        let disc_real = self.discriminator.forward(input.clone(), target.clone());
        let disc_fake = self
            .discriminator
            .forward(input.clone(), generated.clone().detach());
        let loss_d = discriminator_loss(disc_real, disc_fake, self.config.real_loss_source);
        let discriminator: f32 = loss_d.clone().into_scalar().elem();
        let grads_d = GradientsParams::from_grads(loss_d.backward(), &self.discriminator);

        let disc_generated = self.discriminator.forward(input, generated.clone());
        let loss_g = generator_loss(disc_generated, generated, target, self.config.lambda);
        let losses = StepLosses {
            generator: loss_g.total.clone().into_scalar().elem(),
            adversarial: loss_g.adversarial.into_scalar().elem(),
            l1: loss_g.l1.into_scalar().elem(),
            discriminator,
        };
        let grads_g = GradientsParams::from_grads(loss_g.total.backward(), &self.generator);

        self.generator = self
            .optim_g
            .step(self.config.lr, self.generator.clone(), grads_g);
        self.discriminator = self
            .optim_d
            .step(self.config.lr, self.discriminator.clone(), grads_d);

        self.state.step += 1;
        losses
    }

    /// Runs the remaining epochs, checkpointing every `checkpoint_every`
    /// completed epochs.
    pub fn fit(
        &mut self,
        train: &PairLoader<B>,
        eval: &PairLoader<B>,
    ) -> Pix2PixResult<Vec<EpochSummary>> {
        let mut summaries = Vec::new();

        for epoch in self.state.epoch..self.config.num_epochs {
            let start = Instant::now();
            let mut sum = StepLosses::default();
            let mut batches = 0;

            for batch in train.iter() {
                let losses = self.train_step(batch);
                sum.generator += losses.generator;
                sum.adversarial += losses.adversarial;
                sum.l1 += losses.l1;
                sum.discriminator += losses.discriminator;
                batches += 1;
            }

            self.state.epoch = epoch + 1;

            if self.config.preview {
                self.preview(eval, self.state.epoch)?;
            }

            if self.state.epoch % self.config.checkpoint_every == 0 {
                self.checkpoints.save(
                    &self.generator,
                    &self.discriminator,
                    &self.optim_g,
                    &self.optim_d,
                    self.state,
                )?;
            }

            let n = batches.max(1) as f32;
            let summary = EpochSummary {
                epoch: self.state.epoch,
                seconds: start.elapsed().as_secs_f32(),
                batches,
                mean: StepLosses {
                    generator: sum.generator / n,
                    adversarial: sum.adversarial / n,
                    l1: sum.l1 / n,
                    discriminator: sum.discriminator / n,
                },
            };

            info!(
                "Time taken for epoch {} is {:.3} sec [G: {:.4}] [L1: {:.4}] [D: {:.4}]",
                summary.epoch,
                summary.seconds,
                summary.mean.generator,
                summary.mean.l1,
                summary.mean.discriminator
            );
            summaries.push(summary);
        }

        Ok(summaries)
    }

    fn preview(&self, eval: &PairLoader<B>, epoch: usize) -> Pix2PixResult<()> {
        let Some(batch) = eval.iter().next() else {
            return Ok(());
        };

        let path = self.config.samples_dir().join(format!("epoch_{epoch}.png"));
        self.generate_images(batch, &path)
    }

    /// Runs a copy of the generator on the autodiff backend, so batch
    /// normalization uses the statistics of this batch and dropout stays
    /// active. Clones share running statistics, so the copy is rebuilt from
    /// the record and the trained generator never sees evaluation data.
    pub fn generate_images(&self, batch: PairBatch<B>, path: &Path) -> Pix2PixResult<()> {
        let generator = self
            .config
            .model
            .init_generator::<B>(&self.device)
            .load_record(self.generator.clone().into_record());
        let prediction = generator.forward(batch.input.clone()).detach();
        save_preview(path, batch.input, batch.target, prediction)
    }

    pub fn restore(mut self, checkpoint: &Path) -> Pix2PixResult<Self> {
        let device = self.device.clone();

        self.generator = load_module(self.generator, &checkpoint.join(GENERATOR), &device)?;
        self.discriminator =
            load_module(self.discriminator, &checkpoint.join(DISCRIMINATOR), &device)?;
        self.optim_g = load_optimizer::<B, Generator<B>, _>(
            self.optim_g,
            &checkpoint.join(GENERATOR_OPTIMIZER),
            &device,
        )?;
        self.optim_d = load_optimizer::<B, Discriminator<B>, _>(
            self.optim_d,
            &checkpoint.join(DISCRIMINATOR_OPTIMIZER),
            &device,
        )?;
        self.state = read_state(checkpoint)?;

        info!(
            "restored {} (epoch {}, step {})",
            checkpoint.display(),
            self.state.epoch,
            self.state.step
        );
        Ok(self)
    }

    /// Restores the newest checkpoint; a no-op when none has been written.
    pub fn restore_latest(self) -> Pix2PixResult<Self> {
        match self.checkpoints.latest() {
            Some(latest) => self.restore(&latest),
            None => {
                debug!("no checkpoint in {}", self.checkpoints.dir().display());
                Ok(self)
            }
        }
    }
}

/// Writes input | ground truth | prediction of the first batch element side
/// by side.
pub fn save_preview<B: Backend>(
    path: &Path,
    input: Tensor<B, 4>,
    target: Tensor<B, 4>,
    prediction: Tensor<B, 4>,
) -> Pix2PixResult<()> {
    let [_, channels, h, w] = target.dims();

    let panels = [input, target, prediction]
        .into_iter()
        .map(|t| {
            t.into_data()
                .convert::<f32>()
                .to_vec::<f32>()
                .map_err(|e| Pix2PixError::Tensor(format!("{e:?}")))
        })
        .collect::<Pix2PixResult<Vec<_>>>()?;

    let to_u8 = |v: f32| denormalize(v).clamp(0.0, 255.0) as u8;
    let plane = h * w;
    let mut combined = RgbImage::new(w as u32 * 3, h as u32);

    for (i, panel) in panels.iter().enumerate() {
        for y in 0..h {
            for x in 0..w {
                let idx = y * w + x;
                let mut px = [0u8; 3];
                for (c, value) in px.iter_mut().enumerate().take(channels) {
                    *value = to_u8(panel[c * plane + idx]);
                }
                combined.put_pixel((x + i * w) as u32, y as u32, Rgb(px));
            }
        }
    }

    if let Some(parent) = path.parent() {
        create_dir_all(parent).map_err(|e| Pix2PixError::io(parent, e))?;
    }
    combined.save(path).map_err(|source| Pix2PixError::Image {
        path: path.to_path_buf(),
        source,
    })
}

fn save_config(config: &TrainingConfig) -> Pix2PixResult<()> {
    let dir = Path::new(&config.artifact_dir);
    create_dir_all(dir).map_err(|e| Pix2PixError::io(dir, e))?;

    let path = dir.join("config.json");
    config.save(&path).map_err(|e| Pix2PixError::io(&path, e))
}

pub fn run_training<B: AutodiffBackend>(
    config: TrainingConfig,
    device: B::Device,
    resume: bool,
) -> Pix2PixResult<TrainingReport> {
    config.validate()?;
    save_config(&config)?;
    B::seed(&device, config.seed);

    let datasets = build_datasets::<B>(&config.dataset, config.seed, &device)?;
    let mut session = init_session::<B>(config, device)?;

    if resume {
        session = session.restore_latest()?;
    }

    info!(
        "training epochs {}..{} on {} pairs",
        session.state.epoch, session.config.num_epochs, datasets.train_len
    );
    let epochs = session.fit(&datasets.train, &datasets.eval)?;
    let session = session.restore_latest()?;

    Ok(TrainingReport {
        epochs,
        checkpoints: session.checkpoints.checkpoints(),
        state: session.state,
    })
}

/// Restores the latest checkpoint and writes previews for the first
/// `samples` evaluation batches.
pub fn run_inference<B: AutodiffBackend>(
    config: TrainingConfig,
    device: B::Device,
    samples: usize,
) -> Pix2PixResult<Vec<PathBuf>> {
    config.validate()?;

    let (eval, _) = build_eval_loader::<B>(&config.dataset, &device)?;
    let session = init_session::<B>(config, device)?;
    let Some(latest) = session.checkpoints.latest() else {
        return Err(Pix2PixError::NoCheckpoint {
            dir: session.checkpoints.dir().to_path_buf(),
        });
    };
    let session = session.restore(&latest)?;

    let samples_dir = session.config.samples_dir();
    let mut written = Vec::with_capacity(samples);
    for (i, batch) in eval.iter().take(samples).enumerate() {
        let path = samples_dir.join(format!("test_{i}.png"));
        session.generate_images(batch, &path)?;
        written.push(path);
    }

    info!("wrote {} previews to {}", written.len(), samples_dir.display());
    Ok(written)
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::{Autodiff, NdArray};
    use burn::module::AutodiffModule;
    use burn::tensor::Distribution;
    use tempfile::tempdir;

    type B = Autodiff<NdArray<f32>>;

    fn tiny_config(dir: &Path) -> TrainingConfig {
        let model = NetworkConfig::new()
            .with_generator_channels(vec![4, 8, 8])
            .with_discriminator_channels(vec![4, 8, 8])
            .with_discriminator_hidden(8);
        let dataset = DatasetConfig::new()
            .with_root(dir.join("data").display().to_string())
            .with_image_size(32)
            .with_jitter_size(36);

        TrainingConfig::new(model, default_optimizer(), dataset)
            .with_checkpoint_dir(dir.join("models").display().to_string())
            .with_artifact_dir(dir.join("artifact").display().to_string())
    }

    fn batch(device: &<B as Backend>::Device) -> PairBatch<B> {
        PairBatch {
            input: Tensor::random([1, 3, 32, 32], Distribution::Uniform(-1.0, 1.0), device),
            target: Tensor::random([1, 3, 32, 32], Distribution::Uniform(-1.0, 1.0), device),
        }
    }

    #[test]
    fn defaults_match_the_paper_setup() {
        let config = TrainingConfig::with_defaults();
        assert_eq!(config.num_epochs, 150);
        assert_eq!(config.checkpoint_every, 20);
        assert_eq!(config.lambda, 100.0);
        assert_eq!(config.lr, 2e-4);
        assert_eq!(serde_json::to_value(&config.optimizer).unwrap()["beta_1"], 0.5);
        assert_eq!(config.dataset.batch_size, 1);
        assert_eq!(config.dataset.image_size, 256);
        assert_eq!(config.checkpoint_dir, "./models/pix2pix");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn rejects_indivisible_image_size() {
        let dir = tempdir().unwrap();
        let mut config = tiny_config(dir.path());
        config.dataset.image_size = 36;
        config.dataset.jitter_size = 40;
        assert!(matches!(
            config.validate(),
            Err(Pix2PixError::InvalidConfig(_))
        ));
    }

    #[test]
    fn rejects_non_rgb_channels() {
        let dir = tempdir().unwrap();
        for (input, output) in [(1, 3), (3, 1), (4, 3)] {
            let mut config = tiny_config(dir.path());
            config.model.input_channels = input;
            config.model.output_channels = output;
            assert!(matches!(
                config.validate(),
                Err(Pix2PixError::InvalidConfig(_))
            ));
        }
    }

    #[test]
    fn preview_leaves_running_statistics_alone() {
        let dir = tempdir().unwrap();
        let device = <B as Backend>::Device::default();
        let session = init_session::<B>(tiny_config(dir.path()), device.clone()).unwrap();

        let probe = batch(&device).input.inner();
        let inference = |g: &Generator<B>| {
            g.valid()
                .forward(probe.clone())
                .into_data()
                .to_vec::<f32>()
                .unwrap()
        };
        let before = inference(&session.generator);

        let path = dir.path().join("samples").join("epoch_1.png");
        for _ in 0..3 {
            session.generate_images(batch(&device), &path).unwrap();
        }
        assert_eq!(before, inference(&session.generator));
    }

    #[test]
    fn train_step_updates_both_networks() {
        let dir = tempdir().unwrap();
        let device = <B as Backend>::Device::default();
        let mut session = init_session::<B>(tiny_config(dir.path()), device.clone()).unwrap();

        let before_g = session.generator.clone();
        let before_d = session.discriminator.clone();
        let probe = batch(&device);

        let losses = session.train_step(batch(&device));
        assert!(losses.generator.is_finite() && losses.generator >= 0.0);
        assert!(losses.discriminator.is_finite() && losses.discriminator >= 0.0);
        assert_eq!(session.state().step, 1);

        let last_weight = |g: &Generator<B>| g.last.weight.val().into_data();
        assert_ne!(last_weight(&before_g), last_weight(&session.generator));

        let disc_weight = |d: &Discriminator<B>| d.last.weight.val().into_data();
        assert_ne!(disc_weight(&before_d), disc_weight(&session.discriminator));

        let out = session.generator.forward(probe.input);
        assert_eq!(out.dims(), [1, 3, 32, 32]);
    }

    #[test]
    fn checkpoint_restores_weights() {
        let dir = tempdir().unwrap();
        let device = <B as Backend>::Device::default();
        let mut session = init_session::<B>(tiny_config(dir.path()), device.clone()).unwrap();
        session.train_step(batch(&device));

        let saved = session
            .checkpoints
            .save(
                &session.generator,
                &session.discriminator,
                &session.optim_g,
                &session.optim_d,
                TrainingState { epoch: 3, step: 1 },
            )
            .unwrap();
        assert!(saved.ends_with("ckpt-1"));
        let weights = |g: &Generator<B>| g.last.weight.val().into_data().to_vec::<f32>().unwrap();
        let expected = weights(&session.generator);

        let fresh = init_session::<B>(tiny_config(dir.path()), device.clone()).unwrap();
        assert_eq!(fresh.checkpoints().latest(), Some(saved));

        let restored = fresh.restore_latest().unwrap();
        assert_eq!(restored.state(), TrainingState { epoch: 3, step: 1 });
        let actual = weights(&restored.generator);
        assert_eq!(actual.len(), expected.len());
        assert!(actual.iter().zip(&expected).all(|(a, b)| (a - b).abs() < 1e-6));
    }

    #[test]
    fn preview_is_three_panels_wide() {
        let dir = tempdir().unwrap();
        let device = <B as Backend>::Device::default();
        let session = init_session::<B>(tiny_config(dir.path()), device.clone()).unwrap();

        let path = dir.path().join("samples").join("preview.png");
        session.generate_images(batch(&device), &path).unwrap();

        let image = image::open(&path).unwrap();
        assert_eq!((image.width(), image.height()), (96, 32));
    }
}
