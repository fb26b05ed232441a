use crate::augment::{normalize_image, random_jitter, resize};
use crate::consts::{BATCH_SIZE, CHANNELS, IMG_SIZE, JITTER_SIZE};
use crate::error::{Pix2PixError, Pix2PixResult};
use crate::files::{ImagePair, InputHalf, load_split};
use burn::{
    data::{
        dataloader::{DataLoader, DataLoaderBuilder, batcher::Batcher},
        dataset::InMemDataset,
    },
    prelude::*,
};
use rand::rng;
use std::{path::Path, sync::Arc};
use tracing::{info, warn};

#[derive(Config, Debug)]
pub struct DatasetConfig {
    #[config(default = "String::from(\"facades\")")]
    pub root: String,
    #[config(default = "InputHalf::Left")]
    pub input_half: InputHalf,
    #[config(default = "IMG_SIZE")]
    pub image_size: usize,
    #[config(default = "JITTER_SIZE")]
    pub jitter_size: usize,
    #[config(default = "BATCH_SIZE")]
    pub batch_size: usize,
    pub cache: Option<String>,
}

impl DatasetConfig {
    pub fn validate(&self) -> Pix2PixResult<()> {
        if self.batch_size == 0 {
            return Err(Pix2PixError::InvalidConfig("batch_size must be positive".into()));
        }
        if self.image_size == 0 || self.jitter_size < self.image_size {
            return Err(Pix2PixError::InvalidConfig(format!(
                "jitter_size {} must be at least image_size {}",
                self.jitter_size, self.image_size
            )));
        }
        Ok(())
    }
}

#[derive(Clone, Debug)]
pub struct PairBatch<B: Backend> {
    pub input: Tensor<B, 4>,
    pub target: Tensor<B, 4>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Split {
    Train,
    Eval,
}

/// Turns decoded pairs into normalized NCHW tensors; training batches get
/// `random_jitter` on every call, evaluation batches are only resized.
#[derive(Clone, Debug)]
pub struct PairBatcher {
    split: Split,
    image_size: u32,
    jitter_size: u32,
}

impl PairBatcher {
    pub fn new(split: Split, image_size: usize, jitter_size: usize) -> Self {
        Self {
            split,
            image_size: image_size as u32,
            jitter_size: jitter_size as u32,
        }
    }

    fn prepare(&self, pair: &ImagePair) -> ImagePair {
        match self.split {
            Split::Train => random_jitter(pair, self.image_size, self.jitter_size, &mut rng()),
            Split::Eval => resize(pair, self.image_size, self.image_size),
        }
    }
}

fn to_tensor<B: Backend>(pixels: Vec<f32>, size: usize, device: &B::Device) -> Tensor<B, 3> {
    Tensor::<B, 3>::from_data(
        TensorData::new(pixels, [size, size, CHANNELS]).convert::<B::FloatElem>(),
        device,
    )
    .permute([2, 0, 1])
}

impl<B: Backend> Batcher<B, ImagePair, PairBatch<B>> for PairBatcher {
    fn batch(&self, items: Vec<ImagePair>, device: &B::Device) -> PairBatch<B> {
        let size = self.image_size as usize;

        let (input, target): (Vec<_>, Vec<_>) = items
            .iter()
            .map(|item| {
                let pair = self.prepare(item);
                (
                    to_tensor::<B>(normalize_image(&pair.input), size, device),
                    to_tensor::<B>(normalize_image(&pair.target), size, device),
                )
            })
            .unzip();

        PairBatch {
            input: Tensor::stack(input, 0),
            target: Tensor::stack(target, 0),
        }
    }
}

pub type PairLoader<B> = Arc<dyn DataLoader<B, PairBatch<B>>>;

pub struct Datasets<B: Backend> {
    pub train: PairLoader<B>,
    pub eval: PairLoader<B>,
    pub train_len: usize,
    pub eval_len: usize,
}

/// Single-threaded on purpose: burn's multi-worker loader shuffles once and
/// then only within each worker's fixed partition, so it never yields a full
/// permutation per epoch.
fn train_loader<B: Backend>(
    config: &DatasetConfig,
    pairs: Vec<ImagePair>,
    seed: u64,
    device: &B::Device,
) -> PairLoader<B> {
    DataLoaderBuilder::new(PairBatcher::new(
        Split::Train,
        config.image_size,
        config.jitter_size,
    ))
    .batch_size(config.batch_size)
    .shuffle(seed)
    .set_device(device.clone())
    .build(InMemDataset::new(pairs))
}

fn eval_loader<B: Backend>(
    config: &DatasetConfig,
    pairs: Vec<ImagePair>,
    device: &B::Device,
) -> PairLoader<B> {
    DataLoaderBuilder::new(PairBatcher::new(
        Split::Eval,
        config.image_size,
        config.jitter_size,
    ))
    .batch_size(config.batch_size)
    .set_device(device.clone())
    .build(InMemDataset::new(pairs))
}

fn load_eval_pairs(config: &DatasetConfig) -> Pix2PixResult<Vec<ImagePair>> {
    let eval_dir = Path::new(&config.root).join("test");
    if eval_dir.is_dir() {
        load_split(&eval_dir, config.input_half, None)
    } else {
        warn!("no evaluation split at {}", eval_dir.display());
        Ok(Vec::new())
    }
}

pub fn build_datasets<B: Backend>(
    config: &DatasetConfig,
    seed: u64,
    device: &B::Device,
) -> Pix2PixResult<Datasets<B>> {
    config.validate()?;

    let train_dir = Path::new(&config.root).join("train");
    let cache = config.cache.as_deref().map(Path::new);
    let train_pairs = load_split(&train_dir, config.input_half, cache)?;
    if train_pairs.is_empty() {
        return Err(Pix2PixError::EmptyDataset { path: train_dir });
    }
    let eval_pairs = load_eval_pairs(config)?;

    let (train_len, eval_len) = (train_pairs.len(), eval_pairs.len());
    info!("train pairs -> {train_len}, eval pairs -> {eval_len}");

    Ok(Datasets {
        train: train_loader(config, train_pairs, seed, device),
        eval: eval_loader(config, eval_pairs, device),
        train_len,
        eval_len,
    })
}

/// Evaluation split only, for inference runs that never touch `train/`.
pub fn build_eval_loader<B: Backend>(
    config: &DatasetConfig,
    device: &B::Device,
) -> Pix2PixResult<(PairLoader<B>, usize)> {
    config.validate()?;

    let pairs = load_eval_pairs(config)?;
    let len = pairs.len();
    info!("eval pairs -> {len}");
    Ok((eval_loader(config, pairs, device), len))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::augment::denormalize;
    use burn::backend::NdArray;
    use image::{Rgb, RgbImage};
    use std::collections::HashSet;
    use tempfile::tempdir;

    type B = NdArray<f32>;

    fn pair(width: u32, height: u32) -> ImagePair {
        ImagePair {
            input: RgbImage::from_fn(width, height, |_, _| Rgb([0, 255, 51])),
            target: RgbImage::from_fn(width, height, |_, _| Rgb([255, 0, 102])),
        }
    }

    #[test]
    fn eval_batch_is_resized_and_normalized() {
        let device = Default::default();
        let batcher = PairBatcher::new(Split::Eval, 16, 20);
        let batch: PairBatch<B> = batcher.batch(vec![pair(24, 10), pair(8, 8)], &device);

        assert_eq!(batch.input.dims(), [2, 3, 16, 16]);
        assert_eq!(batch.target.dims(), [2, 3, 16, 16]);

        let input = batch.input.into_data().to_vec::<f32>().unwrap();
        // channel-major: first plane is red, second green
        assert!(input[..256].iter().all(|&v| (v + 1.0).abs() < 1e-6));
        assert!(input[256..512].iter().all(|&v| (v - 1.0).abs() < 1e-6));
    }

    #[test]
    fn train_batch_has_crop_size() {
        let device = Default::default();
        let batcher = PairBatcher::new(Split::Train, 16, 20);
        let batch: PairBatch<B> = batcher.batch(vec![pair(30, 30)], &device);

        assert_eq!(batch.input.dims(), [1, 3, 16, 16]);
        let values = batch.target.into_data().to_vec::<f32>().unwrap();
        assert!(values.iter().all(|v| (-1.0..=1.0).contains(v)));
    }

    #[test]
    fn rejects_jitter_smaller_than_image() {
        let config = DatasetConfig::new().with_image_size(64).with_jitter_size(32);
        assert!(matches!(
            config.validate(),
            Err(Pix2PixError::InvalidConfig(_))
        ));
    }

    /// Pair whose every pixel stores `index`, so batches can be traced back.
    fn tagged(index: u8) -> ImagePair {
        let value = index * 30;
        ImagePair {
            input: RgbImage::from_pixel(8, 8, Rgb([value; 3])),
            target: RgbImage::from_pixel(8, 8, Rgb([value; 3])),
        }
    }

    fn order(loader: &PairLoader<B>) -> Vec<u8> {
        loader
            .iter()
            .map(|batch| {
                let first = batch.input.into_data().to_vec::<f32>().unwrap()[0];
                (denormalize(first) / 30.0).round() as u8
            })
            .collect()
    }

    #[test]
    fn train_loader_draws_a_fresh_full_permutation_each_epoch() {
        let device = Default::default();
        let config = DatasetConfig::new().with_image_size(8).with_jitter_size(8);
        let loader = train_loader::<B>(&config, (0..8).map(tagged).collect(), 5, &device);

        let mut leading = HashSet::new();
        for _ in 0..200 {
            let epoch = order(&loader);
            let mut sorted = epoch.clone();
            sorted.sort();
            assert_eq!(sorted, (0..8).collect::<Vec<_>>());
            leading.insert((epoch[0], epoch[1]));
        }

        // 56 ordered leading pairs exist; 200 uniform permutations hit ~54
        assert!(leading.len() >= 40, "only {} leading pairs", leading.len());
    }

    #[test]
    fn eval_loader_keeps_file_order() {
        let dir = tempdir().unwrap();
        let test = dir.path().join("test");
        std::fs::create_dir_all(&test).unwrap();
        for (index, name) in [(2, "a.png"), (0, "b.png"), (1, "c.png")] {
            let value = index * 30;
            RgbImage::from_pixel(16, 8, Rgb([value; 3]))
                .save(test.join(name))
                .unwrap();
        }

        let device = Default::default();
        let config = DatasetConfig::new()
            .with_root(dir.path().display().to_string())
            .with_image_size(8)
            .with_jitter_size(8);
        let (loader, len) = build_eval_loader::<B>(&config, &device).unwrap();

        assert_eq!(len, 3);
        assert_eq!(order(&loader), vec![2, 0, 1]);
        assert_eq!(order(&loader), vec![2, 0, 1]);
    }
}
