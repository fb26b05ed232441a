//! Checkpoint directory layout.
//!
//! ```text
//! <dir>/checkpoint.json        index: save counter + saved checkpoints, oldest first
//! <dir>/<prefix>-<n>/          one checkpoint
//!     generator.mpk
//!     discriminator.mpk
//!     generator_optimizer.mpk
//!     discriminator_optimizer.mpk
//!     state.json
//! ```
//!
//! The index is rewritten only after every file of a checkpoint is on disk,
//! so `latest` never resolves to a partially written checkpoint.

use crate::error::{Pix2PixError, Pix2PixResult};
use crate::network::{Discriminator, Generator};
use burn::{
    module::{AutodiffModule, Module},
    optim::Optimizer,
    record::{FullPrecisionSettings, NamedMpkFileRecorder, Recorder},
    tensor::backend::{AutodiffBackend, Backend},
};
use serde::{Deserialize, Serialize};
use std::{
    fs::{create_dir_all, read_to_string, remove_dir_all, rename, write},
    path::{Path, PathBuf},
};
use tracing::{debug, info};

pub type CheckpointRecorder = NamedMpkFileRecorder<FullPrecisionSettings>;

pub const GENERATOR: &str = "generator";
pub const DISCRIMINATOR: &str = "discriminator";
pub const GENERATOR_OPTIMIZER: &str = "generator_optimizer";
pub const DISCRIMINATOR_OPTIMIZER: &str = "discriminator_optimizer";

const INDEX_FILE: &str = "checkpoint.json";
const STATE_FILE: &str = "state.json";

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrainingState {
    /// Completed epochs.
    pub epoch: usize,
    pub step: usize,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
struct CheckpointIndex {
    save_counter: usize,
    checkpoints: Vec<String>,
}

#[derive(Debug)]
pub struct CheckpointManager {
    dir: PathBuf,
    prefix: String,
    max_to_keep: Option<usize>,
    index: CheckpointIndex,
}

fn record_error(path: &Path, err: impl std::fmt::Debug) -> Pix2PixError {
    Pix2PixError::Record {
        path: path.to_path_buf(),
        reason: format!("{err:?}"),
    }
}

fn write_json<T: Serialize>(path: &Path, value: &T) -> Pix2PixResult<()> {
    let json = serde_json::to_string_pretty(value).map_err(|source| Pix2PixError::Json {
        path: path.to_path_buf(),
        source,
    })?;
    write(path, json).map_err(|e| Pix2PixError::io(path, e))
}

fn read_json<T: for<'de> Deserialize<'de>>(path: &Path) -> Pix2PixResult<T> {
    let contents = read_to_string(path).map_err(|e| Pix2PixError::io(path, e))?;
    serde_json::from_str(&contents).map_err(|source| Pix2PixError::Json {
        path: path.to_path_buf(),
        source,
    })
}

impl CheckpointManager {
    /// Opens `dir`, picking up the index of an earlier run if there is one.
    pub fn new(
        dir: impl Into<PathBuf>,
        prefix: impl Into<String>,
        max_to_keep: Option<usize>,
    ) -> Pix2PixResult<Self> {
        let dir = dir.into();
        let index_path = dir.join(INDEX_FILE);
        let index = if index_path.is_file() {
            read_json(&index_path)?
        } else {
            CheckpointIndex::default()
        };

        Ok(Self {
            dir,
            prefix: prefix.into(),
            max_to_keep,
            index,
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn checkpoints(&self) -> Vec<PathBuf> {
        self.index
            .checkpoints
            .iter()
            .map(|name| self.dir.join(name))
            .collect()
    }

    pub fn latest(&self) -> Option<PathBuf> {
        self.index.checkpoints.last().map(|name| self.dir.join(name))
    }

    pub fn save<B, OG, OD>(
        &mut self,
        generator: &Generator<B>,
        discriminator: &Discriminator<B>,
        optim_g: &OG,
        optim_d: &OD,
        state: TrainingState,
    ) -> Pix2PixResult<PathBuf>
    where
        B: AutodiffBackend,
        OG: Optimizer<Generator<B>, B>,
        OD: Optimizer<Discriminator<B>, B>,
    {
        let number = self.index.save_counter + 1;
        let name = format!("{}-{}", self.prefix, number);
        let path = self.dir.join(&name);
        create_dir_all(&path).map_err(|e| Pix2PixError::io(&path, e))?;

        save_module(generator.clone(), &path.join(GENERATOR))?;
        save_module(discriminator.clone(), &path.join(DISCRIMINATOR))?;
        save_optimizer::<B, Generator<B>, _>(optim_g, &path.join(GENERATOR_OPTIMIZER))?;
        save_optimizer::<B, Discriminator<B>, _>(optim_d, &path.join(DISCRIMINATOR_OPTIMIZER))?;
        write_json(&path.join(STATE_FILE), &state)?;

        self.index.save_counter = number;
        self.index.checkpoints.push(name);
        self.prune()?;
        self.write_index()?;

        info!("saved checkpoint {} at epoch {}", path.display(), state.epoch);
        Ok(path)
    }

    fn prune(&mut self) -> Pix2PixResult<()> {
        let Some(keep) = self.max_to_keep else {
            return Ok(());
        };

        while self.index.checkpoints.len() > keep.max(1) {
            let name = self.index.checkpoints.remove(0);
            let path = self.dir.join(name);
            if path.is_dir() {
                remove_dir_all(&path).map_err(|e| Pix2PixError::io(&path, e))?;
            }
            debug!("pruned checkpoint {}", path.display());
        }
        Ok(())
    }

    fn write_index(&self) -> Pix2PixResult<()> {
        let path = self.dir.join(INDEX_FILE);
        let tmp = path.with_extension("json.tmp");
        write_json(&tmp, &self.index)?;
        rename(&tmp, &path).map_err(|e| Pix2PixError::io(&path, e))
    }
}

pub fn read_state(checkpoint: &Path) -> Pix2PixResult<TrainingState> {
    read_json(&checkpoint.join(STATE_FILE))
}

pub fn save_module<B: Backend, M: Module<B>>(module: M, path: &Path) -> Pix2PixResult<()> {
    module
        .save_file(path, &CheckpointRecorder::new())
        .map_err(|e| record_error(path, e))
}

pub fn load_module<B: Backend, M: Module<B>>(
    module: M,
    path: &Path,
    device: &B::Device,
) -> Pix2PixResult<M> {
    module
        .load_file(path, &CheckpointRecorder::new(), device)
        .map_err(|e| record_error(path, e))
}

pub fn save_optimizer<B, M, O>(optim: &O, path: &Path) -> Pix2PixResult<()>
where
    B: AutodiffBackend,
    M: AutodiffModule<B>,
    O: Optimizer<M, B>,
{
    Recorder::<B>::record(&CheckpointRecorder::new(), optim.to_record(), path.to_path_buf())
        .map_err(|e| record_error(path, e))
}

pub fn load_optimizer<B, M, O>(optim: O, path: &Path, device: &B::Device) -> Pix2PixResult<O>
where
    B: AutodiffBackend,
    M: AutodiffModule<B>,
    O: Optimizer<M, B>,
{
    let record = Recorder::<B>::load(&CheckpointRecorder::new(), path.to_path_buf(), device)
        .map_err(|e| record_error(path, e))?;
    Ok(optim.load_record(record))
}
