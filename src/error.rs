use std::path::PathBuf;
use thiserror::Error;

pub type Pix2PixResult<T> = Result<T, Pix2PixError>;

#[derive(Debug, Error)]
pub enum Pix2PixError {
    #[error("io error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("image decode error at {path}: {source}")]
    Image {
        path: PathBuf,
        #[source]
        source: image::ImageError,
    },
    #[error("{path} has odd width {width}; cannot split into two halves")]
    OddWidth { path: PathBuf, width: u32 },
    #[error("image pair halves differ in size: {input:?} vs {target:?}")]
    SizeMismatch {
        input: (u32, u32),
        target: (u32, u32),
    },
    #[error("crop {crop:?} does not fit into image {image:?}")]
    CropTooLarge { crop: (u32, u32), image: (u32, u32) },
    #[error("no image pairs found under {path}")]
    EmptyDataset { path: PathBuf },
    #[error("image cache {path} is unusable: {reason}")]
    Cache { path: PathBuf, reason: String },
    #[error("json error at {path}: {source}")]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("record error at {path}: {reason}")]
    Record { path: PathBuf, reason: String },
    #[error("tensor conversion failed: {0}")]
    Tensor(String),
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
    #[error("no checkpoint found in {dir}")]
    NoCheckpoint { dir: PathBuf },
}

impl Pix2PixError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}
