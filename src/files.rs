use crate::error::{Pix2PixError, Pix2PixResult};
use clap::ValueEnum;
use image::{RgbImage, imageops::crop_imm};
use serde::{Deserialize, Serialize};
use std::{
    fs::{create_dir_all, read, read_dir, write},
    path::{Path, PathBuf},
};
use tracing::{debug, info, warn};
use wincode::{SchemaRead, SchemaWrite, deserialize, serialize};

const EXTENSIONS: [&str; 3] = ["jpg", "jpeg", "png"];

/// Which half of a side-by-side source image holds the input condition.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize, ValueEnum)]
pub enum InputHalf {
    Left,
    Right,
}

/// Input condition and ground truth, same size, 8-bit RGB.
#[derive(Clone, Debug, PartialEq)]
pub struct ImagePair {
    pub input: RgbImage,
    pub target: RgbImage,
}

impl ImagePair {
    pub fn dimensions(&self) -> (u32, u32) {
        self.input.dimensions()
    }
}

#[derive(Clone, Debug, SchemaWrite, SchemaRead)]
struct CachedPair {
    width: u32,
    height: u32,
    input: Vec<u8>,
    target: Vec<u8>,
}

impl From<&ImagePair> for CachedPair {
    fn from(pair: &ImagePair) -> Self {
        let (width, height) = pair.dimensions();
        Self {
            width,
            height,
            input: pair.input.as_raw().clone(),
            target: pair.target.as_raw().clone(),
        }
    }
}

/// What the cache was built from: a hit must agree on both.
#[derive(Clone, Debug, PartialEq, Eq, SchemaWrite, SchemaRead)]
struct CacheKey {
    input_right: bool,
    files: Vec<String>,
}

impl CacheKey {
    fn new(input_half: InputHalf, paths: &[PathBuf]) -> Self {
        Self {
            input_right: input_half == InputHalf::Right,
            files: paths
                .iter()
                .filter_map(|p| p.file_name())
                .map(|name| name.to_string_lossy().into_owned())
                .collect(),
        }
    }

    /// A missing source directory leaves only the half to compare.
    fn matches(&self, input_half: InputHalf, paths: Option<&[PathBuf]>) -> bool {
        self.input_right == (input_half == InputHalf::Right)
            && paths.is_none_or(|paths| *self == Self::new(input_half, paths))
    }
}

#[derive(Debug, SchemaWrite, SchemaRead)]
struct CacheFile {
    key: CacheKey,
    pairs: Vec<CachedPair>,
}

impl CachedPair {
    fn into_pair(self) -> Option<ImagePair> {
        Some(ImagePair {
            input: RgbImage::from_raw(self.width, self.height, self.input)?,
            target: RgbImage::from_raw(self.width, self.height, self.target)?,
        })
    }
}

pub fn load_pair(path: &Path, input_half: InputHalf) -> Pix2PixResult<ImagePair> {
    let image = image::open(path)
        .map_err(|source| Pix2PixError::Image {
            path: path.to_path_buf(),
            source,
        })?
        .to_rgb8();

    let (width, height) = image.dimensions();
    if width % 2 != 0 {
        return Err(Pix2PixError::OddWidth {
            path: path.to_path_buf(),
            width,
        });
    }

    let half = width / 2;
    let left = crop_imm(&image, 0, 0, half, height).to_image();
    let right = crop_imm(&image, half, 0, half, height).to_image();

    Ok(match input_half {
        InputHalf::Left => ImagePair {
            input: left,
            target: right,
        },
        InputHalf::Right => ImagePair {
            input: right,
            target: left,
        },
    })
}

pub fn list_images(dir: &Path) -> Pix2PixResult<Vec<PathBuf>> {
    let entries = read_dir(dir).map_err(|e| Pix2PixError::io(dir, e))?;

    let mut paths: Vec<PathBuf> = entries
        .flatten()
        .map(|entry| entry.path())
        .filter(|path| path.is_file())
        .filter(|path| {
            path.extension()
                .and_then(|ext| ext.to_str())
                .is_some_and(|ext| EXTENSIONS.iter().any(|e| ext.eq_ignore_ascii_case(e)))
        })
        .collect();

    paths.sort();
    Ok(paths)
}

/// Loads every pair in `dir`, going through the binary cache when one is given.
///
/// A cache built for the other `input_half` or for a different file list is
/// rebuilt.
pub fn load_split(
    dir: &Path,
    input_half: InputHalf,
    cache: Option<&Path>,
) -> Pix2PixResult<Vec<ImagePair>> {
    let paths = if dir.is_dir() {
        Some(list_images(dir)?)
    } else {
        None
    };

    if let Some(cache) = cache
        && cache.is_file()
    {
        let file = read_cache(cache)?;
        if file.key.matches(input_half, paths.as_deref()) {
            let pairs = into_pairs(cache, file.pairs)?;
            info!("loaded {} pairs from cache {}", pairs.len(), cache.display());
            return Ok(pairs);
        }
        warn!("cache {} is stale, rebuilding", cache.display());
    }

    let Some(paths) = paths else {
        return Err(Pix2PixError::io(
            dir,
            std::io::Error::from(std::io::ErrorKind::NotFound),
        ));
    };
    let mut pairs = Vec::with_capacity(paths.len());

    for (n, path) in paths.iter().enumerate() {
        pairs.push(load_pair(path, input_half)?);
        debug!(
            "{:.2}% {}",
            (n + 1) as f32 / paths.len() as f32 * 100.0,
            path.display()
        );
    }

    if let Some(cache) = cache {
        write_cache(cache, CacheKey::new(input_half, &paths), &pairs)?;
        info!("wrote {} pairs to cache {}", pairs.len(), cache.display());
    }

    Ok(pairs)
}

fn read_cache(path: &Path) -> Pix2PixResult<CacheFile> {
    let data = read(path).map_err(|e| Pix2PixError::io(path, e))?;
    deserialize(&data).map_err(|e| Pix2PixError::Cache {
        path: path.to_path_buf(),
        reason: e.to_string(),
    })
}

fn into_pairs(path: &Path, cached: Vec<CachedPair>) -> Pix2PixResult<Vec<ImagePair>> {
    cached
        .into_iter()
        .map(|entry| {
            entry.into_pair().ok_or_else(|| Pix2PixError::Cache {
                path: path.to_path_buf(),
                reason: "buffer length does not match dimensions".to_string(),
            })
        })
        .collect()
}

fn write_cache(path: &Path, key: CacheKey, pairs: &[ImagePair]) -> Pix2PixResult<()> {
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        create_dir_all(parent).map_err(|e| Pix2PixError::io(parent, e))?;
    }

    let file = CacheFile {
        key,
        pairs: pairs.iter().map(CachedPair::from).collect(),
    };
    let data = serialize(&file).map_err(|e| Pix2PixError::Cache {
        path: path.to_path_buf(),
        reason: e.to_string(),
    })?;
    write(path, data).map_err(|e| Pix2PixError::io(path, e))
}
