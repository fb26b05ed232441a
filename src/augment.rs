use crate::consts::PIXEL_MID;
use crate::error::{Pix2PixError, Pix2PixResult};
use crate::files::ImagePair;
use image::{
    RgbImage,
    imageops::{FilterType, crop_imm, flip_horizontal, resize as resize_image},
};
use rand::RngExt;

const FLIP_PROBABILITY: f64 = 0.5;

pub fn resize(pair: &ImagePair, height: u32, width: u32) -> ImagePair {
    ImagePair {
        input: resize_image(&pair.input, width, height, FilterType::Nearest),
        target: resize_image(&pair.target, width, height, FilterType::Nearest),
    }
}

/// Crops both images at one shared random offset so they stay aligned.
pub fn random_crop<R: RngExt + ?Sized>(
    pair: &ImagePair,
    height: u32,
    width: u32,
    rng: &mut R,
) -> Pix2PixResult<ImagePair> {
    let input = pair.input.dimensions();
    let target = pair.target.dimensions();
    if input != target {
        return Err(Pix2PixError::SizeMismatch { input, target });
    }

    let (image_width, image_height) = input;
    if width > image_width || height > image_height {
        return Err(Pix2PixError::CropTooLarge {
            crop: (width, height),
            image: input,
        });
    }

    Ok(crop_at_random(pair, height, width, rng))
}

fn crop_at_random<R: RngExt + ?Sized>(
    pair: &ImagePair,
    height: u32,
    width: u32,
    rng: &mut R,
) -> ImagePair {
    let (image_width, image_height) = pair.dimensions();
    let x = rng.random_range(0..=image_width - width);
    let y = rng.random_range(0..=image_height - height);

    ImagePair {
        input: crop_imm(&pair.input, x, y, width, height).to_image(),
        target: crop_imm(&pair.target, x, y, width, height).to_image(),
    }
}

/// Training-time augmentation: resize up to `jitter_size`, crop back to
/// `image_size`, then mirror both images with probability one half.
pub fn random_jitter<R: RngExt + ?Sized>(
    pair: &ImagePair,
    image_size: u32,
    jitter_size: u32,
    rng: &mut R,
) -> ImagePair {
    let canvas = jitter_size.max(image_size);
    let resized = resize(pair, canvas, canvas);
    let cropped = crop_at_random(&resized, image_size, image_size, rng);

    if rng.random_bool(FLIP_PROBABILITY) {
        ImagePair {
            input: flip_horizontal(&cropped.input),
            target: flip_horizontal(&cropped.target),
        }
    } else {
        cropped
    }
}

pub fn normalize(value: f32) -> f32 {
    value / PIXEL_MID - 1.0
}

pub fn denormalize(value: f32) -> f32 {
    (value + 1.0) * PIXEL_MID
}

/// HWC floats in [-1, 1].
pub fn normalize_image(image: &RgbImage) -> Vec<f32> {
    image
        .as_raw()
        .iter()
        .map(|&b| normalize(b as f32))
        .collect()
}
