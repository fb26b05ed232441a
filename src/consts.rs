pub const CHANNELS: usize = 3;

pub const IMG_SIZE: usize = 256;
pub const JITTER_SIZE: usize = 286;

pub const PIXEL_MAX: f32 = 255.0;
pub const PIXEL_MID: f32 = PIXEL_MAX / 2.0;

pub const LEAKY_SLOPE: f64 = 0.3;
pub const INIT_STD: f64 = 0.02;
pub const DROPOUT_RATE: f64 = 0.5;
pub const DROPOUT_STAGES: usize = 3;
pub const BN_EPSILON: f64 = 1e-3;
pub const BN_MOMENTUM: f64 = 0.01;

pub const LAMBDA: f32 = 100.0;
pub const LEARNING_RATE: f64 = 2e-4;
pub const BETA_1: f32 = 0.5;
pub const ADAM_EPSILON: f32 = 1e-7;

pub const EPOCHS: usize = 150;
pub const BATCH_SIZE: usize = 1;
pub const CHECKPOINT_EVERY: usize = 20;

pub const CHECKPOINT_DIR: &str = "./models/pix2pix";
pub const CHECKPOINT_PREFIX: &str = "ckpt";
pub const ARTIFACT_DIR: &str = "artifact";
pub const SAMPLES_DIR: &str = "samples";
