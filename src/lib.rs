pub mod augment;
pub mod checkpoint;
pub mod consts;
pub mod dataset;
pub mod error;
pub mod files;
pub mod loss;
pub mod network;
pub mod training;

pub use error::{Pix2PixError, Pix2PixResult};
