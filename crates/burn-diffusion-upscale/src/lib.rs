//! Upscaling for generated images and latents
//!
//! - [`upscale_latent`] - interpolation in latent space, before a second denoising pass
//! - [`upscale_pixel`] - classic resampling filters on decoded images
//! - [`upscale_super_resolution`] - RRDBNet (ESRGAN) models

pub mod latent;
pub mod pixel;
pub mod rrdb;
pub mod super_resolution;

pub use image::imageops::FilterType;
pub use latent::{upscale_latent, LatentUpscaleMode};
pub use pixel::{image_to_tensor, tensor_to_image, upscale_pixel};
pub use rrdb::{convert_esrgan_keys, DenseBlock, Rrdb, RrdbConfig, SuperResolution};
pub use super_resolution::upscale_super_resolution;
