//! Variational autoencoder (AutoencoderKL) for latent diffusion
//!
//! Converts between pixel space and the latent space the denoiser works in.
//! Latents produced here are unscaled; multiply by the latent scale factor
//! (`0.18215` for SD 1.x / 2.x) before denoising and divide before decoding.
//!
//! ```ignore
//! use burn_diffusion_vae::Vae;
//!
//! let vae = Vae::from_weights(&weights, None, &device)?;
//! let latents = vae.encode(images).sample(noise) * 0.18215;
//! let images = vae.decode(latents / 0.18215);
//! ```

pub mod decoder;
pub mod encoder;
pub mod vae;

pub use decoder::{Decoder, DecoderBlock, MidBlock, ResnetBlock, SelfAttention};
pub use encoder::{Encoder, EncoderBlock};
pub use vae::{LatentDistribution, Vae, VaeConfig};
