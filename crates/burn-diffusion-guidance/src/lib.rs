//! Classifier-free guidance for latent diffusion samplers
//!
//! [`GuidedDenoiser`] is driven by an external sampler:
//!
//! ```ignore
//! let mut denoiser = GuidedDenoiser::new(&unet.network, schedule, 7.5)?;
//! for (i, t) in timesteps.iter().enumerate() {
//!     denoiser.set_step(i)?;
//!     let eps = denoiser.predict_noise(latents.clone(), *t as f64, alphas_cumprod[*t]);
//!     latents = sampler.step(latents, eps, i);
//!     latents = denoiser.mask_noise(latents, alphas_cumprod[*t], || noise());
//! }
//! ```

pub mod denoiser;
pub mod error;

pub use denoiser::{GuidedDenoiser, LATENT_SCALE};
pub use error::GuidanceError;
