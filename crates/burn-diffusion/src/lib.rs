//! burn-diffusion: guided latent diffusion inference in pure Rust
//!
//! The inference core of a Stable Diffusion 1.x / 2.x stack on the Burn deep
//! learning framework: conditional UNet, CLIP text encoder and VAE
//! constructors, LoRA and hypernetwork adapters attached to frozen networks,
//! the classifier-free guided denoiser samplers call into, and latent / pixel
//! / super-resolution upscaling.
//!
//! # Backend Selection
//!
//! Choose a backend via feature flags:
//! - `ndarray`: CPU backend (no GPU required, default)
//! - `wgpu`: WebGPU backend (cross-platform GPU)
//!
//! # Example
//!
//! ```ignore
//! use burn_diffusion::backends::{default_device, DefaultBackend};
//! use burn_diffusion::{load_lora, load_unet, GuidedDenoiser};
//!
//! let device = default_device();
//! let unet = load_unet::<DefaultBackend>("unet.safetensors", None, &device)?;
//! let lora = load_lora::<DefaultBackend>("style.safetensors", None, &device)?;
//! lora.attach(&[&unet.adapters]);
//!
//! let mut denoiser = GuidedDenoiser::new(unet.network, schedule, 7.5)?;
//! for (i, t) in timesteps.iter().enumerate() {
//!     denoiser.set_step(i)?;
//!     let eps = denoiser.predict_noise(latents.clone(), *t, alphas[i]);
//!     // ... sampler update ...
//! }
//! ```

pub use burn_diffusion_clip as clip;
pub use burn_diffusion_convert as convert;
pub use burn_diffusion_core as core;
pub use burn_diffusion_guidance as guidance;
pub use burn_diffusion_unet as unet;
pub use burn_diffusion_upscale as upscale;
pub use burn_diffusion_vae as vae;

// Re-export the types most callers touch
pub use burn_diffusion_clip::{ClipConfig, ClipTextEncoder};
pub use burn_diffusion_convert::{load_weights, LoadError};
pub use burn_diffusion_core::{
    Adapted, AdapterHandle, AdapterModule, AdapterRegistry, AttachReport, ConfigError,
    DenoisingNetwork, Hypernetwork, LowRankAdapter, LowRankAdapterSet, ModelVariant,
    PrecisionMode, PredictionType, WeightCollection,
};
pub use burn_diffusion_guidance::{GuidanceError, GuidedDenoiser, LATENT_SCALE};
pub use burn_diffusion_unet::{UNet, UNetConfig};
pub use burn_diffusion_upscale::{
    upscale_latent, upscale_pixel, upscale_super_resolution, LatentUpscaleMode, SuperResolution,
};
pub use burn_diffusion_vae::{LatentDistribution, Vae, VaeConfig};

pub mod backends;
pub mod loaders;

pub use loaders::{
    load_hypernetwork, load_lora, load_text_encoder, load_unet, load_upscaler, load_vae,
    CheckpointKind, Error,
};
