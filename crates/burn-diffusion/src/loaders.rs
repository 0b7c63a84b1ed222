//! One-call checkpoint loaders
//!
//! Each loader reads a `.safetensors` file and hands the weights to the
//! matching constructor.

use std::fmt;
use std::path::Path;

use burn::prelude::*;
use thiserror::Error;

use burn_diffusion_clip::ClipTextEncoder;
use burn_diffusion_convert::{load_weights, LoadError};
use burn_diffusion_core::{
    Adapted, ConfigError, Hypernetwork, LowRankAdapterSet, PrecisionMode, WeightCollection,
};
use burn_diffusion_unet::UNet;
use burn_diffusion_upscale::SuperResolution;
use burn_diffusion_vae::Vae;

#[derive(Error, Debug)]
pub enum Error {
    #[error("failed to read checkpoint: {0}")]
    Load(#[from] LoadError),

    #[error("invalid checkpoint: {0}")]
    Config(#[from] ConfigError),
}

/// What a checkpoint contains, judged by its keys
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckpointKind {
    UNet,
    TextEncoder,
    Vae,
    Lora,
    Hypernetwork,
    Upscaler,
    Unknown,
}

impl CheckpointKind {
    pub fn detect(weights: &WeightCollection) -> Self {
        if weights
            .keys()
            .any(|key| key.ends_with(".lora_up.weight") || key.ends_with(".lora_down.weight"))
        {
            Self::Lora
        } else if weights.keys().any(is_hypernetwork_key) {
            Self::Hypernetwork
        } else if weights.contains("conv_in.weight") && weights.contains("time_embedding.linear_1.weight") {
            Self::UNet
        } else if weights.contains("encoder.conv_in.weight") || weights.contains("decoder.conv_in.weight") {
            Self::Vae
        } else if weights.keys().any(|key| key.starts_with("text_model.")) {
            Self::TextEncoder
        } else if weights.keys().any(|key| {
            key.ends_with("conv_first.weight") || key == "model.0.weight" || key.contains(".rdb1.")
        }) {
            Self::Upscaler
        } else {
            Self::Unknown
        }
    }
}

impl fmt::Display for CheckpointKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::UNet => "UNet",
            Self::TextEncoder => "CLIP text encoder",
            Self::Vae => "VAE",
            Self::Lora => "LoRA",
            Self::Hypernetwork => "hypernetwork",
            Self::Upscaler => "super-resolution upscaler",
            Self::Unknown => "unknown",
        };
        f.write_str(name)
    }
}

/// `{dim}.{0|1}.linear.{i}.weight`
fn is_hypernetwork_key(key: &str) -> bool {
    let parts = key.split('.').collect::<Vec<_>>();
    match parts.as_slice() {
        [dim, module, "linear", index, "weight"] => {
            dim.parse::<usize>().is_ok()
                && matches!(*module, "0" | "1")
                && index.parse::<usize>().is_ok()
        }
        _ => false,
    }
}

/// Reads a checkpoint, logging what it appears to contain
fn read(path: &Path) -> Result<WeightCollection, Error> {
    let weights = load_weights(path)?;
    tracing::debug!(path = %path.display(), kind = %CheckpointKind::detect(&weights), "read checkpoint");
    Ok(weights)
}

pub fn load_unet<B: Backend>(
    path: impl AsRef<Path>,
    precision: Option<PrecisionMode>,
    device: &B::Device,
) -> Result<Adapted<UNet<B>, B>, Error> {
    let weights = read(path.as_ref())?;
    Ok(UNet::from_weights(&weights, precision, device)?)
}

pub fn load_text_encoder<B: Backend>(
    path: impl AsRef<Path>,
    precision: Option<PrecisionMode>,
    device: &B::Device,
) -> Result<Adapted<ClipTextEncoder<B>, B>, Error> {
    let weights = read(path.as_ref())?;
    Ok(ClipTextEncoder::from_weights(&weights, precision, device)?)
}

pub fn load_vae<B: Backend>(
    path: impl AsRef<Path>,
    precision: Option<PrecisionMode>,
    device: &B::Device,
) -> Result<Vae<B>, Error> {
    let weights = read(path.as_ref())?;
    Ok(Vae::from_weights(&weights, precision, device)?)
}

pub fn load_lora<B: Backend>(
    path: impl AsRef<Path>,
    precision: Option<PrecisionMode>,
    device: &B::Device,
) -> Result<LowRankAdapterSet<B>, Error> {
    let weights = read(path.as_ref())?;
    Ok(LowRankAdapterSet::from_weights(&weights, precision, device)?)
}

pub fn load_hypernetwork<B: Backend>(
    path: impl AsRef<Path>,
    precision: Option<PrecisionMode>,
    device: &B::Device,
) -> Result<Hypernetwork<B>, Error> {
    let weights = read(path.as_ref())?;
    Ok(Hypernetwork::from_weights(&weights, precision, device)?)
}

pub fn load_upscaler<B: Backend>(
    path: impl AsRef<Path>,
    precision: Option<PrecisionMode>,
    device: &B::Device,
) -> Result<SuperResolution<B>, Error> {
    let weights = read(path.as_ref())?;
    Ok(SuperResolution::from_weights(&weights, precision, device)?)
}
