//! Latent-space upscaling

use burn::prelude::*;
use burn::tensor::module::interpolate;
use burn::tensor::ops::{InterpolateMode, InterpolateOptions};

/// Interpolation used by [`upscale_latent`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LatentUpscaleMode {
    Nearest,
    #[default]
    Bilinear,
    Bicubic,
}

impl LatentUpscaleMode {
    pub fn parse(value: &str) -> Option<Self> {
        match value.to_ascii_lowercase().as_str() {
            "nearest" => Some(Self::Nearest),
            "bilinear" => Some(Self::Bilinear),
            "bicubic" => Some(Self::Bicubic),
            _ => None,
        }
    }

    fn interpolate_mode(self) -> InterpolateMode {
        match self {
            Self::Nearest => InterpolateMode::Nearest,
            Self::Bilinear => InterpolateMode::Bilinear,
            Self::Bicubic => InterpolateMode::Bicubic,
        }
    }
}

/// Resizes `[b, c, h, w]` latents to `[b, c, h * factor, w * factor]`
pub fn upscale_latent<B: Backend>(latents: Tensor<B, 4>, mode: LatentUpscaleMode, factor: f64) -> Tensor<B, 4> {
    let [_, _, h, w] = latents.dims();
    let size = [
        (h as f64 * factor) as usize,
        (w as f64 * factor) as usize,
    ];
    interpolate(latents, size, InterpolateOptions::new(mode.interpolate_mode()))
}
