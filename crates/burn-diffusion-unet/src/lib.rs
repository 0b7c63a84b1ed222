//! Conditional UNet denoisers for Stable Diffusion 1.x and 2.x
//!
//! The network implements [`DenoisingNetwork`](burn_diffusion_core::DenoisingNetwork)
//! so it can be driven by any guidance wrapper, and
//! [`AdapterHost`](burn_diffusion_core::AdapterHost) so LoRA and hypernetwork
//! adapters can be attached to its attention projections.

pub mod blocks;
pub mod unet;

pub use blocks::{
    CrossAttention, Downsample, FeedForward, Projection, ResnetBlock, SpatialTransformer,
    TransformerBlock, TransformerShape, Upsample,
};
pub use unet::{DownBlock, MidBlock, UNet, UNetConfig, UpBlock};
