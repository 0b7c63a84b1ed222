//! CLIP text encoders for Stable Diffusion 1.x and 2.x
//!
//! ```ignore
//! use burn_diffusion_clip::ClipTextEncoder;
//!
//! let clip = ClipTextEncoder::from_weights(&weights, None, &device)?;
//! let context = clip.network.forward_skip(token_ids, 2);
//! ```
//!
//! Tokenization happens outside this crate.

pub mod clip;

pub use clip::{ClipActivation, ClipAttention, ClipConfig, ClipMlp, ClipTextEncoder, EncoderLayer};
