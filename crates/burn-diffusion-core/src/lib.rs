//! Core building blocks for guided latent diffusion
//!
//! Shared by every model crate in the workspace:
//!
//! - [`weights`] - flat checkpoint collections and their metadata
//! - [`params`] - parameter sources: random init or checkpoint reader
//! - [`adapter`] / [`registry`] - adapter slots inside frozen networks
//! - [`lora`] / [`hypernetwork`] - adapter sets attached to those slots
//! - [`network`] - the denoising network contract used by guidance
//!
//! # Example
//!
//! ```ignore
//! let unet = UNet::from_weights(&weights, None, &device)?;
//! let lora = LowRankAdapterSet::from_weights(&lora_weights, None, &device)?;
//! let report = lora.attach(&[&unet.adapters]);
//! // ... denoise ...
//! unet.adapters.clear();
//! ```

pub mod activation;
pub mod adapter;
pub mod attention;
pub mod error;
pub mod groupnorm;
pub mod hypernetwork;
pub mod layernorm;
pub mod lora;
pub mod network;
pub mod params;
pub mod precision;
pub mod registry;
pub mod variant;
pub mod weights;

pub use adapter::{AdaptableConv, AdaptableLinear, AdapterHandle, AdapterModule, Multiplier};
pub use error::ConfigError;
pub use groupnorm::GroupNorm;
pub use hypernetwork::{HnActivation, Hypernetwork, HypernetworkModule};
pub use layernorm::LayerNorm;
pub use lora::{AttachReport, LowRankAdapter, LowRankAdapterSet, LowRankForm};
pub use network::DenoisingNetwork;
pub use params::{Init, ParamSource, RandomInit, RecordingInit, WeightReader};
pub use precision::PrecisionMode;
pub use registry::{derive_adapter_name, Adapted, AdapterHost, AdapterRegistry, SiteVisitor, TargetPolicy};
pub use variant::{ModelVariant, PredictionType};
pub use weights::{Metadata, WeightCollection};
