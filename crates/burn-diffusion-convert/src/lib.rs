//! Checkpoint loading
//!
//! Reads `.safetensors` files into a [`WeightCollection`](burn_diffusion_core::WeightCollection)
//! that any model constructor accepts. Header metadata (`__metadata__`)
//! becomes the collection's metadata.
//!
//! ```ignore
//! use burn_diffusion_convert::load_weights;
//!
//! let weights = load_weights("unet.safetensors")?;
//! let unet = UNet::from_weights(&weights, None, &device)?;
//! ```

pub mod loader;

pub use loader::{load_weights, LoadError, SafeTensorFile};
