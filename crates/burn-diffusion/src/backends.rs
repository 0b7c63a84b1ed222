//! Backend support for burn-diffusion
//!
//! Enable the desired backend via feature flags:
//!
//! - `ndarray`: CPU backend using ndarray (no GPU required, default)
//! - `wgpu`: WebGPU backend (cross-platform GPU support)
//!
//! ```toml
//! [dependencies]
//! burn-diffusion = { version = "0.1", features = ["wgpu"] }
//! ```
//!
//! ```ignore
//! use burn_diffusion::backends::{default_device, DefaultBackend};
//!
//! let device = default_device();
//! let unet = burn_diffusion::load_unet::<DefaultBackend>("unet.safetensors", None, &device)?;
//! ```

#[cfg(feature = "ndarray")]
pub use burn_ndarray::{NdArray, NdArrayDevice};

#[cfg(feature = "wgpu")]
pub use burn_wgpu::{Wgpu, WgpuDevice};

/// Type alias for the default backend when using ndarray feature
#[cfg(feature = "ndarray")]
pub type DefaultBackend = NdArray;

/// Type alias for the default backend when using wgpu feature
#[cfg(all(feature = "wgpu", not(feature = "ndarray")))]
pub type DefaultBackend = Wgpu;

/// Get the default device for the enabled backend
#[cfg(feature = "ndarray")]
pub fn default_device() -> NdArrayDevice {
    NdArrayDevice::default()
}

/// Get the default device for the enabled backend
#[cfg(all(feature = "wgpu", not(feature = "ndarray")))]
pub fn default_device() -> WgpuDevice {
    WgpuDevice::default()
}

#[cfg(test)]
mod tests {
    #[cfg(any(feature = "ndarray", feature = "wgpu"))]
    use super::*;

    #[test]
    #[cfg(any(feature = "ndarray", feature = "wgpu"))]
    fn test_default_device() {
        let _device = default_device();
    }
}
