//! Denoising network contract

use burn::prelude::*;
use burn::tensor::DType;

use crate::variant::PredictionType;

/// A network predicting noise (or velocity) for noisy latents
///
/// Guidance wrappers only ever talk to the denoiser through this trait, so
/// any model with this signature can be guided.
pub trait DenoisingNetwork<B: Backend> {
    /// `latents: [batch, c, h, w]`, `timesteps: [batch]`,
    /// `conditioning: [batch, seq, dim]`; returns `[batch, c, h, w]`
    fn forward(
        &self,
        latents: Tensor<B, 4>,
        timesteps: Tensor<B, 1>,
        conditioning: Tensor<B, 3>,
    ) -> Tensor<B, 4>;

    fn prediction_type(&self) -> PredictionType;

    /// Device of the first parameter
    fn device(&self) -> B::Device;

    /// Dtype of the first parameter
    fn dtype(&self) -> DType;
}

impl<B: Backend, N: DenoisingNetwork<B> + ?Sized> DenoisingNetwork<B> for &N {
    fn forward(
        &self,
        latents: Tensor<B, 4>,
        timesteps: Tensor<B, 1>,
        conditioning: Tensor<B, 3>,
    ) -> Tensor<B, 4> {
        (**self).forward(latents, timesteps, conditioning)
    }

    fn prediction_type(&self) -> PredictionType {
        (**self).prediction_type()
    }

    fn device(&self) -> B::Device {
        (**self).device()
    }

    fn dtype(&self) -> DType {
        (**self).dtype()
    }
}
