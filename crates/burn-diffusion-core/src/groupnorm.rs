//! Group normalization
//!
//! Used by every resnet and attention block in the UNet and VAE. Statistics
//! are computed in f32 regardless of the tensor dtype; half-precision
//! reductions over `group_size * height * width` elements overflow.

use burn::prelude::*;
use burn::tensor::DType;

/// Group normalization module
///
/// ```text
/// y = (x - mean(x_group)) / sqrt(var(x_group) + eps) * weight + bias
/// ```
#[derive(Module, Debug)]
pub struct GroupNorm<B: Backend> {
    /// Number of groups to divide channels into
    pub num_groups: usize,
    /// Scale parameter (gamma), shape [num_channels]
    pub weight: Tensor<B, 1>,
    /// Bias parameter (beta), shape [num_channels]
    pub bias: Tensor<B, 1>,
    pub eps: f64,
}

impl<B: Backend> GroupNorm<B> {
    /// Identity-initialized group norm
    pub fn new(num_groups: usize, num_channels: usize, eps: f64, device: &B::Device) -> Self {
        Self::from_parts(
            num_groups,
            Tensor::ones([num_channels], device),
            Tensor::zeros([num_channels], device),
            eps,
        )
    }

    pub fn from_parts(num_groups: usize, weight: Tensor<B, 1>, bias: Tensor<B, 1>, eps: f64) -> Self {
        Self {
            num_groups,
            weight,
            bias,
            eps,
        }
    }

    /// Normalizes a `[batch, channels, height, width]` tensor
    pub fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        let [batch, channels, height, width] = x.dims();
        let group_size = channels / self.num_groups;
        let original_dtype = x.dtype();

        let x = x
            .reshape([batch, self.num_groups, group_size * height * width])
            .cast(DType::F32);
        let mean = x.clone().mean_dim(2);
        let diff = x - mean;
        let var = diff.clone().powi_scalar(2).mean_dim(2);
        let x = diff / (var + self.eps).sqrt();

        let x = x
            .cast(original_dtype)
            .reshape([batch, channels, height, width]);

        let weight = self.weight.clone().reshape([1, channels, 1, 1]);
        let bias = self.bias.clone().reshape([1, channels, 1, 1]);
        x * weight + bias
    }
}
