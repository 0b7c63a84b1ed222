//! Layer normalization over the last dimension

use burn::prelude::*;

/// Layer normalization module
///
/// ```text
/// y = (x - mean(x)) / sqrt(var(x) + eps) * weight + bias
/// ```
///
/// The variance is the biased (population) one, matching the checkpoints
/// these models are trained with.
#[derive(Module, Debug)]
pub struct LayerNorm<B: Backend> {
    pub weight: Tensor<B, 1>,
    pub bias: Tensor<B, 1>,
    pub eps: f64,
}

impl<B: Backend> LayerNorm<B> {
    pub fn new(size: usize, eps: f64, device: &B::Device) -> Self {
        Self::from_parts(Tensor::ones([size], device), Tensor::zeros([size], device), eps)
    }

    pub fn from_parts(weight: Tensor<B, 1>, bias: Tensor<B, 1>, eps: f64) -> Self {
        Self { weight, bias, eps }
    }

    pub fn forward<const D: usize>(&self, x: Tensor<B, D>) -> Tensor<B, D> {
        let last_dim = D - 1;
        let (var, mean) = x.clone().var_mean_bias(last_dim);
        let x_norm = (x - mean) / (var + self.eps).sqrt();

        x_norm * self.weight.clone().unsqueeze() + self.bias.clone().unsqueeze()
    }
}
