//! Activation functions not provided by `burn::tensor::activation`

use burn::prelude::*;
use burn::tensor::activation::sigmoid;

/// SiLU (Sigmoid Linear Unit) activation: x * sigmoid(x)
pub fn silu<B: Backend, const D: usize>(x: Tensor<B, D>) -> Tensor<B, D> {
    x.clone() * sigmoid(x)
}

/// Sigmoid approximation of GELU used by the SD 1.x text encoder
pub fn quick_gelu<B: Backend, const D: usize>(x: Tensor<B, D>) -> Tensor<B, D> {
    x.clone() * sigmoid(x * 1.702)
}
