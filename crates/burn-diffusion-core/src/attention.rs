//! Scaled dot-product attention shared by the text encoder, UNet and VAE

use burn::prelude::*;
use burn::tensor::activation::softmax;

/// Multi-head attention over `[batch, heads, seq, head_dim]` tensors
///
/// `mask` is added to the scores before the softmax and broadcast over batch
/// and heads.
pub fn qkv_attention<B: Backend>(
    q: Tensor<B, 4>,
    k: Tensor<B, 4>,
    v: Tensor<B, 4>,
    mask: Option<Tensor<B, 2>>,
) -> Tensor<B, 4> {
    let [_batch, _heads, _seq_len, head_dim] = q.dims();
    // Split the 1/sqrt(d) scale across q and k to keep half-precision scores in range
    let scale = (head_dim as f64).powf(-0.25);

    let q = q * scale;
    let k = k * scale;

    // [batch, heads, seq_q, seq_k]
    let attn = q.matmul(k.swap_dims(2, 3));
    let attn = match mask {
        Some(m) => attn + m.unsqueeze::<4>(),
        None => attn,
    };

    softmax(attn, 3).matmul(v)
}

/// `[batch, seq, heads * head_dim]` to `[batch, heads, seq, head_dim]`
pub fn split_heads<B: Backend>(x: Tensor<B, 3>, heads: usize) -> Tensor<B, 4> {
    let [batch, seq, dim] = x.dims();
    x.reshape([batch, seq, heads, dim / heads]).swap_dims(1, 2)
}

/// Inverse of [`split_heads`]
pub fn merge_heads<B: Backend>(x: Tensor<B, 4>) -> Tensor<B, 3> {
    let [batch, heads, seq, head_dim] = x.dims();
    x.swap_dims(1, 2).reshape([batch, seq, heads * head_dim])
}

/// Upper triangular `-inf` mask that hides future positions
pub fn causal_mask<B: Backend>(seq_len: usize, device: &B::Device) -> Tensor<B, 2> {
    let mut mask_data = vec![0.0f32; seq_len * seq_len];
    for i in 0..seq_len {
        for j in (i + 1)..seq_len {
            mask_data[i * seq_len + j] = f32::NEG_INFINITY;
        }
    }
    Tensor::<B, 1>::from_floats(mask_data.as_slice(), device).reshape([seq_len, seq_len])
}
