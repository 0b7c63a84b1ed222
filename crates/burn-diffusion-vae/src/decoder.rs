//! VAE decoder: latent -> image
//!
//! Also holds the blocks shared with the encoder.

use burn::nn::conv::Conv2d;
use burn::nn::Linear;
use burn::prelude::*;
use burn::tensor::module::interpolate;
use burn::tensor::ops::{InterpolateMode, InterpolateOptions};

use burn_diffusion_core::activation::silu;
use burn_diffusion_core::attention::{merge_heads, qkv_attention, split_heads};
use burn_diffusion_core::params::{self, join, ParamSource};
use burn_diffusion_core::GroupNorm;

use crate::vae::VaeConfig;

pub(crate) const NORM_EPS: f64 = 1e-6;

/// Decoder (`decoder.*`)
#[derive(Module, Debug)]
pub struct Decoder<B: Backend> {
    pub conv_in: Conv2d<B>,
    pub mid_block: MidBlock<B>,
    pub up_blocks: Vec<DecoderBlock<B>>,
    pub conv_norm_out: GroupNorm<B>,
    pub conv_out: Conv2d<B>,
}

impl<B: Backend> Decoder<B> {
    pub fn build<S: ParamSource<B>>(src: &mut S, path: &str, config: &VaeConfig) -> Self {
        let groups = config.norm_num_groups;
        let reversed: Vec<usize> = config.block_out_channels.iter().rev().copied().collect();
        let levels = reversed.len();
        let top = reversed[0];

        let conv_in = params::conv2d(src, &join(path, "conv_in"), [config.latent_channels, top], 3, 1, 1);
        let mid_block = MidBlock::build(src, &join(path, "mid_block"), top, groups);

        let mut up_blocks = Vec::with_capacity(levels);
        let mut c_prev = top;
        for (i, &c_out) in reversed.iter().enumerate() {
            let block_path = join(path, &format!("up_blocks.{i}"));
            let resnets = (0..=config.layers_per_block)
                .map(|j| {
                    let c_in = if j == 0 { c_prev } else { c_out };
                    ResnetBlock::build(&mut *src, &format!("{block_path}.resnets.{j}"), [c_in, c_out], groups)
                })
                .collect();
            let upsample = (i + 1 < levels).then(|| {
                params::conv2d(&mut *src, &format!("{block_path}.upsamplers.0.conv"), [c_out, c_out], 3, 1, 1)
            });
            up_blocks.push(DecoderBlock { resnets, upsample });
            c_prev = c_out;
        }

        let bottom = reversed[levels - 1];
        Self {
            conv_in,
            mid_block,
            up_blocks,
            conv_norm_out: params::group_norm(src, &join(path, "conv_norm_out"), groups, bottom, NORM_EPS),
            conv_out: params::conv2d(src, &join(path, "conv_out"), [bottom, config.out_channels], 3, 1, 1),
        }
    }

    /// `[b, latent, h, w]` to `[b, out, h * 2^(levels-1), w * 2^(levels-1)]`
    pub fn forward(&self, z: Tensor<B, 4>) -> Tensor<B, 4> {
        let mut h = self.conv_in.forward(z);
        h = self.mid_block.forward(h);
        for block in &self.up_blocks {
            h = block.forward(h);
        }
        self.conv_out.forward(silu(self.conv_norm_out.forward(h)))
    }
}

/// Resnets followed by an optional 2x upsampling conv
#[derive(Module, Debug)]
pub struct DecoderBlock<B: Backend> {
    pub resnets: Vec<ResnetBlock<B>>,
    /// `upsamplers.0.conv`
    pub upsample: Option<Conv2d<B>>,
}

impl<B: Backend> DecoderBlock<B> {
    pub fn forward(&self, mut x: Tensor<B, 4>) -> Tensor<B, 4> {
        for resnet in &self.resnets {
            x = resnet.forward(x);
        }

        if let Some(conv) = &self.upsample {
            let [_, _, h, w] = x.dims();
            x = interpolate(x, [h * 2, w * 2], InterpolateOptions::new(InterpolateMode::Nearest));
            x = conv.forward(x);
        }
        x
    }
}

/// Resnet, self-attention, resnet
#[derive(Module, Debug)]
pub struct MidBlock<B: Backend> {
    pub resnet_0: ResnetBlock<B>,
    pub attention: SelfAttention<B>,
    pub resnet_1: ResnetBlock<B>,
}

impl<B: Backend> MidBlock<B> {
    pub fn build<S: ParamSource<B>>(src: &mut S, path: &str, channels: usize, groups: usize) -> Self {
        Self {
            resnet_0: ResnetBlock::build(src, &join(path, "resnets.0"), [channels, channels], groups),
            attention: SelfAttention::build(src, &join(path, "attentions.0"), channels, groups),
            resnet_1: ResnetBlock::build(src, &join(path, "resnets.1"), [channels, channels], groups),
        }
    }

    pub fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        let h = self.resnet_0.forward(x);
        let h = self.attention.forward(h);
        self.resnet_1.forward(h)
    }
}

/// Resnet block without time conditioning
#[derive(Module, Debug)]
pub struct ResnetBlock<B: Backend> {
    pub norm1: GroupNorm<B>,
    pub conv1: Conv2d<B>,
    pub norm2: GroupNorm<B>,
    pub conv2: Conv2d<B>,
    pub conv_shortcut: Option<Conv2d<B>>,
}

impl<B: Backend> ResnetBlock<B> {
    pub fn build<S: ParamSource<B>>(src: &mut S, path: &str, channels: [usize; 2], groups: usize) -> Self {
        let [c_in, c_out] = channels;
        Self {
            norm1: params::group_norm(src, &join(path, "norm1"), groups, c_in, NORM_EPS),
            conv1: params::conv2d(src, &join(path, "conv1"), [c_in, c_out], 3, 1, 1),
            norm2: params::group_norm(src, &join(path, "norm2"), groups, c_out, NORM_EPS),
            conv2: params::conv2d(src, &join(path, "conv2"), [c_out, c_out], 3, 1, 1),
            conv_shortcut: (c_in != c_out)
                .then(|| params::conv2d(&mut *src, &join(path, "conv_shortcut"), [c_in, c_out], 1, 1, 0)),
        }
    }

    pub fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        let residual = match &self.conv_shortcut {
            Some(conv) => conv.forward(x.clone()),
            None => x.clone(),
        };

        let h = self.conv1.forward(silu(self.norm1.forward(x)));
        let h = self.conv2.forward(silu(self.norm2.forward(h)));
        h + residual
    }
}

/// Single-head spatial self-attention
#[derive(Module, Debug)]
pub struct SelfAttention<B: Backend> {
    pub group_norm: GroupNorm<B>,
    pub to_q: Linear<B>,
    pub to_k: Linear<B>,
    pub to_v: Linear<B>,
    /// `to_out.0`
    pub to_out: Linear<B>,
}

impl<B: Backend> SelfAttention<B> {
    pub fn build<S: ParamSource<B>>(src: &mut S, path: &str, channels: usize, groups: usize) -> Self {
        Self {
            group_norm: params::group_norm(src, &join(path, "group_norm"), groups, channels, NORM_EPS),
            to_q: params::linear(src, &join(path, "to_q"), channels, channels, true),
            to_k: params::linear(src, &join(path, "to_k"), channels, channels, true),
            to_v: params::linear(src, &join(path, "to_v"), channels, channels, true),
            to_out: params::linear(src, &join(path, "to_out.0"), channels, channels, true),
        }
    }

    pub fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        let [b, c, h, w] = x.dims();
        let residual = x.clone();

        // [b, c, h, w] -> [b, h*w, c]
        let x = self.group_norm.forward(x).reshape([b, c, h * w]).swap_dims(1, 2);

        let q = split_heads(self.to_q.forward(x.clone()), 1);
        let k = split_heads(self.to_k.forward(x.clone()), 1);
        let v = split_heads(self.to_v.forward(x), 1);
        let out = self.to_out.forward(merge_heads(qkv_attention(q, k, v, None)));

        out.swap_dims(1, 2).reshape([b, c, h, w]) + residual
    }
}
