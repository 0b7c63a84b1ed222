//! UNet building blocks: resnets, spatial transformers, down/up sampling
//!
//! Every block is built from a [`ParamSource`] under its diffusers path, so
//! the same code constructs random, recorded and loaded networks.

use burn::nn::conv::Conv2d;
use burn::prelude::*;
use burn::tensor::activation::gelu;

use burn_diffusion_core::activation::silu;
use burn_diffusion_core::attention::{merge_heads, qkv_attention, split_heads};
use burn_diffusion_core::params::{self, join, ParamSource};
use burn_diffusion_core::{AdaptableConv, AdaptableLinear, GroupNorm, LayerNorm, SiteVisitor};

/// Frequencies of the sinusoidal timestep embedding
pub fn timestep_freqs<B: Backend>(dim: usize, device: &B::Device) -> Tensor<B, 1> {
    let half_dim = dim / 2;
    let max_period = 10000.0f64;

    let freqs: Vec<f32> = (0..half_dim)
        .map(|i| (-((i as f64) / half_dim as f64) * max_period.ln()).exp() as f32)
        .collect();

    Tensor::<B, 1>::from_data(TensorData::new(freqs, [half_dim]), device)
}

/// Sinusoidal timestep embedding, cosine half first
pub fn timestep_embedding<B: Backend>(timesteps: Tensor<B, 1>, freqs: Tensor<B, 1>) -> Tensor<B, 2> {
    let [batch] = timesteps.dims();
    let [half_dim] = freqs.dims();
    let args = timesteps.reshape([batch, 1]) * freqs.reshape([1, half_dim]);

    Tensor::cat(vec![args.clone().cos(), args.sin()], 1)
}

/// ResNet block with time embedding
#[derive(Module, Debug)]
pub struct ResnetBlock<B: Backend> {
    pub norm1: GroupNorm<B>,
    pub conv1: Conv2d<B>,
    pub time_emb_proj: burn::nn::Linear<B>,
    pub norm2: GroupNorm<B>,
    pub conv2: Conv2d<B>,
    /// 1x1 skip projection when channel counts differ
    pub conv_shortcut: Option<Conv2d<B>>,
}

impl<B: Backend> ResnetBlock<B> {
    pub fn build<S: ParamSource<B>>(
        src: &mut S,
        path: &str,
        channels: [usize; 2],
        temb_dim: usize,
        groups: usize,
    ) -> Self {
        let [c_in, c_out] = channels;
        Self {
            norm1: params::group_norm(src, &join(path, "norm1"), groups, c_in, 1e-5),
            conv1: params::conv2d(src, &join(path, "conv1"), [c_in, c_out], 3, 1, 1),
            time_emb_proj: params::linear(src, &join(path, "time_emb_proj"), temb_dim, c_out, true),
            norm2: params::group_norm(src, &join(path, "norm2"), groups, c_out, 1e-5),
            conv2: params::conv2d(src, &join(path, "conv2"), [c_out, c_out], 3, 1, 1),
            conv_shortcut: (c_in != c_out)
                .then(|| params::conv2d(src, &join(path, "conv_shortcut"), [c_in, c_out], 1, 1, 0)),
        }
    }

    pub fn forward(&self, x: Tensor<B, 4>, temb: Tensor<B, 2>) -> Tensor<B, 4> {
        let residual = match &self.conv_shortcut {
            Some(conv) => conv.forward(x.clone()),
            None => x.clone(),
        };

        let h = self.conv1.forward(silu(self.norm1.forward(x)));
        let [b, c, _, _] = h.dims();
        let h = h + self.time_emb_proj.forward(silu(temb)).reshape([b, c, 1, 1]);
        let h = self.conv2.forward(silu(self.norm2.forward(h)));

        h + residual
    }
}

/// Projection into and out of a spatial transformer
///
/// SD 1.x checkpoints use 1x1 convolutions, SD 2.x linear layers.
#[derive(Module, Debug)]
pub struct Projection<B: Backend> {
    pub conv: Option<AdaptableConv<B>>,
    pub linear: Option<AdaptableLinear<B>>,
}

impl<B: Backend> Projection<B> {
    fn build<S: ParamSource<B>>(src: &mut S, path: &str, channels: [usize; 2], linear: bool) -> Self {
        let [c_in, c_out] = channels;
        if linear {
            Self {
                conv: None,
                linear: Some(AdaptableLinear::new(params::linear(src, path, c_in, c_out, true))),
            }
        } else {
            Self {
                conv: Some(AdaptableConv::new(params::conv2d(src, path, channels, 1, 1, 0))),
                linear: None,
            }
        }
    }

    fn is_linear(&self) -> bool {
        self.linear.is_some()
    }

    /// NCHW forward (conv form)
    fn forward_spatial(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        match &self.conv {
            Some(conv) => conv.forward(x),
            None => x,
        }
    }

    /// Sequence forward (linear form)
    fn forward_sequence(&self, x: Tensor<B, 3>) -> Tensor<B, 3> {
        match &self.linear {
            Some(linear) => linear.forward(x),
            None => x,
        }
    }

    fn visit_sites(&mut self, name: &str, visitor: &mut SiteVisitor<B>) {
        if let Some(conv) = &mut self.conv {
            visitor.conv(name, conv);
        }
        if let Some(linear) = &mut self.linear {
            visitor.linear(name, linear);
        }
    }
}

/// Spatial transformer (`Transformer2DModel`)
#[derive(Module, Debug)]
pub struct SpatialTransformer<B: Backend> {
    pub norm: GroupNorm<B>,
    pub proj_in: Projection<B>,
    pub transformer_blocks: Vec<TransformerBlock<B>>,
    pub proj_out: Projection<B>,
}

/// Shape of one spatial transformer
#[derive(Debug, Clone, Copy)]
pub struct TransformerShape {
    pub channels: usize,
    pub num_heads: usize,
    pub context_dim: usize,
    pub depth: usize,
    pub groups: usize,
    pub linear_projection: bool,
}

impl<B: Backend> SpatialTransformer<B> {
    pub fn build<S: ParamSource<B>>(src: &mut S, path: &str, shape: TransformerShape) -> Self {
        let dim = shape.channels;
        let norm = params::group_norm(src, &join(path, "norm"), shape.groups, dim, 1e-6);
        let proj_in = Projection::build(src, &join(path, "proj_in"), [dim, dim], shape.linear_projection);
        let transformer_blocks = (0..shape.depth)
            .map(|i| {
                TransformerBlock::build(
                    &mut *src,
                    &join(path, &format!("transformer_blocks.{i}")),
                    dim,
                    shape.num_heads,
                    shape.context_dim,
                )
            })
            .collect();
        let proj_out = Projection::build(src, &join(path, "proj_out"), [dim, dim], shape.linear_projection);

        Self {
            norm,
            proj_in,
            transformer_blocks,
            proj_out,
        }
    }

    pub fn forward(&self, x: Tensor<B, 4>, context: Tensor<B, 3>) -> Tensor<B, 4> {
        let [b, c, h, w] = x.dims();
        let residual = x.clone();

        let x = self.proj_in.forward_spatial(self.norm.forward(x));
        // [b, c, h, w] -> [b, h*w, c]
        let x = x.reshape([b, c, h * w]).swap_dims(1, 2);
        let mut x = self.proj_in.forward_sequence(x);

        for block in &self.transformer_blocks {
            x = block.forward(x, context.clone());
        }

        let x = self.proj_out.forward_sequence(x);
        let x = x.swap_dims(1, 2).reshape([b, c, h, w]);
        self.proj_out.forward_spatial(x) + residual
    }

    /// Reports this container and its adaptable leaves
    pub fn visit_sites(&mut self, name: &str, visitor: &mut SiteVisitor<B>) {
        visitor.enter(name, "Transformer2DModel");
        self.proj_in.visit_sites("proj_in", visitor);
        for (i, block) in self.transformer_blocks.iter_mut().enumerate() {
            visitor.enter(&format!("transformer_blocks.{i}"), "BasicTransformerBlock");
            block.visit_sites(visitor);
            visitor.exit();
        }
        self.proj_out.visit_sites("proj_out", visitor);
        visitor.exit();
    }

    pub fn uses_linear_projection(&self) -> bool {
        self.proj_in.is_linear()
    }
}

/// Self-attention, cross-attention and GEGLU feed-forward
#[derive(Module, Debug)]
pub struct TransformerBlock<B: Backend> {
    pub norm1: LayerNorm<B>,
    pub attn1: CrossAttention<B>,
    pub norm2: LayerNorm<B>,
    pub attn2: CrossAttention<B>,
    pub norm3: LayerNorm<B>,
    pub ff: FeedForward<B>,
}

impl<B: Backend> TransformerBlock<B> {
    fn build<S: ParamSource<B>>(
        src: &mut S,
        path: &str,
        dim: usize,
        num_heads: usize,
        context_dim: usize,
    ) -> Self {
        Self {
            norm1: params::layer_norm(src, &join(path, "norm1"), dim, 1e-5),
            attn1: CrossAttention::build(src, &join(path, "attn1"), dim, dim, num_heads),
            norm2: params::layer_norm(src, &join(path, "norm2"), dim, 1e-5),
            attn2: CrossAttention::build(src, &join(path, "attn2"), dim, context_dim, num_heads),
            norm3: params::layer_norm(src, &join(path, "norm3"), dim, 1e-5),
            ff: FeedForward::build(src, &join(path, "ff"), dim, dim * 4),
        }
    }

    pub fn forward(&self, x: Tensor<B, 3>, context: Tensor<B, 3>) -> Tensor<B, 3> {
        let x = x.clone() + self.attn1.forward(self.norm1.forward(x), None);
        let x = x.clone() + self.attn2.forward(self.norm2.forward(x), Some(context));
        x.clone() + self.ff.forward(self.norm3.forward(x))
    }

    fn visit_sites(&mut self, visitor: &mut SiteVisitor<B>) {
        self.attn1.visit_sites("attn1", visitor);
        self.attn2.visit_sites("attn2", visitor);

        visitor.enter("ff", "FeedForward");
        visitor.enter("net", "ModuleList");
        visitor.enter("0", "GEGLU");
        visitor.linear("proj", &mut self.ff.proj);
        visitor.exit();
        visitor.linear("2", &mut self.ff.out);
        visitor.exit();
        visitor.exit();
    }
}

/// Cross-attention (self-attention when no context is given)
#[derive(Module, Debug)]
pub struct CrossAttention<B: Backend> {
    pub to_q: AdaptableLinear<B>,
    pub to_k: AdaptableLinear<B>,
    pub to_v: AdaptableLinear<B>,
    /// `to_out.0`
    pub to_out: AdaptableLinear<B>,
    pub num_heads: usize,
}

impl<B: Backend> CrossAttention<B> {
    fn build<S: ParamSource<B>>(
        src: &mut S,
        path: &str,
        query_dim: usize,
        context_dim: usize,
        num_heads: usize,
    ) -> Self {
        Self {
            to_q: AdaptableLinear::new(params::linear(src, &join(path, "to_q"), query_dim, query_dim, false)),
            to_k: AdaptableLinear::new(params::linear(src, &join(path, "to_k"), context_dim, query_dim, false)),
            to_v: AdaptableLinear::new(params::linear(src, &join(path, "to_v"), context_dim, query_dim, false)),
            to_out: AdaptableLinear::new(params::linear(src, &join(path, "to_out.0"), query_dim, query_dim, true)),
            num_heads,
        }
    }

    pub fn forward(&self, x: Tensor<B, 3>, context: Option<Tensor<B, 3>>) -> Tensor<B, 3> {
        let context = context.unwrap_or_else(|| x.clone());

        let q = split_heads(self.to_q.forward(x), self.num_heads);
        let k = split_heads(self.to_k.forward(context.clone()), self.num_heads);
        let v = split_heads(self.to_v.forward(context), self.num_heads);

        self.to_out.forward(merge_heads(qkv_attention(q, k, v, None)))
    }

    fn visit_sites(&mut self, name: &str, visitor: &mut SiteVisitor<B>) {
        visitor.enter(name, "Attention");
        visitor.linear("to_q", &mut self.to_q);
        visitor.linear("to_k", &mut self.to_k);
        visitor.linear("to_v", &mut self.to_v);
        visitor.enter("to_out", "ModuleList");
        visitor.linear("0", &mut self.to_out);
        visitor.exit();
        visitor.exit();
    }
}

/// Feed-forward network with GEGLU activation
#[derive(Module, Debug)]
pub struct FeedForward<B: Backend> {
    /// `net.0.proj`, projects to twice the hidden size
    pub proj: AdaptableLinear<B>,
    /// `net.2`
    pub out: AdaptableLinear<B>,
}

impl<B: Backend> FeedForward<B> {
    fn build<S: ParamSource<B>>(src: &mut S, path: &str, dim: usize, hidden: usize) -> Self {
        Self {
            proj: AdaptableLinear::new(params::linear(src, &join(path, "net.0.proj"), dim, hidden * 2, true)),
            out: AdaptableLinear::new(params::linear(src, &join(path, "net.2"), hidden, dim, true)),
        }
    }

    pub fn forward(&self, x: Tensor<B, 3>) -> Tensor<B, 3> {
        let hidden = self.proj.forward(x);
        let [b, s, d] = hidden.dims();
        let half = d / 2;
        let x = hidden.clone().slice([0..b, 0..s, 0..half]);
        let gate = hidden.slice([0..b, 0..s, half..d]);

        self.out.forward(x * gelu(gate))
    }
}

/// Strided 3x3 convolution halving the resolution
#[derive(Module, Debug)]
pub struct Downsample<B: Backend> {
    pub conv: Conv2d<B>,
}

impl<B: Backend> Downsample<B> {
    pub fn build<S: ParamSource<B>>(src: &mut S, path: &str, channels: usize) -> Self {
        Self {
            conv: params::conv2d(src, &join(path, "conv"), [channels, channels], 3, 2, 1),
        }
    }

    pub fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        self.conv.forward(x)
    }
}

/// Nearest-neighbor 2x upsample followed by a 3x3 convolution
#[derive(Module, Debug)]
pub struct Upsample<B: Backend> {
    pub conv: Conv2d<B>,
}

impl<B: Backend> Upsample<B> {
    pub fn build<S: ParamSource<B>>(src: &mut S, path: &str, channels: usize) -> Self {
        Self {
            conv: params::conv2d(src, &join(path, "conv"), [channels, channels], 3, 1, 1),
        }
    }

    pub fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        self.conv.forward(upsample_nearest(x))
    }
}

/// Nearest-neighbor 2x spatial upsampling
pub fn upsample_nearest<B: Backend>(x: Tensor<B, 4>) -> Tensor<B, 4> {
    let [b, c, h, w] = x.dims();
    x.reshape([b, c, h, 1, w, 1])
        .repeat_dim(3, 2)
        .repeat_dim(5, 2)
        .reshape([b, c, h * 2, w * 2])
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::tensor::Distribution;
    use burn_diffusion_core::params::RandomInit;
    use burn_ndarray::NdArray;

    type TestBackend = NdArray;

    #[test]
    fn test_timestep_embedding_cos_first() {
        let device = Default::default();
        let freqs = timestep_freqs::<TestBackend>(8, &device);
        let t = Tensor::<TestBackend, 1>::zeros([2], &device);

        let emb = timestep_embedding(t, freqs).into_data().to_vec::<f32>().unwrap();
        assert_eq!(&emb[..8], &[1.0, 1.0, 1.0, 1.0, 0.0, 0.0, 0.0, 0.0]);
    }

    #[test]
    fn test_upsample_nearest() {
        let device = Default::default();
        let x = Tensor::<TestBackend, 4>::from_data(
            TensorData::new(vec![1.0f32, 2.0, 3.0, 4.0], [1, 1, 2, 2]),
            &device,
        );
        let y = upsample_nearest(x).into_data().to_vec::<f32>().unwrap();
        assert_eq!(
            y,
            vec![1.0, 1.0, 2.0, 2.0, 1.0, 1.0, 2.0, 2.0, 3.0, 3.0, 4.0, 4.0, 3.0, 3.0, 4.0, 4.0]
        );
    }

    #[test]
    fn test_spatial_transformer_shapes() {
        let device = Default::default();
        let mut src = RandomInit::<TestBackend>::new(&device);
        let x = Tensor::<TestBackend, 4>::random([2, 8, 4, 4], Distribution::Normal(0.0, 1.0), &device);
        let context = Tensor::<TestBackend, 3>::random([2, 3, 6], Distribution::Normal(0.0, 1.0), &device);

        for linear_projection in [false, true] {
            let shape = TransformerShape {
                channels: 8,
                num_heads: 2,
                context_dim: 6,
                depth: 1,
                groups: 4,
                linear_projection,
            };
            let block = SpatialTransformer::build(&mut src, "attn", shape);
            assert_eq!(block.uses_linear_projection(), linear_projection);
            assert_eq!(block.forward(x.clone(), context.clone()).dims(), [2, 8, 4, 4]);
        }
    }

    #[test]
    fn test_resnet_shortcut() {
        let device = Default::default();
        let mut src = RandomInit::<TestBackend>::new(&device);
        let block = ResnetBlock::build(&mut src, "res", [8, 16], 32, 4);
        assert!(block.conv_shortcut.is_some());

        let x = Tensor::<TestBackend, 4>::random([1, 8, 4, 4], Distribution::Normal(0.0, 1.0), &device);
        let temb = Tensor::<TestBackend, 2>::random([1, 32], Distribution::Normal(0.0, 1.0), &device);
        assert_eq!(block.forward(x, temb).dims(), [1, 16, 4, 4]);
    }
}
