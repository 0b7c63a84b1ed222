//! Conditional UNet (SD 1.x / 2.x)
//!
//! Parameter keys follow the diffusers `UNet2DConditionModel` layout:
//!
//! ```text
//! time_embedding.linear_{1,2}
//! conv_in
//! down_blocks.{i}.resnets.{j}       down_blocks.{i}.attentions.{j}
//! down_blocks.{i}.downsamplers.0.conv
//! mid_block.resnets.{0,1}           mid_block.attentions.0
//! up_blocks.{i}.resnets.{j}         up_blocks.{i}.attentions.{j}
//! up_blocks.{i}.upsamplers.0.conv
//! conv_norm_out, conv_out
//! ```

use burn::nn::conv::Conv2d;
use burn::nn::Linear;
use burn::prelude::*;
use burn::tensor::DType;

use burn_diffusion_core::activation::silu;
use burn_diffusion_core::params::{self, ParamSource, RandomInit, WeightReader};
use burn_diffusion_core::{
    Adapted, AdapterHost, ConfigError, DenoisingNetwork, GroupNorm, ModelVariant, PrecisionMode,
    PredictionType, SiteVisitor, WeightCollection,
};

use crate::blocks::{
    timestep_embedding, timestep_freqs, Downsample, ResnetBlock, SpatialTransformer,
    TransformerShape, Upsample,
};

/// UNet configuration
#[derive(Debug, Clone)]
pub struct UNetConfig {
    /// Latent channels in and out
    pub in_channels: usize,
    pub out_channels: usize,
    /// Channels of the first level
    pub model_channels: usize,
    /// Channel multiplier per resolution level
    pub channel_mult: Vec<usize>,
    /// Whether each level has spatial transformers
    pub attention_levels: Vec<bool>,
    /// Attention heads per level
    pub num_heads: Vec<usize>,
    pub layers_per_block: usize,
    /// Text embedding width
    pub context_dim: usize,
    pub transformer_depth: usize,
    /// Linear (SD 2.x) instead of 1x1 conv (SD 1.x) transformer projections
    pub linear_projection: bool,
    pub norm_num_groups: usize,
}

impl UNetConfig {
    /// SD 1.x: 768-wide context, 8 heads everywhere
    pub fn sd_v1() -> Self {
        Self {
            in_channels: 4,
            out_channels: 4,
            model_channels: 320,
            channel_mult: vec![1, 2, 4, 4],
            attention_levels: vec![true, true, true, false],
            num_heads: vec![8, 8, 8, 8],
            layers_per_block: 2,
            context_dim: 768,
            transformer_depth: 1,
            linear_projection: false,
            norm_num_groups: 32,
        }
    }

    /// SD 2.x: 1024-wide context, 64-wide heads, linear projections
    pub fn sd_v2() -> Self {
        Self {
            num_heads: vec![5, 10, 20, 20],
            context_dim: 1024,
            linear_projection: true,
            ..Self::sd_v1()
        }
    }

    pub fn for_variant(variant: ModelVariant) -> Self {
        match variant {
            ModelVariant::SdV1 => Self::sd_v1(),
            ModelVariant::SdV2 => Self::sd_v2(),
        }
    }

    fn block_channels(&self) -> Vec<usize> {
        self.channel_mult
            .iter()
            .map(|mult| self.model_channels * mult)
            .collect()
    }

    fn transformer(&self, level: usize, channels: usize) -> TransformerShape {
        TransformerShape {
            channels,
            num_heads: self.num_heads[level],
            context_dim: self.context_dim,
            depth: self.transformer_depth,
            groups: self.norm_num_groups,
            linear_projection: self.linear_projection,
        }
    }
}

/// Conditional UNet denoiser
#[derive(Module, Debug)]
pub struct UNet<B: Backend> {
    pub time_linear_1: Linear<B>,
    pub time_linear_2: Linear<B>,
    pub time_freqs: Tensor<B, 1>,
    pub conv_in: Conv2d<B>,
    pub down_blocks: Vec<DownBlock<B>>,
    pub mid_block: MidBlock<B>,
    pub up_blocks: Vec<UpBlock<B>>,
    pub conv_norm_out: GroupNorm<B>,
    pub conv_out: Conv2d<B>,
    #[module(skip)]
    pub prediction_type: PredictionType,
}

impl<B: Backend> UNet<B> {
    /// Builds the network, asking `src` for every parameter
    pub fn build<S: ParamSource<B>>(
        config: &UNetConfig,
        prediction_type: PredictionType,
        src: &mut S,
    ) -> Self {
        let ch = config.model_channels;
        let temb_dim = ch * 4;
        let groups = config.norm_num_groups;
        let block_channels = config.block_channels();
        let levels = block_channels.len();

        let time_linear_1 = params::linear(src, "time_embedding.linear_1", ch, temb_dim, true);
        let time_linear_2 = params::linear(src, "time_embedding.linear_2", temb_dim, temb_dim, true);
        let conv_in = params::conv2d(src, "conv_in", [config.in_channels, ch], 3, 1, 1);

        let mut down_blocks = Vec::with_capacity(levels);
        let mut c_in = ch;
        for (level, &c_out) in block_channels.iter().enumerate() {
            let path = format!("down_blocks.{level}");
            let resnets = (0..config.layers_per_block)
                .map(|j| {
                    let c = if j == 0 { c_in } else { c_out };
                    ResnetBlock::build(&mut *src, &format!("{path}.resnets.{j}"), [c, c_out], temb_dim, groups)
                })
                .collect();
            let attentions = if config.attention_levels[level] {
                (0..config.layers_per_block)
                    .map(|j| {
                        SpatialTransformer::build(
                            &mut *src,
                            &format!("{path}.attentions.{j}"),
                            config.transformer(level, c_out),
                        )
                    })
                    .collect()
            } else {
                Vec::new()
            };
            let downsampler = (level + 1 < levels)
                .then(|| Downsample::build(&mut *src, &format!("{path}.downsamplers.0"), c_out));

            down_blocks.push(DownBlock {
                resnets,
                attentions,
                downsampler,
            });
            c_in = c_out;
        }

        let mid_ch = block_channels[levels - 1];
        let mid_block = MidBlock {
            resnet_0: ResnetBlock::build(src, "mid_block.resnets.0", [mid_ch, mid_ch], temb_dim, groups),
            attention: SpatialTransformer::build(
                src,
                "mid_block.attentions.0",
                config.transformer(levels - 1, mid_ch),
            ),
            resnet_1: ResnetBlock::build(src, "mid_block.resnets.1", [mid_ch, mid_ch], temb_dim, groups),
        };

        let mut up_blocks = Vec::with_capacity(levels);
        let mut c_out = mid_ch;
        for i in 0..levels {
            let level = levels - 1 - i;
            let path = format!("up_blocks.{i}");
            let c_prev = c_out;
            c_out = block_channels[level];
            let c_skip_last = block_channels[level.saturating_sub(1)];

            let resnets = (0..=config.layers_per_block)
                .map(|j| {
                    let c_res = if j == 0 { c_prev } else { c_out };
                    let c_skip = if j == config.layers_per_block { c_skip_last } else { c_out };
                    ResnetBlock::build(
                        &mut *src,
                        &format!("{path}.resnets.{j}"),
                        [c_res + c_skip, c_out],
                        temb_dim,
                        groups,
                    )
                })
                .collect();
            let attentions = if config.attention_levels[level] {
                (0..=config.layers_per_block)
                    .map(|j| {
                        SpatialTransformer::build(
                            &mut *src,
                            &format!("{path}.attentions.{j}"),
                            config.transformer(level, c_out),
                        )
                    })
                    .collect()
            } else {
                Vec::new()
            };
            let upsampler = (i + 1 < levels)
                .then(|| Upsample::build(&mut *src, &format!("{path}.upsamplers.0"), c_out));

            up_blocks.push(UpBlock {
                resnets,
                attentions,
                upsampler,
            });
        }

        let conv_norm_out = params::group_norm(src, "conv_norm_out", groups, ch, 1e-5);
        let conv_out = params::conv2d(src, "conv_out", [ch, config.out_channels], 3, 1, 1);

        Self {
            time_linear_1,
            time_linear_2,
            time_freqs: timestep_freqs(ch, &src.device()),
            conv_in,
            down_blocks,
            mid_block,
            up_blocks,
            conv_norm_out,
            conv_out,
            prediction_type,
        }
    }

    /// Randomly initialized network
    pub fn init(config: &UNetConfig, prediction_type: PredictionType, device: &B::Device) -> Self {
        Self::build(config, prediction_type, &mut RandomInit::new(device))
    }

    /// Loads a network of a known configuration
    pub fn load(
        config: &UNetConfig,
        prediction_type: PredictionType,
        weights: &WeightCollection,
        precision: Option<PrecisionMode>,
        device: &B::Device,
    ) -> Result<Self, ConfigError> {
        let dtype = weights.resolve_precision(precision)?.map(|mode| mode.dtype());
        let mut reader = WeightReader::new(weights, dtype, device);
        let mut unet = Self::build(config, prediction_type, &mut reader);
        reader.finish()?;
        if let Some(dtype) = dtype {
            unet.time_freqs = unet.time_freqs.cast(dtype);
        }
        Ok(unet)
    }

    /// Loads the network described by the checkpoint metadata (`model_type`,
    /// `prediction_type`) and scans it for adapter slots
    pub fn from_weights(
        weights: &WeightCollection,
        precision: Option<PrecisionMode>,
        device: &B::Device,
    ) -> Result<Adapted<Self, B>, ConfigError> {
        let metadata = weights.require_metadata("model_type")?;
        let variant = metadata.variant()?;
        let prediction_type = metadata.prediction_type()?;
        let config = UNetConfig::for_variant(variant);

        let unet = Self::load(&config, prediction_type, weights, precision, device)?;
        let adapted = Adapted::new(unet)?;
        tracing::info!(
            %variant,
            %prediction_type,
            adapter_slots = adapted.adapters.len(),
            "loaded UNet"
        );
        Ok(adapted)
    }

    /// Predicted noise (or velocity) `[batch, out_channels, h, w]`
    ///
    /// `h` and `w` must be divisible by `2^(levels - 1)`.
    pub fn forward(
        &self,
        x: Tensor<B, 4>,
        timesteps: Tensor<B, 1>,
        context: Tensor<B, 3>,
    ) -> Tensor<B, 4> {
        let temb = timestep_embedding(timesteps, self.time_freqs.clone());
        let temb = self.time_linear_2.forward(silu(self.time_linear_1.forward(temb)));

        let mut h = self.conv_in.forward(x);
        let mut skips = vec![h.clone()];
        for block in &self.down_blocks {
            h = block.forward(h, temb.clone(), context.clone(), &mut skips);
        }

        h = self.mid_block.forward(h, temb.clone(), context.clone());

        for block in &self.up_blocks {
            h = block.forward(h, temb.clone(), context.clone(), &mut skips);
        }

        self.conv_out.forward(silu(self.conv_norm_out.forward(h)))
    }
}

impl<B: Backend> DenoisingNetwork<B> for UNet<B> {
    fn forward(
        &self,
        latents: Tensor<B, 4>,
        timesteps: Tensor<B, 1>,
        conditioning: Tensor<B, 3>,
    ) -> Tensor<B, 4> {
        UNet::forward(self, latents, timesteps, conditioning)
    }

    fn prediction_type(&self) -> PredictionType {
        self.prediction_type
    }

    fn device(&self) -> B::Device {
        self.conv_in.weight.val().device()
    }

    fn dtype(&self) -> DType {
        self.conv_in.weight.val().dtype()
    }
}

impl<B: Backend> AdapterHost<B> for UNet<B> {
    fn host_type(&self) -> &str {
        "UNET"
    }

    fn visit_sites(&mut self, visitor: &mut SiteVisitor<B>) {
        for (i, block) in self.down_blocks.iter_mut().enumerate() {
            visitor.enter(&format!("down_blocks.{i}"), "CrossAttnDownBlock2D");
            for (j, attention) in block.attentions.iter_mut().enumerate() {
                attention.visit_sites(&format!("attentions.{j}"), visitor);
            }
            visitor.exit();
        }

        visitor.enter("mid_block", "UNetMidBlock2DCrossAttn");
        self.mid_block.attention.visit_sites("attentions.0", visitor);
        visitor.exit();

        for (i, block) in self.up_blocks.iter_mut().enumerate() {
            visitor.enter(&format!("up_blocks.{i}"), "CrossAttnUpBlock2D");
            for (j, attention) in block.attentions.iter_mut().enumerate() {
                attention.visit_sites(&format!("attentions.{j}"), visitor);
            }
            visitor.exit();
        }
    }
}

/// Resnets, optional transformers and an optional downsampler
#[derive(Module, Debug)]
pub struct DownBlock<B: Backend> {
    pub resnets: Vec<ResnetBlock<B>>,
    /// Empty for levels without attention
    pub attentions: Vec<SpatialTransformer<B>>,
    pub downsampler: Option<Downsample<B>>,
}

impl<B: Backend> DownBlock<B> {
    fn forward(
        &self,
        x: Tensor<B, 4>,
        temb: Tensor<B, 2>,
        context: Tensor<B, 3>,
        skips: &mut Vec<Tensor<B, 4>>,
    ) -> Tensor<B, 4> {
        let mut h = x;
        for (j, resnet) in self.resnets.iter().enumerate() {
            h = resnet.forward(h, temb.clone());
            if let Some(attention) = self.attentions.get(j) {
                h = attention.forward(h, context.clone());
            }
            skips.push(h.clone());
        }

        if let Some(downsampler) = &self.downsampler {
            h = downsampler.forward(h);
            skips.push(h.clone());
        }
        h
    }
}

/// Resnet, transformer, resnet
#[derive(Module, Debug)]
pub struct MidBlock<B: Backend> {
    pub resnet_0: ResnetBlock<B>,
    pub attention: SpatialTransformer<B>,
    pub resnet_1: ResnetBlock<B>,
}

impl<B: Backend> MidBlock<B> {
    fn forward(&self, x: Tensor<B, 4>, temb: Tensor<B, 2>, context: Tensor<B, 3>) -> Tensor<B, 4> {
        let h = self.resnet_0.forward(x, temb.clone());
        let h = self.attention.forward(h, context);
        self.resnet_1.forward(h, temb)
    }
}

/// Resnets over concatenated skips, optional transformers and upsampler
#[derive(Module, Debug)]
pub struct UpBlock<B: Backend> {
    pub resnets: Vec<ResnetBlock<B>>,
    pub attentions: Vec<SpatialTransformer<B>>,
    pub upsampler: Option<Upsample<B>>,
}

impl<B: Backend> UpBlock<B> {
    fn forward(
        &self,
        x: Tensor<B, 4>,
        temb: Tensor<B, 2>,
        context: Tensor<B, 3>,
        skips: &mut Vec<Tensor<B, 4>>,
    ) -> Tensor<B, 4> {
        let mut h = x;
        for (j, resnet) in self.resnets.iter().enumerate() {
            if let Some(skip) = skips.pop() {
                h = Tensor::cat(vec![h, skip], 1);
            }
            h = resnet.forward(h, temb.clone());
            if let Some(attention) = self.attentions.get(j) {
                h = attention.forward(h, context.clone());
            }
        }

        match &self.upsampler {
            Some(upsampler) => upsampler.forward(h),
            None => h,
        }
    }
}
