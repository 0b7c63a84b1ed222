//! VAE encoder: image -> latent moments

use burn::nn::conv::Conv2d;
use burn::prelude::*;

use burn_diffusion_core::activation::silu;
use burn_diffusion_core::params::{self, join, ParamSource};
use burn_diffusion_core::GroupNorm;

use crate::decoder::{MidBlock, ResnetBlock, NORM_EPS};
use crate::vae::VaeConfig;

/// Encoder (`encoder.*`)
///
/// Outputs `2 * latent_channels` channels: mean followed by log-variance.
#[derive(Module, Debug)]
pub struct Encoder<B: Backend> {
    pub conv_in: Conv2d<B>,
    pub down_blocks: Vec<EncoderBlock<B>>,
    pub mid_block: MidBlock<B>,
    pub conv_norm_out: GroupNorm<B>,
    pub conv_out: Conv2d<B>,
}

impl<B: Backend> Encoder<B> {
    pub fn build<S: ParamSource<B>>(src: &mut S, path: &str, config: &VaeConfig) -> Self {
        let groups = config.norm_num_groups;
        let channels = &config.block_out_channels;
        let levels = channels.len();

        let conv_in = params::conv2d(src, &join(path, "conv_in"), [config.in_channels, channels[0]], 3, 1, 1);

        let mut down_blocks = Vec::with_capacity(levels);
        let mut c_in = channels[0];
        for (i, &c_out) in channels.iter().enumerate() {
            let block_path = join(path, &format!("down_blocks.{i}"));
            let resnets = (0..config.layers_per_block)
                .map(|j| {
                    let c = if j == 0 { c_in } else { c_out };
                    ResnetBlock::build(&mut *src, &format!("{block_path}.resnets.{j}"), [c, c_out], groups)
                })
                .collect();
            let downsample = (i + 1 < levels).then(|| {
                params::conv2d(&mut *src, &format!("{block_path}.downsamplers.0.conv"), [c_out, c_out], 3, 2, 0)
            });
            down_blocks.push(EncoderBlock { resnets, downsample });
            c_in = c_out;
        }

        let top = channels[levels - 1];
        Self {
            conv_in,
            down_blocks,
            mid_block: MidBlock::build(src, &join(path, "mid_block"), top, groups),
            conv_norm_out: params::group_norm(src, &join(path, "conv_norm_out"), groups, top, NORM_EPS),
            conv_out: params::conv2d(src, &join(path, "conv_out"), [top, 2 * config.latent_channels], 3, 1, 1),
        }
    }

    /// `[b, in, h, w]` (values in `[-1, 1]`) to `[b, 2 * latent, h / f, w / f]`
    pub fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        let mut h = self.conv_in.forward(x);
        for block in &self.down_blocks {
            h = block.forward(h);
        }
        h = self.mid_block.forward(h);
        self.conv_out.forward(silu(self.conv_norm_out.forward(h)))
    }
}

/// Resnets followed by an optional strided downsampling conv
#[derive(Module, Debug)]
pub struct EncoderBlock<B: Backend> {
    pub resnets: Vec<ResnetBlock<B>>,
    /// `downsamplers.0.conv`, stride 2 without padding
    pub downsample: Option<Conv2d<B>>,
}

impl<B: Backend> EncoderBlock<B> {
    pub fn forward(&self, mut x: Tensor<B, 4>) -> Tensor<B, 4> {
        for resnet in &self.resnets {
            x = resnet.forward(x);
        }

        if let Some(conv) = &self.downsample {
            x = conv.forward(pad_bottom_right(x));
        }
        x
    }
}

/// Zero-pads one row at the bottom and one column at the right
fn pad_bottom_right<B: Backend>(x: Tensor<B, 4>) -> Tensor<B, 4> {
    let [b, c, h, w] = x.dims();
    let dtype = x.dtype();
    let padded = Tensor::<B, 4>::zeros([b, c, h + 1, w + 1], &x.device());
    let padded = if padded.dtype() != dtype { padded.cast(dtype) } else { padded };
    padded.slice_assign([0..b, 0..c, 0..h, 0..w], x)
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::tensor::{Distribution, TensorData};
    use burn_diffusion_core::params::RandomInit;
    use burn_ndarray::NdArray;

    type TestBackend = NdArray;

    #[test]
    fn test_pad_bottom_right() {
        let device = Default::default();
        let x = Tensor::<TestBackend, 4>::from_data(
            TensorData::new(vec![1.0f32, 2.0, 3.0, 4.0], [1, 1, 2, 2]),
            &device,
        );
        let padded = pad_bottom_right(x).into_data().to_vec::<f32>().unwrap();
        assert_eq!(padded, vec![1.0, 2.0, 0.0, 3.0, 4.0, 0.0, 0.0, 0.0, 0.0]);
    }

    #[test]
    fn test_encoder_downsamples() {
        let device = Default::default();
        let mut src = RandomInit::<TestBackend>::new(&device);
        let config = VaeConfig {
            block_out_channels: vec![8, 16],
            layers_per_block: 1,
            norm_num_groups: 4,
            ..VaeConfig::sd()
        };
        let encoder = Encoder::build(&mut src, "encoder", &config);

        let x = Tensor::<TestBackend, 4>::random([1, 3, 8, 8], Distribution::Normal(0.0, 1.0), &device);
        assert_eq!(encoder.forward(x).dims(), [1, 8, 4, 4]);
    }
}
