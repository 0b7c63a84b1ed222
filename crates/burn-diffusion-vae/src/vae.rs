//! AutoencoderKL

use burn::nn::conv::Conv2d;
use burn::prelude::*;
use burn::tensor::DType;

use burn_diffusion_core::params::{self, ParamSource, RandomInit, WeightReader};
use burn_diffusion_core::{ConfigError, ModelVariant, PrecisionMode, WeightCollection};

use crate::decoder::Decoder;
use crate::encoder::Encoder;

/// VAE configuration
#[derive(Debug, Clone)]
pub struct VaeConfig {
    pub in_channels: usize,
    pub out_channels: usize,
    pub latent_channels: usize,
    /// Channels per encoder level (reversed for the decoder)
    pub block_out_channels: Vec<usize>,
    pub layers_per_block: usize,
    pub norm_num_groups: usize,
}

impl VaeConfig {
    /// SD 1.x and 2.x share one autoencoder
    pub fn sd() -> Self {
        Self {
            in_channels: 3,
            out_channels: 3,
            latent_channels: 4,
            block_out_channels: vec![128, 256, 512, 512],
            layers_per_block: 2,
            norm_num_groups: 32,
        }
    }

    pub fn for_variant(variant: ModelVariant) -> Self {
        match variant {
            ModelVariant::SdV1 | ModelVariant::SdV2 => Self::sd(),
        }
    }
}

/// Diagonal Gaussian over latents
#[derive(Debug, Clone)]
pub struct LatentDistribution<B: Backend> {
    pub mean: Tensor<B, 4>,
    pub std: Tensor<B, 4>,
}

impl<B: Backend> LatentDistribution<B> {
    /// Splits encoder moments `[b, 2c, h, w]` into mean and log-variance
    ///
    /// The log-variance is clamped to `[-30, 20]`.
    pub fn from_moments(moments: Tensor<B, 4>) -> Self {
        let [b, c2, h, w] = moments.dims();
        let c = c2 / 2;
        let mean = moments.clone().slice([0..b, 0..c, 0..h, 0..w]);
        let logvar = moments.slice([0..b, c..c2, 0..h, 0..w]).clamp(-30.0, 20.0);
        Self {
            mean,
            std: (logvar * 0.5).exp(),
        }
    }

    /// `mean + std * noise`
    pub fn sample(&self, noise: Tensor<B, 4>) -> Tensor<B, 4> {
        self.mean.clone() + self.std.clone() * noise
    }

    /// Most likely latent
    pub fn mode(&self) -> Tensor<B, 4> {
        self.mean.clone()
    }
}

/// Variational autoencoder between pixel and latent space
#[derive(Module, Debug)]
pub struct Vae<B: Backend> {
    pub encoder: Encoder<B>,
    pub decoder: Decoder<B>,
    pub quant_conv: Conv2d<B>,
    pub post_quant_conv: Conv2d<B>,
    /// Decode one batch item at a time
    #[module(skip)]
    slicing: bool,
}

impl<B: Backend> Vae<B> {
    pub fn build<S: ParamSource<B>>(config: &VaeConfig, src: &mut S) -> Self {
        let latent = config.latent_channels;
        Self {
            encoder: Encoder::build(src, "encoder", config),
            decoder: Decoder::build(src, "decoder", config),
            quant_conv: params::conv2d(src, "quant_conv", [2 * latent, 2 * latent], 1, 1, 0),
            post_quant_conv: params::conv2d(src, "post_quant_conv", [latent, latent], 1, 1, 0),
            slicing: true,
        }
    }

    pub fn init(config: &VaeConfig, device: &B::Device) -> Self {
        Self::build(config, &mut RandomInit::new(device))
    }

    pub fn load(
        config: &VaeConfig,
        weights: &WeightCollection,
        precision: Option<PrecisionMode>,
        device: &B::Device,
    ) -> Result<Self, ConfigError> {
        let dtype = weights.resolve_precision(precision)?.map(|mode| mode.dtype());
        let mut reader = WeightReader::new(weights, dtype, device);
        let vae = Self::build(config, &mut reader);
        reader.finish()?;
        Ok(vae)
    }

    /// Loads the autoencoder named by the `model_type` metadata
    pub fn from_weights(
        weights: &WeightCollection,
        precision: Option<PrecisionMode>,
        device: &B::Device,
    ) -> Result<Self, ConfigError> {
        let variant = weights.require_metadata("model_type")?.variant()?;
        let vae = Self::load(&VaeConfig::for_variant(variant), weights, precision, device)?;
        tracing::info!(%variant, dtype = ?vae.dtype(), "loaded VAE");
        Ok(vae)
    }

    pub fn with_slicing(mut self, slicing: bool) -> Self {
        self.slicing = slicing;
        self
    }

    pub fn set_slicing(&mut self, slicing: bool) {
        self.slicing = slicing;
    }

    pub fn is_slicing(&self) -> bool {
        self.slicing
    }

    pub fn device(&self) -> B::Device {
        self.quant_conv.weight.val().device()
    }

    pub fn dtype(&self) -> DType {
        self.quant_conv.weight.val().dtype()
    }

    /// Images in `[-1, 1]` to a distribution over unscaled latents
    pub fn encode(&self, x: Tensor<B, 4>) -> LatentDistribution<B> {
        let moments = self.quant_conv.forward(self.encoder.forward(x));
        LatentDistribution::from_moments(moments)
    }

    /// Unscaled latents to images in roughly `[-1, 1]`
    pub fn decode(&self, z: Tensor<B, 4>) -> Tensor<B, 4> {
        let [batch, _, _, _] = z.dims();
        if !self.slicing || batch <= 1 {
            return self.decode_batch(z);
        }

        let slices = z
            .chunk(batch, 0)
            .into_iter()
            .map(|item| self.decode_batch(item))
            .collect();
        Tensor::cat(slices, 0)
    }

    fn decode_batch(&self, z: Tensor<B, 4>) -> Tensor<B, 4> {
        self.decoder.forward(self.post_quant_conv.forward(z))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::tensor::{Distribution, TensorData};
    use burn_diffusion_core::{Metadata, RecordingInit};
    use burn_ndarray::NdArray;

    type TestBackend = NdArray;

    fn tiny() -> VaeConfig {
        VaeConfig {
            block_out_channels: vec![8, 16],
            layers_per_block: 1,
            norm_num_groups: 4,
            ..VaeConfig::sd()
        }
    }

    #[test]
    fn test_latent_distribution() {
        let device = Default::default();
        // mean 1, logvar 2 (std e), one pixel, one latent channel
        let moments = Tensor::<TestBackend, 4>::from_data(
            TensorData::new(vec![1.0f32, 2.0], [1, 2, 1, 1]),
            &device,
        );
        let dist = LatentDistribution::from_moments(moments);
        let noise = Tensor::<TestBackend, 4>::ones([1, 1, 1, 1], &device);

        let sample = dist.sample(noise).into_data().to_vec::<f32>().unwrap();
        assert!((sample[0] - (1.0 + std::f32::consts::E)).abs() < 1e-5);
        assert_eq!(dist.mode().into_data().to_vec::<f32>().unwrap(), vec![1.0]);
    }

    #[test]
    fn test_logvar_clamped() {
        let device = Default::default();
        let moments = Tensor::<TestBackend, 4>::from_data(
            TensorData::new(vec![0.0f32, 100.0], [1, 2, 1, 1]),
            &device,
        );
        let std = LatentDistribution::from_moments(moments).std.into_data().to_vec::<f32>().unwrap();
        assert!((std[0] - 10.0f32.exp()).abs() / 10.0f32.exp() < 1e-5);
    }

    #[test]
    fn test_encode_decode_shapes() {
        let device = Default::default();
        let vae = Vae::<TestBackend>::init(&tiny(), &device);
        assert!(vae.is_slicing());

        let x = Tensor::<TestBackend, 4>::random([2, 3, 8, 8], Distribution::Uniform(-1.0, 1.0), &device);
        let dist = vae.encode(x);
        assert_eq!(dist.mean.dims(), [2, 4, 4, 4]);
        assert_eq!(dist.std.dims(), [2, 4, 4, 4]);
        assert_eq!(vae.decode(dist.mode()).dims(), [2, 3, 8, 8]);
    }

    #[test]
    fn test_sliced_decode_matches_batched() {
        let device = Default::default();
        let vae = Vae::<TestBackend>::init(&tiny(), &device);
        let z = Tensor::<TestBackend, 4>::random([3, 4, 4, 4], Distribution::Normal(0.0, 1.0), &device);

        let sliced = vae.decode(z.clone()).into_data().to_vec::<f32>().unwrap();
        let vae = vae.with_slicing(false);
        let batched = vae.decode(z).into_data().to_vec::<f32>().unwrap();
        for (a, b) in sliced.iter().zip(&batched) {
            assert!((a - b).abs() < 1e-4);
        }
    }

    #[test]
    fn test_load_round_trip_and_missing_keys() {
        let device = Default::default();
        let mut recorder = RecordingInit::<TestBackend>::new(&device);
        let _ = Vae::build(&tiny(), &mut recorder);
        let mut weights = recorder.into_weights();
        assert!(weights.contains("encoder.mid_block.attentions.0.to_out.0.weight"));
        assert!(weights.contains("decoder.up_blocks.0.upsamplers.0.conv.bias"));

        assert!(Vae::<TestBackend>::load(&tiny(), &weights, None, &device).is_ok());

        weights.remove("post_quant_conv.bias");
        let err = Vae::<TestBackend>::load(&tiny(), &weights, None, &device).unwrap_err();
        assert_eq!(err, ConfigError::MissingKeys(vec!["post_quant_conv.bias".into()]));
    }

    #[test]
    fn test_from_weights_requires_variant() {
        let device = Default::default();
        let weights = WeightCollection::new().with_metadata(Metadata::default());
        let err = Vae::<TestBackend>::from_weights(&weights, None, &device).unwrap_err();
        assert_eq!(err, ConfigError::MissingMetadata("model_type"));
    }
}
