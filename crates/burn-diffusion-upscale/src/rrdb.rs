//! RRDBNet super-resolution model (ESRGAN / Real-ESRGAN)
//!
//! Parameter keys follow the basicsr layout:
//!
//! ```text
//! conv_first
//! body.{i}.rdb{1,2,3}.conv{1..5}
//! conv_body, conv_up1, conv_up2, conv_hr, conv_last
//! ```
//!
//! Legacy ESRGAN checkpoints (`model.0.weight`, `model.1.sub.*`) are
//! converted by [`convert_esrgan_keys`].

use burn::nn::conv::Conv2d;
use burn::prelude::*;
use burn::tensor::activation::leaky_relu;
use burn::tensor::module::interpolate;
use burn::tensor::ops::{InterpolateMode, InterpolateOptions};
use burn::tensor::DType;

use burn_diffusion_core::params::{self, join, ParamSource, RandomInit, WeightReader};
use burn_diffusion_core::{ConfigError, PrecisionMode, WeightCollection};

const NEGATIVE_SLOPE: f64 = 0.2;
const RESIDUAL_SCALE: f64 = 0.2;

/// RRDBNet configuration
#[derive(Debug, Clone)]
pub struct RrdbConfig {
    pub in_channels: usize,
    pub out_channels: usize,
    pub scale: usize,
    pub num_feat: usize,
    pub num_block: usize,
    pub num_grow_ch: usize,
}

impl RrdbConfig {
    /// 4x RGB model with 64 features and 32 growth channels
    pub fn x4(num_block: usize) -> Self {
        Self {
            in_channels: 3,
            out_channels: 3,
            scale: 4,
            num_feat: 64,
            num_block,
            num_grow_ch: 32,
        }
    }
}

/// Super-resolution network
#[derive(Module, Debug)]
pub struct SuperResolution<B: Backend> {
    pub conv_first: Conv2d<B>,
    pub body: Vec<Rrdb<B>>,
    pub conv_body: Conv2d<B>,
    pub conv_up1: Conv2d<B>,
    pub conv_up2: Conv2d<B>,
    pub conv_hr: Conv2d<B>,
    pub conv_last: Conv2d<B>,
    #[module(skip)]
    scale: usize,
}

impl<B: Backend> SuperResolution<B> {
    pub fn build<S: ParamSource<B>>(config: &RrdbConfig, src: &mut S) -> Self {
        let nf = config.num_feat;
        let body = (0..config.num_block)
            .map(|i| Rrdb::build(&mut *src, &format!("body.{i}"), nf, config.num_grow_ch))
            .collect();

        Self {
            conv_first: params::conv2d(src, "conv_first", [config.in_channels, nf], 3, 1, 1),
            body,
            conv_body: params::conv2d(src, "conv_body", [nf, nf], 3, 1, 1),
            conv_up1: params::conv2d(src, "conv_up1", [nf, nf], 3, 1, 1),
            conv_up2: params::conv2d(src, "conv_up2", [nf, nf], 3, 1, 1),
            conv_hr: params::conv2d(src, "conv_hr", [nf, nf], 3, 1, 1),
            conv_last: params::conv2d(src, "conv_last", [nf, config.out_channels], 3, 1, 1),
            scale: config.scale,
        }
    }

    pub fn init(config: &RrdbConfig, device: &B::Device) -> Self {
        Self::build(config, &mut RandomInit::new(device))
    }

    pub fn load(
        config: &RrdbConfig,
        weights: &WeightCollection,
        precision: Option<PrecisionMode>,
        device: &B::Device,
    ) -> Result<Self, ConfigError> {
        let dtype = weights.resolve_precision(precision)?.map(|mode| mode.dtype());
        let mut reader = WeightReader::new(weights, dtype, device);
        let model = Self::build(config, &mut reader);
        reader.finish()?;
        Ok(model)
    }

    /// Loads a basicsr or legacy ESRGAN checkpoint
    ///
    /// A single shared top-level prefix (e.g. `params_ema.`) is unwrapped and
    /// the block count is inferred from the `body.{i}` keys.
    pub fn from_weights(
        weights: &WeightCollection,
        precision: Option<PrecisionMode>,
        device: &B::Device,
    ) -> Result<Self, ConfigError> {
        let mut weights = unwrap_root(weights);
        if weights.contains("model.0.weight") {
            weights = convert_esrgan_keys(&weights);
        }

        let num_block = count_blocks(&weights).ok_or(ConfigError::UnknownUpscalerFormat)?;
        let config = RrdbConfig::x4(num_block);
        let model = Self::load(&config, &weights, precision, device)?;
        tracing::info!(num_block, scale = config.scale, "loaded super-resolution model");
        Ok(model)
    }

    pub fn scale(&self) -> usize {
        self.scale
    }

    pub fn device(&self) -> B::Device {
        self.conv_first.weight.val().device()
    }

    pub fn dtype(&self) -> DType {
        self.conv_first.weight.val().dtype()
    }

    /// `[b, in, h, w]` in `[0, 1]` to `[b, out, 4h, 4w]`
    pub fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        let feat = self.conv_first.forward(x);
        let mut body = feat.clone();
        for block in &self.body {
            body = block.forward(body);
        }
        let feat = feat + self.conv_body.forward(body);

        let feat = leaky_relu(self.conv_up1.forward(upsample_nearest(feat)), NEGATIVE_SLOPE);
        let feat = leaky_relu(self.conv_up2.forward(upsample_nearest(feat)), NEGATIVE_SLOPE);
        self.conv_last.forward(leaky_relu(self.conv_hr.forward(feat), NEGATIVE_SLOPE))
    }
}

/// Residual in residual dense block
#[derive(Module, Debug)]
pub struct Rrdb<B: Backend> {
    pub rdb1: DenseBlock<B>,
    pub rdb2: DenseBlock<B>,
    pub rdb3: DenseBlock<B>,
}

impl<B: Backend> Rrdb<B> {
    fn build<S: ParamSource<B>>(src: &mut S, path: &str, nf: usize, gc: usize) -> Self {
        Self {
            rdb1: DenseBlock::build(src, &join(path, "rdb1"), nf, gc),
            rdb2: DenseBlock::build(src, &join(path, "rdb2"), nf, gc),
            rdb3: DenseBlock::build(src, &join(path, "rdb3"), nf, gc),
        }
    }

    pub fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        let out = self.rdb3.forward(self.rdb2.forward(self.rdb1.forward(x.clone())));
        out * RESIDUAL_SCALE + x
    }
}

/// Five densely connected convolutions
#[derive(Module, Debug)]
pub struct DenseBlock<B: Backend> {
    pub convs: Vec<Conv2d<B>>,
}

impl<B: Backend> DenseBlock<B> {
    fn build<S: ParamSource<B>>(src: &mut S, path: &str, nf: usize, gc: usize) -> Self {
        let convs = (0..5)
            .map(|i| {
                let c_out = if i == 4 { nf } else { gc };
                params::conv2d(&mut *src, &join(path, &format!("conv{}", i + 1)), [nf + i * gc, c_out], 3, 1, 1)
            })
            .collect();
        Self { convs }
    }

    pub fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        let mut features = vec![x.clone()];
        let last = self.convs.len().saturating_sub(1);
        for (i, conv) in self.convs.iter().enumerate() {
            let out = conv.forward(Tensor::cat(features.clone(), 1));
            if i == last {
                return out * RESIDUAL_SCALE + x;
            }
            features.push(leaky_relu(out, NEGATIVE_SLOPE));
        }
        x
    }
}

fn upsample_nearest<B: Backend>(x: Tensor<B, 4>) -> Tensor<B, 4> {
    let [_, _, h, w] = x.dims();
    interpolate(x, [h * 2, w * 2], InterpolateOptions::new(InterpolateMode::Nearest))
}

/// Strips a prefix shared by every key unless the keys already name a known layout
fn unwrap_root(weights: &WeightCollection) -> WeightCollection {
    if weights.contains("conv_first.weight") || weights.contains("model.0.weight") {
        return weights.clone();
    }
    match weights.shared_root() {
        Some(root) => {
            tracing::debug!(root, "unwrapping shared key prefix");
            weights.strip_prefix(&format!("{root}."))
        }
        None => weights.clone(),
    }
}

/// `1 + max(i)` over `body.{i}.*` keys
fn count_blocks(weights: &WeightCollection) -> Option<usize> {
    weights
        .keys()
        .filter_map(|key| key.strip_prefix("body."))
        .filter_map(|rest| rest.split('.').next()?.parse::<usize>().ok())
        .max()
        .map(|max| max + 1)
}

/// Renames legacy ESRGAN keys to the basicsr layout
///
/// ```text
/// model.0.*                   conv_first.*
/// model.1.sub.{i}.RDB{j}...   body.{i}.rdb{j}...
/// model.1.sub.{n}.*           conv_body.*
/// model.3.*, model.6.*        conv_up1.*, conv_up2.*
/// model.8.*, model.10.*       conv_hr.*, conv_last.*
/// ```
pub fn convert_esrgan_keys(weights: &WeightCollection) -> WeightCollection {
    let mut converted: WeightCollection = weights
        .iter()
        .map(|(key, data)| {
            let key = key
                .to_lowercase()
                .replace("model.1.sub.", "body.")
                .replace(".0.weight", ".weight")
                .replace(".0.bias", ".bias");
            (key, data.clone())
        })
        .collect();
    converted.set_metadata(weights.metadata().cloned());

    // the trunk conv sits directly under body, after the last block
    let trunk: Vec<String> = converted
        .keys()
        .filter(|key| {
            key.strip_prefix("body.")
                .and_then(|rest| rest.split_once('.'))
                .is_some_and(|(_, leaf)| leaf == "weight" || leaf == "bias")
        })
        .map(str::to_string)
        .collect();
    for key in trunk {
        let leaf = key.rsplit('.').next().unwrap_or_default().to_string();
        converted.rename(&key, format!("conv_body.{leaf}"));
    }

    for (from, to) in [
        ("model.", "conv_first."),
        ("model.3.", "conv_up1."),
        ("model.6.", "conv_up2."),
        ("model.8.", "conv_hr."),
        ("model.10.", "conv_last."),
    ] {
        for leaf in ["weight", "bias"] {
            converted.rename(&format!("{from}{leaf}"), format!("{to}{leaf}"));
        }
    }
    converted
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::tensor::{Distribution, TensorData};
    use burn_diffusion_core::RecordingInit;
    use burn_ndarray::NdArray;

    type TestBackend = NdArray;

    fn tiny() -> RrdbConfig {
        RrdbConfig {
            num_feat: 4,
            num_grow_ch: 2,
            ..RrdbConfig::x4(2)
        }
    }

    fn basicsr_weights(config: &RrdbConfig) -> WeightCollection {
        let device = Default::default();
        let mut recorder = RecordingInit::<TestBackend>::new(&device);
        let _ = SuperResolution::build(config, &mut recorder);
        recorder.into_weights()
    }

    #[test]
    fn test_forward_scales_by_four() {
        let device = Default::default();
        let model = SuperResolution::<TestBackend>::init(&tiny(), &device);
        let x = Tensor::<TestBackend, 4>::random([1, 3, 3, 5], Distribution::Uniform(0.0, 1.0), &device);
        assert_eq!(model.forward(x).dims(), [1, 3, 12, 20]);
        assert_eq!(model.scale(), 4);
    }

    #[test]
    fn test_count_blocks() {
        let weights = basicsr_weights(&tiny());
        assert_eq!(count_blocks(&weights), Some(2));
        assert_eq!(count_blocks(&WeightCollection::new()), None);
    }

    #[test]
    fn test_unwrap_shared_root() {
        let weights: WeightCollection = basicsr_weights(&tiny())
            .iter()
            .map(|(key, data)| (format!("params_ema.{key}"), data.clone()))
            .collect();
        let unwrapped = unwrap_root(&weights);
        assert!(unwrapped.contains("conv_first.weight"));
        assert!(unwrapped.contains("body.1.rdb3.conv5.bias"));
        assert_eq!(unwrapped.len(), weights.len());
    }

    #[test]
    fn test_convert_esrgan_keys() {
        let data = || TensorData::new(vec![0.0f32], [1]);
        let weights: WeightCollection = [
            "model.0.weight",
            "model.0.bias",
            "model.1.sub.0.RDB1.conv1.0.weight",
            "model.1.sub.0.RDB3.conv5.0.bias",
            "model.1.sub.1.weight",
            "model.1.sub.1.bias",
            "model.3.weight",
            "model.6.bias",
            "model.8.weight",
            "model.10.bias",
        ]
        .into_iter()
        .map(|key| (key.to_string(), data()))
        .collect();

        let converted = convert_esrgan_keys(&weights);
        let mut keys: Vec<&str> = converted.keys().collect();
        keys.sort();
        assert_eq!(
            keys,
            vec![
                "body.0.rdb1.conv1.weight",
                "body.0.rdb3.conv5.bias",
                "conv_body.bias",
                "conv_body.weight",
                "conv_first.bias",
                "conv_first.weight",
                "conv_hr.weight",
                "conv_last.bias",
                "conv_up1.weight",
                "conv_up2.bias",
            ]
        );
        assert_eq!(count_blocks(&converted), Some(1));
    }

    #[test]
    fn test_from_weights_without_blocks() {
        let device = Default::default();
        let weights: WeightCollection = [("conv_first.weight".to_string(), TensorData::new(vec![0.0f32], [1]))]
            .into_iter()
            .collect();
        let err = SuperResolution::<TestBackend>::from_weights(&weights, None, &device).unwrap_err();
        assert_eq!(err, ConfigError::UnknownUpscalerFormat);
    }

    #[test]
    fn test_load_reports_missing_keys() {
        let device = Default::default();
        let config = tiny();
        let mut weights = basicsr_weights(&config);
        weights.remove("conv_hr.bias");

        let err = SuperResolution::<TestBackend>::load(&config, &weights, None, &device).unwrap_err();
        assert_eq!(err, ConfigError::MissingKeys(vec!["conv_hr.bias".into()]));
    }
}
