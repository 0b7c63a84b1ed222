//! Parameter sources for model construction
//!
//! Every network in this workspace is built by walking its architecture once
//! and asking a [`ParamSource`] for each parameter by its checkpoint key. Three
//! sources exist:
//!
//! - [`RandomInit`] draws fresh values (tests, shape checks)
//! - [`RecordingInit`] draws them and keeps a copy in checkpoint layout
//! - [`WeightReader`] reads them from a [`WeightCollection`], recording every
//!   key the architecture asked for but the collection lacks
//!
//! Because both go through the same build code, the key layout a model loads
//! from is exactly the layout it was built with.

use std::collections::HashSet;

use burn::module::Param;
use burn::nn::conv::{Conv2d, Conv2dConfig};
use burn::nn::{Embedding, EmbeddingConfig, Linear, LinearConfig, PaddingConfig2d};
use burn::prelude::*;
use burn::tensor::{DType, Distribution};

use crate::error::ConfigError;
use crate::groupnorm::GroupNorm;
use crate::layernorm::LayerNorm;
use crate::weights::WeightCollection;

/// Initialization hint used when a parameter is not read from a checkpoint
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Init {
    Zeros,
    Ones,
    Normal { std: f64 },
    Uniform { bound: f64 },
}

/// Supplies parameter tensors by key
pub trait ParamSource<B: Backend> {
    /// Device parameters are created on
    fn device(&self) -> B::Device;

    /// Tensor for `key` with the given shape
    fn float<const D: usize>(&mut self, key: &str, shape: [usize; D], init: Init) -> Tensor<B, D>;
}

/// Joins a module path and a child name with `.`
pub fn join(prefix: &str, name: &str) -> String {
    if prefix.is_empty() {
        name.to_string()
    } else {
        format!("{prefix}.{name}")
    }
}

/// Randomly initialized parameters
pub struct RandomInit<B: Backend> {
    device: B::Device,
}

impl<B: Backend> RandomInit<B> {
    pub fn new(device: &B::Device) -> Self {
        Self {
            device: device.clone(),
        }
    }
}

impl<B: Backend> ParamSource<B> for RandomInit<B> {
    fn device(&self) -> B::Device {
        self.device.clone()
    }

    fn float<const D: usize>(&mut self, _key: &str, shape: [usize; D], init: Init) -> Tensor<B, D> {
        match init {
            Init::Zeros => Tensor::zeros(shape, &self.device),
            Init::Ones => Tensor::ones(shape, &self.device),
            Init::Normal { std } => {
                Tensor::random(shape, Distribution::Normal(0.0, std), &self.device)
            }
            Init::Uniform { bound } => {
                Tensor::random(shape, Distribution::Uniform(-bound, bound), &self.device)
            }
        }
    }
}

/// Random parameters that are also recorded under their checkpoint keys
///
/// Building a model through this source yields a complete
/// [`WeightCollection`] in checkpoint layout for that architecture.
pub struct RecordingInit<B: Backend> {
    inner: RandomInit<B>,
    weights: WeightCollection,
}

impl<B: Backend> RecordingInit<B> {
    pub fn new(device: &B::Device) -> Self {
        Self {
            inner: RandomInit::new(device),
            weights: WeightCollection::new(),
        }
    }

    pub fn into_weights(self) -> WeightCollection {
        self.weights
    }
}

impl<B: Backend> ParamSource<B> for RecordingInit<B> {
    fn device(&self) -> B::Device {
        self.inner.device()
    }

    fn float<const D: usize>(&mut self, key: &str, shape: [usize; D], init: Init) -> Tensor<B, D> {
        let tensor = self.inner.float(key, shape, init);
        self.weights.insert(key, tensor.to_data());
        tensor
    }
}

/// Reads parameters from a [`WeightCollection`]
///
/// Missing keys are substituted with zeros so construction can finish and
/// report every missing key at once; [`WeightReader::finish`] turns them
/// into an error.
pub struct WeightReader<'a, B: Backend> {
    weights: &'a WeightCollection,
    device: B::Device,
    dtype: Option<DType>,
    used: HashSet<String>,
    missing: Vec<String>,
    mismatch: Option<ConfigError>,
}

impl<'a, B: Backend> WeightReader<'a, B> {
    /// Reader casting every tensor to `dtype` when given
    pub fn new(weights: &'a WeightCollection, dtype: Option<DType>, device: &B::Device) -> Self {
        Self {
            weights,
            device: device.clone(),
            dtype,
            used: HashSet::new(),
            missing: Vec::new(),
            mismatch: None,
        }
    }

    /// Keys requested so far that the collection lacks
    pub fn missing(&self) -> &[String] {
        &self.missing
    }

    /// Fails with the first shape mismatch, then with all missing keys
    pub fn finish(self) -> Result<(), ConfigError> {
        if let Some(err) = self.mismatch {
            return Err(err);
        }
        if !self.missing.is_empty() {
            return Err(ConfigError::MissingKeys(self.missing));
        }

        let unused = self.weights.len().saturating_sub(self.used.len());
        if unused > 0 {
            tracing::warn!(unused, "ignored checkpoint keys not used by the architecture");
        }
        Ok(())
    }
}

impl<B: Backend> ParamSource<B> for WeightReader<'_, B> {
    fn device(&self) -> B::Device {
        self.device.clone()
    }

    fn float<const D: usize>(&mut self, key: &str, shape: [usize; D], _init: Init) -> Tensor<B, D> {
        let Some(data) = self.weights.get(key) else {
            self.missing.push(key.to_string());
            return Tensor::zeros(shape, &self.device);
        };

        if data.shape.as_slice() != shape.as_slice() {
            if self.mismatch.is_none() {
                self.mismatch = Some(ConfigError::ShapeMismatch {
                    key: key.to_string(),
                    expected: shape.to_vec(),
                    actual: data.shape.clone(),
                });
            }
            return Tensor::zeros(shape, &self.device);
        }

        self.used.insert(key.to_string());
        let tensor = Tensor::<B, D>::from_data(data.clone(), &self.device);
        match self.dtype {
            Some(dtype) if tensor.dtype() != dtype => tensor.cast(dtype),
            _ => tensor,
        }
    }
}

/// Linear layer from `{path}.weight` (`[out, in]`) and optional `{path}.bias`
pub fn linear<B: Backend, S: ParamSource<B>>(
    src: &mut S,
    path: &str,
    d_input: usize,
    d_output: usize,
    bias: bool,
) -> Linear<B> {
    let device = src.device();
    let bound = 1.0 / (d_input as f64).sqrt();
    let mut layer = LinearConfig::new(d_input, d_output)
        .with_bias(bias)
        .init(&device);

    // Checkpoints store [out, in]; burn expects [in, out]
    let weight: Tensor<B, 2> = src.float(&join(path, "weight"), [d_output, d_input], Init::Uniform { bound });
    layer.weight = Param::from_tensor(weight.transpose());
    if bias {
        let bias = src.float(&join(path, "bias"), [d_output], Init::Uniform { bound });
        layer.bias = Some(Param::from_tensor(bias));
    }
    layer
}

/// Square-kernel convolution from `{path}.weight` / `{path}.bias`
pub fn conv2d<B: Backend, S: ParamSource<B>>(
    src: &mut S,
    path: &str,
    channels: [usize; 2],
    kernel: usize,
    stride: usize,
    padding: usize,
) -> Conv2d<B> {
    let device = src.device();
    let [c_in, c_out] = channels;
    let bound = 1.0 / ((c_in * kernel * kernel) as f64).sqrt();

    let mut layer = Conv2dConfig::new(channels, [kernel, kernel])
        .with_stride([stride, stride])
        .with_padding(PaddingConfig2d::Explicit(padding, padding))
        .init(&device);

    let weight = src.float(&join(path, "weight"), [c_out, c_in, kernel, kernel], Init::Uniform { bound });
    let bias = src.float(&join(path, "bias"), [c_out], Init::Uniform { bound });
    layer.weight = Param::from_tensor(weight);
    layer.bias = Some(Param::from_tensor(bias));
    layer
}

pub fn group_norm<B: Backend, S: ParamSource<B>>(
    src: &mut S,
    path: &str,
    num_groups: usize,
    channels: usize,
    eps: f64,
) -> GroupNorm<B> {
    let weight = src.float(&join(path, "weight"), [channels], Init::Ones);
    let bias = src.float(&join(path, "bias"), [channels], Init::Zeros);
    GroupNorm::from_parts(num_groups, weight, bias, eps)
}

pub fn layer_norm<B: Backend, S: ParamSource<B>>(
    src: &mut S,
    path: &str,
    size: usize,
    eps: f64,
) -> LayerNorm<B> {
    let weight = src.float(&join(path, "weight"), [size], Init::Ones);
    let bias = src.float(&join(path, "bias"), [size], Init::Zeros);
    LayerNorm::from_parts(weight, bias, eps)
}

pub fn embedding<B: Backend, S: ParamSource<B>>(
    src: &mut S,
    path: &str,
    num_embeddings: usize,
    dim: usize,
) -> Embedding<B> {
    let device = src.device();
    let mut layer = EmbeddingConfig::new(num_embeddings, dim).init(&device);
    let weight = src.float(&join(path, "weight"), [num_embeddings, dim], Init::Normal { std: 0.02 });
    layer.weight = Param::from_tensor(weight);
    layer
}
