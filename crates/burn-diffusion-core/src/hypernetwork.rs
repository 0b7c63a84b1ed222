//! Hypernetworks
//!
//! A hypernetwork holds one pair of small MLPs per cross-attention context
//! width. Module 0 transforms the input of every `attn2.to_k` projection and
//! module 1 the input of every `attn2.to_v` projection:
//!
//! ```text
//! 768.0.linear.0.weight   [1536, 768]
//! 768.0.linear.0.bias     [1536]
//! 768.0.linear.1.weight   [768, 1536]
//! 768.1.linear.0.weight   ...
//! ```

use std::collections::BTreeMap;
use std::sync::Arc;

use burn::prelude::*;
use burn::tensor::activation::{leaky_relu, relu, sigmoid, tanh};
use burn::tensor::DType;

use crate::activation::silu;
use crate::adapter::Multiplier;
use crate::error::ConfigError;
use crate::lora::AttachReport;
use crate::precision::PrecisionMode;
use crate::registry::AdapterRegistry;
use crate::weights::WeightCollection;

/// Registry name suffixes receiving module 0 and module 1
const TARGET_SUFFIXES: [&str; 2] = ["attn2_to_k", "attn2_to_v"];

/// Activation between hypernetwork layers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum HnActivation {
    #[default]
    Linear,
    Relu,
    LeakyRelu,
    Elu,
    Swish,
    Tanh,
    Sigmoid,
}

impl HnActivation {
    /// Parses the `activation_func` metadata field
    pub fn parse(value: &str) -> Result<Self, ConfigError> {
        match value.to_ascii_lowercase().as_str() {
            "linear" => Ok(HnActivation::Linear),
            "relu" => Ok(HnActivation::Relu),
            "leakyrelu" => Ok(HnActivation::LeakyRelu),
            "elu" => Ok(HnActivation::Elu),
            "swish" => Ok(HnActivation::Swish),
            "tanh" => Ok(HnActivation::Tanh),
            "sigmoid" => Ok(HnActivation::Sigmoid),
            _ => Err(ConfigError::UnknownActivation(value.to_string())),
        }
    }

    pub fn apply<B: Backend, const D: usize>(&self, x: Tensor<B, D>) -> Tensor<B, D> {
        match self {
            HnActivation::Linear => x,
            HnActivation::Relu => relu(x),
            HnActivation::LeakyRelu => leaky_relu(x, 0.01),
            HnActivation::Elu => {
                let negative = x.clone().clamp_max(0.0).exp() - 1.0;
                x.clamp_min(0.0) + negative
            }
            HnActivation::Swish => silu(x),
            HnActivation::Tanh => tanh(x),
            HnActivation::Sigmoid => sigmoid(x),
        }
    }
}

/// Dense layer stored as `[in, out]` weight and `[out]` bias
#[derive(Debug, Clone)]
struct HnLayer<B: Backend> {
    weight: Tensor<B, 2>,
    bias: Tensor<B, 1>,
}

/// One MLP of a hypernetwork
#[derive(Debug)]
pub struct HypernetworkModule<B: Backend> {
    dim: usize,
    layers: Vec<HnLayer<B>>,
    activation: HnActivation,
    activate_output: bool,
    multiplier: Multiplier,
}

impl<B: Backend> HypernetworkModule<B> {
    pub fn dim(&self) -> usize {
        self.dim
    }

    pub fn depth(&self) -> usize {
        self.layers.len()
    }

    pub fn multiplier(&self) -> f32 {
        self.multiplier.get()
    }

    pub fn set_multiplier(&self, value: f32) {
        self.multiplier.set(value);
    }

    /// Delta `mlp(x) * multiplier` for features on the last axis
    pub fn forward<const D: usize>(&self, x: Tensor<B, D>) -> Tensor<B, D> {
        let dims = x.dims();
        let rows = dims[..D - 1].iter().product::<usize>();
        let mut h = x.reshape([rows, dims[D - 1]]);

        let last = self.layers.len().saturating_sub(1);
        for (i, layer) in self.layers.iter().enumerate() {
            h = h.matmul(layer.weight.clone()) + layer.bias.clone().unsqueeze::<2>();
            if i < last || self.activate_output {
                h = self.activation.apply(h);
            }
        }

        h.reshape(dims) * self.multiplier.get()
    }
}

/// Hypernetwork: `[k-module, v-module]` per context width
#[derive(Debug)]
pub struct Hypernetwork<B: Backend> {
    modules: BTreeMap<usize, [Arc<HypernetworkModule<B>>; 2]>,
}

impl<B: Backend> Hypernetwork<B> {
    /// Builds every module from `{dim}.{0|1}.linear.{i}.weight|bias` keys
    ///
    /// Layers are applied in ascending index order. The optional metadata
    /// fields `activation_func` and `activate_output` select the activation.
    pub fn from_weights(
        weights: &WeightCollection,
        precision: Option<PrecisionMode>,
        device: &B::Device,
    ) -> Result<Self, ConfigError> {
        let dtype = weights.resolve_precision(precision)?.map(|mode| mode.dtype());
        let metadata = weights.metadata();
        let activation = metadata
            .and_then(|m| m.get("activation_func"))
            .map(HnActivation::parse)
            .transpose()?
            .unwrap_or_default();
        let activate_output = metadata
            .and_then(|m| m.get("activate_output"))
            .is_some_and(|v| matches!(v.to_ascii_lowercase().as_str(), "true" | "1"));

        // dim -> module index -> layer indices
        let mut layout: BTreeMap<usize, [Vec<usize>; 2]> = BTreeMap::new();
        for key in weights.keys() {
            let parts = key.split('.').collect::<Vec<_>>();
            let [dim, module, "linear", index, "weight"] = parts.as_slice() else {
                continue;
            };
            let (Ok(dim), Ok(module @ 0..=1), Ok(index)) =
                (dim.parse::<usize>(), module.parse::<usize>(), index.parse::<usize>())
            else {
                return Err(ConfigError::UnexpectedKey(key.to_string()));
            };
            layout.entry(dim).or_default()[module].push(index);
        }

        let mut modules = BTreeMap::new();
        for (dim, [k_layers, v_layers]) in layout {
            let k = build_module(weights, dim, 0, k_layers, activation, activate_output, dtype, device)?;
            let v = build_module(weights, dim, 1, v_layers, activation, activate_output, dtype, device)?;
            modules.insert(dim, [Arc::new(k), Arc::new(v)]);
        }

        tracing::info!(dims = ?modules.keys().collect::<Vec<_>>(), ?activation, "built hypernetwork");
        Ok(Self { modules })
    }

    /// Context widths with a module pair
    pub fn dims(&self) -> impl Iterator<Item = usize> + '_ {
        self.modules.keys().copied()
    }

    pub fn module(&self, dim: usize, index: usize) -> Option<&Arc<HypernetworkModule<B>>> {
        self.modules.get(&dim).and_then(|pair| pair.get(index))
    }

    /// Attaches module 0 to every `*attn2_to_k` entry and module 1 to every
    /// `*attn2_to_v` entry whose input width has a module pair
    pub fn attach(&self, registries: &[&AdapterRegistry<B>]) -> AttachReport {
        let mut report = AttachReport::default();

        for registry in registries {
            for (name, handle) in registry.iter() {
                let Some(index) = TARGET_SUFFIXES.iter().position(|s| name.ends_with(s)) else {
                    continue;
                };
                match self.module(handle.dim(), index) {
                    Some(module) => {
                        handle.attach_hn(Arc::clone(module));
                        report.attached.push(name.to_string());
                    }
                    None => {
                        tracing::debug!(name, dim = handle.dim(), "no hypernetwork module for width");
                        report.skipped.push(name.to_string());
                    }
                }
            }
        }

        tracing::info!(attached = report.attached.len(), "attached hypernetwork");
        report
    }

    pub fn set_strength(&self, value: f32) {
        for module in self.modules.values().flatten() {
            module.set_multiplier(value);
        }
    }
}

#[allow(clippy::too_many_arguments)]
fn build_module<B: Backend>(
    weights: &WeightCollection,
    dim: usize,
    module: usize,
    mut indices: Vec<usize>,
    activation: HnActivation,
    activate_output: bool,
    dtype: Option<DType>,
    device: &B::Device,
) -> Result<HypernetworkModule<B>, ConfigError> {
    indices.sort_unstable();
    if indices.is_empty() {
        return Err(ConfigError::MissingKeys(vec![format!("{dim}.{module}.linear.0.weight")]));
    }

    let mut layers = Vec::with_capacity(indices.len());
    let mut d_in = dim;
    let mut missing = Vec::new();
    for index in indices {
        let weight_key = format!("{dim}.{module}.linear.{index}.weight");
        let bias_key = format!("{dim}.{module}.linear.{index}.bias");

        let Some(data) = weights.get(&weight_key) else {
            missing.push(weight_key);
            continue;
        };
        let [d_out, w_in] = data.shape[..] else {
            return Err(shape_error(weight_key, vec![0, d_in], &data.shape));
        };
        if w_in != d_in {
            return Err(shape_error(weight_key, vec![d_out, d_in], &data.shape));
        }
        let weight = Tensor::<B, 2>::from_data(data.clone(), device).transpose();

        let bias = match weights.get(&bias_key) {
            Some(data) if data.shape[..] == [d_out] => Tensor::<B, 1>::from_data(data.clone(), device),
            Some(data) => return Err(shape_error(bias_key, vec![d_out], &data.shape)),
            None => {
                missing.push(bias_key);
                Tensor::zeros([d_out], device)
            }
        };

        let (weight, bias) = match dtype {
            Some(dtype) => (weight.cast(dtype), bias.cast(dtype)),
            None => (weight, bias),
        };
        layers.push(HnLayer { weight, bias });
        d_in = d_out;
    }

    if !missing.is_empty() {
        return Err(ConfigError::MissingKeys(missing));
    }
    if d_in != dim {
        return Err(ConfigError::ShapeMismatch {
            key: format!("{dim}.{module}.linear"),
            expected: vec![dim],
            actual: vec![d_in],
        });
    }

    Ok(HypernetworkModule {
        dim,
        layers,
        activation,
        activate_output,
        multiplier: Multiplier::default(),
    })
}

fn shape_error(key: String, expected: Vec<usize>, actual: &[usize]) -> ConfigError {
    ConfigError::ShapeMismatch {
        key,
        expected,
        actual: actual.to_vec(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::weights::Metadata;
    use burn::tensor::TensorData;
    use burn_ndarray::NdArray;

    type TestBackend = NdArray;

    fn hypernetwork_weights(dim: usize, hidden: usize) -> WeightCollection {
        let mut weights = WeightCollection::new();
        for module in 0..2 {
            weights.insert(
                format!("{dim}.{module}.linear.0.weight"),
                TensorData::new(vec![0.1f32; hidden * dim], [hidden, dim]),
            );
            weights.insert(
                format!("{dim}.{module}.linear.0.bias"),
                TensorData::new(vec![0.0f32; hidden], [hidden]),
            );
            // Sequential index 2: index 1 is the activation
            weights.insert(
                format!("{dim}.{module}.linear.2.weight"),
                TensorData::new(vec![0.1f32; dim * hidden], [dim, hidden]),
            );
            weights.insert(
                format!("{dim}.{module}.linear.2.bias"),
                TensorData::new(vec![0.0f32; dim], [dim]),
            );
        }
        weights
    }

    #[test]
    fn test_activation_parse() {
        assert_eq!(HnActivation::parse("relu").unwrap(), HnActivation::Relu);
        assert_eq!(HnActivation::parse("LeakyReLU").unwrap(), HnActivation::LeakyRelu);
        assert_eq!(
            HnActivation::parse("gelu"),
            Err(ConfigError::UnknownActivation("gelu".into()))
        );
    }

    #[test]
    fn test_builds_module_pairs() {
        let device = Default::default();
        let weights = hypernetwork_weights(4, 8).with_metadata(Metadata {
            extra: [("activation_func".to_string(), "relu".to_string())].into(),
            ..Default::default()
        });

        let hn = Hypernetwork::<TestBackend>::from_weights(&weights, None, &device).unwrap();
        assert_eq!(hn.dims().collect::<Vec<_>>(), vec![4]);
        let k = hn.module(4, 0).unwrap();
        assert_eq!(k.depth(), 2);

        // ones -> 0.4 per hidden unit -> 8 * 0.04 = 0.32
        let x = Tensor::<TestBackend, 3>::ones([1, 2, 4], &device);
        let delta = k.forward(x).into_data().to_vec::<f32>().unwrap();
        assert!(delta.iter().all(|v| (v - 0.32).abs() < 1e-5));

        hn.set_strength(0.0);
        assert_eq!(k.multiplier(), 0.0);
    }

    #[test]
    fn test_missing_bias_is_reported() {
        let device = Default::default();
        let mut weights = hypernetwork_weights(4, 8);
        weights.remove("4.1.linear.2.bias");

        let err = Hypernetwork::<TestBackend>::from_weights(&weights, None, &device).unwrap_err();
        assert_eq!(err, ConfigError::MissingKeys(vec!["4.1.linear.2.bias".into()]));
    }
}
