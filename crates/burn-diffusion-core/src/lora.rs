//! LoRA (Low-Rank Adaptation) support
//!
//! A [`LowRankAdapter`] is a named down/up projection pair. Attached to an
//! adapted sublayer it adds `up(down(x)) * multiplier` to that sublayer's
//! output; the frozen weights are never touched, so clearing the registry
//! restores the original network exactly.
//!
//! [`LowRankAdapterSet`] builds adapters from a kohya-style LoRA checkpoint:
//!
//! ```text
//! lora_unet_down_blocks_0_attentions_0_proj_in.lora_down.weight   [r, in, 1, 1]
//! lora_unet_down_blocks_0_attentions_0_proj_in.lora_up.weight     [out, r, 1, 1]
//! lora_unet_down_blocks_0_attentions_0_proj_in.alpha              []
//! lora_te_text_model_encoder_layers_0_mlp_fc1.lora_down.weight    [r, in]
//! ```

use std::collections::BTreeMap;
use std::sync::Arc;

use burn::prelude::*;
use burn::tensor::module::conv2d;
use burn::tensor::ops::ConvOptions;
use burn::tensor::{DType, TensorData};

use crate::adapter::Multiplier;
use crate::error::ConfigError;
use crate::precision::PrecisionMode;
use crate::registry::AdapterRegistry;
use crate::weights::WeightCollection;

/// Prefix stripped from adapter names before registry lookup
pub const LORA_PREFIX: &str = "lora_";

/// Layout of the projection weights
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LowRankForm {
    /// `[out, in]` matrices
    Linear,
    /// `[out, in, 1, 1]` kernels
    Conv,
}

impl LowRankForm {
    /// Conv for UNet projection layers (`proj_in`, `proj_out`), linear otherwise
    pub fn for_name(name: &str) -> Self {
        if name.contains("unet") && name.contains("_proj_") {
            LowRankForm::Conv
        } else {
            LowRankForm::Linear
        }
    }
}

#[derive(Debug, Clone)]
enum Projections<B: Backend> {
    Linear { down: Tensor<B, 2>, up: Tensor<B, 2> },
    Conv { down: Tensor<B, 4>, up: Tensor<B, 4> },
}

/// Low-rank weight delta for one sublayer
#[derive(Debug)]
pub struct LowRankAdapter<B: Backend> {
    name: String,
    rank: usize,
    projections: Projections<B>,
    down_bias: Option<Tensor<B, 1>>,
    up_bias: Option<Tensor<B, 1>>,
    multiplier: Multiplier,
}

impl<B: Backend> LowRankAdapter<B> {
    /// Adapter from `up: [out, rank]` and `down: [rank, in]` matrices
    ///
    /// The form (and so the stored layout) is chosen from the name.
    pub fn new(name: impl Into<String>, up: Tensor<B, 2>, down: Tensor<B, 2>) -> Self {
        let name = name.into();
        let [rank, c_in] = down.dims();
        let [c_out, _] = up.dims();
        let projections = match LowRankForm::for_name(&name) {
            LowRankForm::Linear => Projections::Linear { down, up },
            LowRankForm::Conv => Projections::Conv {
                down: down.reshape([rank, c_in, 1, 1]),
                up: up.reshape([c_out, rank, 1, 1]),
            },
        };

        Self {
            name,
            rank,
            projections,
            down_bias: None,
            up_bias: None,
            multiplier: Multiplier::default(),
        }
    }

    /// Scales the up projection by `alpha / rank`
    pub fn with_alpha(mut self, alpha: f32) -> Self {
        let scale = alpha as f64 / self.rank as f64;
        self.projections = match self.projections {
            Projections::Linear { down, up } => Projections::Linear { down, up: up * scale },
            Projections::Conv { down, up } => Projections::Conv { down, up: up * scale },
        };
        self
    }

    pub fn with_biases(mut self, up_bias: Option<Tensor<B, 1>>, down_bias: Option<Tensor<B, 1>>) -> Self {
        self.up_bias = up_bias;
        self.down_bias = down_bias;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn rank(&self) -> usize {
        self.rank
    }

    pub fn form(&self) -> LowRankForm {
        match self.projections {
            Projections::Linear { .. } => LowRankForm::Linear,
            Projections::Conv { .. } => LowRankForm::Conv,
        }
    }

    pub fn in_features(&self) -> usize {
        match &self.projections {
            Projections::Linear { down, .. } => down.dims()[1],
            Projections::Conv { down, .. } => down.dims()[1],
        }
    }

    pub fn out_features(&self) -> usize {
        match &self.projections {
            Projections::Linear { up, .. } => up.dims()[0],
            Projections::Conv { up, .. } => up.dims()[0],
        }
    }

    pub fn multiplier(&self) -> f32 {
        self.multiplier.get()
    }

    /// Strength of this adapter at every place it is attached; 0 disables it
    pub fn set_multiplier(&self, value: f32) {
        self.multiplier.set(value);
    }

    /// `(down, up)` as `[rank, in]` / `[out, rank]` matrices
    fn matrices(&self) -> (Tensor<B, 2>, Tensor<B, 2>) {
        match &self.projections {
            Projections::Linear { down, up } => (down.clone(), up.clone()),
            Projections::Conv { down, up } => {
                let [rank, c_in, _, _] = down.dims();
                let [c_out, _, _, _] = up.dims();
                (
                    down.clone().reshape([rank, c_in]),
                    up.clone().reshape([c_out, rank]),
                )
            }
        }
    }

    /// `(down, up)` as 1x1 kernels
    fn kernels(&self) -> (Tensor<B, 4>, Tensor<B, 4>) {
        match &self.projections {
            Projections::Conv { down, up } => (down.clone(), up.clone()),
            Projections::Linear { down, up } => {
                let [rank, c_in] = down.dims();
                let [c_out, _] = up.dims();
                (
                    down.clone().reshape([rank, c_in, 1, 1]),
                    up.clone().reshape([c_out, rank, 1, 1]),
                )
            }
        }
    }

    /// Delta for features on the last axis
    pub fn forward_last<const D: usize>(&self, x: Tensor<B, D>) -> Tensor<B, D> {
        let dims = x.dims();
        let d_in = dims[D - 1];
        let rows = dims[..D - 1].iter().product::<usize>();
        let (down, up) = self.matrices();

        let mut h = x.reshape([rows, d_in]).matmul(down.transpose());
        if let Some(bias) = &self.down_bias {
            h = h + bias.clone().unsqueeze::<2>();
        }
        let mut out = h.matmul(up.transpose());
        if let Some(bias) = &self.up_bias {
            out = out + bias.clone().unsqueeze::<2>();
        }

        let mut out_dims = dims;
        out_dims[D - 1] = self.out_features();
        out.reshape(out_dims) * self.multiplier.get()
    }

    /// Delta for NCHW tensors
    pub fn forward_channels(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        let (down, up) = self.kernels();
        let options = || ConvOptions::new([1, 1], [0, 0], [1, 1], 1);

        let h = conv2d(x, down, self.down_bias.clone(), options());
        conv2d(h, up, self.up_bias.clone(), options()) * self.multiplier.get()
    }
}

/// Outcome of attaching an adapter set
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AttachReport {
    /// Registry names that received an adapter
    pub attached: Vec<String>,
    /// Adapter names with no matching registry entry
    pub skipped: Vec<String>,
}

impl AttachReport {
    pub fn is_complete(&self) -> bool {
        self.skipped.is_empty()
    }
}

#[derive(Default)]
struct LoraParts<'a> {
    up: Option<(&'a str, &'a TensorData)>,
    down: Option<(&'a str, &'a TensorData)>,
    alpha: Option<&'a str>,
    up_bias: Option<(&'a str, &'a TensorData)>,
    down_bias: Option<(&'a str, &'a TensorData)>,
}

/// Every LoRA adapter in one checkpoint
#[derive(Debug)]
pub struct LowRankAdapterSet<B: Backend> {
    adapters: Vec<Arc<LowRankAdapter<B>>>,
}

impl<B: Backend> LowRankAdapterSet<B> {
    /// Builds the adapters, ordered by name
    ///
    /// Every key must be `{name}.{suffix}` with a known suffix, and every
    /// name needs both `lora_up.weight` and `lora_down.weight`.
    pub fn from_weights(
        weights: &WeightCollection,
        precision: Option<PrecisionMode>,
        device: &B::Device,
    ) -> Result<Self, ConfigError> {
        let dtype = weights.resolve_precision(precision)?.map(|mode| mode.dtype());

        let mut parts: BTreeMap<&str, LoraParts<'_>> = BTreeMap::new();
        for (key, data) in weights.iter() {
            let (name, suffix) = key
                .split_once('.')
                .ok_or_else(|| ConfigError::UnexpectedKey(key.to_string()))?;
            let entry = parts.entry(name).or_default();
            match suffix {
                "lora_up.weight" => entry.up = Some((key, data)),
                "lora_down.weight" => entry.down = Some((key, data)),
                "alpha" => entry.alpha = Some(key),
                "lora_up.bias" => entry.up_bias = Some((key, data)),
                "lora_down.bias" => entry.down_bias = Some((key, data)),
                _ => return Err(ConfigError::UnexpectedKey(key.to_string())),
            }
        }

        let mut adapters = Vec::with_capacity(parts.len());
        for (name, part) in parts {
            let (Some((up_key, up)), Some((down_key, down))) = (part.up, part.down) else {
                return Err(ConfigError::IncompleteLora(name.to_string()));
            };

            let down = load_matrix::<B>(down_key, down, dtype, device)?;
            let up = load_matrix::<B>(up_key, up, dtype, device)?;
            let [rank, _] = down.dims();
            let [c_out, up_rank] = up.dims();
            if up_rank != rank {
                return Err(ConfigError::ShapeMismatch {
                    key: up_key.to_string(),
                    expected: vec![c_out, rank],
                    actual: vec![c_out, up_rank],
                });
            }

            let mut adapter = LowRankAdapter::new(name, up, down);
            if let Some(key) = part.alpha {
                let Some(alpha) = weights.scalar(key) else {
                    return Err(ConfigError::ShapeMismatch {
                        key: key.to_string(),
                        expected: vec![],
                        actual: weights.shape(key).map(<[usize]>::to_vec).unwrap_or_default(),
                    });
                };
                adapter = adapter.with_alpha(alpha);
            }
            let up_bias = part
                .up_bias
                .map(|(key, data)| load_vector::<B>(key, data, dtype, device))
                .transpose()?;
            let down_bias = part
                .down_bias
                .map(|(key, data)| load_vector::<B>(key, data, dtype, device))
                .transpose()?;
            adapters.push(Arc::new(adapter.with_biases(up_bias, down_bias)));
        }

        tracing::info!(count = adapters.len(), "built LoRA adapters");
        Ok(Self { adapters })
    }

    pub fn len(&self) -> usize {
        self.adapters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.adapters.is_empty()
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.adapters.iter().map(|adapter| adapter.name())
    }

    pub fn get(&self, name: &str) -> Option<&Arc<LowRankAdapter<B>>> {
        self.adapters.iter().find(|adapter| adapter.name() == name)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<LowRankAdapter<B>>> {
        self.adapters.iter()
    }

    /// Attaches each adapter to the first registry holding its name
    ///
    /// Names are looked up with the `lora_` prefix removed. Names no registry
    /// knows, and adapters whose widths differ from their slot, are skipped
    /// and listed in the report.
    pub fn attach(&self, registries: &[&AdapterRegistry<B>]) -> AttachReport {
        let mut report = AttachReport::default();

        for adapter in &self.adapters {
            let key = adapter
                .name()
                .strip_prefix(LORA_PREFIX)
                .unwrap_or(adapter.name());
            match registries.iter().find_map(|registry| registry.get(key)) {
                Some(handle)
                    if (adapter.in_features(), adapter.out_features())
                        != (handle.dim(), handle.out_dim()) =>
                {
                    tracing::debug!(
                        name = adapter.name(),
                        lora = ?[adapter.in_features(), adapter.out_features()],
                        slot = ?[handle.dim(), handle.out_dim()],
                        "LoRA shape does not fit its slot, skipping"
                    );
                    report.skipped.push(adapter.name().to_string());
                }
                Some(handle) => {
                    handle.attach_lora(Arc::clone(adapter));
                    report.attached.push(key.to_string());
                }
                None => {
                    tracing::debug!(name = adapter.name(), "no adapter slot for LoRA, skipping");
                    report.skipped.push(adapter.name().to_string());
                }
            }
        }

        tracing::info!(
            attached = report.attached.len(),
            skipped = report.skipped.len(),
            "attached LoRA set"
        );
        report
    }

    /// Sets the multiplier of every adapter, attached or not
    pub fn set_strength(&self, value: f32) {
        for adapter in &self.adapters {
            adapter.set_multiplier(value);
        }
    }
}

fn cast<B: Backend, const D: usize>(tensor: Tensor<B, D>, dtype: Option<DType>) -> Tensor<B, D> {
    match dtype {
        Some(dtype) if tensor.dtype() != dtype => tensor.cast(dtype),
        _ => tensor,
    }
}

/// Reads `[a, b]` or `[a, b, 1, 1]` data as an `[a, b]` matrix
fn load_matrix<B: Backend>(
    key: &str,
    data: &TensorData,
    dtype: Option<DType>,
    device: &B::Device,
) -> Result<Tensor<B, 2>, ConfigError> {
    let tensor = match data.shape.as_slice() {
        [_, _] => Tensor::<B, 2>::from_data(data.clone(), device),
        [a, b, 1, 1] => Tensor::<B, 4>::from_data(data.clone(), device).reshape([*a, *b]),
        shape => {
            let mut expected = shape.iter().take(2).copied().collect::<Vec<_>>();
            expected.extend([1, 1]);
            return Err(ConfigError::ShapeMismatch {
                key: key.to_string(),
                expected,
                actual: shape.to_vec(),
            });
        }
    };
    Ok(cast(tensor, dtype))
}

fn load_vector<B: Backend>(
    key: &str,
    data: &TensorData,
    dtype: Option<DType>,
    device: &B::Device,
) -> Result<Tensor<B, 1>, ConfigError> {
    if data.shape.len() != 1 {
        return Err(ConfigError::ShapeMismatch {
            key: key.to_string(),
            expected: vec![data.shape.iter().product()],
            actual: data.shape.clone(),
        });
    }
    Ok(cast(Tensor::from_data(data.clone(), device), dtype))
}
