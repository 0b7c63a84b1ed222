//! CLIP text encoder (SD 1.x / 2.x)
//!
//! Parameter keys follow the transformers `CLIPTextModel` layout:
//!
//! ```text
//! text_model.embeddings.token_embedding.weight
//! text_model.embeddings.position_embedding.weight
//! text_model.encoder.layers.{i}.self_attn.{q,k,v,out}_proj.{weight,bias}
//! text_model.encoder.layers.{i}.layer_norm{1,2}.{weight,bias}
//! text_model.encoder.layers.{i}.mlp.fc{1,2}.{weight,bias}
//! text_model.final_layer_norm.{weight,bias}
//! ```

use std::fmt;

use burn::constant;
use burn::module::Param;
use burn::nn::Embedding;
use burn::prelude::*;
use burn::tensor::activation::gelu;
use burn::tensor::{DType, Int};

use burn_diffusion_core::activation::quick_gelu;
use burn_diffusion_core::attention::{causal_mask, merge_heads, qkv_attention, split_heads};
use burn_diffusion_core::params::{self, join, Init, ParamSource, RandomInit, WeightReader};
use burn_diffusion_core::{
    AdaptableLinear, Adapted, AdapterHost, ConfigError, LayerNorm, ModelVariant, PrecisionMode,
    SiteVisitor, WeightCollection,
};

const PREFIX: &str = "text_model";

/// Feed-forward activation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClipActivation {
    QuickGelu,
    Gelu,
}

impl ClipActivation {
    fn apply<B: Backend, const D: usize>(&self, x: Tensor<B, D>) -> Tensor<B, D> {
        match self {
            ClipActivation::QuickGelu => quick_gelu(x),
            ClipActivation::Gelu => gelu(x),
        }
    }
}

impl fmt::Display for ClipActivation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ClipActivation::QuickGelu => "quick_gelu",
            ClipActivation::Gelu => "gelu",
        })
    }
}

burn::constant!(ClipActivation);

/// CLIP model configuration
#[derive(Debug, Clone)]
pub struct ClipConfig {
    pub vocab_size: usize,
    pub embed_dim: usize,
    pub num_heads: usize,
    pub num_layers: usize,
    pub context_length: usize,
    pub intermediate_size: usize,
    pub activation: ClipActivation,
    pub layer_norm_eps: f64,
}

impl ClipConfig {
    /// OpenAI CLIP ViT-L/14 as used by SD 1.x
    pub fn sd_v1() -> Self {
        Self {
            vocab_size: 49408,
            embed_dim: 768,
            num_heads: 12,
            num_layers: 12,
            context_length: 77,
            intermediate_size: 3072,
            activation: ClipActivation::QuickGelu,
            layer_norm_eps: 1e-5,
        }
    }

    /// OpenCLIP ViT-H/14 as used by SD 2.x (penultimate layer dropped)
    pub fn sd_v2() -> Self {
        Self {
            vocab_size: 49408,
            embed_dim: 1024,
            num_heads: 16,
            num_layers: 23,
            context_length: 77,
            intermediate_size: 4096,
            activation: ClipActivation::Gelu,
            layer_norm_eps: 1e-5,
        }
    }

    pub fn for_variant(variant: ModelVariant) -> Self {
        match variant {
            ModelVariant::SdV1 => Self::sd_v1(),
            ModelVariant::SdV2 => Self::sd_v2(),
        }
    }
}

/// CLIP text encoder
#[derive(Module, Debug)]
pub struct ClipTextEncoder<B: Backend> {
    pub token_embedding: Embedding<B>,
    pub position_embedding: Param<Tensor<B, 2>>,
    pub layers: Vec<EncoderLayer<B>>,
    pub final_layer_norm: LayerNorm<B>,
    pub context_length: usize,
}

impl<B: Backend> ClipTextEncoder<B> {
    /// Builds the encoder, asking `src` for every parameter
    pub fn build<S: ParamSource<B>>(config: &ClipConfig, src: &mut S) -> Self {
        let embeddings = join(PREFIX, "embeddings");
        let token_embedding = params::embedding(
            src,
            &join(&embeddings, "token_embedding"),
            config.vocab_size,
            config.embed_dim,
        );
        let position_embedding = src.float(
            &join(&embeddings, "position_embedding.weight"),
            [config.context_length, config.embed_dim],
            Init::Normal { std: 0.01 },
        );

        let layers = (0..config.num_layers)
            .map(|i| EncoderLayer::build(config, &mut *src, &format!("{PREFIX}.encoder.layers.{i}")))
            .collect();

        let final_layer_norm = params::layer_norm(
            src,
            &join(PREFIX, "final_layer_norm"),
            config.embed_dim,
            config.layer_norm_eps,
        );

        Self {
            token_embedding,
            position_embedding: Param::from_tensor(position_embedding),
            layers,
            final_layer_norm,
            context_length: config.context_length,
        }
    }

    /// Randomly initialized encoder
    pub fn init(config: &ClipConfig, device: &B::Device) -> Self {
        Self::build(config, &mut RandomInit::new(device))
    }

    /// Loads an encoder of a known configuration
    pub fn load(
        config: &ClipConfig,
        weights: &WeightCollection,
        precision: Option<PrecisionMode>,
        device: &B::Device,
    ) -> Result<Self, ConfigError> {
        let dtype = weights.resolve_precision(precision)?.map(|mode| mode.dtype());
        let mut reader = WeightReader::new(weights, dtype, device);
        let encoder = Self::build(config, &mut reader);
        reader.finish()?;
        Ok(encoder)
    }

    /// Loads an encoder for the variant named in the checkpoint metadata and
    /// scans it for adapter slots
    pub fn from_weights(
        weights: &WeightCollection,
        precision: Option<PrecisionMode>,
        device: &B::Device,
    ) -> Result<Adapted<Self, B>, ConfigError> {
        let variant = weights.require_metadata("model_type")?.variant()?;
        let config = ClipConfig::for_variant(variant);

        let encoder = Self::load(&config, weights, precision, device)?;
        let adapted = Adapted::new(encoder)?;
        tracing::info!(%variant, layers = config.num_layers, adapter_slots = adapted.adapters.len(), "loaded CLIP text encoder");
        Ok(adapted)
    }

    pub fn device(&self) -> B::Device {
        self.token_embedding.weight.val().device()
    }

    pub fn dtype(&self) -> DType {
        self.token_embedding.weight.val().dtype()
    }

    pub fn num_layers(&self) -> usize {
        self.layers.len()
    }

    /// Final hidden states `[batch, seq, embed_dim]`
    pub fn forward(&self, tokens: Tensor<B, 2, Int>) -> Tensor<B, 3> {
        self.forward_skip(tokens, 1)
    }

    /// Hidden states `clip_skip` layers from the end, with the final layer norm
    ///
    /// `clip_skip = 1` is the last layer; values are clamped to the layer count.
    pub fn forward_skip(&self, tokens: Tensor<B, 2, Int>, clip_skip: usize) -> Tensor<B, 3> {
        let [_batch, seq_len] = tokens.dims();
        let clip_skip = clip_skip.clamp(1, self.layers.len().max(1));
        let depth = self.layers.len() + 1 - clip_skip;

        let pos_emb = self
            .position_embedding
            .val()
            .slice([0..seq_len])
            .unsqueeze::<3>();
        let mut x = self.token_embedding.forward(tokens) + pos_emb;

        let mask = causal_mask::<B>(seq_len, &x.device()).cast(x.dtype());
        for layer in self.layers.iter().take(depth) {
            x = layer.forward(x, mask.clone());
        }

        self.final_layer_norm.forward(x)
    }
}

impl<B: Backend> AdapterHost<B> for ClipTextEncoder<B> {
    fn host_type(&self) -> &str {
        "CLIPTextModel"
    }

    fn visit_sites(&mut self, visitor: &mut SiteVisitor<B>) {
        visitor.enter(PREFIX, "CLIPTextTransformer");
        visitor.enter("encoder", "CLIPEncoder");
        for (i, layer) in self.layers.iter_mut().enumerate() {
            visitor.enter(&format!("layers.{i}"), "CLIPEncoderLayer");
            layer.visit_sites(visitor);
            visitor.exit();
        }
        visitor.exit();
        visitor.exit();
    }
}

/// Pre-norm transformer layer
#[derive(Module, Debug)]
pub struct EncoderLayer<B: Backend> {
    pub layer_norm1: LayerNorm<B>,
    pub self_attn: ClipAttention<B>,
    pub layer_norm2: LayerNorm<B>,
    pub mlp: ClipMlp<B>,
}

impl<B: Backend> EncoderLayer<B> {
    fn build<S: ParamSource<B>>(config: &ClipConfig, src: &mut S, path: &str) -> Self {
        let eps = config.layer_norm_eps;
        Self {
            layer_norm1: params::layer_norm(src, &join(path, "layer_norm1"), config.embed_dim, eps),
            self_attn: ClipAttention::build(config, src, &join(path, "self_attn")),
            layer_norm2: params::layer_norm(src, &join(path, "layer_norm2"), config.embed_dim, eps),
            mlp: ClipMlp::build(config, src, &join(path, "mlp")),
        }
    }

    pub fn forward(&self, x: Tensor<B, 3>, mask: Tensor<B, 2>) -> Tensor<B, 3> {
        let x = x.clone() + self.self_attn.forward(self.layer_norm1.forward(x), mask);
        x.clone() + self.mlp.forward(self.layer_norm2.forward(x))
    }

    fn visit_sites(&mut self, visitor: &mut SiteVisitor<B>) {
        visitor.enter("self_attn", "CLIPAttention");
        visitor.linear("q_proj", &mut self.self_attn.q_proj);
        visitor.linear("k_proj", &mut self.self_attn.k_proj);
        visitor.linear("v_proj", &mut self.self_attn.v_proj);
        visitor.linear("out_proj", &mut self.self_attn.out_proj);
        visitor.exit();

        visitor.enter("mlp", "CLIPMLP");
        visitor.linear("fc1", &mut self.mlp.fc1);
        visitor.linear("fc2", &mut self.mlp.fc2);
        visitor.exit();
    }
}

/// Causal multi-head self-attention
#[derive(Module, Debug)]
pub struct ClipAttention<B: Backend> {
    pub q_proj: AdaptableLinear<B>,
    pub k_proj: AdaptableLinear<B>,
    pub v_proj: AdaptableLinear<B>,
    pub out_proj: AdaptableLinear<B>,
    pub num_heads: usize,
}

impl<B: Backend> ClipAttention<B> {
    fn build<S: ParamSource<B>>(config: &ClipConfig, src: &mut S, path: &str) -> Self {
        let dim = config.embed_dim;
        let mut proj = |name: &str| AdaptableLinear::new(params::linear(&mut *src, &join(path, name), dim, dim, true));
        Self {
            q_proj: proj("q_proj"),
            k_proj: proj("k_proj"),
            v_proj: proj("v_proj"),
            out_proj: proj("out_proj"),
            num_heads: config.num_heads,
        }
    }

    pub fn forward(&self, x: Tensor<B, 3>, mask: Tensor<B, 2>) -> Tensor<B, 3> {
        let q = split_heads(self.q_proj.forward(x.clone()), self.num_heads);
        let k = split_heads(self.k_proj.forward(x.clone()), self.num_heads);
        let v = split_heads(self.v_proj.forward(x), self.num_heads);

        let out = qkv_attention(q, k, v, Some(mask));
        self.out_proj.forward(merge_heads(out))
    }
}

#[derive(Module, Debug)]
pub struct ClipMlp<B: Backend> {
    pub fc1: AdaptableLinear<B>,
    pub fc2: AdaptableLinear<B>,
    #[module(skip)]
    pub activation: ClipActivation,
}

impl<B: Backend> ClipMlp<B> {
    fn build<S: ParamSource<B>>(config: &ClipConfig, src: &mut S, path: &str) -> Self {
        let (dim, hidden) = (config.embed_dim, config.intermediate_size);
        Self {
            fc1: AdaptableLinear::new(params::linear(src, &join(path, "fc1"), dim, hidden, true)),
            fc2: AdaptableLinear::new(params::linear(src, &join(path, "fc2"), hidden, dim, true)),
            activation: config.activation,
        }
    }

    pub fn forward(&self, x: Tensor<B, 3>) -> Tensor<B, 3> {
        self.fc2.forward(self.activation.apply(self.fc1.forward(x)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn_diffusion_core::params::RecordingInit;
    use burn_diffusion_core::{AdapterRegistry, Metadata};
    use burn_ndarray::NdArray;

    type TestBackend = NdArray;

    fn tiny() -> ClipConfig {
        ClipConfig {
            vocab_size: 16,
            embed_dim: 8,
            num_heads: 2,
            num_layers: 2,
            context_length: 6,
            intermediate_size: 16,
            activation: ClipActivation::QuickGelu,
            layer_norm_eps: 1e-5,
        }
    }

    fn tokens(device: &<TestBackend as Backend>::Device) -> Tensor<TestBackend, 2, Int> {
        Tensor::from_ints([[1, 4, 2, 0], [3, 3, 5, 1]], device)
    }

    #[test]
    fn test_clip_configs() {
        let v1 = ClipConfig::sd_v1();
        assert_eq!((v1.embed_dim, v1.num_heads, v1.num_layers), (768, 12, 12));
        assert_eq!(v1.activation, ClipActivation::QuickGelu);

        let v2 = ClipConfig::for_variant(ModelVariant::SdV2);
        assert_eq!((v2.embed_dim, v2.num_heads, v2.num_layers), (1024, 16, 23));
        assert_eq!(v2.activation, ClipActivation::Gelu);
    }

    #[test]
    fn test_forward_shape_and_skip() {
        let device = Default::default();
        let encoder = ClipTextEncoder::<TestBackend>::init(&tiny(), &device);

        let out = encoder.forward(tokens(&device));
        assert_eq!(out.dims(), [2, 4, 8]);

        let skip1 = encoder.forward_skip(tokens(&device), 1);
        assert_eq!(
            out.into_data().to_vec::<f32>().unwrap(),
            skip1.into_data().to_vec::<f32>().unwrap()
        );
        assert_eq!(encoder.forward_skip(tokens(&device), 2).dims(), [2, 4, 8]);
    }

    #[test]
    fn test_activation_is_a_constant() {
        let device = Default::default();
        let config = ClipConfig {
            activation: ClipActivation::Gelu,
            ..tiny()
        };
        let encoder = ClipTextEncoder::<TestBackend>::init(&config, &device);
        let copy = encoder.clone();

        assert_eq!(copy.num_params(), encoder.num_params());
        assert!(copy.layers.iter().all(|layer| layer.mlp.activation == ClipActivation::Gelu));
        assert_eq!(ClipActivation::QuickGelu.to_string(), "quick_gelu");
    }

    #[test]
    fn test_registry_names() {
        let device = Default::default();
        let mut encoder = ClipTextEncoder::<TestBackend>::init(&tiny(), &device);
        let registry = AdapterRegistry::new(&mut encoder).unwrap();

        assert_eq!(registry.len(), 2 * 6);
        assert!(registry.contains("te_text_model_encoder_layers_0_self_attn_q_proj"));
        assert!(registry.contains("te_text_model_encoder_layers_1_mlp_fc2"));
        assert_eq!(registry.prefix(), "te");
    }

    #[test]
    fn test_load_reports_missing_keys() {
        let device = Default::default();
        let mut recorder = RecordingInit::<TestBackend>::new(&device);
        let _ = ClipTextEncoder::build(&tiny(), &mut recorder);
        let mut weights = recorder.into_weights();
        weights.remove("text_model.final_layer_norm.bias");
        weights.remove("text_model.encoder.layers.1.mlp.fc1.weight");

        let err = ClipTextEncoder::<TestBackend>::load(&tiny(), &weights, None, &device).unwrap_err();
        assert_eq!(
            err,
            ConfigError::MissingKeys(vec![
                "text_model.encoder.layers.1.mlp.fc1.weight".into(),
                "text_model.final_layer_norm.bias".into(),
            ])
        );
    }

    #[test]
    fn test_from_weights_requires_variant() {
        let device = Default::default();
        let weights = WeightCollection::new().with_metadata(Metadata::default());
        let err = ClipTextEncoder::<TestBackend>::from_weights(&weights, None, &device).unwrap_err();
        assert_eq!(err, ConfigError::MissingMetadata("model_type"));
    }
}
