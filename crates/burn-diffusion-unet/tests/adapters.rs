//! UNet adapter slots, LoRA attachment and checkpoint loading

use burn::prelude::*;
use burn::tensor::Distribution;
use burn_diffusion_core::{
    Adapted, ConfigError, DenoisingNetwork, LowRankAdapterSet, Metadata, PredictionType,
    RecordingInit, WeightCollection,
};
use burn_diffusion_unet::{UNet, UNetConfig};
use burn_ndarray::NdArray;

type TestBackend = NdArray;

const ATTN2_TO_K: &str = "unet_down_blocks_0_attentions_0_transformer_blocks_0_attn2_to_k";
const MID_PROJ_IN: &str = "unet_mid_block_attentions_0_proj_in";

fn tiny() -> UNetConfig {
    UNetConfig {
        in_channels: 4,
        out_channels: 4,
        model_channels: 8,
        channel_mult: vec![1, 2],
        attention_levels: vec![true, false],
        num_heads: vec![2, 2],
        layers_per_block: 1,
        context_dim: 6,
        transformer_depth: 1,
        linear_projection: false,
        norm_num_groups: 4,
    }
}

struct Inputs {
    latents: Tensor<TestBackend, 4>,
    timesteps: Tensor<TestBackend, 1>,
    context: Tensor<TestBackend, 3>,
}

fn inputs(device: &<TestBackend as Backend>::Device) -> Inputs {
    Inputs {
        latents: Tensor::random([2, 4, 8, 8], Distribution::Normal(0.0, 1.0), device),
        timesteps: Tensor::from_floats([999.0, 10.0], device),
        context: Tensor::random([2, 3, 6], Distribution::Normal(0.0, 1.0), device),
    }
}

fn run(unet: &UNet<TestBackend>, inputs: &Inputs) -> Vec<f32> {
    unet.forward(
        inputs.latents.clone(),
        inputs.timesteps.clone(),
        inputs.context.clone(),
    )
    .into_data()
    .to_vec::<f32>()
    .unwrap()
}

fn lora_weights() -> WeightCollection {
    let mut weights = WeightCollection::new();
    let mut put = |key: String, shape: Vec<usize>, value: f32| {
        let len = shape.iter().product();
        weights.insert(key, TensorData::new(vec![value; len], shape));
    };

    put(format!("lora_{ATTN2_TO_K}.lora_down.weight"), vec![2, 6], 0.1);
    put(format!("lora_{ATTN2_TO_K}.lora_up.weight"), vec![8, 2], 0.1);
    put(format!("lora_{MID_PROJ_IN}.lora_down.weight"), vec![2, 16, 1, 1], 0.1);
    put(format!("lora_{MID_PROJ_IN}.lora_up.weight"), vec![16, 2, 1, 1], 0.1);
    put(format!("lora_{MID_PROJ_IN}.alpha"), vec![], 1.0);
    put("lora_unet_no_such_layer.lora_down.weight".into(), vec![2, 4], 0.1);
    put("lora_unet_no_such_layer.lora_up.weight".into(), vec![4, 2], 0.1);
    weights
}

#[test]
fn test_forward_shape() {
    let device = Default::default();
    let unet = UNet::<TestBackend>::init(&tiny(), PredictionType::Epsilon, &device);
    let inputs = inputs(&device);

    let out = unet.forward(inputs.latents, inputs.timesteps, inputs.context);
    assert_eq!(out.dims(), [2, 4, 8, 8]);
    assert_eq!(DenoisingNetwork::prediction_type(&unet), PredictionType::Epsilon);
}

#[test]
fn test_registry_names() {
    let device = Default::default();
    let unet = UNet::<TestBackend>::init(&tiny(), PredictionType::Epsilon, &device);
    let adapted = Adapted::new(unet).unwrap();

    // one transformer in down block 0, two in up block 1, one in the mid block
    assert_eq!(adapted.adapters.len(), 4 * 12);
    assert_eq!(adapted.adapters.prefix(), "unet");
    for name in [
        ATTN2_TO_K,
        MID_PROJ_IN,
        "unet_down_blocks_0_attentions_0_proj_out",
        "unet_up_blocks_1_attentions_1_transformer_blocks_0_attn1_to_out_0",
        "unet_up_blocks_1_attentions_0_transformer_blocks_0_ff_net_0_proj",
        "unet_mid_block_attentions_0_transformer_blocks_0_ff_net_2",
    ] {
        assert!(adapted.adapters.contains(name), "missing slot {name}");
    }
    // resnets and samplers are never adapter targets
    assert!(adapted.adapters.names().all(|name| name.contains("_attentions_")));
}

#[test]
fn test_adapter_names_round_trip() {
    let device = Default::default();
    let unet = UNet::<TestBackend>::init(&tiny(), PredictionType::Epsilon, &device);
    let adapted = Adapted::new(unet).unwrap();

    for (name, handle) in adapted.adapters.iter() {
        assert_eq!(handle.name(), name);
    }
}

#[test]
fn test_scanned_unet_is_unchanged() {
    let device = Default::default();
    let inputs = inputs(&device);
    let unet = UNet::<TestBackend>::init(&tiny(), PredictionType::Epsilon, &device);
    let before = run(&unet, &inputs);

    let adapted = Adapted::new(unet).unwrap();
    assert_eq!(run(&adapted.network, &inputs), before);
}

#[test]
fn test_lora_attach_and_clear() {
    let device = Default::default();
    let inputs = inputs(&device);
    let unet = UNet::<TestBackend>::init(&tiny(), PredictionType::Epsilon, &device);
    let adapted = Adapted::new(unet).unwrap();
    let base = run(&adapted.network, &inputs);

    let lora = LowRankAdapterSet::<TestBackend>::from_weights(&lora_weights(), None, &device).unwrap();
    let report = lora.attach(&[&adapted.adapters]);
    assert_eq!(report.attached, vec![ATTN2_TO_K.to_string(), MID_PROJ_IN.to_string()]);
    assert_eq!(report.skipped, vec!["lora_unet_no_such_layer".to_string()]);
    assert!(!report.is_complete());

    let adapted_out = run(&adapted.network, &inputs);
    assert_ne!(adapted_out, base);

    lora.set_strength(0.0);
    assert_eq!(run(&adapted.network, &inputs), base);
    lora.set_strength(1.0);
    assert_eq!(run(&adapted.network, &inputs), adapted_out);

    adapted.adapters.clear();
    assert_eq!(run(&adapted.network, &inputs), base);
}

#[test]
fn test_load_round_trip() {
    let device = Default::default();
    let inputs = inputs(&device);
    let mut recorder = RecordingInit::<TestBackend>::new(&device);
    let built = UNet::build(&tiny(), PredictionType::V, &mut recorder);
    let weights = recorder.into_weights();

    let loaded = UNet::<TestBackend>::load(&tiny(), PredictionType::V, &weights, None, &device).unwrap();
    assert_eq!(run(&loaded, &inputs), run(&built, &inputs));
    assert_eq!(loaded.prediction_type, PredictionType::V);
}

#[test]
fn test_load_reports_missing_keys() {
    let device = Default::default();
    let mut recorder = RecordingInit::<TestBackend>::new(&device);
    let _ = UNet::build(&tiny(), PredictionType::Epsilon, &mut recorder);
    let mut weights = recorder.into_weights();
    weights.remove("up_blocks.0.upsamplers.0.conv.weight");

    let err = UNet::<TestBackend>::load(&tiny(), PredictionType::Epsilon, &weights, None, &device)
        .unwrap_err();
    assert_eq!(
        err,
        ConfigError::MissingKeys(vec!["up_blocks.0.upsamplers.0.conv.weight".into()])
    );
}

#[test]
fn test_from_weights_requires_prediction_type() {
    let device = Default::default();
    let metadata = Metadata {
        model_type: Some("SDv1".into()),
        ..Default::default()
    };
    let weights = WeightCollection::new().with_metadata(metadata);

    let err = UNet::<TestBackend>::from_weights(&weights, None, &device).unwrap_err();
    assert_eq!(err, ConfigError::MissingMetadata("prediction_type"));
}
