//! Guided denoising on a tiny UNet

use burn::prelude::*;
use burn::tensor::Distribution;
use burn_diffusion_core::{Adapted, LowRankAdapterSet, PredictionType, WeightCollection};
use burn_diffusion_guidance::GuidedDenoiser;
use burn_diffusion_unet::{UNet, UNetConfig};
use burn_ndarray::NdArray;

type TestBackend = NdArray;

fn tiny_unet(device: &<TestBackend as Backend>::Device) -> Adapted<UNet<TestBackend>, TestBackend> {
    let config = UNetConfig {
        in_channels: 4,
        out_channels: 4,
        model_channels: 8,
        channel_mult: vec![1, 2],
        attention_levels: vec![true, false],
        num_heads: vec![2, 2],
        layers_per_block: 1,
        context_dim: 6,
        transformer_depth: 1,
        linear_projection: true,
        norm_num_groups: 4,
    };
    Adapted::new(UNet::init(&config, PredictionType::Epsilon, device)).unwrap()
}

fn values(tensor: Tensor<TestBackend, 4>) -> Vec<f32> {
    tensor.into_data().to_vec::<f32>().unwrap()
}

#[test]
fn test_unit_scale_matches_conditional_branch() {
    let device = Default::default();
    let unet = tiny_unet(&device);
    let uncond = Tensor::<TestBackend, 3>::random([1, 3, 6], Distribution::Normal(0.0, 1.0), &device);
    let cond = Tensor::<TestBackend, 3>::random([1, 3, 6], Distribution::Normal(0.0, 1.0), &device);
    let schedule = vec![Tensor::cat(vec![uncond, cond.clone()], 0)];
    let latents = Tensor::<TestBackend, 4>::random([1, 4, 8, 8], Distribution::Normal(0.0, 1.0), &device);

    let denoiser = GuidedDenoiser::new(&unet.network, schedule, 1.0).unwrap();
    let guided = values(denoiser.predict_noise(latents.clone(), 500.0, 0.5));

    let direct = values(unet.network.forward(
        latents,
        Tensor::from_floats([500.0], &device),
        cond,
    ));
    for (g, d) in guided.iter().zip(&direct) {
        assert!((g - d).abs() < 1e-4, "{g} != {d}");
    }
}

#[test]
fn test_lora_clear_restores_guided_output() {
    let device = Default::default();
    let unet = tiny_unet(&device);
    let schedule = vec![Tensor::<TestBackend, 3>::random([2, 3, 6], Distribution::Normal(0.0, 1.0), &device)];
    let latents = Tensor::<TestBackend, 4>::random([1, 4, 8, 8], Distribution::Normal(0.0, 1.0), &device);

    let denoiser = GuidedDenoiser::new(&unet.network, schedule, 7.5).unwrap();
    let base = values(denoiser.predict_noise(latents.clone(), 10.0, 0.9));

    // one rank-1 adapter per slot, input and output widths taken from the checkpoint layout
    let mut weights = WeightCollection::new();
    let name = "lora_unet_down_blocks_0_attentions_0_transformer_blocks_0_attn1_to_v";
    weights.insert(format!("{name}.lora_down.weight"), TensorData::new(vec![0.2f32; 8], [1, 8]));
    weights.insert(format!("{name}.lora_up.weight"), TensorData::new(vec![0.2f32; 8], [8, 1]));
    let name = "lora_unet_mid_block_attentions_0_proj_out";
    weights.insert(format!("{name}.lora_down.weight"), TensorData::new(vec![0.2f32; 16], [1, 16]));
    weights.insert(format!("{name}.lora_up.weight"), TensorData::new(vec![0.2f32; 16], [16, 1]));

    let lora = LowRankAdapterSet::<TestBackend>::from_weights(&weights, None, &device).unwrap();
    assert!(lora.attach(&[&unet.adapters]).is_complete());
    assert_ne!(values(denoiser.predict_noise(latents.clone(), 10.0, 0.9)), base);

    unet.adapters.clear();
    assert_eq!(values(denoiser.predict_noise(latents, 10.0, 0.9)), base);
}
