//! Guided denoiser
//!
//! Wraps a [`DenoisingNetwork`] for use inside a sampler loop. Each prediction
//! runs the network once on a doubled batch (unconditional + conditional) and
//! combines the halves with the guidance scale:
//!
//! ```text
//! result = negative + scale * (positive - negative)
//! ```
//!
//! With a mask set (inpainting), `predict_original` restores the preserved
//! region from the original latents and `mask_noise` keeps its noise level in
//! step with the schedule.

use burn::prelude::*;
use burn::tensor::DType;

use burn_diffusion_core::{DenoisingNetwork, PredictionType};

use crate::error::GuidanceError;

/// Latent normalization applied to original content passed to [`GuidedDenoiser::set_mask`]
pub const LATENT_SCALE: f64 = 0.18215;

#[derive(Debug, Clone)]
struct Inpainting<B: Backend> {
    mask: Tensor<B, 4>,
    original: Tensor<B, 4>,
}

/// Classifier-free guidance around a denoising network
///
/// Every entry of the conditioning schedule holds the unconditional
/// embeddings in its first half and the conditional ones in its second half:
/// `[2 * batch, seq, dim]`.
pub struct GuidedDenoiser<B: Backend, N: DenoisingNetwork<B>> {
    network: N,
    schedule: Vec<Tensor<B, 3>>,
    conditioning: Tensor<B, 3>,
    step: usize,
    scale: f64,
    inpainting: Option<Inpainting<B>>,
}

impl<B: Backend, N: DenoisingNetwork<B>> GuidedDenoiser<B, N> {
    /// Starts at step 0 of `schedule`, unmasked
    pub fn new(network: N, schedule: Vec<Tensor<B, 3>>, scale: f64) -> Result<Self, GuidanceError> {
        let first = schedule.first().cloned().ok_or(GuidanceError::EmptySchedule)?;
        let conditioning = cast(first, network.dtype());
        tracing::debug!(steps = schedule.len(), scale, prediction_type = %network.prediction_type(), "created guided denoiser");

        Ok(Self {
            network,
            schedule,
            conditioning,
            step: 0,
            scale,
            inpainting: None,
        })
    }

    pub fn network(&self) -> &N {
        &self.network
    }

    pub fn into_network(self) -> N {
        self.network
    }

    pub fn scale(&self) -> f64 {
        self.scale
    }

    pub fn current_step(&self) -> usize {
        self.step
    }

    /// Conditioning used by the next prediction
    pub fn conditioning(&self) -> &Tensor<B, 3> {
        &self.conditioning
    }

    pub fn is_masked(&self) -> bool {
        self.inpainting.is_some()
    }

    pub fn device(&self) -> B::Device {
        self.network.device()
    }

    pub fn dtype(&self) -> DType {
        self.network.dtype()
    }

    /// Enters inpainting mode
    ///
    /// `mask` is 1 where `original` (unscaled latents) must be preserved and 0
    /// where new content is generated.
    pub fn set_mask(&mut self, mask: Tensor<B, 4>, original: Tensor<B, 4>) {
        let dtype = self.dtype();
        self.inpainting = Some(Inpainting {
            mask: cast(mask, dtype),
            original: cast(original, dtype) * LATENT_SCALE,
        });
    }

    /// Selects the conditioning of sampling step `step`
    pub fn set_step(&mut self, step: usize) -> Result<(), GuidanceError> {
        let conditioning = self.schedule.get(step).cloned().ok_or(GuidanceError::StepOutOfRange {
            step,
            len: self.schedule.len(),
        })?;
        self.conditioning = cast(conditioning, self.dtype());
        self.step = step;
        Ok(())
    }

    /// Clears the mask and returns to the first conditioning
    pub fn reset(&mut self) {
        self.inpainting = None;
        self.step = 0;
        if let Some(first) = self.schedule.first() {
            self.conditioning = cast(first.clone(), self.network.dtype());
        }
    }

    /// Guided noise estimate for `latents` at `timestep`
    ///
    /// `alpha` is the cumulative signal level (`alphas_cumprod[timestep]`).
    pub fn predict_noise(&self, latents: Tensor<B, 4>, timestep: f64, alpha: f64) -> Tensor<B, 4> {
        let input = Tensor::cat(vec![latents.clone(), latents], 0);
        let conditioning = self.conditioning.clone();

        let prediction = match self.network.prediction_type() {
            PredictionType::Epsilon => self.predict_noise_epsilon(input, timestep, conditioning),
            PredictionType::V => self.predict_noise_v(input, timestep, conditioning, alpha),
        };
        self.guide(prediction)
    }

    /// Guided estimate of the denoised latents at noise level `sigma`
    ///
    /// When a mask is set, preserved regions are replaced by the original.
    pub fn predict_original(&self, latents: Tensor<B, 4>, timestep: f64, sigma: f64) -> Tensor<B, 4> {
        let input = Tensor::cat(vec![latents.clone(), latents], 0);
        let conditioning = self.conditioning.clone();

        let prediction = match self.network.prediction_type() {
            PredictionType::Epsilon => self.predict_original_epsilon(input, timestep, sigma, conditioning),
            PredictionType::V => self.predict_original_v(input, timestep, sigma, conditioning),
        };
        let guided = self.guide(prediction);

        match &self.inpainting {
            Some(Inpainting { mask, original }) => {
                original.clone() * mask.clone() + guided * (mask.clone().neg() + 1.0)
            }
            None => guided,
        }
    }

    /// Raw network output
    pub fn predict_noise_epsilon(
        &self,
        latents: Tensor<B, 4>,
        timestep: f64,
        conditioning: Tensor<B, 3>,
    ) -> Tensor<B, 4> {
        self.run(latents, timestep, conditioning)
    }

    /// `sqrt(alpha) * v + sqrt(1 - alpha) * latents`
    pub fn predict_noise_v(
        &self,
        latents: Tensor<B, 4>,
        timestep: f64,
        conditioning: Tensor<B, 3>,
        alpha: f64,
    ) -> Tensor<B, 4> {
        let v = self.run(latents.clone(), timestep, conditioning);
        v * alpha.sqrt() + latents * (1.0 - alpha).sqrt()
    }

    /// `latents - sigma * eps`, with the network input scaled by `c_in`
    pub fn predict_original_epsilon(
        &self,
        latents: Tensor<B, 4>,
        timestep: f64,
        sigma: f64,
        conditioning: Tensor<B, 3>,
    ) -> Tensor<B, 4> {
        let c_in = 1.0 / (sigma * sigma + 1.0).sqrt();
        let eps = self.run(latents.clone() * c_in, timestep, conditioning);
        latents - eps * sigma
    }

    /// `v * c_out + latents * c_skip`, with the network input scaled by `c_in`
    pub fn predict_original_v(
        &self,
        latents: Tensor<B, 4>,
        timestep: f64,
        sigma: f64,
        conditioning: Tensor<B, 3>,
    ) -> Tensor<B, 4> {
        let variance = sigma * sigma + 1.0;
        let c_in = 1.0 / variance.sqrt();
        let c_skip = 1.0 / variance;
        let c_out = -sigma / variance.sqrt();

        let v = self.run(latents.clone() * c_in, timestep, conditioning);
        v * c_out + latents * c_skip
    }

    /// Re-noises the preserved region to the level of `alpha` and blends it in
    ///
    /// `noise` is only sampled when a mask is set.
    pub fn mask_noise<F>(&self, latents: Tensor<B, 4>, alpha: f64, noise: F) -> Tensor<B, 4>
    where
        F: FnOnce() -> Tensor<B, 4>,
    {
        match &self.inpainting {
            Some(Inpainting { mask, original }) => {
                let noised = original.clone() * alpha.sqrt() + noise() * (1.0 - alpha).sqrt();
                noised * mask.clone() + latents * (mask.clone().neg() + 1.0)
            }
            None => latents,
        }
    }

    fn run(&self, latents: Tensor<B, 4>, timestep: f64, conditioning: Tensor<B, 3>) -> Tensor<B, 4> {
        let [batch, _, _, _] = latents.dims();
        let timesteps = cast(
            Tensor::<B, 1>::full([batch], timestep, &latents.device()),
            self.dtype(),
        );
        self.network.forward(latents, timesteps, conditioning)
    }

    /// Splits `[negative, positive]` and applies the guidance scale
    fn guide(&self, prediction: Tensor<B, 4>) -> Tensor<B, 4> {
        let [batch, c, h, w] = prediction.dims();
        let half = batch / 2;
        let negative = prediction.clone().slice([0..half, 0..c, 0..h, 0..w]);
        let positive = prediction.slice([half..batch, 0..c, 0..h, 0..w]);

        // scale 1 and 0 return one half as is
        if self.scale == 1.0 {
            positive
        } else if self.scale == 0.0 {
            negative
        } else {
            negative.clone() + (positive - negative) * self.scale
        }
    }
}

fn cast<B: Backend, const D: usize>(tensor: Tensor<B, D>, dtype: DType) -> Tensor<B, D> {
    if tensor.dtype() == dtype {
        tensor
    } else {
        tensor.cast(dtype)
    }
}

#[cfg(test)]
mod tests {
    use std::cell::RefCell;

    use super::*;
    use burn::tensor::{Distribution, TensorData};
    use burn_ndarray::NdArray;

    type TestBackend = NdArray;
    type Device = <TestBackend as Backend>::Device;

    /// Adds the mean of each batch item's conditioning to its latents
    struct MockNetwork {
        prediction_type: PredictionType,
        calls: RefCell<Vec<[usize; 4]>>,
        timesteps: RefCell<Vec<f32>>,
    }

    impl MockNetwork {
        fn new(prediction_type: PredictionType) -> Self {
            Self {
                prediction_type,
                calls: RefCell::new(Vec::new()),
                timesteps: RefCell::new(Vec::new()),
            }
        }
    }

    impl DenoisingNetwork<TestBackend> for MockNetwork {
        fn forward(
            &self,
            latents: Tensor<TestBackend, 4>,
            timesteps: Tensor<TestBackend, 1>,
            conditioning: Tensor<TestBackend, 3>,
        ) -> Tensor<TestBackend, 4> {
            let [b, _, _, _] = latents.dims();
            self.calls.borrow_mut().push(latents.dims());
            *self.timesteps.borrow_mut() = timesteps.into_data().to_vec::<f32>().unwrap();

            let offset = conditioning.mean_dim(2).mean_dim(1).reshape([b, 1, 1, 1]);
            latents + offset
        }

        fn prediction_type(&self) -> PredictionType {
            self.prediction_type
        }

        fn device(&self) -> Device {
            Default::default()
        }

        fn dtype(&self) -> DType {
            DType::F32
        }
    }

    /// Unconditional half filled with `neg`, conditional half with `pos`
    fn conditioning(neg: f32, pos: f32, device: &Device) -> Tensor<TestBackend, 3> {
        Tensor::cat(
            vec![
                Tensor::full([1, 3, 4], neg, device),
                Tensor::full([1, 3, 4], pos, device),
            ],
            0,
        )
    }

    fn latents(device: &Device) -> Tensor<TestBackend, 4> {
        Tensor::from_data(
            TensorData::new(vec![0.5f32, -1.0, 2.0, 0.25], [1, 1, 2, 2]),
            device,
        )
    }

    fn values(tensor: Tensor<TestBackend, 4>) -> Vec<f32> {
        tensor.into_data().to_vec::<f32>().unwrap()
    }

    fn assert_close(actual: &[f32], expected: &[f32]) {
        assert_eq!(actual.len(), expected.len());
        for (a, e) in actual.iter().zip(expected) {
            assert!((a - e).abs() < 1e-5, "{actual:?} != {expected:?}");
        }
    }

    #[test]
    fn test_empty_schedule() {
        let result = GuidedDenoiser::<TestBackend, _>::new(MockNetwork::new(PredictionType::Epsilon), vec![], 7.5);
        assert!(matches!(result, Err(GuidanceError::EmptySchedule)));
    }

    #[test]
    fn test_epsilon_guidance_single_call() {
        let device = Default::default();
        let mut denoiser = GuidedDenoiser::new(
            MockNetwork::new(PredictionType::Epsilon),
            vec![conditioning(1.0, 3.0, &device)],
            7.5,
        )
        .unwrap();
        denoiser.set_step(0).unwrap();

        let out = values(denoiser.predict_noise(latents(&device), 10.0, 0.5));

        assert_eq!(*denoiser.network().calls.borrow(), vec![[2, 1, 2, 2]]);
        assert_eq!(*denoiser.network().timesteps.borrow(), vec![10.0, 10.0]);
        // negative = x + 1, positive = x + 3
        let expected: Vec<f32> = values(latents(&device)).iter().map(|x| x + 1.0 + 7.5 * 2.0).collect();
        assert_close(&out, &expected);
    }

    #[test]
    fn test_scale_end_points() {
        let device = Default::default();
        let x = latents(&device);
        let schedule = vec![conditioning(1.0, 3.0, &device)];

        let cond = GuidedDenoiser::new(MockNetwork::new(PredictionType::Epsilon), schedule.clone(), 1.0).unwrap();
        let uncond = GuidedDenoiser::new(MockNetwork::new(PredictionType::Epsilon), schedule, 0.0).unwrap();

        let x_values = values(x.clone());
        assert_eq!(
            values(cond.predict_noise(x.clone(), 1.0, 0.5)),
            x_values.iter().map(|x| x + 3.0).collect::<Vec<_>>()
        );
        assert_eq!(
            values(uncond.predict_noise(x.clone(), 1.0, 0.5)),
            x_values.iter().map(|x| x + 1.0).collect::<Vec<_>>()
        );

        // sigma 0: nothing to remove
        assert_eq!(values(cond.predict_original(x, 1.0, 0.0)), x_values);
    }

    #[test]
    fn test_set_step_switches_conditioning() {
        let device = Default::default();
        let mut denoiser = GuidedDenoiser::new(
            MockNetwork::new(PredictionType::Epsilon),
            vec![conditioning(0.0, 1.0, &device), conditioning(0.0, 2.0, &device)],
            1.0,
        )
        .unwrap();
        let x = latents(&device);
        let x_values = values(x.clone());

        denoiser.set_step(1).unwrap();
        assert_eq!(denoiser.current_step(), 1);
        assert_eq!(
            values(denoiser.predict_noise(x.clone(), 1.0, 0.5)),
            x_values.iter().map(|x| x + 2.0).collect::<Vec<_>>()
        );

        assert!(matches!(
            denoiser.set_step(2),
            Err(GuidanceError::StepOutOfRange { step: 2, len: 2 })
        ));

        denoiser.reset();
        assert_eq!(denoiser.current_step(), 0);
        assert_eq!(
            values(denoiser.predict_noise(x, 1.0, 0.5)),
            x_values.iter().map(|x| x + 1.0).collect::<Vec<_>>()
        );
    }

    #[test]
    fn test_v_prediction_formulas() {
        let device = Default::default();
        let denoiser = GuidedDenoiser::new(
            MockNetwork::new(PredictionType::V),
            vec![conditioning(2.0, 2.0, &device)],
            7.5,
        )
        .unwrap();
        let x = latents(&device);
        let x_values = values(x.clone());

        // v = x + 2 for both halves
        let alpha: f64 = 0.64;
        let noise = values(denoiser.predict_noise(x.clone(), 5.0, alpha));
        let expected: Vec<f32> = x_values.iter().map(|x| 0.8 * (x + 2.0) + 0.6 * x).collect();
        assert_close(&noise, &expected);

        let sigma: f64 = 0.75;
        let (c_in, c_skip, c_out) = (0.8f32, 0.64f32, -0.6f32);
        let original = values(denoiser.predict_original(x, 5.0, sigma));
        let expected: Vec<f32> = x_values.iter().map(|x| (c_in * x + 2.0) * c_out + x * c_skip).collect();
        assert_close(&original, &expected);
    }

    #[test]
    fn test_epsilon_original() {
        let device = Default::default();
        let denoiser = GuidedDenoiser::new(
            MockNetwork::new(PredictionType::Epsilon),
            vec![conditioning(1.0, 1.0, &device)],
            3.0,
        )
        .unwrap();
        let x = latents(&device);
        let x_values = values(x.clone());

        let original = values(denoiser.predict_original(x, 5.0, 0.75));
        let expected: Vec<f32> = x_values.iter().map(|x| x - 0.75 * (0.8 * x + 1.0)).collect();
        assert_close(&original, &expected);
    }

    #[test]
    fn test_full_mask_restores_original() {
        let device = Default::default();
        let mut denoiser = GuidedDenoiser::new(
            MockNetwork::new(PredictionType::Epsilon),
            vec![conditioning(1.0, 3.0, &device)],
            7.5,
        )
        .unwrap();
        let original = latents(&device);
        denoiser.set_mask(Tensor::ones([1, 1, 2, 2], &device), original.clone());
        assert!(denoiser.is_masked());

        let noisy = Tensor::<TestBackend, 4>::random([1, 1, 2, 2], Distribution::Normal(0.0, 1.0), &device);
        let out = values(denoiser.predict_original(noisy, 10.0, 2.0));
        assert_eq!(out, values(original * LATENT_SCALE));
    }

    #[test]
    fn test_empty_mask_is_guided_prediction() {
        let device = Default::default();
        let schedule = vec![conditioning(1.0, 3.0, &device)];
        let plain = GuidedDenoiser::new(MockNetwork::new(PredictionType::Epsilon), schedule.clone(), 7.5).unwrap();
        let mut masked = GuidedDenoiser::new(MockNetwork::new(PredictionType::Epsilon), schedule, 7.5).unwrap();
        masked.set_mask(Tensor::zeros([1, 1, 2, 2], &device), latents(&device));

        let x = latents(&device);
        assert_eq!(
            values(masked.predict_original(x.clone(), 10.0, 2.0)),
            values(plain.predict_original(x, 10.0, 2.0))
        );
    }

    #[test]
    fn test_mask_noise() {
        let device = Default::default();
        let mut denoiser = GuidedDenoiser::new(
            MockNetwork::new(PredictionType::Epsilon),
            vec![conditioning(0.0, 0.0, &device)],
            1.0,
        )
        .unwrap();
        let x = latents(&device);

        // no mask: untouched, noise never sampled
        let out = denoiser.mask_noise(x.clone(), 0.25, || panic!("noise sampled without a mask"));
        assert_eq!(values(out), values(x.clone()));

        // left column preserved
        let mask = Tensor::from_data(TensorData::new(vec![1.0f32, 0.0, 1.0, 0.0], [1, 1, 2, 2]), &device);
        let original = Tensor::ones([1, 1, 2, 2], &device);
        denoiser.set_mask(mask, original);

        let out = values(denoiser.mask_noise(x.clone(), 0.25, || Tensor::full([1, 1, 2, 2], 2.0, &device)));
        let noised = 0.5 * LATENT_SCALE as f32 + (0.75f32).sqrt() * 2.0;
        let x_values = values(x);
        assert_close(&out, &[noised, x_values[1], noised, x_values[3]]);

        denoiser.reset();
        assert!(!denoiser.is_masked());
    }
}
