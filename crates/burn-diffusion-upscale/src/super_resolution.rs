//! Model-based upscaling

use burn::prelude::*;
use image::imageops::{self, FilterType};
use image::RgbImage;

use crate::pixel::{image_to_tensor, scaled_size, tensor_to_image};
use crate::rrdb::SuperResolution;

/// Upscales every image by `factor` with a super-resolution model
///
/// The model runs repeatedly until an image is at least as wide as its
/// target; the result is then Lanczos-resized to the exact target size.
pub fn upscale_super_resolution<B: Backend>(
    images: &[RgbImage],
    model: &SuperResolution<B>,
    factor: f64,
) -> Vec<RgbImage> {
    let device = model.device();
    let dtype = model.dtype();

    images
        .iter()
        .map(|image| {
            let (target_w, target_h) = scaled_size(image, factor);
            let mut current = image.clone();
            let mut passes = 0;

            while current.width() < target_w {
                let input = image_to_tensor::<B>(&current, &device);
                let input = if input.dtype() != dtype { input.cast(dtype) } else { input };
                current = tensor_to_image(model.forward(input).clamp(0.0, 1.0));
                passes += 1;
            }

            if current.dimensions() != (target_w, target_h) {
                current = imageops::resize(&current, target_w, target_h, FilterType::Lanczos3);
            }
            tracing::debug!(passes, width = target_w, height = target_h, "upscaled image");
            current
        })
        .collect()
}
