//! Pixel-space upscaling and image/tensor conversion

use burn::prelude::*;
use image::imageops::{self, FilterType};
use image::{ImageBuffer, Rgb, RgbImage};

/// `(w * factor, h * factor)`, truncated
pub(crate) fn scaled_size(image: &RgbImage, factor: f64) -> (u32, u32) {
    (
        (image.width() as f64 * factor) as u32,
        (image.height() as f64 * factor) as u32,
    )
}

/// Resizes every image by `factor` with `filter`
pub fn upscale_pixel(images: &[RgbImage], filter: FilterType, factor: f64) -> Vec<RgbImage> {
    images
        .iter()
        .map(|image| {
            let (w, h) = scaled_size(image, factor);
            imageops::resize(image, w, h, filter)
        })
        .collect()
}

/// RGB image to a `[1, 3, h, w]` tensor with values in `[0, 1]`
pub fn image_to_tensor<B: Backend>(image: &RgbImage, device: &B::Device) -> Tensor<B, 4> {
    let (w, h) = (image.width() as usize, image.height() as usize);
    let mut planar = vec![0.0f32; 3 * h * w];
    for (x, y, pixel) in image.enumerate_pixels() {
        let idx = y as usize * w + x as usize;
        for c in 0..3 {
            planar[c * h * w + idx] = pixel[c] as f32 / 255.0;
        }
    }
    Tensor::from_data(TensorData::new(planar, [1, 3, h, w]), device)
}

/// First image of a `[b, 3, h, w]` tensor with values in `[0, 1]`
pub fn tensor_to_image<B: Backend>(tensor: Tensor<B, 4>) -> RgbImage {
    let [_, _, h, w] = tensor.dims();
    let floats: Vec<f32> = tensor
        .slice([0..1, 0..3, 0..h, 0..w])
        .clamp(0.0, 1.0)
        .into_data()
        .iter::<f32>()
        .collect();

    ImageBuffer::from_fn(w as u32, h as u32, |x, y| {
        let idx = y as usize * w + x as usize;
        Rgb(std::array::from_fn(|c| {
            (floats[c * h * w + idx] * 255.0).round() as u8
        }))
    })
}
