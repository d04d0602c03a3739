//! RGB image <-> planar float tensor conversions.
//!
//! All tensors are NCHW float32. Image inputs are `[-1, 1]` for the VAE
//! encoder and `[0, 1]` for ControlNet conditioning; masks are `[0, 1]`
//! single-channel.

use burn::prelude::*;
use image::imageops::FilterType;
use image::{DynamicImage, Rgb, RgbImage};

/// Value range of a planar image tensor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Normalization {
    /// `[-1, 1]`
    SignedUnit,
    /// `[0, 1]`
    Unit,
}

/// `[1, 3, h, w]` planar tensor from the RGB view of `image`,
/// bilinear-resized to the target size. Alpha is dropped.
pub fn tensor_from_image<B: Backend>(
    image: &DynamicImage,
    width: usize,
    height: usize,
    normalization: Normalization,
    device: &B::Device,
) -> Tensor<B, 4> {
    let resized = image
        .resize_exact(width as u32, height as u32, FilterType::Triangle)
        .to_rgb8();
    let area = width * height;
    let mut data = vec![0.0f32; 3 * area];
    for (x, y, pixel) in resized.enumerate_pixels() {
        let index = y as usize * width + x as usize;
        for channel in 0..3 {
            let value = pixel[channel] as f32 / 255.0;
            data[channel * area + index] = match normalization {
                Normalization::SignedUnit => value * 2.0 - 1.0,
                Normalization::Unit => value,
            };
        }
    }
    Tensor::from_data(TensorData::new(data, [1, 3, height, width]), device)
}

/// `[1, 1, h, w]` mask in `[0, 1]` from the alpha channel, bilinear-resized.
/// Opaque pixels map to 1.
pub fn alpha_tensor<B: Backend>(
    image: &DynamicImage,
    width: usize,
    height: usize,
    device: &B::Device,
) -> Tensor<B, 4> {
    let resized = image
        .resize_exact(width as u32, height as u32, FilterType::Triangle)
        .to_rgba8();
    let mut data = vec![0.0f32; width * height];
    for (x, y, pixel) in resized.enumerate_pixels() {
        data[y as usize * width + x as usize] = pixel[3] as f32 / 255.0;
    }
    Tensor::from_data(TensorData::new(data, [1, 1, height, width]), device)
}

/// RGB image from a `[1, 3, h, w]` tensor with values in `[-1, 1]`.
pub fn image_from_tensor<B: Backend>(tensor: Tensor<B, 4>) -> RgbImage {
    let [_, _, height, width] = tensor.dims();
    let scaled = ((tensor + 1.0) * 127.5).clamp(0.0, 255.0);
    let values: Vec<f32> = scaled.into_data().to_vec().unwrap();
    let area = width * height;
    RgbImage::from_fn(width as u32, height as u32, |x, y| {
        let index = y as usize * width + x as usize;
        Rgb([
            values[index] as u8,
            values[area + index] as u8,
            values[2 * area + index] as u8,
        ])
    })
}

/// Nearest-neighbour downsample of a `[1, c, h, w]` mask to the latent
/// resolution.
pub fn downsample_mask<B: Backend>(
    mask: Tensor<B, 4>,
    target_height: usize,
    target_width: usize,
) -> Tensor<B, 4> {
    let [batch, channels, height, width] = mask.dims();
    let device = mask.device();
    let scale_h = height / target_height;
    let scale_w = width / target_width;

    let values: Vec<f32> = mask.into_data().to_vec().unwrap();
    let mut out = Vec::with_capacity(batch * channels * target_height * target_width);
    for b in 0..batch {
        for c in 0..channels {
            let plane = (b * channels + c) * height * width;
            for y in 0..target_height {
                for x in 0..target_width {
                    out.push(values[plane + (y * scale_h) * width + x * scale_w]);
                }
            }
        }
    }
    Tensor::from_data(
        TensorData::new(out, [batch, channels, target_height, target_width]),
        &device,
    )
}
