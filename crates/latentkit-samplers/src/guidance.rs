//! Classifier-free guidance fusion.

use burn::prelude::*;

/// Standard classifier-free guidance: `neg + g * (text - neg)`.
pub fn apply_guidance<B: Backend>(
    negative: Tensor<B, 4>,
    text: Tensor<B, 4>,
    guidance_scale: f32,
) -> Tensor<B, 4> {
    negative.clone() + (text - negative) * guidance_scale
}

/// Image-conditioned (instruct) guidance over a three-way split:
/// `neg + g * (text - image) + gI * (image - neg)`.
pub fn apply_instruct_guidance<B: Backend>(
    text: Tensor<B, 4>,
    image: Tensor<B, 4>,
    negative: Tensor<B, 4>,
    guidance_scale: f32,
    image_guidance_scale: f32,
) -> Tensor<B, 4> {
    negative.clone()
        + (text - image.clone()) * guidance_scale
        + (image - negative) * image_guidance_scale
}
