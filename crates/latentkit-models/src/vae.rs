//! VAE encoder and decoder wrappers.

use burn::prelude::*;
use image::DynamicImage;
use latentkit_samplers::NoiseGenerator;

use crate::artifact::Features;
use crate::error::ModelError;
use crate::images::{self, Normalization};
use crate::managed::ManagedModel;

/// Latent scaling of the Stable Diffusion VAE.
pub const LATENT_SCALE_FACTOR: f32 = 0.18215;

const LOG_VARIANCE_MIN: f32 = -30.0;
const LOG_VARIANCE_MAX: f32 = 20.0;

/// Image -> latent via diagonal-Gaussian reparameterization.
///
/// The encoder owns no randomness: the caller injects the generator so one
/// seed governs every noise source of a request.
pub struct VaeEncoder<B: Backend> {
    model: ManagedModel<B>,
    width: usize,
    height: usize,
    device: B::Device,
}

impl<B: Backend> VaeEncoder<B> {
    pub fn new(model: ManagedModel<B>, width: usize, height: usize, device: B::Device) -> Self {
        Self {
            model,
            width,
            height,
            device,
        }
    }

    pub fn model(&self) -> &ManagedModel<B> {
        &self.model
    }

    /// Declared image input size as `(width, height)`.
    pub fn input_size(&self) -> (usize, usize) {
        (self.width, self.height)
    }

    /// Encode an RGB image to a `[1, 4, h, w]` latent.
    pub fn encode(
        &self,
        image: &DynamicImage,
        scale_factor: f32,
        rng: &mut NoiseGenerator,
    ) -> Result<Tensor<B, 4>, ModelError> {
        let input = images::tensor_from_image(
            image,
            self.width,
            self.height,
            Normalization::SignedUnit,
            &self.device,
        );
        self.encode_tensor(input, scale_factor, rng)
    }

    /// Encode a caller-prepared `[1, 3, h, w]` tensor in `[-1, 1]`.
    ///
    /// The artifact outputs `[1, 2c, h, w]` moments read as `(mean, logvar)`
    /// along the channel axis; each latent element is
    /// `(mean + exp(0.5 * clamp(logvar)) * z) * scale_factor` with `z` drawn
    /// from `rng` in row-major order.
    pub fn encode_tensor(
        &self,
        input: Tensor<B, 4>,
        scale_factor: f32,
        rng: &mut NoiseGenerator,
    ) -> Result<Tensor<B, 4>, ModelError> {
        let moments = self.model.perform(|model| {
            let input_name = model
                .inputs()
                .first()
                .map(|desc| desc.name.clone())
                .ok_or_else(|| ModelError::InferenceFailed {
                    name: self.model.name().to_string(),
                    reason: "artifact declares no inputs".into(),
                })?;
            let mut outputs = model.predict(Features::from([(input_name, input)]))?;
            let key = model
                .outputs()
                .first()
                .map(|desc| desc.name.clone())
                .unwrap_or_else(|| outputs.keys().next().cloned().unwrap_or_default());
            outputs.remove(&key).ok_or_else(|| ModelError::InferenceFailed {
                name: self.model.name().to_string(),
                reason: format!("missing output {key}"),
            })
        })?;

        let [batch, channels, height, width] = moments.dims();
        if channels % 2 != 0 {
            return Err(ModelError::ShapeMismatch {
                feature: "latent moments".into(),
                expected: vec![batch, 8, height, width],
                actual: vec![batch, channels, height, width],
            });
        }
        let latent_channels = channels / 2;

        let mean = moments.clone().narrow(1, 0, latent_channels);
        let log_variance = moments
            .narrow(1, latent_channels, latent_channels)
            .clamp(LOG_VARIANCE_MIN, LOG_VARIANCE_MAX);
        let std = (log_variance * 0.5).exp();
        let noise = rng.normal_tensor([batch, latent_channels, height, width], &self.device);

        Ok((mean + std * noise) * scale_factor)
    }
}

/// Latent -> RGB image tensor.
pub struct VaeDecoder<B: Backend> {
    model: ManagedModel<B>,
}

impl<B: Backend> VaeDecoder<B> {
    pub fn new(model: ManagedModel<B>) -> Self {
        Self { model }
    }

    pub fn model(&self) -> &ManagedModel<B> {
        &self.model
    }

    /// Decode a `[1, 4, h, w]` latent to a `[1, 3, H, W]` image tensor in
    /// `[-1, 1]`. The latent scale applied at encode time is inverted here.
    pub fn decode(
        &self,
        latent: Tensor<B, 4>,
        scale_factor: f32,
    ) -> Result<Tensor<B, 4>, ModelError> {
        let scaled = latent / scale_factor;
        self.model.perform(|model| {
            let input_name = model
                .inputs()
                .first()
                .map(|desc| desc.name.clone())
                .ok_or_else(|| ModelError::InferenceFailed {
                    name: self.model.name().to_string(),
                    reason: "artifact declares no inputs".into(),
                })?;
            let mut outputs = model.predict(Features::from([(input_name, scaled)]))?;
            let key = model
                .outputs()
                .first()
                .map(|desc| desc.name.clone())
                .unwrap_or_else(|| outputs.keys().next().cloned().unwrap_or_default());
            outputs.remove(&key).ok_or_else(|| ModelError::InferenceFailed {
                name: self.model.name().to_string(),
                reason: format!("missing output {key}"),
            })
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::artifact::{Artifact, FeatureDescription, FnArtifact};

    type TestBackend = burn_ndarray::NdArray;

    /// Encoder artifact emitting constant moments: mean `0.5`, logvar `0`.
    fn moments_model() -> ManagedModel<TestBackend> {
        ManagedModel::new("vae_encoder", || {
            Ok(Box::new(FnArtifact::new(
                vec![FeatureDescription::new("sample", [1, 3, 16, 16])],
                vec![FeatureDescription::new("latent_dist", [1, 8, 2, 2])],
                |_| {
                    let device = Default::default();
                    let mut values = vec![0.5f32; 4 * 4];
                    values.extend(vec![0.0f32; 4 * 4]);
                    Ok(Features::from([(
                        "latent_dist".to_string(),
                        Tensor::from_data(TensorData::new(values, [1, 8, 2, 2]), &device),
                    )]))
                },
            )) as Box<dyn Artifact<TestBackend>>)
        })
    }

    #[test]
    fn reparameterizes_with_the_injected_generator() {
        let encoder = VaeEncoder::new(moments_model(), 16, 16, Default::default());
        let device = Default::default();
        let input = Tensor::zeros([1, 3, 16, 16], &device);

        let mut rng = NoiseGenerator::new(42);
        let latent = encoder
            .encode_tensor(input, LATENT_SCALE_FACTOR, &mut rng)
            .unwrap();
        assert_eq!(latent.dims(), [1, 4, 2, 2]);

        // logvar 0 -> std 1, so each element is (0.5 + z) * scale.
        let mut reference = NoiseGenerator::new(42);
        let values: Vec<f32> = latent.into_data().to_vec().unwrap();
        for value in values {
            let expected = (0.5 + reference.next_normal() as f32) * LATENT_SCALE_FACTOR;
            assert!((value - expected).abs() < 1e-6);
        }
    }

    #[test]
    fn log_variance_is_clamped_before_exponentiation() {
        let model = ManagedModel::new("vae_encoder", || {
            Ok(Box::new(FnArtifact::new(
                vec![FeatureDescription::new("sample", [1, 3, 8, 8])],
                vec![FeatureDescription::new("latent_dist", [1, 2, 1, 1])],
                |_| {
                    let device = Default::default();
                    // Absurd logvar that would overflow exp without the clamp.
                    Ok(Features::from([(
                        "latent_dist".to_string(),
                        Tensor::from_data(
                            TensorData::new(vec![0.0f32, 1000.0], [1, 2, 1, 1]),
                            &device,
                        ),
                    )]))
                },
            )) as Box<dyn Artifact<TestBackend>>)
        });
        let encoder = VaeEncoder::<TestBackend>::new(model, 8, 8, Default::default());
        let device = Default::default();
        let mut rng = NoiseGenerator::new(0);
        let latent = encoder
            .encode_tensor(Tensor::zeros([1, 3, 8, 8], &device), 1.0, &mut rng)
            .unwrap();
        let value: f32 = latent.into_data().to_vec().unwrap()[0];
        assert!(value.is_finite());
    }

    #[test]
    fn odd_moment_channels_are_rejected() {
        let model = ManagedModel::new("vae_encoder", || {
            Ok(Box::new(FnArtifact::new(
                vec![FeatureDescription::new("sample", [1, 3, 8, 8])],
                vec![FeatureDescription::new("latent_dist", [1, 3, 1, 1])],
                |_| {
                    let device = Default::default();
                    Ok(Features::from([(
                        "latent_dist".to_string(),
                        Tensor::zeros([1, 3, 1, 1], &device),
                    )]))
                },
            )) as Box<dyn Artifact<TestBackend>>)
        });
        let encoder = VaeEncoder::<TestBackend>::new(model, 8, 8, Default::default());
        let device = Default::default();
        let mut rng = NoiseGenerator::new(0);
        assert!(matches!(
            encoder.encode_tensor(Tensor::zeros([1, 3, 8, 8], &device), 1.0, &mut rng),
            Err(ModelError::ShapeMismatch { .. })
        ));
    }

    #[test]
    fn decoder_inverts_the_latent_scale() {
        let model = ManagedModel::new("vae_decoder", || {
            Ok(Box::new(FnArtifact::new(
                vec![FeatureDescription::new("z", [1, 4, 1, 1])],
                vec![FeatureDescription::new("image", [1, 3, 8, 8])],
                |inputs| {
                    // Echo the scaled latent mean into a flat image tensor.
                    let z = inputs.get("z").unwrap().clone();
                    let value: f32 = z.into_data().to_vec().unwrap()[0];
                    let device = Default::default();
                    Ok(Features::from([(
                        "image".to_string(),
                        Tensor::from_data(
                            TensorData::new(vec![value; 3 * 64], [1, 3, 8, 8]),
                            &device,
                        ),
                    )]))
                },
            )) as Box<dyn Artifact<TestBackend>>)
        });
        let decoder = VaeDecoder::<TestBackend>::new(model);
        let device = Default::default();
        let latent = Tensor::from_data(
            TensorData::new(vec![LATENT_SCALE_FACTOR; 4], [1, 4, 1, 1]),
            &device,
        );
        let image = decoder.decode(latent, LATENT_SCALE_FACTOR).unwrap();
        let value: f32 = image.into_data().to_vec().unwrap()[0];
        assert!((value - 1.0).abs() < 1e-6);
    }
}
