//! ControlNet: auxiliary residuals conditioned on a control image.

use burn::prelude::*;
use image::DynamicImage;

use crate::artifact::Features;
use crate::error::ModelError;
use crate::images::{self, Normalization};
use crate::managed::ManagedModel;
use crate::unet::{
    down_residual_name, ControlResiduals, DOWN_RESIDUAL_COUNT, HIDDEN_STATES_INPUT,
    MID_RESIDUAL_INPUT, SAMPLE_INPUT, TIMESTEP_INPUT,
};

/// Input feature carrying the preprocessed conditioning image.
pub const CONDITIONING_INPUT: &str = "controlnet_cond";

pub struct ControlNet<B: Backend> {
    model: ManagedModel<B>,
    /// Preprocessed conditioning tensor, already batch-duplicated for CFG.
    conditioning: Option<Tensor<B, 4>>,
    pub conditioning_scale: f32,
    width: usize,
    height: usize,
    device: B::Device,
}

impl<B: Backend> ControlNet<B> {
    pub fn new(model: ManagedModel<B>, width: usize, height: usize, device: B::Device) -> Self {
        Self {
            model,
            conditioning: None,
            conditioning_scale: 1.0,
            width,
            height,
            device,
        }
    }

    pub fn model(&self) -> &ManagedModel<B> {
        &self.model
    }

    /// Preprocess the conditioning image once: bilinear resize, `[0, 1]`
    /// normalization, and duplication along the batch axis for the guidance
    /// split.
    pub fn set_conditioning_image(&mut self, image: &DynamicImage, batch: usize) {
        let single = images::tensor_from_image(
            image,
            self.width,
            self.height,
            Normalization::Unit,
            &self.device,
        );
        self.conditioning = Some(Tensor::cat(vec![single; batch], 0));
    }

    pub fn clear_conditioning_image(&mut self) {
        self.conditioning = None;
    }

    pub fn is_active(&self) -> bool {
        self.conditioning.is_some()
    }

    /// One residual pair per input latent, or `None` when no conditioning
    /// image is set. Residuals are scaled elementwise by
    /// `conditioning_scale`.
    pub fn predict_residuals(
        &self,
        latents: &[Tensor<B, 4>],
        time_step: usize,
        hidden_states: &Tensor<B, 4>,
    ) -> Result<Option<Vec<ControlResiduals<B>>>, ModelError> {
        let Some(conditioning) = &self.conditioning else {
            return Ok(None);
        };

        let residuals = latents
            .iter()
            .map(|latent| {
                let batch = latent.dims()[0];
                let mut features = Features::new();
                features.insert(SAMPLE_INPUT.to_string(), latent.clone());
                features.insert(
                    TIMESTEP_INPUT.to_string(),
                    Tensor::from_data(
                        TensorData::new(vec![time_step as f32; batch], [batch, 1, 1, 1]),
                        &self.device,
                    ),
                );
                features.insert(HIDDEN_STATES_INPUT.to_string(), hidden_states.clone());
                features.insert(CONDITIONING_INPUT.to_string(), conditioning.clone());

                self.model.perform(|artifact| {
                    let mut outputs = artifact.predict(features)?;
                    let down = (0..DOWN_RESIDUAL_COUNT)
                        .map(|index| {
                            let name = down_residual_name(index);
                            outputs.remove(&name).ok_or_else(|| {
                                ModelError::InferenceFailed {
                                    name: self.model.name().to_string(),
                                    reason: format!("missing residual output {name}"),
                                }
                            })
                        })
                        .collect::<Result<Vec<_>, _>>()?;
                    let mid = outputs.remove(MID_RESIDUAL_INPUT).ok_or_else(|| {
                        ModelError::InferenceFailed {
                            name: self.model.name().to_string(),
                            reason: format!("missing residual output {MID_RESIDUAL_INPUT}"),
                        }
                    })?;
                    Ok(self.scaled(ControlResiduals { down, mid }))
                })
            })
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Some(residuals))
    }

    fn scaled(&self, residuals: ControlResiduals<B>) -> ControlResiduals<B> {
        if (self.conditioning_scale - 1.0).abs() < f32::EPSILON {
            return residuals;
        }
        ControlResiduals {
            down: residuals
                .down
                .into_iter()
                .map(|tensor| tensor * self.conditioning_scale)
                .collect(),
            mid: residuals.mid * self.conditioning_scale,
        }
    }
}
