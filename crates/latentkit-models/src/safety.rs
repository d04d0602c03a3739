//! Optional safety classifier.
//!
//! The classifier is an opaque callable: one decoded image tensor in, one
//! score tensor out. Anything above the threshold flags the image.

use burn::prelude::*;

use crate::artifact::Features;
use crate::error::ModelError;
use crate::managed::ManagedModel;

const FLAG_THRESHOLD: f32 = 0.5;

pub struct SafetyChecker<B: Backend> {
    model: ManagedModel<B>,
}

impl<B: Backend> SafetyChecker<B> {
    pub fn new(model: ManagedModel<B>) -> Self {
        Self { model }
    }

    pub fn model(&self) -> &ManagedModel<B> {
        &self.model
    }

    /// Check a decoded `[1, 3, H, W]` image tensor in `[-1, 1]`.
    pub fn is_safe(&self, image: &Tensor<B, 4>) -> Result<bool, ModelError> {
        let image = image.clone();
        self.model.perform(|model| {
            let input_name = model
                .inputs()
                .first()
                .map(|desc| desc.name.clone())
                .ok_or_else(|| ModelError::InferenceFailed {
                    name: self.model.name().to_string(),
                    reason: "artifact declares no inputs".into(),
                })?;
            let mut outputs = model.predict(Features::from([(input_name, image)]))?;
            let key = model
                .outputs()
                .first()
                .map(|desc| desc.name.clone())
                .unwrap_or_else(|| outputs.keys().next().cloned().unwrap_or_default());
            let scores = outputs.remove(&key).ok_or_else(|| ModelError::InferenceFailed {
                name: self.model.name().to_string(),
                reason: format!("missing output {key}"),
            })?;
            let values: Vec<f32> = scores.into_data().to_vec().unwrap();
            Ok(values.iter().all(|score| *score <= FLAG_THRESHOLD))
        })
    }
}
