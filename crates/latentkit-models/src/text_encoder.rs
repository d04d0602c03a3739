//! Prompt embedding through the text-encoder artifact.

use burn::prelude::*;

use crate::artifact::Features;
use crate::error::ModelError;
use crate::managed::ManagedModel;
use crate::tokenizer::PromptTokenizer;

/// Output feature carrying the embeddings; the first output is used when the
/// artifact does not name one.
pub const HIDDEN_STATE_OUTPUT: &str = "last_hidden_state";

/// Model-declared token sequence length of the Stable Diffusion family.
pub const DEFAULT_SEQUENCE_LENGTH: usize = 77;

pub struct TextEncoder<B: Backend> {
    model: ManagedModel<B>,
    tokenizer: PromptTokenizer,
    sequence_length: usize,
    device: B::Device,
}

impl<B: Backend> TextEncoder<B> {
    pub fn new(
        model: ManagedModel<B>,
        tokenizer: PromptTokenizer,
        sequence_length: usize,
        device: B::Device,
    ) -> Self {
        Self {
            model,
            tokenizer,
            sequence_length,
            device,
        }
    }

    pub fn model(&self) -> &ManagedModel<B> {
        &self.model
    }

    /// Hidden states `[1, 1, L, E]` for one prompt.
    pub fn encode(&self, text: &str) -> Result<Tensor<B, 4>, ModelError> {
        let ids = self.tokenizer.encode(text, self.sequence_length)?;
        let values: Vec<f32> = ids.iter().map(|&id| id as f32).collect();
        let tokens = Tensor::from_data(
            TensorData::new(values, [1, 1, 1, self.sequence_length]),
            &self.device,
        );

        self.model.perform(|model| {
            let input_name = model
                .inputs()
                .first()
                .map(|desc| desc.name.clone())
                .ok_or_else(|| ModelError::InferenceFailed {
                    name: self.model.name().to_string(),
                    reason: "artifact declares no inputs".into(),
                })?;
            let mut outputs = model.predict(Features::from([(input_name, tokens)]))?;

            let key = if outputs.contains_key(HIDDEN_STATE_OUTPUT) {
                HIDDEN_STATE_OUTPUT.to_string()
            } else {
                model
                    .outputs()
                    .first()
                    .map(|desc| desc.name.clone())
                    .ok_or_else(|| ModelError::InferenceFailed {
                        name: self.model.name().to_string(),
                        reason: "artifact declares no outputs".into(),
                    })?
            };
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
    use crate::artifact::{FeatureDescription, FnArtifact};
    use crate::tokenizer::{END_OF_TEXT, START_OF_TEXT};
    use std::collections::HashMap;

    type TestBackend = burn_ndarray::NdArray;

    fn tokenizer() -> PromptTokenizer {
        let vocab = HashMap::from([
            (START_OF_TEXT.to_string(), 0u32),
            (END_OF_TEXT.to_string(), 1u32),
            ("a</w>".to_string(), 2u32),
        ]);
        PromptTokenizer::from_parts(vocab, vec![]).unwrap()
    }

    fn encoder(output_name: &str) -> TextEncoder<TestBackend> {
        let output_name = output_name.to_string();
        let model = ManagedModel::new("text_encoder", move || {
            let output_name = output_name.clone();
            Ok(Box::new(FnArtifact::new(
                vec![FeatureDescription::new("input_ids", [1, 1, 1, 8])],
                vec![FeatureDescription::new(output_name.clone(), [1, 1, 8, 4])],
                move |inputs| {
                    assert!(inputs.contains_key("input_ids"));
                    let device = Default::default();
                    Ok(Features::from([(
                        output_name.clone(),
                        Tensor::zeros([1, 1, 8, 4], &device),
                    )]))
                },
            )) as Box<dyn crate::artifact::Artifact<TestBackend>>)
        });
        TextEncoder::new(model, tokenizer(), 8, Default::default())
    }

    #[test]
    fn reads_the_named_hidden_state_output() {
        let encoder = encoder(HIDDEN_STATE_OUTPUT);
        let states = encoder.encode("a").unwrap();
        assert_eq!(states.dims(), [1, 1, 8, 4]);
    }

    #[test]
    fn falls_back_to_the_first_output() {
        let encoder = encoder("embeddings");
        let states = encoder.encode("a").unwrap();
        assert_eq!(states.dims(), [1, 1, 8, 4]);
    }
}
