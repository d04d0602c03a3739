//! Noise-prediction model: single or chunked artifacts plus a capability
//! record computed once.

use burn::prelude::*;
use tracing::debug;

use crate::artifact::{Artifact, Features};
use crate::error::ModelError;
use crate::managed::ManagedModel;
use crate::metadata::{ModelFunction, ModelMetadata};

pub const SAMPLE_INPUT: &str = "sample";
pub const TIMESTEP_INPUT: &str = "timestep";
pub const HIDDEN_STATES_INPUT: &str = "encoder_hidden_states";
pub const MID_RESIDUAL_INPUT: &str = "mid_block_res_sample";
pub const DOWN_RESIDUAL_PREFIX: &str = "down_block_res_samples";
pub const DOWN_RESIDUAL_COUNT: usize = 12;

/// Default latent edge for a 512-pixel model.
const DEFAULT_LATENT_EDGE: usize = 64;

pub fn down_residual_name(index: usize) -> String {
    format!("{DOWN_RESIDUAL_PREFIX}_{index:02}")
}

/// What the loaded model can do, derived once.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct UNetCapabilities {
    /// The first conv expects 9 channels: `(noise, mask, masked image)`.
    pub can_inpaint: bool,
    /// The timestep input is batched three ways (instruct variant).
    pub takes_instructions: bool,
    /// The model declares ControlNet residual inputs.
    pub supports_controlnet: bool,
}

impl UNetCapabilities {
    /// Derived from the declared I/O of a loaded artifact.
    pub fn from_artifact<B: Backend>(model: &dyn Artifact<B>) -> Self {
        let can_inpaint = model
            .input(SAMPLE_INPUT)
            .is_some_and(|desc| desc.shape.get(1) == Some(&9));
        let takes_instructions = model
            .input(TIMESTEP_INPUT)
            .is_some_and(|desc| desc.shape.first() == Some(&3));
        let supports_controlnet = model.has_input(MID_RESIDUAL_INPUT);
        Self {
            can_inpaint,
            takes_instructions,
            supports_controlnet,
        }
    }

    /// Derived from metadata without loading the artifact.
    pub fn from_metadata(metadata: &ModelMetadata) -> Self {
        Self {
            can_inpaint: metadata.function == ModelFunction::Inpaint,
            takes_instructions: metadata.function == ModelFunction::Instructions,
            supports_controlnet: metadata.controlnet_support,
        }
    }
}

/// Auxiliary residual tensors produced by a ControlNet for one prediction.
pub struct ControlResiduals<B: Backend> {
    /// One residual per down block, `DOWN_RESIDUAL_COUNT` entries.
    pub down: Vec<Tensor<B, 4>>,
    pub mid: Tensor<B, 4>,
}

enum Stages<B: Backend> {
    Single(ManagedModel<B>),
    /// Two artifacts; the first stage's outputs are merged into the second
    /// stage's input dictionary.
    Chunked {
        first: ManagedModel<B>,
        second: ManagedModel<B>,
    },
}

pub struct UNet<B: Backend> {
    stages: Stages<B>,
    capabilities: UNetCapabilities,
    latent_height: usize,
    latent_width: usize,
    device: B::Device,
}

impl<B: Backend> UNet<B> {
    pub fn single(
        model: ManagedModel<B>,
        metadata: Option<&ModelMetadata>,
        device: B::Device,
    ) -> Result<Self, ModelError> {
        Self::build(Stages::Single(model), metadata, device)
    }

    pub fn chunked(
        first: ManagedModel<B>,
        second: ManagedModel<B>,
        metadata: Option<&ModelMetadata>,
        device: B::Device,
    ) -> Result<Self, ModelError> {
        Self::build(Stages::Chunked { first, second }, metadata, device)
    }

    fn build(
        stages: Stages<B>,
        metadata: Option<&ModelMetadata>,
        device: B::Device,
    ) -> Result<Self, ModelError> {
        let (capabilities, latent_height, latent_width) = match metadata {
            Some(metadata) => {
                let capabilities = UNetCapabilities::from_metadata(metadata);
                let latent_height = metadata.height.map_or(DEFAULT_LATENT_EDGE, |h| h / 8);
                let latent_width = metadata.width.map_or(DEFAULT_LATENT_EDGE, |w| w / 8);
                (capabilities, latent_height, latent_width)
            }
            None => {
                // One-shot inspection load; the artifact stays loaded until
                // the owner applies its resource policy.
                let first = match &stages {
                    Stages::Single(model) => model,
                    Stages::Chunked { first, .. } => first,
                };
                first.perform(|model| {
                    let capabilities = UNetCapabilities::from_artifact(model);
                    let desc = model.input(SAMPLE_INPUT).or_else(|| model.inputs().first());
                    let [_, _, height, width] =
                        desc.ok_or_else(|| ModelError::InferenceFailed {
                            name: first.name().to_string(),
                            reason: "artifact declares no inputs".into(),
                        })?
                        .dims()?;
                    Ok((capabilities, height, width))
                })?
            }
        };
        debug!(
            can_inpaint = capabilities.can_inpaint,
            takes_instructions = capabilities.takes_instructions,
            supports_controlnet = capabilities.supports_controlnet,
            "noise predictor ready"
        );
        Ok(Self {
            stages,
            capabilities,
            latent_height,
            latent_width,
            device,
        })
    }

    pub fn capabilities(&self) -> UNetCapabilities {
        self.capabilities
    }

    /// Replication factor of the classifier-free guidance batch.
    pub fn batch(&self) -> usize {
        if self.capabilities.takes_instructions {
            3
        } else {
            2
        }
    }

    /// Latent resolution as `(height, width)`.
    pub fn latent_size(&self) -> (usize, usize) {
        (self.latent_height, self.latent_width)
    }

    pub fn unload(&self) {
        match &self.stages {
            Stages::Single(model) => model.unload(),
            Stages::Chunked { first, second } => {
                first.unload();
                second.unload();
            }
        }
    }

    pub fn prewarm(&self) -> Result<(), ModelError> {
        match &self.stages {
            Stages::Single(model) => model.prewarm(),
            Stages::Chunked { first, second } => {
                first.prewarm()?;
                second.prewarm()
            }
        }
    }

    pub fn is_loaded(&self) -> bool {
        match &self.stages {
            Stages::Single(model) => model.is_loaded(),
            Stages::Chunked { first, second } => first.is_loaded() || second.is_loaded(),
        }
    }

    /// Predict the noise residual for each assembled per-image input.
    pub fn predict_noise(
        &self,
        latents: &[Tensor<B, 4>],
        time_step: usize,
        hidden_states: &Tensor<B, 4>,
        residuals: Option<&[ControlResiduals<B>]>,
    ) -> Result<Vec<Tensor<B, 4>>, ModelError> {
        latents
            .iter()
            .enumerate()
            .map(|(index, latent)| {
                let residual = residuals.map(|all| &all[index]);
                self.predict_single(latent.clone(), time_step, hidden_states, residual)
            })
            .collect()
    }

    fn predict_single(
        &self,
        latent: Tensor<B, 4>,
        time_step: usize,
        hidden_states: &Tensor<B, 4>,
        residuals: Option<&ControlResiduals<B>>,
    ) -> Result<Tensor<B, 4>, ModelError> {
        let batch = self.batch();
        let mut features = Features::new();
        features.insert(SAMPLE_INPUT.to_string(), latent);
        features.insert(
            TIMESTEP_INPUT.to_string(),
            Tensor::from_data(
                TensorData::new(vec![time_step as f32; batch], [batch, 1, 1, 1]),
                &self.device,
            ),
        );
        features.insert(HIDDEN_STATES_INPUT.to_string(), hidden_states.clone());
        if let Some(residuals) = residuals {
            for (index, down) in residuals.down.iter().enumerate() {
                features.insert(down_residual_name(index), down.clone());
            }
            features.insert(MID_RESIDUAL_INPUT.to_string(), residuals.mid.clone());
        }

        match &self.stages {
            Stages::Single(model) => model.perform(|artifact| {
                let mut features = features;
                self.prepare_stage(artifact, &mut features)?;
                let outputs = artifact.predict(features)?;
                take_primary_output(artifact, outputs, model.name())
            }),
            Stages::Chunked { first, second } => {
                let first_features = features.clone();
                let stage_outputs = first.perform(|artifact| {
                    let mut features = first_features;
                    self.prepare_stage(artifact, &mut features)?;
                    artifact.predict(features)
                })?;

                let mut merged = features;
                for (name, tensor) in stage_outputs {
                    if merged.contains_key(&name) {
                        return Err(ModelError::InferenceFailed {
                            name: first.name().to_string(),
                            reason: format!(
                                "stage output {name} collides with a pipeline input"
                            ),
                        });
                    }
                    merged.insert(name, tensor);
                }

                second.perform(|artifact| {
                    let mut merged = merged;
                    self.prepare_stage(artifact, &mut merged)?;
                    let outputs = artifact.predict(merged)?;
                    take_primary_output(artifact, outputs, second.name())
                })
            }
        }
    }

    /// Validate the assembled sample against the declaration and zero-fill
    /// any ControlNet inputs the model declares but the caller did not set.
    fn prepare_stage(
        &self,
        artifact: &dyn Artifact<B>,
        features: &mut Features<B>,
    ) -> Result<(), ModelError> {
        if let Some(desc) = artifact.input(SAMPLE_INPUT) {
            let actual = features[SAMPLE_INPUT].dims().to_vec();
            if desc.shape != actual {
                return Err(ModelError::ShapeMismatch {
                    feature: SAMPLE_INPUT.to_string(),
                    expected: desc.shape.clone(),
                    actual,
                });
            }
        }
        for desc in artifact.inputs() {
            let is_residual =
                desc.name == MID_RESIDUAL_INPUT || desc.name.starts_with(DOWN_RESIDUAL_PREFIX);
            if is_residual && !features.contains_key(&desc.name) {
                features.insert(desc.name.clone(), Tensor::zeros(desc.dims()?, &self.device));
            }
        }
        Ok(())
    }
}

fn take_primary_output<B: Backend>(
    artifact: &dyn Artifact<B>,
    mut outputs: Features<B>,
    model_name: &str,
) -> Result<Tensor<B, 4>, ModelError> {
    let key = artifact
        .outputs()
        .first()
        .map(|desc| desc.name.clone())
        .unwrap_or_else(|| outputs.keys().next().cloned().unwrap_or_default());
    outputs.remove(&key).ok_or_else(|| ModelError::InferenceFailed {
        name: model_name.to_string(),
        reason: format!("missing output {key}"),
    })
}
