//! The seam to the host inference framework.
//!
//! A compiled model is an [`Artifact`]: a named-feature dictionary in, a
//! named-feature dictionary out, with declared I/O shapes that the runtime
//! inspects for capability detection and validation. Every feature is a
//! rank-4 float32 NCHW tensor; scalar side inputs (timesteps, token ids) ride
//! along as `[B, 1, 1, 1]` / `[1, 1, 1, L]`.

use std::collections::HashMap;
use std::path::Path;

use burn::prelude::*;

use crate::error::ModelError;

/// Named feature dictionary at a model boundary.
pub type Features<B> = HashMap<String, Tensor<B, 4>>;

/// Declared input or output of a loaded artifact.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FeatureDescription {
    pub name: String,
    pub shape: Vec<usize>,
}

impl FeatureDescription {
    pub fn new(name: impl Into<String>, shape: impl Into<Vec<usize>>) -> Self {
        Self {
            name: name.into(),
            shape: shape.into(),
        }
    }

    /// The shape as fixed rank-4 dims.
    pub fn dims(&self) -> Result<[usize; 4], ModelError> {
        self.shape
            .clone()
            .try_into()
            .map_err(|_| ModelError::ShapeMismatch {
                feature: self.name.clone(),
                expected: vec![0; 4],
                actual: self.shape.clone(),
            })
    }
}

/// Compute units requested from the host framework.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ComputeUnits {
    #[default]
    All,
    CpuOnly,
    CpuAndGpu,
    CpuAndNeuralEngine,
}

/// One compiled model executed by the host inference framework.
pub trait Artifact<B: Backend>: Send {
    fn inputs(&self) -> &[FeatureDescription];
    fn outputs(&self) -> &[FeatureDescription];
    fn predict(&self, inputs: Features<B>) -> Result<Features<B>, ModelError>;

    fn input(&self, name: &str) -> Option<&FeatureDescription> {
        self.inputs().iter().find(|desc| desc.name == name)
    }

    fn output(&self, name: &str) -> Option<&FeatureDescription> {
        self.outputs().iter().find(|desc| desc.name == name)
    }

    fn has_input(&self, name: &str) -> bool {
        self.input(name).is_some()
    }
}

/// Loads compiled artifacts from disk; implemented by the host framework
/// binding, never by this crate.
pub trait ModelLoader<B: Backend>: Send + Sync {
    fn load(
        &self,
        path: &Path,
        compute_units: ComputeUnits,
        device: &B::Device,
    ) -> Result<Box<dyn Artifact<B>>, ModelError>;
}

/// Closure-backed artifact, for embedding and tests.
pub struct FnArtifact<B: Backend> {
    inputs: Vec<FeatureDescription>,
    outputs: Vec<FeatureDescription>,
    #[allow(clippy::type_complexity)]
    run: Box<dyn Fn(Features<B>) -> Result<Features<B>, ModelError> + Send + Sync>,
}

impl<B: Backend> FnArtifact<B> {
    pub fn new(
        inputs: Vec<FeatureDescription>,
        outputs: Vec<FeatureDescription>,
        run: impl Fn(Features<B>) -> Result<Features<B>, ModelError> + Send + Sync + 'static,
    ) -> Self {
        Self {
            inputs,
            outputs,
            run: Box::new(run),
        }
    }
}

impl<B: Backend> Artifact<B> for FnArtifact<B> {
    fn inputs(&self) -> &[FeatureDescription] {
        &self.inputs
    }

    fn outputs(&self) -> &[FeatureDescription] {
        &self.outputs
    }

    fn predict(&self, inputs: Features<B>) -> Result<Features<B>, ModelError> {
        (self.run)(inputs)
    }
}
