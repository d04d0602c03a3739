//! latentkit: an on-device latent-diffusion runtime.
//!
//! Drives the Stable Diffusion model family from a prompt (and optionally an
//! initial image) to finished RGB images. The neural sub-models — text
//! encoder, U-Net, VAE encoder/decoder, optional safety classifier — are
//! opaque artifacts executed by a host inference framework behind
//! [`ModelLoader`]; this crate owns the orchestration: seeded latent
//! preparation, the sampling loop, classifier-free guidance (plain,
//! instruct, inpaint), ControlNet residual injection, and the lazy resource
//! lifecycle around every artifact.
//!
//! ```ignore
//! use std::sync::Arc;
//! use latentkit::{PipelineConfiguration, ResourceDirectory, SampleInput};
//!
//! let resources = ResourceDirectory::open("models/sd-v1-5")?;
//! let mut pipeline = resources.build_pipeline::<Backend>(
//!     Arc::new(loader),
//!     &PipelineConfiguration::default(),
//!     &device,
//! )?;
//!
//! let input = SampleInput {
//!     prompt: "a photo of an astronaut riding a horse".into(),
//!     seed: 93,
//!     ..SampleInput::default()
//! };
//! let images = pipeline.generate_images(&input, 1, false, |_| true)?;
//! ```

pub mod backends;
pub mod error;
pub mod pipeline;
pub mod resources;

pub use error::PipelineError;
pub use pipeline::{GenerationProgress, Pipeline, SampleInput};
pub use resources::{PipelineConfiguration, ResourceDirectory};

pub use latentkit_models as models;
pub use latentkit_samplers as samplers;

pub use latentkit_models::{
    Artifact, ComputeUnits, ControlNet, FeatureDescription, Features, ManagedModel, ModelError,
    ModelLoader, ModelMetadata, SafetyChecker, TextEncoder, UNet, UNetCapabilities, VaeDecoder,
    VaeEncoder,
};
pub use latentkit_samplers::{NoiseGenerator, Scheduler, SchedulerConfig, SchedulerKind};
