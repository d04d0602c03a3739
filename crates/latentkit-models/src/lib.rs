//! Managed inference artifacts and model wrappers for latentkit.
//!
//! The neural sub-models of the diffusion pipeline are opaque artifacts
//! executed by a host inference framework. This crate owns the seam to that
//! framework ([`Artifact`], [`ModelLoader`]), the lazy lifecycle around each
//! artifact ([`ManagedModel`]), and the typed wrappers that give every model
//! its fixed I/O contract: [`TextEncoder`], [`UNet`], [`ControlNet`],
//! [`VaeEncoder`], [`VaeDecoder`], and [`SafetyChecker`].

pub mod artifact;
pub mod controlnet;
pub mod error;
pub mod images;
pub mod managed;
pub mod metadata;
pub mod safety;
pub mod text_encoder;
pub mod tokenizer;
pub mod unet;
pub mod vae;

pub use artifact::{Artifact, ComputeUnits, FeatureDescription, Features, FnArtifact, ModelLoader};
pub use controlnet::ControlNet;
pub use error::ModelError;
pub use managed::ManagedModel;
pub use metadata::{AttentionImplementation, ModelFunction, ModelMetadata, METADATA_FILE_NAME};
pub use safety::SafetyChecker;
pub use text_encoder::{TextEncoder, DEFAULT_SEQUENCE_LENGTH};
pub use tokenizer::PromptTokenizer;
pub use unet::{ControlResiduals, UNet, UNetCapabilities};
pub use vae::{VaeDecoder, VaeEncoder, LATENT_SCALE_FACTOR};
