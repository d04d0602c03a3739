//! Resource-directory discovery and pipeline construction.
//!
//! A model ships as one directory of compiled artifacts plus tokenizer
//! assets. Required pieces fail construction when absent; optional pieces
//! downgrade capabilities instead.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use burn::prelude::*;
use tracing::info;

use latentkit_models::{
    Artifact, ComputeUnits, ManagedModel, ModelLoader, ModelMetadata, PromptTokenizer,
    SafetyChecker, TextEncoder, UNet, VaeDecoder, VaeEncoder, DEFAULT_SEQUENCE_LENGTH,
};

use crate::error::PipelineError;
use crate::pipeline::Pipeline;

pub const TEXT_ENCODER_STEM: &str = "TextEncoder";
pub const UNET_STEM: &str = "Unet";
pub const UNET_CHUNK1_STEM: &str = "UnetChunk1";
pub const UNET_CHUNK2_STEM: &str = "UnetChunk2";
pub const VAE_ENCODER_STEM: &str = "VAEEncoder";
pub const VAE_DECODER_STEM: &str = "VAEDecoder";
pub const SAFETY_CHECKER_STEM: &str = "SafetyChecker";
pub const VOCAB_FILE: &str = "vocab.json";
pub const MERGES_FILE: &str = "merges.txt";

/// Default image edge when metadata does not declare one.
const DEFAULT_IMAGE_EDGE: usize = 512;

#[derive(Debug, Clone, Default)]
pub struct PipelineConfiguration {
    pub compute_units: ComputeUnits,
    /// Keep at most the model required by the current stage loaded.
    pub reduce_memory: bool,
}

pub struct ResourceDirectory {
    root: PathBuf,
}

impl ResourceDirectory {
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, PipelineError> {
        let root = path.into();
        if !root.is_dir() {
            return Err(PipelineError::ResourceMissing(root));
        }
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// First directory entry whose file stem matches, any extension.
    fn locate(&self, stem: &str) -> Option<PathBuf> {
        let entries = std::fs::read_dir(&self.root).ok()?;
        let mut matches: Vec<PathBuf> = entries
            .flatten()
            .map(|entry| entry.path())
            .filter(|path| {
                path.file_stem()
                    .is_some_and(|candidate| candidate.to_str() == Some(stem))
            })
            .collect();
        matches.sort();
        matches.into_iter().next()
    }

    fn require(&self, stem: &str) -> Result<PathBuf, PipelineError> {
        self.locate(stem)
            .ok_or_else(|| PipelineError::ResourceMissing(self.root.join(stem)))
    }

    fn require_file(&self, name: &str) -> Result<PathBuf, PipelineError> {
        let path = self.root.join(name);
        if !path.is_file() {
            return Err(PipelineError::ResourceMissing(path));
        }
        Ok(path)
    }

    /// Build a pipeline over the artifacts in this directory.
    ///
    /// `UnetChunk1` + `UnetChunk2` are preferred over a single `Unet` when
    /// both are present; a lone `Unet` next to the chunk pair is ignored.
    pub fn build_pipeline<B: Backend>(
        &self,
        loader: Arc<dyn ModelLoader<B>>,
        config: &PipelineConfiguration,
        device: &B::Device,
    ) -> Result<Pipeline<B>, PipelineError> {
        let vocab = self.require_file(VOCAB_FILE)?;
        let merges = self.require_file(MERGES_FILE)?;
        let tokenizer = PromptTokenizer::from_files(&vocab, &merges)?;

        let text_encoder_path = self.require(TEXT_ENCODER_STEM)?;
        let text_encoder = TextEncoder::new(
            managed_model(&loader, "text_encoder", text_encoder_path, config, device),
            tokenizer,
            DEFAULT_SEQUENCE_LENGTH,
            device.clone(),
        );

        let unet = match (self.locate(UNET_CHUNK1_STEM), self.locate(UNET_CHUNK2_STEM)) {
            (Some(chunk1), Some(chunk2)) => {
                info!(root = %self.root.display(), "using the chunked noise predictor");
                let metadata = ModelMetadata::for_artifact(&chunk1);
                UNet::chunked(
                    managed_model(&loader, "unet_chunk1", chunk1, config, device),
                    managed_model(&loader, "unet_chunk2", chunk2, config, device),
                    metadata.as_ref(),
                    device.clone(),
                )?
            }
            _ => {
                let path = self.require(UNET_STEM)?;
                let metadata = ModelMetadata::for_artifact(&path);
                UNet::single(
                    managed_model(&loader, "unet", path, config, device),
                    metadata.as_ref(),
                    device.clone(),
                )?
            }
        };

        let decoder_path = self.require(VAE_DECODER_STEM)?;
        let vae_decoder = VaeDecoder::new(managed_model(
            &loader,
            "vae_decoder",
            decoder_path,
            config,
            device,
        ));

        let mut pipeline = Pipeline::new(text_encoder, unet, vae_decoder, device.clone())
            .with_reduce_memory(config.reduce_memory);

        if let Some(encoder_path) = self.locate(VAE_ENCODER_STEM) {
            let metadata = ModelMetadata::for_artifact(&encoder_path);
            let width = metadata
                .as_ref()
                .and_then(|m| m.width)
                .unwrap_or(DEFAULT_IMAGE_EDGE);
            let height = metadata
                .as_ref()
                .and_then(|m| m.height)
                .unwrap_or(DEFAULT_IMAGE_EDGE);
            pipeline = pipeline.with_vae_encoder(VaeEncoder::new(
                managed_model(&loader, "vae_encoder", encoder_path, config, device),
                width,
                height,
                device.clone(),
            ));
        }

        if let Some(checker_path) = self.locate(SAFETY_CHECKER_STEM) {
            pipeline = pipeline.with_safety_checker(SafetyChecker::new(managed_model(
                &loader,
                "safety_checker",
                checker_path,
                config,
                device,
            )));
        }

        info!(root = %self.root.display(), "pipeline constructed");
        Ok(pipeline)
    }
}

fn managed_model<B: Backend>(
    loader: &Arc<dyn ModelLoader<B>>,
    name: &str,
    path: PathBuf,
    config: &PipelineConfiguration,
    device: &B::Device,
) -> ManagedModel<B> {
    let loader = Arc::clone(loader);
    let compute_units = config.compute_units;
    let device = device.clone();
    ManagedModel::new(name, move || -> Result<Box<dyn Artifact<B>>, _> {
        loader.load(&path, compute_units, &device)
    })
}
