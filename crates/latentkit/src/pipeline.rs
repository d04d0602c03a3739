//! Diffusion pipeline orchestration.
//!
//! One `generate_images` call runs sequentially on the calling thread:
//! encode the prompts, prepare latents from the seed (and optionally an
//! initial image), iterate the scheduler over the noise predictions with
//! guidance fusion, decode, and safety-check. The inference backend may
//! parallelize internally; that is opaque here.

use burn::prelude::*;
use image::{DynamicImage, RgbImage};
use tracing::debug;

use latentkit_models::images;
use latentkit_models::{
    ControlNet, ModelError, SafetyChecker, TextEncoder, UNet, VaeDecoder, VaeEncoder,
    LATENT_SCALE_FACTOR,
};
use latentkit_samplers::{
    apply_guidance, apply_instruct_guidance, NoiseGenerator, Scheduler, SchedulerConfig,
    SchedulerKind,
};

use crate::error::PipelineError;

/// Number of latent channels the seed noise fills.
const NOISE_CHANNELS: usize = 4;

/// One immutable generation request.
#[derive(Clone)]
pub struct SampleInput {
    pub prompt: String,
    pub negative_prompt: String,
    pub init_image: Option<DynamicImage>,
    /// Fraction of the denoising trajectory to run from an image-derived
    /// noised latent. Requires `init_image`; incompatible with
    /// `inpaint_mask`.
    pub strength: Option<f32>,
    /// Mask whose alpha channel selects the region to keep; requires
    /// `init_image`.
    pub inpaint_mask: Option<DynamicImage>,
    pub seed: u32,
    pub step_count: usize,
    pub guidance_scale: f32,
    /// Second guidance scale of the instruct variant; requires `init_image`.
    pub image_guidance_scale: Option<f32>,
    pub scheduler: SchedulerKind,
}

impl Default for SampleInput {
    fn default() -> Self {
        Self {
            prompt: String::new(),
            negative_prompt: String::new(),
            init_image: None,
            strength: None,
            inpaint_mask: None,
            seed: 0,
            step_count: 50,
            guidance_scale: 7.5,
            image_guidance_scale: None,
            scheduler: SchedulerKind::default(),
        }
    }
}

impl SampleInput {
    fn validate(&self) -> Result<(), PipelineError> {
        if let Some(strength) = self.strength {
            if !(0.0..=1.0).contains(&strength) {
                return Err(PipelineError::InvalidInput(format!(
                    "strength {strength} is outside [0, 1]"
                )));
            }
        }
        if self.inpaint_mask.is_some() {
            if self.init_image.is_none() {
                return Err(PipelineError::InvalidInput(
                    "inpainting requires an initial image".into(),
                ));
            }
            if self.strength.is_some() {
                return Err(PipelineError::InvalidInput(
                    "strength does not apply to inpainting".into(),
                ));
            }
            if self.image_guidance_scale.is_some() {
                return Err(PipelineError::InvalidInput(
                    "inpainting and image guidance are mutually exclusive".into(),
                ));
            }
        }
        if self.image_guidance_scale.is_some() && self.init_image.is_none() {
            return Err(PipelineError::InvalidInput(
                "image guidance requires an initial image".into(),
            ));
        }
        Ok(())
    }
}

/// Passed to the progress callback once per timestep, after every scheduler
/// for that step has been updated. Returning `false` cancels the request.
#[derive(Debug, Clone, Copy)]
pub struct GenerationProgress {
    /// 0-indexed step.
    pub step: usize,
    pub step_count: usize,
}

/// Single-slot cache of the last prompt pair's embeddings.
struct CachedEmbeddings<B: Backend> {
    prompt: String,
    negative_prompt: String,
    /// `[1, 1, L, E]` each.
    positive: Tensor<B, 4>,
    negative: Tensor<B, 4>,
}

pub struct Pipeline<B: Backend> {
    text_encoder: TextEncoder<B>,
    unet: UNet<B>,
    vae_decoder: VaeDecoder<B>,
    vae_encoder: Option<VaeEncoder<B>>,
    safety_checker: Option<SafetyChecker<B>>,
    controlnet: Option<ControlNet<B>>,
    reduce_memory: bool,
    cache: Option<CachedEmbeddings<B>>,
    device: B::Device,
}

impl<B: Backend> Pipeline<B> {
    pub fn new(
        text_encoder: TextEncoder<B>,
        unet: UNet<B>,
        vae_decoder: VaeDecoder<B>,
        device: B::Device,
    ) -> Self {
        Self {
            text_encoder,
            unet,
            vae_decoder,
            vae_encoder: None,
            safety_checker: None,
            controlnet: None,
            reduce_memory: false,
            cache: None,
            device,
        }
    }

    pub fn with_vae_encoder(mut self, encoder: VaeEncoder<B>) -> Self {
        self.vae_encoder = Some(encoder);
        self
    }

    pub fn with_safety_checker(mut self, checker: SafetyChecker<B>) -> Self {
        self.safety_checker = Some(checker);
        self
    }

    pub fn with_reduce_memory(mut self, reduce_memory: bool) -> Self {
        self.reduce_memory = reduce_memory;
        self
    }

    pub fn attach_controlnet(&mut self, controlnet: ControlNet<B>) {
        self.controlnet = Some(controlnet);
    }

    pub fn detach_controlnet(&mut self) -> Option<ControlNet<B>> {
        self.controlnet.take()
    }

    pub fn controlnet_mut(&mut self) -> Option<&mut ControlNet<B>> {
        self.controlnet.as_mut()
    }

    pub fn can_inpaint(&self) -> bool {
        self.unet.capabilities().can_inpaint && self.vae_encoder.is_some()
    }

    pub fn can_generate_variations(&self) -> bool {
        self.vae_encoder.is_some()
    }

    pub fn can_safety_check(&self) -> bool {
        self.safety_checker.is_some()
    }

    pub fn takes_instructions(&self) -> bool {
        self.unet.capabilities().takes_instructions
    }

    /// Load and release every owned artifact, populating the host
    /// framework's compilation caches ahead of the first request.
    pub fn prewarm(&self) -> Result<(), ModelError> {
        self.text_encoder.model().prewarm()?;
        self.unet.prewarm()?;
        self.vae_decoder.model().prewarm()?;
        if let Some(encoder) = &self.vae_encoder {
            encoder.model().prewarm()?;
        }
        if let Some(checker) = &self.safety_checker {
            checker.model().prewarm()?;
        }
        if let Some(controlnet) = &self.controlnet {
            controlnet.model().prewarm()?;
        }
        Ok(())
    }

    /// Drop every loaded artifact.
    pub fn unload_resources(&self) {
        self.text_encoder.model().unload();
        self.unet.unload();
        self.vae_decoder.model().unload();
        if let Some(encoder) = &self.vae_encoder {
            encoder.model().unload();
        }
        if let Some(checker) = &self.safety_checker {
            checker.model().unload();
        }
        if let Some(controlnet) = &self.controlnet {
            controlnet.model().unload();
        }
    }

    /// Generate `count` images for one request.
    ///
    /// Returns one entry per image: `None` where the safety checker rejected
    /// the result. Cooperative cancellation through `progress` yields an
    /// empty list, not an error.
    pub fn generate_images(
        &mut self,
        input: &SampleInput,
        count: usize,
        disable_safety: bool,
        mut progress: impl FnMut(GenerationProgress) -> bool,
    ) -> Result<Vec<Option<RgbImage>>, PipelineError> {
        input.validate()?;
        self.validate_against_capabilities(input)?;
        if count == 0 {
            return Ok(Vec::new());
        }

        let instruct = input.image_guidance_scale.is_some();
        let inpaint = input.inpaint_mask.is_some();
        let image_to_image =
            input.init_image.is_some() && input.strength.is_some() && !inpaint && !instruct;

        // 1. Hidden states, through the single-slot prompt cache.
        let hidden_states = self.hidden_states(input)?;
        if self.reduce_memory {
            self.text_encoder.model().unload();
        }

        // 2. Independent scheduler state per image, shared constants.
        let config = SchedulerConfig {
            step_count: input.step_count,
            strength: input.strength.filter(|_| image_to_image),
            ..SchedulerConfig::default()
        };
        let mut schedulers: Vec<Scheduler<B>> = (0..count)
            .map(|_| Scheduler::new(input.scheduler, &config))
            .collect();
        let time_steps: Vec<usize> = schedulers[0].time_steps().to_vec();

        // 3-5. Latent preparation. One generator feeds every noise source.
        let (latent_height, latent_width) = self.unet.latent_size();
        let latent_shape = [1, NOISE_CHANNELS, latent_height, latent_width];
        let mut rng = NoiseGenerator::new(input.seed);

        let mut latents: Vec<Tensor<B, 4>>;
        let mut mask_latent: Option<Tensor<B, 4>> = None;
        let mut masked_image_latent: Option<Tensor<B, 4>> = None;
        let mut image_latents: Option<Tensor<B, 4>> = None;

        if image_to_image {
            let encoder = self.vae_encoder.as_ref().expect("validated above");
            let image = input.init_image.as_ref().expect("validated above");
            let image_latent = encoder.encode(image, LATENT_SCALE_FACTOR, &mut rng)?;
            let noises = (0..count)
                .map(|_| rng.normal_tensor(latent_shape, &self.device))
                .collect();
            latents = schedulers[0].add_noise(&image_latent, noises);
        } else {
            let sigma = schedulers[0].init_noise_sigma();
            latents = (0..count)
                .map(|_| rng.normal_tensor(latent_shape, &self.device) * sigma)
                .collect();
        }

        if inpaint {
            let encoder = self.vae_encoder.as_ref().expect("validated above");
            let (width, height) = encoder.input_size();
            let mask_image = input.inpaint_mask.as_ref().expect("validated above");
            let init_image = input.init_image.as_ref().expect("validated above");

            let mask = images::alpha_tensor::<B>(mask_image, width, height, &self.device);
            let init = images::tensor_from_image::<B>(
                init_image,
                width,
                height,
                images::Normalization::SignedUnit,
                &self.device,
            );
            let masked = init * (mask.clone().neg() + 1.0);
            let masked_latent = encoder.encode_tensor(masked, LATENT_SCALE_FACTOR, &mut rng)?;

            let mask_small = images::downsample_mask(mask, latent_height, latent_width);
            mask_latent = Some(Tensor::cat(vec![mask_small; 2], 0));
            masked_image_latent = Some(Tensor::cat(vec![masked_latent; 2], 0));
        }

        if instruct {
            let encoder = self.vae_encoder.as_ref().expect("validated above");
            let image = input.init_image.as_ref().expect("validated above");
            let image_latent = encoder.encode(image, 1.0, &mut rng)?;
            let zeros = Tensor::zeros(image_latent.dims(), &self.device);
            image_latents = Some(Tensor::cat(
                vec![image_latent.clone(), image_latent, zeros],
                0,
            ));
        }

        if self.reduce_memory {
            if let Some(encoder) = &self.vae_encoder {
                encoder.model().unload();
            }
        }

        // 6. Denoising loop.
        let batch = self.unet.batch();
        for (step, &time_step) in time_steps.iter().enumerate() {
            let unet_inputs: Vec<Tensor<B, 4>> = latents
                .iter()
                .map(|latent| {
                    let mut x = Tensor::cat(vec![latent.clone(); batch], 0);
                    if let (Some(mask), Some(masked)) = (&mask_latent, &masked_image_latent) {
                        x = Tensor::cat(vec![x, mask.clone(), masked.clone()], 1);
                    }
                    if let Some(image_latents) = &image_latents {
                        x = Tensor::cat(vec![x, image_latents.clone()], 1);
                    }
                    x
                })
                .collect();

            let residuals = match &self.controlnet {
                Some(controlnet) => {
                    controlnet.predict_residuals(&unet_inputs, time_step, &hidden_states)?
                }
                None => None,
            };

            let noise_predictions = self.unet.predict_noise(
                &unet_inputs,
                time_step,
                &hidden_states,
                residuals.as_deref(),
            )?;

            for (index, scheduler) in schedulers.iter_mut().enumerate() {
                let guided = self.fuse_guidance(noise_predictions[index].clone(), input);
                latents[index] = scheduler.step(guided, time_step, latents[index].clone());
            }

            if !progress(GenerationProgress {
                step,
                step_count: time_steps.len(),
            }) {
                debug!(step, "generation cancelled");
                if self.reduce_memory {
                    self.unet.unload();
                }
                return Ok(Vec::new());
            }
        }
        if self.reduce_memory {
            self.unet.unload();
            if let Some(controlnet) = &self.controlnet {
                controlnet.model().unload();
            }
        }

        // 7. Decode.
        let mut decoded = Vec::with_capacity(count);
        for latent in latents {
            decoded.push(self.vae_decoder.decode(latent, LATENT_SCALE_FACTOR)?);
        }
        if self.reduce_memory {
            self.vae_decoder.model().unload();
        }

        // 8. Safety.
        let mut results = Vec::with_capacity(count);
        for image_tensor in decoded {
            let safe = if disable_safety {
                true
            } else {
                match &self.safety_checker {
                    Some(checker) => checker.is_safe(&image_tensor)?,
                    None => true,
                }
            };
            results.push(safe.then(|| images::image_from_tensor(image_tensor)));
        }
        if self.reduce_memory {
            if let Some(checker) = &self.safety_checker {
                checker.model().unload();
            }
        }

        Ok(results)
    }

    fn validate_against_capabilities(&self, input: &SampleInput) -> Result<(), PipelineError> {
        if input.init_image.is_some() && self.vae_encoder.is_none() {
            return Err(PipelineError::InvalidInput(
                "this pipeline has no VAE encoder; image-to-image is unavailable".into(),
            ));
        }
        if input.inpaint_mask.is_some() && !self.unet.capabilities().can_inpaint {
            return Err(PipelineError::InvalidInput(
                "the loaded model cannot inpaint".into(),
            ));
        }
        if input.image_guidance_scale.is_some() != self.takes_instructions() {
            return Err(PipelineError::InvalidInput(if self.takes_instructions() {
                "the loaded model requires an image guidance scale".into()
            } else {
                "the loaded model does not take image guidance".into()
            }));
        }
        Ok(())
    }

    /// Hidden states `[B, E, 1, L]` for the request, via the single-slot
    /// prompt cache. Batch order is `[negative, positive]`, or
    /// `[positive, negative, negative]` for the instruct split.
    fn hidden_states(&mut self, input: &SampleInput) -> Result<Tensor<B, 4>, PipelineError> {
        let cached = self.cache.as_ref().is_some_and(|cache| {
            cache.prompt == input.prompt && cache.negative_prompt == input.negative_prompt
        });
        if !cached {
            debug!("encoding prompt pair");
            let positive = self.text_encoder.encode(&input.prompt)?;
            let negative = self.text_encoder.encode(&input.negative_prompt)?;
            self.cache = Some(CachedEmbeddings {
                prompt: input.prompt.clone(),
                negative_prompt: input.negative_prompt.clone(),
                positive,
                negative,
            });
        } else {
            debug!("reusing cached prompt embeddings");
        }
        let cache = self.cache.as_ref().expect("cache populated above");

        let stacked = if input.image_guidance_scale.is_some() {
            Tensor::cat(
                vec![
                    cache.positive.clone(),
                    cache.negative.clone(),
                    cache.negative.clone(),
                ],
                0,
            )
        } else {
            Tensor::cat(vec![cache.negative.clone(), cache.positive.clone()], 0)
        };
        // [B, 1, L, E] -> [B, E, 1, L]
        Ok(stacked.swap_dims(1, 3).swap_dims(2, 3))
    }

    /// Split the batched noise prediction and fuse the guidance branches.
    fn fuse_guidance(&self, noise: Tensor<B, 4>, input: &SampleInput) -> Tensor<B, 4> {
        if let Some(image_guidance_scale) = input.image_guidance_scale {
            let text = noise.clone().narrow(0, 0, 1);
            let image = noise.clone().narrow(0, 1, 1);
            let negative = noise.narrow(0, 2, 1);
            apply_instruct_guidance(
                text,
                image,
                negative,
                input.guidance_scale,
                image_guidance_scale,
            )
        } else {
            let negative = noise.clone().narrow(0, 0, 1);
            let text = noise.narrow(0, 1, 1);
            apply_guidance(negative, text, input.guidance_scale)
        }
    }
}
