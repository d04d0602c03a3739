//! Noise schedules and shared scheduler machinery.

use burn::prelude::*;

use crate::dpm::DpmSolverScheduler;
use crate::plms::PlmsScheduler;

/// Training-time diffusion steps of the Stable Diffusion family.
pub const DEFAULT_TRAIN_STEP_COUNT: usize = 1000;

/// How the training betas are spaced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BetaSchedule {
    /// `linspace(start, end, T)`
    Linear,
    /// `linspace(sqrt(start), sqrt(end), T)^2` (Stable Diffusion default)
    #[default]
    ScaledLinear,
}

/// Scheduler algorithm selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SchedulerKind {
    /// Pseudo linear multistep (PNDM without the Runge-Kutta warmup)
    #[default]
    Plms,
    /// DPM-Solver++ 2M
    DpmSolverMultistep,
}

/// Shared scheduler configuration.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub train_step_count: usize,
    pub beta_schedule: BetaSchedule,
    pub beta_start: f64,
    pub beta_end: f64,
    /// Number of inference steps.
    pub step_count: usize,
    /// Fraction of the denoising trajectory to run; image-to-image starts
    /// from a partially noised sample. `None` runs the full trajectory.
    pub strength: Option<f32>,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            train_step_count: DEFAULT_TRAIN_STEP_COUNT,
            beta_schedule: BetaSchedule::default(),
            beta_start: 0.00085,
            beta_end: 0.012,
            step_count: 50,
            strength: None,
        }
    }
}

/// Training betas for the configured schedule.
pub(crate) fn betas(config: &SchedulerConfig) -> Vec<f32> {
    let n = config.train_step_count;
    (0..n)
        .map(|i| {
            let t = i as f64 / (n - 1) as f64;
            let beta = match config.beta_schedule {
                BetaSchedule::Linear => config.beta_start + t * (config.beta_end - config.beta_start),
                BetaSchedule::ScaledLinear => {
                    let root = config.beta_start.sqrt()
                        + t * (config.beta_end.sqrt() - config.beta_start.sqrt());
                    root * root
                }
            };
            beta as f32
        })
        .collect()
}

/// Running product of `1 - beta`.
pub(crate) fn alphas_cumprod(betas: &[f32]) -> Vec<f32> {
    let mut out = Vec::with_capacity(betas.len());
    let mut cumprod = 1.0f64;
    for beta in betas {
        cumprod *= 1.0 - *beta as f64;
        out.push(cumprod as f32);
    }
    out
}

/// Descending inference timesteps.
///
/// Forward steps are `round(i * T / N) + 1`; strength keeps the last
/// `floor(N * strength)` steps of the denoising trajectory (the lowest
/// forward steps), and the list is handed out highest-first.
pub fn inference_time_steps(config: &SchedulerConfig) -> Vec<usize> {
    let ratio = config.train_step_count as f64 / config.step_count as f64;
    let mut steps: Vec<usize> = (0..config.step_count)
        .map(|i| (i as f64 * ratio).round() as usize + 1)
        .collect();
    if let Some(strength) = config.strength {
        let keep = (config.step_count as f32 * strength.clamp(0.0, 1.0)).floor() as usize;
        steps.truncate(keep);
    }
    steps.reverse();
    steps
}

/// PLMS variant of the timestep list: the bootstrap step is replayed once
/// (the second timestep appears twice) and the list is trimmed back to the
/// configured length.
pub(crate) fn plms_time_steps(config: &SchedulerConfig) -> Vec<usize> {
    let mut steps = inference_time_steps(config);
    if steps.len() >= 2 {
        let bootstrap = steps[1];
        steps.insert(2, bootstrap);
        steps.pop();
    }
    steps
}

/// Elementwise linear combination. All tensors must share a shape.
pub fn weighted_sum<B: Backend>(weights: &[f32], tensors: &[Tensor<B, 4>]) -> Tensor<B, 4> {
    debug_assert_eq!(weights.len(), tensors.len());
    debug_assert!(tensors.windows(2).all(|pair| pair[0].dims() == pair[1].dims()));
    let mut terms = weights.iter().zip(tensors);
    let (weight, tensor) = terms.next().expect("weighted_sum needs at least one term");
    let mut acc = tensor.clone() * *weight;
    for (weight, tensor) in terms {
        acc = acc + tensor.clone() * *weight;
    }
    acc
}

/// `alphas_cumprod` lookup clamped to the table.
pub(crate) fn alpha_cumprod_at(alphas_cumprod: &[f32], t: usize) -> f32 {
    alphas_cumprod[t.min(alphas_cumprod.len() - 1)]
}

/// Noise `original` to the first (latest) scheduled timestep, once per noise
/// tensor: `sqrt(a) * sample + sqrt(1 - a) * noise`.
pub(crate) fn add_noise_at<B: Backend>(
    alphas_cumprod: &[f32],
    time_steps: &[usize],
    original: &Tensor<B, 4>,
    noises: Vec<Tensor<B, 4>>,
) -> Vec<Tensor<B, 4>> {
    let Some(&t) = time_steps.first() else {
        return noises.into_iter().map(|_| original.clone()).collect();
    };
    let alpha = alpha_cumprod_at(alphas_cumprod, t);
    let signal_scale = alpha.sqrt();
    let noise_scale = (1.0 - alpha).sqrt();
    noises
        .into_iter()
        .map(|noise| original.clone() * signal_scale + noise * noise_scale)
        .collect()
}

/// Denoising scheduler. The set is closed and small, so it is a sum type
/// dispatched at the sampling loop rather than an open interface.
pub enum Scheduler<B: Backend> {
    Plms(PlmsScheduler<B>),
    DpmSolverMultistep(DpmSolverScheduler<B>),
}

impl<B: Backend> Scheduler<B> {
    pub fn new(kind: SchedulerKind, config: &SchedulerConfig) -> Self {
        match kind {
            SchedulerKind::Plms => Self::Plms(PlmsScheduler::new(config)),
            SchedulerKind::DpmSolverMultistep => {
                Self::DpmSolverMultistep(DpmSolverScheduler::new(config))
            }
        }
    }

    pub fn time_steps(&self) -> &[usize] {
        match self {
            Self::Plms(scheduler) => scheduler.time_steps(),
            Self::DpmSolverMultistep(scheduler) => scheduler.time_steps(),
        }
    }

    /// Standard deviation of the initial latent distribution.
    pub fn init_noise_sigma(&self) -> f32 {
        1.0
    }

    /// Consume one predicted noise tensor and return the next latent.
    pub fn step(
        &mut self,
        model_output: Tensor<B, 4>,
        time_step: usize,
        sample: Tensor<B, 4>,
    ) -> Tensor<B, 4> {
        match self {
            Self::Plms(scheduler) => scheduler.step(model_output, time_step, sample),
            Self::DpmSolverMultistep(scheduler) => scheduler.step(model_output, time_step, sample),
        }
    }

    /// Image-to-image start: noise `original` to the first scheduled timestep.
    pub fn add_noise(
        &self,
        original: &Tensor<B, 4>,
        noises: Vec<Tensor<B, 4>>,
    ) -> Vec<Tensor<B, 4>> {
        match self {
            Self::Plms(scheduler) => scheduler.add_noise(original, noises),
            Self::DpmSolverMultistep(scheduler) => scheduler.add_noise(original, noises),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    type TestBackend = burn_ndarray::NdArray;

    #[test]
    fn beta_schedules_interpolate_endpoints() {
        let linear = SchedulerConfig {
            beta_schedule: BetaSchedule::Linear,
            beta_start: 0.0001,
            beta_end: 0.02,
            ..Default::default()
        };
        let values = betas(&linear);
        assert_eq!(values.len(), 1000);
        assert!((values[0] - 0.0001).abs() < 1e-9);
        assert!((values[999] - 0.02).abs() < 1e-7);

        let scaled = SchedulerConfig::default();
        let values = betas(&scaled);
        assert!((values[0] - 0.00085).abs() < 1e-8);
        assert!((values[999] - 0.012).abs() < 1e-7);
        // Quadratic spacing: the midpoint lies below the linear midpoint.
        let linear_mid = (0.00085 + 0.012) / 2.0;
        assert!((values[500] as f64) < linear_mid);
    }

    #[test]
    fn alphas_cumprod_is_running_product() {
        let values = betas(&SchedulerConfig::default());
        let cumprod = alphas_cumprod(&values);
        let mut expected = 1.0f64;
        for (beta, actual) in values.iter().zip(&cumprod) {
            expected *= 1.0 - *beta as f64;
            assert!((expected - *actual as f64).abs() < 1e-6);
        }
    }

    #[test]
    fn time_steps_cover_full_trajectory() {
        let steps = inference_time_steps(&SchedulerConfig::default());
        assert_eq!(steps.len(), 50);
        assert_eq!(steps[0], 981);
        assert_eq!(steps[49], 1);
        assert!(steps.windows(2).all(|pair| pair[0] > pair[1]));
    }

    #[test]
    fn strength_keeps_the_tail_of_the_trajectory() {
        let config = SchedulerConfig {
            strength: Some(0.5),
            ..Default::default()
        };
        let steps = inference_time_steps(&config);
        assert_eq!(steps.len(), 25);
        // Starts from roughly half the training trajectory.
        assert_eq!(steps[0], 481);
        assert_eq!(steps[24], 1);
    }

    #[test]
    fn plms_list_has_one_bootstrap_duplicate() {
        let steps = plms_time_steps(&SchedulerConfig::default());
        assert_eq!(steps.len(), 50);
        assert_eq!(steps[1], steps[2]);
        let strictly_decreasing = steps
            .windows(2)
            .filter(|pair| pair[0] > pair[1])
            .count();
        let duplicates = steps.windows(2).filter(|pair| pair[0] == pair[1]).count();
        assert_eq!(duplicates, 1);
        assert_eq!(strictly_decreasing, steps.len() - 2);
    }

    #[test]
    fn plms_duplicate_survives_strength_truncation() {
        for strength in [0.2f32, 0.5, 0.8, 1.0] {
            let config = SchedulerConfig {
                strength: Some(strength),
                ..Default::default()
            };
            let steps = plms_time_steps(&config);
            assert_eq!(steps.len(), (50.0 * strength).floor() as usize);
            if steps.len() >= 3 {
                assert_eq!(steps[1], steps[2]);
            }
        }
    }

    #[test]
    fn weighted_sum_combines_elementwise() {
        let device = Default::default();
        let a = Tensor::<TestBackend, 4>::from_data(
            TensorData::new(vec![1.0f32, 2.0], [1, 1, 1, 2]),
            &device,
        );
        let b = Tensor::<TestBackend, 4>::from_data(
            TensorData::new(vec![10.0f32, 20.0], [1, 1, 1, 2]),
            &device,
        );
        let out = weighted_sum(&[0.5, 0.25], &[a, b]);
        let values: Vec<f32> = out.into_data().to_vec().unwrap();
        assert_eq!(values, vec![3.0, 6.0]);
    }

    #[test]
    fn add_noise_is_identity_at_unit_alpha() {
        let device = Default::default();
        // Zero betas keep the cumulative product at exactly one.
        let alphas = vec![1.0f32; 1000];
        let original = Tensor::<TestBackend, 4>::from_data(
            TensorData::new(vec![0.25f32, -0.5, 1.0, 2.0], [1, 1, 2, 2]),
            &device,
        );
        let noise = Tensor::<TestBackend, 4>::from_data(
            TensorData::new(vec![5.0f32, 5.0, 5.0, 5.0], [1, 1, 2, 2]),
            &device,
        );
        let noised = add_noise_at(&alphas, &[981, 961], &original, vec![noise]);
        let values: Vec<f32> = noised[0].clone().into_data().to_vec().unwrap();
        assert_eq!(values, vec![0.25, -0.5, 1.0, 2.0]);
    }

    #[test]
    fn add_noise_mixes_signal_and_noise() {
        let device = Default::default();
        let config = SchedulerConfig::default();
        let scheduler = Scheduler::<TestBackend>::new(SchedulerKind::Plms, &config);
        let original = Tensor::<TestBackend, 4>::from_data(
            TensorData::new(vec![1.0f32], [1, 1, 1, 1]),
            &device,
        );
        let noise = Tensor::<TestBackend, 4>::from_data(
            TensorData::new(vec![1.0f32], [1, 1, 1, 1]),
            &device,
        );
        let noised = scheduler.add_noise(&original, vec![noise]);
        let cumprod = alphas_cumprod(&betas(&config));
        let alpha = cumprod[scheduler.time_steps()[0]];
        let expected = alpha.sqrt() + (1.0 - alpha).sqrt();
        let value: f32 = noised[0].clone().into_data().to_vec().unwrap()[0];
        assert!((value - expected).abs() < 1e-6);
    }
}
