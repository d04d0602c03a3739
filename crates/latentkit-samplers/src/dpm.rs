//! DPM-Solver++ (2M) scheduler.
//!
//! Second-order multistep solver in the data-prediction formulation. The
//! first invocation falls back to the first-order update; later invocations
//! combine the current and previous converted outputs with log-sigma
//! coefficients.

use burn::prelude::*;

use crate::schedule::{
    add_noise_at, alpha_cumprod_at, alphas_cumprod, betas, inference_time_steps, SchedulerConfig,
};

pub struct DpmSolverScheduler<B: Backend> {
    time_steps: Vec<usize>,
    /// One sigma per scheduled timestep plus the trailing boundary value.
    sigmas: Vec<f32>,
    alphas_cumprod: Vec<f32>,
    counter: usize,
    lower_order_nums: usize,
    previous_model_output: Option<Tensor<B, 4>>,
}

fn sigma_for(alphas_cumprod: &[f32], t: usize) -> f32 {
    let alpha = alpha_cumprod_at(alphas_cumprod, t) as f64;
    (((1.0 - alpha) / alpha).sqrt()) as f32
}

/// `alpha = 1 / sqrt(1 + sigma^2)`
fn alpha_for(sigma: f32) -> f32 {
    1.0 / (1.0 + sigma * sigma).sqrt()
}

/// `lambda = -ln(sigma)`
fn lambda_for(sigma: f32) -> f32 {
    -sigma.ln()
}

impl<B: Backend> DpmSolverScheduler<B> {
    pub fn new(config: &SchedulerConfig) -> Self {
        let betas = betas(config);
        let alphas_cumprod = alphas_cumprod(&betas);
        let time_steps = inference_time_steps(config);
        let step_increment = config.train_step_count / config.step_count;

        let mut sigmas: Vec<f32> = time_steps
            .iter()
            .map(|&t| sigma_for(&alphas_cumprod, t))
            .collect();
        let boundary = time_steps
            .last()
            .map(|&t| t.saturating_sub(step_increment))
            .unwrap_or(0);
        sigmas.push(sigma_for(&alphas_cumprod, boundary));

        Self {
            time_steps,
            sigmas,
            alphas_cumprod,
            counter: 0,
            lower_order_nums: 0,
            previous_model_output: None,
        }
    }

    pub fn time_steps(&self) -> &[usize] {
        &self.time_steps
    }

    pub fn sigmas(&self) -> &[f32] {
        &self.sigmas
    }

    /// Noise prediction -> data prediction at the given step index.
    fn convert_model_output(
        &self,
        model_output: Tensor<B, 4>,
        step_index: usize,
        sample: &Tensor<B, 4>,
    ) -> Tensor<B, 4> {
        let sigma = self.sigmas[step_index];
        (sample.clone() - model_output * sigma) / (1.0 + sigma * sigma).sqrt()
    }

    /// Perform one DPM-Solver++ step.
    ///
    /// Calls must be strictly ordered; one instance serves one image.
    pub fn step(
        &mut self,
        model_output: Tensor<B, 4>,
        time_step: usize,
        sample: Tensor<B, 4>,
    ) -> Tensor<B, 4> {
        let step_index = self.counter.min(self.time_steps.len().saturating_sub(1));
        debug_assert_eq!(self.time_steps.get(step_index), Some(&time_step));

        let converted = self.convert_model_output(model_output, step_index, &sample);
        let prev_sample = match (&self.previous_model_output, self.lower_order_nums) {
            (Some(previous), nums) if nums >= 1 => {
                self.second_order_update(&converted, previous, step_index, &sample)
            }
            _ => self.first_order_update(&converted, step_index, &sample),
        };

        self.previous_model_output = Some(converted);
        self.counter += 1;
        self.lower_order_nums = self.counter.min(2);
        prev_sample
    }

    fn first_order_update(
        &self,
        converted: &Tensor<B, 4>,
        step_index: usize,
        sample: &Tensor<B, 4>,
    ) -> Tensor<B, 4> {
        let sigma_next = self.sigmas[step_index + 1];
        let sigma_cur = self.sigmas[step_index];
        let alpha_next = alpha_for(sigma_next);
        let alpha_cur = alpha_for(sigma_cur);
        let h = lambda_for(sigma_next) - lambda_for(sigma_cur);

        let sample_coeff = (sigma_next * alpha_next) / (sigma_cur * alpha_cur);
        let data_coeff = alpha_next * ((-h).exp() - 1.0);
        sample.clone() * sample_coeff - converted.clone() * data_coeff
    }

    fn second_order_update(
        &self,
        converted: &Tensor<B, 4>,
        previous: &Tensor<B, 4>,
        step_index: usize,
        sample: &Tensor<B, 4>,
    ) -> Tensor<B, 4> {
        let sigma_next = self.sigmas[step_index + 1];
        let sigma_cur = self.sigmas[step_index];
        let sigma_prev = self.sigmas[step_index - 1];
        let alpha_next = alpha_for(sigma_next);
        let alpha_cur = alpha_for(sigma_cur);

        let h = lambda_for(sigma_next) - lambda_for(sigma_cur);
        let h_last = lambda_for(sigma_cur) - lambda_for(sigma_prev);
        let ratio = h_last / h;

        let first = converted.clone();
        let second = (converted.clone() - previous.clone()) * (1.0 / ratio);

        let sample_coeff = (sigma_next * alpha_next) / (sigma_cur * alpha_cur);
        let data_coeff = alpha_next * ((-h).exp() - 1.0);
        sample.clone() * sample_coeff - first * data_coeff - second * (0.5 * data_coeff)
    }

    pub fn add_noise(
        &self,
        original: &Tensor<B, 4>,
        noises: Vec<Tensor<B, 4>>,
    ) -> Vec<Tensor<B, 4>> {
        add_noise_at(&self.alphas_cumprod, &self.time_steps, original, noises)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    type TestBackend = burn_ndarray::NdArray;

    fn scalar(value: f32) -> Tensor<TestBackend, 4> {
        Tensor::from_data(TensorData::new(vec![value], [1, 1, 1, 1]), &Default::default())
    }

    fn value(tensor: &Tensor<TestBackend, 4>) -> f32 {
        tensor.clone().into_data().to_vec().unwrap()[0]
    }

    #[test]
    fn sigmas_decrease_toward_the_data_end() {
        let scheduler = DpmSolverScheduler::<TestBackend>::new(&SchedulerConfig::default());
        assert_eq!(scheduler.sigmas().len(), scheduler.time_steps().len() + 1);
        assert!(scheduler
            .sigmas()
            .windows(2)
            .all(|pair| pair[0] > pair[1]));
        assert!(scheduler.sigmas().last().unwrap() > &0.0);
    }

    #[test]
    fn sigma_matches_alpha_table() {
        let scheduler = DpmSolverScheduler::<TestBackend>::new(&SchedulerConfig::default());
        let t = scheduler.time_steps()[0];
        let alpha = alpha_cumprod_at(&scheduler.alphas_cumprod, t);
        let expected = ((1.0 - alpha) / alpha).sqrt();
        assert!((scheduler.sigmas()[0] - expected).abs() < 1e-5);
    }

    #[test]
    fn conversion_is_data_prediction() {
        let scheduler = DpmSolverScheduler::<TestBackend>::new(&SchedulerConfig::default());
        let sigma = scheduler.sigmas()[0];
        let converted = scheduler.convert_model_output(scalar(0.5), 0, &scalar(2.0));
        let expected = (2.0 - 0.5 * sigma) / (1.0 + sigma * sigma).sqrt();
        assert!((value(&converted) - expected).abs() < 1e-6);
    }

    #[test]
    fn first_step_is_first_order() {
        let mut scheduler = DpmSolverScheduler::<TestBackend>::new(&SchedulerConfig::default());
        let steps = scheduler.time_steps().to_vec();

        let converted = scheduler.convert_model_output(scalar(0.5), 0, &scalar(1.0));
        let reference = scheduler.first_order_update(&converted, 0, &scalar(1.0));

        let stepped = scheduler.step(scalar(0.5), steps[0], scalar(1.0));
        assert!((value(&stepped) - value(&reference)).abs() < 1e-7);
        assert_eq!(scheduler.lower_order_nums, 1);
    }

    #[test]
    fn later_steps_use_the_multistep_update() {
        let mut scheduler = DpmSolverScheduler::<TestBackend>::new(&SchedulerConfig::default());
        let steps = scheduler.time_steps().to_vec();

        let sample_1 = scheduler.step(scalar(0.5), steps[0], scalar(1.0));

        let converted_0 = scheduler.previous_model_output.clone().unwrap();
        let converted_1 = scheduler.convert_model_output(scalar(0.4), 1, &sample_1);
        let reference = scheduler.second_order_update(&converted_1, &converted_0, 1, &sample_1);

        let stepped = scheduler.step(scalar(0.4), steps[1], sample_1);
        assert!((value(&stepped) - value(&reference)).abs() < 1e-7);
        assert_eq!(scheduler.lower_order_nums, 2);
    }

    #[test]
    fn order_counter_saturates_at_two() {
        let mut scheduler = DpmSolverScheduler::<TestBackend>::new(&SchedulerConfig::default());
        let steps = scheduler.time_steps().to_vec();
        let mut sample = scalar(1.0);
        for &t in steps.iter().take(6) {
            sample = scheduler.step(scalar(0.1), t, sample);
        }
        assert_eq!(scheduler.lower_order_nums, 2);
        assert_eq!(scheduler.counter, 6);
    }

    #[test]
    fn strength_shortens_the_sigma_table() {
        let config = SchedulerConfig {
            strength: Some(0.5),
            ..Default::default()
        };
        let scheduler = DpmSolverScheduler::<TestBackend>::new(&config);
        assert_eq!(scheduler.time_steps().len(), 25);
        assert_eq!(scheduler.sigmas().len(), 26);
    }
}
