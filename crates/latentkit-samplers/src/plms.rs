//! PLMS (pseudo linear multistep) scheduler.
//!
//! History-only PNDM variant: no Runge-Kutta warmup. The first two
//! invocations bootstrap by averaging the two earliest residuals and
//! replaying the same step; afterwards Adams-Bashforth coefficients are
//! applied over a deque of recent model outputs.

use std::collections::VecDeque;

use burn::prelude::*;

use crate::schedule::{
    add_noise_at, alpha_cumprod_at, alphas_cumprod, betas, plms_time_steps, weighted_sum,
    SchedulerConfig,
};

pub struct PlmsScheduler<B: Backend> {
    time_steps: Vec<usize>,
    alphas_cumprod: Vec<f32>,
    /// Training steps advanced per inference step.
    step_increment: usize,
    counter: usize,
    /// Most recent model outputs, newest last.
    ets: VecDeque<Tensor<B, 4>>,
    /// Sample snapshot taken at the bootstrap step.
    current_sample: Option<Tensor<B, 4>>,
}

impl<B: Backend> PlmsScheduler<B> {
    pub fn new(config: &SchedulerConfig) -> Self {
        let betas = betas(config);
        Self {
            time_steps: plms_time_steps(config),
            alphas_cumprod: alphas_cumprod(&betas),
            step_increment: config.train_step_count / config.step_count,
            counter: 0,
            ets: VecDeque::new(),
            current_sample: None,
        }
    }

    pub fn time_steps(&self) -> &[usize] {
        &self.time_steps
    }

    pub fn counter(&self) -> usize {
        self.counter
    }

    /// Perform one PLMS step.
    ///
    /// Calls must be strictly ordered; one instance serves one image.
    pub fn step(
        &mut self,
        model_output: Tensor<B, 4>,
        time_step: usize,
        sample: Tensor<B, 4>,
    ) -> Tensor<B, 4> {
        let mut time_step = time_step;
        let mut prev_step = time_step.saturating_sub(self.step_increment);
        let mut sample = sample;

        if self.counter != 1 {
            while self.ets.len() > 3 {
                self.ets.pop_front();
            }
            self.ets.push_back(model_output.clone());
        } else {
            // Replay of the bootstrap step: same transition, one step up.
            prev_step = time_step;
            time_step += self.step_increment;
        }

        let latest = self.ets.len();
        let output = if latest == 1 && self.counter == 0 {
            self.current_sample = Some(sample.clone());
            model_output
        } else if latest == 1 && self.counter == 1 {
            let earliest = self.ets[0].clone();
            sample = self.current_sample.take().expect("bootstrap snapshot");
            weighted_sum(&[0.5, 0.5], &[model_output, earliest])
        } else if latest == 2 {
            weighted_sum(
                &[3.0 / 2.0, -1.0 / 2.0],
                &[self.ets[latest - 1].clone(), self.ets[latest - 2].clone()],
            )
        } else if latest == 3 {
            weighted_sum(
                &[23.0 / 12.0, -16.0 / 12.0, 5.0 / 12.0],
                &[
                    self.ets[latest - 1].clone(),
                    self.ets[latest - 2].clone(),
                    self.ets[latest - 3].clone(),
                ],
            )
        } else {
            weighted_sum(
                &[55.0 / 24.0, -59.0 / 24.0, 37.0 / 24.0, -9.0 / 24.0],
                &[
                    self.ets[latest - 1].clone(),
                    self.ets[latest - 2].clone(),
                    self.ets[latest - 3].clone(),
                    self.ets[latest - 4].clone(),
                ],
            )
        };

        self.counter += 1;
        self.previous_sample(sample, time_step, prev_step, output)
    }

    /// `prev = sqrt(a_prev / a) * sample - (a_prev - a) / denom * output` with
    /// `denom = a * sqrt(1 - a_prev) + sqrt(a * (1 - a) * a_prev)`.
    fn previous_sample(
        &self,
        sample: Tensor<B, 4>,
        time_step: usize,
        prev_step: usize,
        model_output: Tensor<B, 4>,
    ) -> Tensor<B, 4> {
        let alpha = alpha_cumprod_at(&self.alphas_cumprod, time_step);
        let alpha_prev = alpha_cumprod_at(&self.alphas_cumprod, prev_step);
        let sample_coeff = (alpha_prev / alpha).sqrt();
        let denom = alpha * (1.0 - alpha_prev).sqrt() + (alpha * (1.0 - alpha) * alpha_prev).sqrt();
        let model_coeff = -(alpha_prev - alpha) / denom;
        sample * sample_coeff + model_output * model_coeff
    }

    pub fn add_noise(
        &self,
        original: &Tensor<B, 4>,
        noises: Vec<Tensor<B, 4>>,
    ) -> Vec<Tensor<B, 4>> {
        add_noise_at(&self.alphas_cumprod, &self.time_steps, original, noises)
    }
}
