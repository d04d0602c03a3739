//! Seeded normal-distribution sampler.
//!
//! Reproduces the legacy NumPy generator exactly: an MT19937 core, 53-bit
//! uniform doubles assembled from two 32-bit draws, and the polar Box-Muller
//! variant with its cached second value. A given `(seed, shape)` therefore
//! yields the same float32 values as the reference tooling that seeded the
//! deployable models.

use burn::prelude::*;
use rand_mt::Mt;

/// Deterministic normal sampler seeded by a 32-bit seed.
///
/// One generator drives every noise source of a request (initial latents and
/// VAE reparameterization), so consumption order is part of the contract:
/// values are drawn in row-major element order.
pub struct NoiseGenerator {
    rng: Mt,
    /// Second value of the most recent normal pair, if not yet consumed.
    cached: Option<f64>,
}

impl NoiseGenerator {
    pub fn new(seed: u32) -> Self {
        Self {
            rng: Mt::new(seed),
            cached: None,
        }
    }

    /// Uniform double in [0, 1) built from two 32-bit draws (53 significant bits).
    fn next_uniform(&mut self) -> f64 {
        let a = (self.rng.next_u32() >> 5) as f64;
        let b = (self.rng.next_u32() >> 6) as f64;
        (a * 67_108_864.0 + b) / 9_007_199_254_740_992.0
    }

    /// One draw from N(0, 1).
    ///
    /// Pairs are produced by the polar method; the second value of each pair
    /// is cached and returned by the following call.
    pub fn next_normal(&mut self) -> f64 {
        if let Some(value) = self.cached.take() {
            return value;
        }
        loop {
            let x = 2.0 * self.next_uniform() - 1.0;
            let y = 2.0 * self.next_uniform() - 1.0;
            let s = x * x + y * y;
            if s < 1.0 && s != 0.0 {
                let f = (-2.0 * s.ln() / s).sqrt();
                self.cached = Some(f * x);
                return f * y;
            }
        }
    }

    /// One draw from N(mean, std^2).
    pub fn normal(&mut self, mean: f64, std: f64) -> f64 {
        mean + std * self.next_normal()
    }

    /// `count` standard-normal draws in consumption order, narrowed to f32.
    pub fn normal_values(&mut self, count: usize) -> Vec<f32> {
        (0..count).map(|_| self.next_normal() as f32).collect()
    }

    /// Standard-normal tensor filled in row-major order.
    pub fn normal_tensor<B: Backend>(
        &mut self,
        shape: [usize; 4],
        device: &B::Device,
    ) -> Tensor<B, 4> {
        let count = shape.iter().product();
        Tensor::from_data(TensorData::new(self.normal_values(count), shape), device)
    }
}
