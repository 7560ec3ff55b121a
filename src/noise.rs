//! Seedable randomness for training steps and samplers.
//!
//! Every stochastic operation takes a caller-owned [`NoiseRng`], so a run can
//! be reproduced from its seed and no global generator is shared between
//! concurrent callers.

use burn::tensor::{backend::Backend, Tensor, TensorData};
use rand::{rngs::StdRng, Rng, SeedableRng};
use rand_distr::StandardNormal;

/// Host-side random source producing Gaussian tensors and timestep draws.
#[derive(Debug, Clone)]
pub struct NoiseRng {
    rng: StdRng,
}

impl NoiseRng {
    /// Create a generator from a fixed seed.
    pub fn seed_from_u64(seed: u64) -> Self {
        Self {
            rng: StdRng::seed_from_u64(seed),
        }
    }

    /// Create a generator seeded from the operating system.
    pub fn from_os_rng() -> Self {
        Self {
            rng: StdRng::from_os_rng(),
        }
    }

    /// Draw a standard normal tensor of the given shape.
    pub fn normal<B: Backend, const D: usize>(
        &mut self,
        shape: [usize; D],
        device: &B::Device,
    ) -> Tensor<B, D> {
        let count = shape.iter().product::<usize>();
        let values: Vec<f32> = (0..count)
            .map(|_| self.rng.sample::<f32, _>(StandardNormal))
            .collect();
        Tensor::from_data(TensorData::new(values, shape), device)
    }

    /// Draw one timestep per example, uniformly from `0..timesteps`.
    pub fn timesteps(&mut self, batch: usize, timesteps: usize) -> Vec<usize> {
        (0..batch)
            .map(|_| self.rng.random_range(0..timesteps))
            .collect()
    }
}
