//! Noise schedule coefficient tables.
//!
//! A [`NoiseSchedule`] is built once from the number of timesteps and the beta
//! schedule kind, computed in `f64` and read as `f32` tensors through
//! [`NoiseSchedule::extract`]. It is immutable; a different configuration
//! produces a new schedule.

use crate::config::BetaScheduleKind;
use crate::error::{Error, Result};
use burn::tensor::{backend::Backend, Tensor, TensorData};
use serde::Serialize;

/// Lower clamp applied to the posterior variance before taking its log.
const POSTERIOR_VARIANCE_FLOOR: f64 = 1e-20;
/// Offset of the cosine schedule.
const COSINE_S: f64 = 0.008;
/// Maximum beta of the cosine schedule.
const COSINE_MAX_BETA: f64 = 0.999;

/// `T` betas rising linearly from `1e-4 * 1000/T` to `0.02 * 1000/T`.
pub fn linear_betas(timesteps: usize) -> Vec<f64> {
    let scale = 1000.0 / timesteps as f64;
    linspace(scale * 1e-4, scale * 0.02, timesteps)
}

/// Cosine schedule betas, clipped at 0.999.
pub fn cosine_betas(timesteps: usize) -> Vec<f64> {
    let total = timesteps as f64;
    let alpha_bar = |step: f64| {
        let angle = (step / total + COSINE_S) / (1.0 + COSINE_S) * std::f64::consts::FRAC_PI_2;
        angle.cos().powi(2)
    };
    let first = alpha_bar(0.0);
    (0..timesteps)
        .map(|i| {
            let current = alpha_bar(i as f64) / first;
            let next = alpha_bar((i + 1) as f64) / first;
            (1.0 - next / current).clamp(0.0, COSINE_MAX_BETA)
        })
        .collect()
}

fn linspace(start: f64, end: f64, steps: usize) -> Vec<f64> {
    match steps {
        0 => Vec::new(),
        1 => vec![start],
        _ => {
            let step = (end - start) / (steps - 1) as f64;
            (0..steps).map(|i| start + step * i as f64).collect()
        }
    }
}

/// Precomputed diffusion coefficients indexed by timestep.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NoiseSchedule {
    pub betas: Vec<f64>,
    pub alphas_cumprod: Vec<f64>,
    pub alphas_cumprod_prev: Vec<f64>,
    pub sqrt_alphas_cumprod: Vec<f64>,
    pub sqrt_one_minus_alphas_cumprod: Vec<f64>,
    pub log_one_minus_alphas_cumprod: Vec<f64>,
    pub sqrt_recip_alphas_cumprod: Vec<f64>,
    pub sqrt_recipm1_alphas_cumprod: Vec<f64>,
    pub posterior_variance: Vec<f64>,
    pub posterior_log_variance_clipped: Vec<f64>,
    pub posterior_mean_coef1: Vec<f64>,
    pub posterior_mean_coef2: Vec<f64>,
    /// Signal-to-noise ratio, optionally clipped at `min_snr_gamma`.
    pub loss_weight: Vec<f64>,
}

impl NoiseSchedule {
    /// Build the tables for `timesteps` steps of the given schedule.
    ///
    /// `min_snr_gamma` clips the SNR loss weight when set.
    pub fn new(
        timesteps: usize,
        kind: BetaScheduleKind,
        min_snr_gamma: Option<f64>,
    ) -> Result<Self> {
        if timesteps == 0 {
            return Err(Error::InvalidConfig(
                "noise schedule needs at least one timestep".into(),
            ));
        }
        let betas = match kind {
            BetaScheduleKind::Linear => linear_betas(timesteps),
            BetaScheduleKind::Cosine => cosine_betas(timesteps),
        };
        if betas.iter().any(|&b| !(b > 0.0 && b < 1.0)) {
            return Err(Error::InvalidConfig(format!(
                "{kind:?} schedule with {timesteps} steps yields betas outside (0, 1)"
            )));
        }
        Ok(Self::from_betas(betas, min_snr_gamma))
    }

    /// Derive every table from explicit betas.
    pub fn from_betas(betas: Vec<f64>, min_snr_gamma: Option<f64>) -> Self {
        let alphas: Vec<f64> = betas.iter().map(|b| 1.0 - b).collect();
        let alphas_cumprod: Vec<f64> = alphas
            .iter()
            .scan(1.0, |acc, &a| {
                *acc *= a;
                Some(*acc)
            })
            .collect();
        let alphas_cumprod_prev: Vec<f64> = std::iter::once(1.0)
            .chain(alphas_cumprod.iter().copied())
            .take(alphas_cumprod.len())
            .collect();

        let map = |f: &dyn Fn(usize) -> f64| (0..betas.len()).map(f).collect::<Vec<f64>>();
        let ac = &alphas_cumprod;
        let prev = &alphas_cumprod_prev;

        let posterior_variance = map(&|i| betas[i] * (1.0 - prev[i]) / (1.0 - ac[i]));
        let posterior_log_variance_clipped = posterior_variance
            .iter()
            .map(|v| v.max(POSTERIOR_VARIANCE_FLOOR).ln())
            .collect();
        let loss_weight = map(&|i| {
            let snr = ac[i] / (1.0 - ac[i]);
            match min_snr_gamma {
                Some(gamma) => snr.min(gamma),
                None => snr,
            }
        });

        Self {
            sqrt_alphas_cumprod: map(&|i| ac[i].sqrt()),
            sqrt_one_minus_alphas_cumprod: map(&|i| (1.0 - ac[i]).sqrt()),
            log_one_minus_alphas_cumprod: map(&|i| (1.0 - ac[i]).ln()),
            sqrt_recip_alphas_cumprod: map(&|i| (1.0 / ac[i]).sqrt()),
            sqrt_recipm1_alphas_cumprod: map(&|i| (1.0 / ac[i] - 1.0).sqrt()),
            posterior_mean_coef1: map(&|i| betas[i] * prev[i].sqrt() / (1.0 - ac[i])),
            posterior_mean_coef2: map(&|i| (1.0 - prev[i]) * alphas[i].sqrt() / (1.0 - ac[i])),
            posterior_variance,
            posterior_log_variance_clipped,
            loss_weight,
            alphas_cumprod_prev,
            alphas_cumprod,
            betas,
        }
    }

    /// Number of diffusion steps `T`.
    pub fn timesteps(&self) -> usize {
        self.betas.len()
    }

    /// Gather `table[t[b]]` into a `[batch, 1, 1]` tensor for broadcasting.
    pub fn extract<B: Backend>(table: &[f64], t: &[usize], device: &B::Device) -> Tensor<B, 3> {
        let values: Vec<f32> = t.iter().map(|&i| table[i] as f32).collect();
        Tensor::from_data(TensorData::new(values, [t.len(), 1, 1]), device)
    }
}

/// Strided timestep pairs `(t, t_next)` for the DDIM sampler, from `T - 1`
/// down to a final pair ending at `-1`.
///
/// The `sampling_timesteps + 1` points span `[-1, T - 1]` evenly and are
/// truncated toward zero, so `sampling_timesteps == T` visits every step.
pub fn ddim_time_pairs(timesteps: usize, sampling_timesteps: usize) -> Vec<(i64, i64)> {
    let steps = sampling_timesteps + 1;
    let start = -1.0f32;
    let end = timesteps as f32 - 1.0;
    let step = (end - start) / (steps - 1).max(1) as f32;
    let times: Vec<i64> = (0..steps)
        .rev()
        .map(|i| {
            let value = if i < steps / 2 {
                start + step * i as f32
            } else {
                end - step * (steps - 1 - i) as f32
            };
            value as i64
        })
        .collect();
    times.windows(2).map(|w| (w[0], w[1])).collect()
}
