//! Diffusion timestep embedding.
//!
//! Integer timesteps are embedded with fixed sinusoids (`sin` half first,
//! then `cos`) and passed through a two-layer GELU perceptron.

use burn::tensor::{activation::gelu, backend::Backend, Int, Tensor, TensorData};
use burn_nn::{Linear, LinearConfig};

/// Configuration for [`TimestepEmbedder`].
#[derive(Debug, Clone)]
pub struct TimestepEmbedderConfig {
    /// Width of the sinusoidal embedding and of the output.
    pub hidden_size: usize,
    /// Hidden width multiplier of the perceptron.
    pub mlp_ratio: usize,
    /// Max period for log-spaced frequencies.
    pub max_period: f32,
}

impl TimestepEmbedderConfig {
    /// Create a config with a `4x` perceptron and the usual 10000 period.
    pub fn new(hidden_size: usize) -> Self {
        Self {
            hidden_size,
            mlp_ratio: 4,
            max_period: 10000.0,
        }
    }
}

/// Sinusoidal frequencies `exp(-ln(max_period) * i / (half - 1))`.
pub fn sinusoidal_frequencies(dim: usize, max_period: f32) -> Vec<f32> {
    let half = dim / 2;
    let step = if half > 1 {
        max_period.ln() / (half - 1) as f32
    } else {
        0.0
    };
    (0..half).map(|i| (-(i as f32) * step).exp()).collect()
}

/// Sinusoidal timestep embedder with a small MLP projection.
#[derive(Debug, Clone)]
pub struct TimestepEmbedder<B: Backend> {
    /// Precomputed frequencies `[hidden / 2]`.
    pub freqs: Tensor<B, 1>,
    /// Input projection (`H -> mlp_ratio * H`).
    pub proj_in: Linear<B>,
    /// Output projection (`mlp_ratio * H -> H`).
    pub proj_out: Linear<B>,
}

impl<B: Backend> TimestepEmbedder<B> {
    /// Create a new embedder from config.
    pub fn new(config: TimestepEmbedderConfig, device: &B::Device) -> Self {
        let values = sinusoidal_frequencies(config.hidden_size, config.max_period);
        let half = values.len();
        let freqs = Tensor::<B, 1>::from_data(TensorData::new(values, [half]), device);
        let inner = config.hidden_size * config.mlp_ratio;
        Self {
            freqs,
            proj_in: LinearConfig::new(2 * half, inner).init(device),
            proj_out: LinearConfig::new(inner, config.hidden_size).init(device),
        }
    }

    /// Raw sinusoidal embedding `[batch, 2 * half]` of the timesteps.
    pub fn sinusoids(&self, timesteps: Tensor<B, 1, Int>) -> Tensor<B, 2> {
        let t = timesteps.float().unsqueeze_dim::<2>(1);
        let args = t.mul(self.freqs.clone().unsqueeze_dim::<2>(0));
        Tensor::cat(vec![args.clone().sin(), args.cos()], 1)
    }

    /// Embed a batch of timesteps to `[batch, hidden]`.
    pub fn forward(&self, timesteps: Tensor<B, 1, Int>) -> Tensor<B, 2> {
        let hidden = self.proj_in.forward(self.sinusoids(timesteps));
        self.proj_out.forward(gelu(hidden))
    }
}
