//! Pitch conditioning: log-f0 transforms and coarse pitch embedding.

use burn::tensor::{backend::Backend, Int, Tensor};
use burn_nn::{Embedding, EmbeddingConfig};
use std::f32::consts::LN_10;

/// Number of coarse pitch bins (bin 0 is never produced).
pub const F0_BINS: usize = 256;
/// Lowest f0 mapped above the first bin, in Hz.
pub const F0_MIN: f32 = 50.0;
/// Highest f0 mapped below the last bin, in Hz.
pub const F0_MAX: f32 = 1100.0;

fn hz_to_mel_f32(f0: f32) -> f32 {
    1127.0 * (1.0 + f0 / 700.0).ln()
}

/// Map f0 in Hz to `lf0 = 2595 * log10(1 + f0 / 700) / 500`.
pub fn f0_to_lf0<B: Backend, const D: usize>(f0: Tensor<B, D>) -> Tensor<B, D> {
    f0.div_scalar(700.0)
        .add_scalar(1.0)
        .log()
        .mul_scalar(2595.0 / (500.0 * LN_10))
}

/// Inverse of [`f0_to_lf0`]: `f0 = 700 * (10^(lf0 * 500 / 2595) - 1)`.
pub fn lf0_to_f0<B: Backend, const D: usize>(lf0: Tensor<B, D>) -> Tensor<B, D> {
    lf0.mul_scalar(500.0 * LN_10 / 2595.0)
        .exp()
        .sub_scalar(1.0)
        .mul_scalar(700.0)
}

/// Quantise f0 (Hz) into mel-spaced bins in `1..=255`.
///
/// Unvoiced frames (`f0 <= 0`) land in bin 1, as do frames below [`F0_MIN`].
pub fn f0_to_coarse<B: Backend, const D: usize>(f0: Tensor<B, D>) -> Tensor<B, D, Int> {
    let mel_min = hz_to_mel_f32(F0_MIN);
    let mel_max = hz_to_mel_f32(F0_MAX);
    let top = (F0_BINS - 1) as f32;
    let mel = f0.clamp_min(0.0).div_scalar(700.0).add_scalar(1.0).log().mul_scalar(1127.0);
    let voiced = mel.clone().greater_elem(0.0);
    let scaled = mel
        .clone()
        .sub_scalar(mel_min)
        .mul_scalar((F0_BINS - 2) as f32 / (mel_max - mel_min))
        .add_scalar(1.0);
    mel.mask_where(voiced, scaled)
        .clamp(1.0, top)
        .add_scalar(0.5)
        .floor()
        .int()
}

/// Embedding of coarse pitch bins.
#[derive(Debug, Clone)]
pub struct PitchEmbedding<B: Backend> {
    /// Table with [`F0_BINS`] rows.
    pub embed: Embedding<B>,
}

impl<B: Backend> PitchEmbedding<B> {
    /// Create the embedding on the given device.
    pub fn new(hidden: usize, device: &B::Device) -> Self {
        Self {
            embed: EmbeddingConfig::new(F0_BINS, hidden).init(device),
        }
    }

    /// Embed frame-level f0 `[batch, time]` (Hz) to `[batch, time, hidden]`.
    pub fn forward(&self, f0: Tensor<B, 2>) -> Tensor<B, 3> {
        self.embed.forward(f0_to_coarse(f0))
    }
}
