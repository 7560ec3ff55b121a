//! Perceiver resampler: compresses a variable-length prompt into a fixed
//! number of latent vectors with one cross-attention step.

use crate::modules::attention::{MultiHeadAttention, MultiHeadAttentionConfig};
use crate::modules::mask::{debug_assert_finite, PaddingMask};
use burn::{
    module::Param,
    tensor::{backend::Backend, Bool, Distribution, Tensor},
};

/// Configuration for [`PerceiverResampler`].
#[derive(Debug, Clone)]
pub struct PerceiverResamplerConfig {
    /// Width of prompt and latents.
    pub dim: usize,
    /// Number of learned latent queries.
    pub num_latents: usize,
    /// Attention heads.
    pub num_heads: usize,
    /// Attention dropout.
    pub dropout: f64,
}

impl PerceiverResamplerConfig {
    /// Create a config with 32 latents and 8 heads.
    pub fn new(dim: usize) -> Self {
        Self {
            dim,
            num_latents: 32,
            num_heads: 8,
            dropout: 0.2,
        }
    }

    /// Set the number of latents.
    pub fn with_num_latents(mut self, num_latents: usize) -> Self {
        self.num_latents = num_latents;
        self
    }

    /// Set the number of heads.
    pub fn with_num_heads(mut self, num_heads: usize) -> Self {
        self.num_heads = num_heads;
        self
    }

    /// Set the attention dropout.
    pub fn with_dropout(mut self, dropout: f64) -> Self {
        self.dropout = dropout;
        self
    }
}

/// Learned latents attending over a padded prompt.
#[derive(Debug, Clone)]
pub struct PerceiverResampler<B: Backend> {
    /// Latent queries `[num_latents, dim]`, initialised from `N(0, 1)`.
    pub latents: Param<Tensor<B, 2>>,
    /// Cross-attention (no projection bias).
    pub attn: MultiHeadAttention<B>,
}

impl<B: Backend> PerceiverResampler<B> {
    /// Create the resampler on the given device.
    pub fn new(config: PerceiverResamplerConfig, device: &B::Device) -> Self {
        let latents = Tensor::random(
            [config.num_latents, config.dim],
            Distribution::Normal(0.0, 1.0),
            device,
        );
        Self {
            latents: Param::from_tensor(latents),
            attn: MultiHeadAttention::new(
                MultiHeadAttentionConfig::new(config.dim, config.num_heads)
                    .with_dropout(config.dropout)
                    .with_bias(false),
                device,
            ),
        }
    }

    /// Number of latent vectors produced per example.
    pub fn num_latents(&self) -> usize {
        self.latents.val().dims()[0]
    }

    /// Resample `prompt` `[batch, time, dim]` to `[batch, num_latents, dim]`.
    pub fn forward(&self, prompt: Tensor<B, 3>, prompt_mask: &PaddingMask<B>) -> Tensor<B, 3> {
        let [batch, _, _] = prompt.dims();
        let latents = self.latents.val();
        let [num_latents, _] = latents.dims();
        let queries = latents.unsqueeze_dim::<3>(0).repeat_dim(0, batch);
        let key_mask = prompt_mask.mask();
        let mask: Tensor<B, 3, Bool> = key_mask.unsqueeze_dim::<3>(1).repeat_dim(1, num_latents);
        let out = self
            .attn
            .forward(queries, prompt_mask.zero_btc(prompt), Some(mask));
        debug_assert_finite("perceiver resampler", &out);
        out
    }
}
