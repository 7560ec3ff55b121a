//! Encoder blocks shared by the phoneme and prompt encoders.
//!
//! Blocks are selected by [`LayerKind`] and exposed through the
//! [`SequenceLayer`] capability so encoders do not depend on a concrete block.

use crate::config::LayerKind;
use crate::modules::attention::{MultiHeadAttention, MultiHeadAttentionConfig};
use crate::modules::conv::{Conv1d, Conv1dConfig};
use crate::modules::mask::{debug_assert_finite, PaddingMask};
use burn::tensor::{activation::gelu, backend::Backend, Tensor};
use burn_nn::{Dropout, DropoutConfig, LayerNorm, LayerNormConfig, Linear, LinearConfig};

/// A block mapping a padded `[batch, time, channels]` sequence to a sequence
/// of the same length.
pub trait SequenceLayer<B: Backend> {
    /// Process `x` under `mask`; padded timesteps of the result are zero.
    fn process(&self, x: Tensor<B, 3>, mask: &PaddingMask<B>) -> Tensor<B, 3>;
}

/// Configuration for [`ConvSelfAttentionLayer`].
#[derive(Debug, Clone)]
pub struct ConvSelfAttentionConfig {
    /// Input channels.
    pub in_channels: usize,
    /// Output channels.
    pub out_channels: usize,
    /// Self-attention heads.
    pub num_heads: usize,
    /// Feed-forward convolution kernel size.
    pub kernel_size: usize,
    /// Dropout probability.
    pub dropout: f64,
}

impl ConvSelfAttentionConfig {
    /// Create a width-preserving block config.
    pub fn new(channels: usize, num_heads: usize, kernel_size: usize, dropout: f64) -> Self {
        Self {
            in_channels: channels,
            out_channels: channels,
            num_heads,
            kernel_size,
            dropout,
        }
    }

    /// Set a different output width (adds a residual projection).
    pub fn with_out_channels(mut self, out_channels: usize) -> Self {
        self.out_channels = out_channels;
        self
    }
}

/// Pre-norm self-attention followed by a pre-norm convolutional feed-forward.
#[derive(Debug, Clone)]
pub struct ConvSelfAttentionLayer<B: Backend> {
    /// Norm before attention.
    pub attn_norm: LayerNorm<B>,
    /// Self-attention.
    pub attn: MultiHeadAttention<B>,
    /// Norm before the feed-forward.
    pub ffn_norm: LayerNorm<B>,
    /// Feed-forward input convolution (`c -> 4c`).
    pub ffn_conv: Conv1d<B>,
    /// Feed-forward output projection (`4c -> out`).
    pub ffn_out: Linear<B>,
    /// Residual projection used when the width changes.
    pub residual_proj: Option<Linear<B>>,
    dropout: Dropout,
    kernel_scale: f32,
}

impl<B: Backend> ConvSelfAttentionLayer<B> {
    /// Create the block on the given device.
    pub fn new(config: ConvSelfAttentionConfig, device: &B::Device) -> Self {
        let c = config.in_channels;
        let filter = 4 * c;
        let residual_proj = (config.in_channels != config.out_channels).then(|| {
            LinearConfig::new(config.in_channels, config.out_channels)
                .with_bias(false)
                .init(device)
        });
        Self {
            attn_norm: LayerNormConfig::new(c).init(device),
            attn: MultiHeadAttention::new(
                MultiHeadAttentionConfig::new(c, config.num_heads).with_dropout(config.dropout),
                device,
            ),
            ffn_norm: LayerNormConfig::new(c).init(device),
            ffn_conv: Conv1d::new(Conv1dConfig::new(c, filter, config.kernel_size), device),
            ffn_out: LinearConfig::new(filter, config.out_channels).init(device),
            residual_proj,
            dropout: DropoutConfig::new(config.dropout).init(),
            kernel_scale: (config.kernel_size as f32).powf(-0.5),
        }
    }

    /// Apply the block to `[batch, time, in_channels]`.
    pub fn forward(&self, x: Tensor<B, 3>, mask: &PaddingMask<B>) -> Tensor<B, 3> {
        let self_mask = mask.cross(mask);
        let h = self.attn_norm.forward(x.clone());
        let h = self.attn.forward(h.clone(), h, Some(self_mask));
        let x = mask.zero_btc(x + self.dropout.forward(h));
        debug_assert_finite("self-attention", &x);

        let h = self.ffn_norm.forward(x.clone());
        let h = mask.around_btc(h, |h| self.ffn_conv.forward_btc(h));
        let h = gelu(h.mul_scalar(self.kernel_scale));
        let h = self.ffn_out.forward(self.dropout.forward(h));
        let residual = match &self.residual_proj {
            Some(proj) => proj.forward(x),
            None => x,
        };
        let x = mask.zero_btc(residual + self.dropout.forward(h));
        debug_assert_finite("feed-forward", &x);
        x
    }
}

impl<B: Backend> SequenceLayer<B> for ConvSelfAttentionLayer<B> {
    fn process(&self, x: Tensor<B, 3>, mask: &PaddingMask<B>) -> Tensor<B, 3> {
        self.forward(x, mask)
    }
}

/// Encoder block selected by a [`LayerKind`] tag.
#[derive(Debug, Clone)]
pub enum EncoderLayer<B: Backend> {
    /// See [`ConvSelfAttentionLayer`].
    ConvSelfAttention(ConvSelfAttentionLayer<B>),
}

impl<B: Backend> EncoderLayer<B> {
    /// Build the block variant named by `kind`.
    pub fn new(
        kind: LayerKind,
        channels: usize,
        num_heads: usize,
        kernel_size: usize,
        dropout: f64,
        device: &B::Device,
    ) -> Self {
        match kind {
            LayerKind::ConvSelfAttention => Self::ConvSelfAttention(ConvSelfAttentionLayer::new(
                ConvSelfAttentionConfig::new(channels, num_heads, kernel_size, dropout),
                device,
            )),
        }
    }
}

impl<B: Backend> SequenceLayer<B> for EncoderLayer<B> {
    fn process(&self, x: Tensor<B, 3>, mask: &PaddingMask<B>) -> Tensor<B, 3> {
        match self {
            Self::ConvSelfAttention(layer) => layer.process(x, mask),
        }
    }
}

/// Stack of encoder blocks with an optional final layer norm and re-mask.
#[derive(Debug, Clone)]
pub struct EncoderStack<B: Backend> {
    /// Blocks applied in order.
    pub layers: Vec<EncoderLayer<B>>,
    /// Optional final layer norm.
    pub final_norm: Option<LayerNorm<B>>,
}

impl<B: Backend> EncoderStack<B> {
    /// Build `n_layers` blocks of the given kind.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        kind: LayerKind,
        n_layers: usize,
        channels: usize,
        num_heads: usize,
        kernel_size: usize,
        dropout: f64,
        last_ln: bool,
        device: &B::Device,
    ) -> Self {
        let layers = (0..n_layers)
            .map(|_| EncoderLayer::new(kind, channels, num_heads, kernel_size, dropout, device))
            .collect();
        Self {
            layers,
            final_norm: last_ln.then(|| LayerNormConfig::new(channels).init(device)),
        }
    }

    /// Run every block, then the final norm followed by re-masking.
    pub fn forward(&self, x: Tensor<B, 3>, mask: &PaddingMask<B>) -> Tensor<B, 3> {
        let x = self
            .layers
            .iter()
            .fold(x, |x, layer| layer.process(x, mask));
        match &self.final_norm {
            Some(norm) => mask.zero_btc(norm.forward(x)),
            None => x,
        }
    }
}
