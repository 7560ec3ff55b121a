//! Phoneme encoder: embeds phoneme ids and contextualises them with the
//! shared encoder block stack.

use crate::config::PhonemeEncoderConfig;
use crate::error::Result;
use crate::modules::mask::PaddingMask;
use crate::modules::transformer::EncoderStack;
use burn::tensor::{backend::Backend, Int, Tensor};
use burn_nn::{Dropout, DropoutConfig, Embedding, EmbeddingConfig};

/// Token embedding followed by [`EncoderStack`].
#[derive(Debug, Clone)]
pub struct PhonemeEncoder<B: Backend> {
    /// Embedding table with `n_symbols + 1` rows (row 0 is padding).
    pub embed: Embedding<B>,
    /// Block stack.
    pub stack: EncoderStack<B>,
    dropout: Dropout,
    embed_scale: f32,
}

impl<B: Backend> PhonemeEncoder<B> {
    /// Create the encoder on the given device.
    pub fn new(config: &PhonemeEncoderConfig, device: &B::Device) -> Self {
        let hidden = config.hidden_channels;
        Self {
            embed: EmbeddingConfig::new(config.n_symbols + 1, hidden).init(device),
            stack: EncoderStack::new(
                config.layer,
                config.n_layers,
                hidden,
                config.n_heads,
                config.kernel_size,
                config.p_dropout,
                config.last_ln,
                device,
            ),
            dropout: DropoutConfig::new(config.p_dropout).init(),
            embed_scale: (hidden as f32).sqrt(),
        }
    }

    /// Encode `phoneme_ids` `[batch, N]` into `[batch, N, hidden]`.
    ///
    /// Positions at or past `lengths[b]` are zero in the output.
    pub fn forward(&self, phoneme_ids: Tensor<B, 2, Int>, lengths: &[usize]) -> Result<Tensor<B, 3>> {
        let x = self.embed.forward(phoneme_ids).mul_scalar(self.embed_scale);
        let mask = PaddingMask::for_btc("phoneme_encoder", "phoneme_lengths", &x, lengths)?;
        let x = self.dropout.forward(x);
        Ok(self.stack.forward(mask.zero_btc(x), &mask))
    }
}
