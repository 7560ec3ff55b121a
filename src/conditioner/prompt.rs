//! Prompt encoder: turns reference-audio codec frames into a speaker/style
//! embedding sequence.

use crate::config::PromptEncoderConfig;
use crate::error::Result;
use crate::modules::conv::{ConvLayer, ConvLayerConfig};
use crate::modules::mask::PaddingMask;
use crate::modules::transformer::EncoderStack;
use burn::tensor::{backend::Backend, Tensor};

/// Kernel-1 projection from codec width followed by [`EncoderStack`].
#[derive(Debug, Clone)]
pub struct PromptEncoder<B: Backend> {
    /// Codec width to hidden width projection.
    pub pre: ConvLayer<B>,
    /// Block stack.
    pub stack: EncoderStack<B>,
}

impl<B: Backend> PromptEncoder<B> {
    /// Create the encoder on the given device.
    pub fn new(config: &PromptEncoderConfig, device: &B::Device) -> Self {
        Self {
            pre: ConvLayer::new(
                ConvLayerConfig::new(config.in_channels, config.hidden_channels, 1, config.p_dropout),
                device,
            ),
            stack: EncoderStack::new(
                config.layer,
                config.n_layers,
                config.hidden_channels,
                config.n_heads,
                config.kernel_size,
                config.p_dropout,
                config.last_ln,
                device,
            ),
        }
    }

    /// Encode `codes` `[batch, Tp, codec_channels]` into `[batch, Tp, hidden]`.
    pub fn forward(&self, codes: Tensor<B, 3>, lengths: &[usize]) -> Result<Tensor<B, 3>> {
        let mask = PaddingMask::for_btc("prompt_encoder", "prompt_lengths", &codes, lengths)?;
        let x = mask.zero_btc(self.pre.forward(codes, &mask));
        Ok(self.stack.forward(x, &mask))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::tensor::Distribution;
    use burn_ndarray::{NdArray, NdArrayDevice};

    type TestBackend = NdArray<f32>;

    #[test]
    fn projects_codec_width_to_hidden() {
        let device = NdArrayDevice::default();
        let config = PromptEncoderConfig {
            in_channels: 6,
            hidden_channels: 8,
            n_layers: 1,
            kernel_size: 3,
            n_heads: 2,
            ..PromptEncoderConfig::default()
        };
        let encoder = PromptEncoder::<TestBackend>::new(&config, &device);
        let codes = Tensor::<TestBackend, 3>::random([2, 5, 6], Distribution::Default, &device);
        let out = encoder.forward(codes, &[5, 3]).unwrap();
        assert_eq!(out.dims(), [2, 5, 8]);
        let tail = out.narrow(0, 1, 1).narrow(1, 3, 2).abs().sum().into_scalar();
        assert_eq!(tail, 0.0);
    }
}
