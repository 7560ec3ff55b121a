//! Gated residual block of the denoising network.

use crate::modules::conv::{Conv1d, Conv1dConfig, ConvInit};
use crate::modules::mask::{debug_assert_finite, PaddingMask};
use burn::tensor::{
    activation::{sigmoid, tanh},
    backend::Backend,
    Tensor,
};

/// Configuration for [`ResidualBlock`].
#[derive(Debug, Clone)]
pub struct ResidualBlockConfig {
    /// Width of the conditioning sequence.
    pub cond_channels: usize,
    /// Residual width.
    pub residual_channels: usize,
    /// Dilated convolution kernel size.
    pub kernel_size: usize,
    /// Dilation factor.
    pub dilation: usize,
}

impl ResidualBlockConfig {
    /// Create a kernel-3 block.
    pub fn new(cond_channels: usize, residual_channels: usize, dilation: usize) -> Self {
        Self {
            cond_channels,
            residual_channels,
            kernel_size: 3,
            dilation,
        }
    }

    /// Set the dilated convolution kernel size.
    pub fn with_kernel_size(mut self, kernel_size: usize) -> Self {
        self.kernel_size = kernel_size;
        self
    }
}

/// Dilated convolution with additive content and timestep conditioning and a
/// `sigmoid(gate) * tanh(filter)` nonlinearity.
#[derive(Debug, Clone)]
pub struct ResidualBlock<B: Backend> {
    /// Dilated convolution `C -> 2C`.
    pub dilated_conv: Conv1d<B>,
    /// Conditioning projection `cond -> 2C`.
    pub cond_proj: Conv1d<B>,
    /// Output projection `C -> 2C` (residual, skip).
    pub out_proj: Conv1d<B>,
}

impl<B: Backend> ResidualBlock<B> {
    /// Create the block on the given device.
    pub fn new(config: ResidualBlockConfig, device: &B::Device) -> Self {
        let c = config.residual_channels;
        Self {
            dilated_conv: Conv1d::new(
                Conv1dConfig::new(c, 2 * c, config.kernel_size)
                    .with_dilation(config.dilation)
                    .with_init(ConvInit::KaimingNormal),
                device,
            ),
            cond_proj: Conv1d::new(
                Conv1dConfig::new(config.cond_channels, 2 * c, 1).with_init(ConvInit::KaimingNormal),
                device,
            ),
            out_proj: Conv1d::new(
                Conv1dConfig::new(c, 2 * c, 1).with_init(ConvInit::KaimingNormal),
                device,
            ),
        }
    }

    /// Run the block.
    ///
    /// `x` is `[batch, C, time]`, `step` the timestep embedding `[batch, C]`,
    /// `cond` the content sequence `[batch, cond, time]`. Returns the new
    /// residual stream and the skip contribution.
    pub fn forward(
        &self,
        x: Tensor<B, 3>,
        step: Tensor<B, 2>,
        cond: Tensor<B, 3>,
        mask: &PaddingMask<B>,
    ) -> (Tensor<B, 3>, Tensor<B, 3>) {
        let channels = x.dims()[1];
        let y = mask.zero_bct(x.clone() + step.unsqueeze_dim::<3>(2));
        let y = mask.zero_bct(self.dilated_conv.forward(y) + self.cond_proj.forward(cond));

        let gate = y.clone().narrow(1, 0, channels);
        let filter = y.narrow(1, channels, channels);
        let y = mask.zero_bct(sigmoid(gate) * tanh(filter));

        let y = mask.zero_bct(self.out_proj.forward(y));
        debug_assert_finite("residual block", &y);
        let residual = y.clone().narrow(1, 0, channels);
        let skip = y.narrow(1, channels, channels);
        ((x + residual).div_scalar(std::f32::consts::SQRT_2), skip)
    }
}
