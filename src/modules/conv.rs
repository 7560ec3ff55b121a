//! 1D convolution primitives and the masked convolution layers built on them.
//!
//! [`Conv1d`] works on `[batch, channels, time]` tensors with "same" padding.
//! [`ConvLayer`] and [`EncConvLayer`] take `[batch, time, channels]`
//! sequences and zero padded timesteps before and after every convolution so
//! padding never leaks into valid frames.

use crate::modules::mask::{debug_assert_finite, PaddingMask};
use burn::{
    module::Param,
    tensor::{
        activation::relu,
        backend::Backend,
        module::conv1d,
        ops::ConvOptions,
        Distribution, Tensor,
    },
};
use burn_nn::{Dropout, DropoutConfig, LayerNorm, LayerNormConfig, Linear, LinearConfig};

/// Weight initialisation for [`Conv1d`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ConvInit {
    /// Uniform in `±1/sqrt(fan_in)` for weights and bias.
    Uniform,
    /// Normal with the given standard deviation; zero bias.
    Normal {
        /// Standard deviation.
        std: f64,
    },
    /// He normal (`std = sqrt(2 / fan_in)`); zero bias.
    KaimingNormal,
    /// All zeros.
    Zeros,
}

/// Configuration for [`Conv1d`].
#[derive(Debug, Clone)]
pub struct Conv1dConfig {
    /// Input channels.
    pub in_channels: usize,
    /// Output channels.
    pub out_channels: usize,
    /// Kernel size (odd, for "same" padding).
    pub kernel_size: usize,
    /// Dilation factor.
    pub dilation: usize,
    /// Number of groups.
    pub groups: usize,
    /// Learn an additive bias.
    pub bias: bool,
    /// Weight initialisation.
    pub init: ConvInit,
}

impl Conv1dConfig {
    /// Create a dense, undilated convolution config with bias.
    pub fn new(in_channels: usize, out_channels: usize, kernel_size: usize) -> Self {
        Self {
            in_channels,
            out_channels,
            kernel_size,
            dilation: 1,
            groups: 1,
            bias: true,
            init: ConvInit::Uniform,
        }
    }

    /// Set the dilation factor.
    pub fn with_dilation(mut self, dilation: usize) -> Self {
        self.dilation = dilation;
        self
    }

    /// Set the number of groups.
    pub fn with_groups(mut self, groups: usize) -> Self {
        self.groups = groups;
        self
    }

    /// Set the weight initialisation.
    pub fn with_init(mut self, init: ConvInit) -> Self {
        self.init = init;
        self
    }

    fn padding(&self) -> usize {
        self.dilation * self.kernel_size.saturating_sub(1) / 2
    }
}

/// 1D convolution with "same" padding on `[batch, channels, time]` input.
#[derive(Debug, Clone)]
pub struct Conv1d<B: Backend> {
    /// Weight `[out, in / groups, kernel]`.
    pub weight: Param<Tensor<B, 3>>,
    /// Optional bias `[out]`.
    pub bias: Option<Param<Tensor<B, 1>>>,
    options: ConvOptions<1>,
}

impl<B: Backend> Conv1d<B> {
    /// Create and initialise a convolution on the given device.
    pub fn new(config: Conv1dConfig, device: &B::Device) -> Self {
        let in_per_group = config.in_channels / config.groups;
        let shape = [config.out_channels, in_per_group, config.kernel_size];
        let fan_in = (in_per_group * config.kernel_size).max(1) as f64;
        let (weight, bias) = match config.init {
            ConvInit::Uniform => {
                let bound = fan_in.sqrt().recip();
                (
                    Tensor::random(shape, Distribution::Uniform(-bound, bound), device),
                    Tensor::random(
                        [config.out_channels],
                        Distribution::Uniform(-bound, bound),
                        device,
                    ),
                )
            }
            ConvInit::Normal { std } => (
                Tensor::random(shape, Distribution::Normal(0.0, std), device),
                Tensor::zeros([config.out_channels], device),
            ),
            ConvInit::KaimingNormal => (
                Tensor::random(
                    shape,
                    Distribution::Normal(0.0, (2.0 / fan_in).sqrt()),
                    device,
                ),
                Tensor::zeros([config.out_channels], device),
            ),
            ConvInit::Zeros => (
                Tensor::zeros(shape, device),
                Tensor::zeros([config.out_channels], device),
            ),
        };
        let padding = config.padding();
        Self {
            weight: Param::from_tensor(weight),
            bias: config.bias.then(|| Param::from_tensor(bias)),
            options: ConvOptions::new([1], [padding], [config.dilation], config.groups),
        }
    }

    /// Dilation factor of the kernel.
    pub fn dilation(&self) -> usize {
        self.options.dilation[0]
    }

    /// Apply the convolution to `[batch, channels, time]`.
    pub fn forward(&self, x: Tensor<B, 3>) -> Tensor<B, 3> {
        conv1d(
            x,
            self.weight.val(),
            self.bias.as_ref().map(|b| b.val()),
            self.options.clone(),
        )
    }

    /// Apply the convolution to `[batch, time, channels]`.
    pub fn forward_btc(&self, x: Tensor<B, 3>) -> Tensor<B, 3> {
        self.forward(x.swap_dims(1, 2)).swap_dims(1, 2)
    }
}

fn scaled_normal_init(c_in: usize, kernel_size: usize, dropout: f64) -> ConvInit {
    let std = (4.0 * (1.0 - dropout) / (kernel_size * c_in) as f64).sqrt();
    ConvInit::Normal { std }
}

/// Configuration for [`ConvLayer`] and [`EncConvLayer`].
#[derive(Debug, Clone)]
pub struct ConvLayerConfig {
    /// Input channels.
    pub in_channels: usize,
    /// Output channels.
    pub out_channels: usize,
    /// Kernel size.
    pub kernel_size: usize,
    /// Dropout after the activation.
    pub dropout: f64,
    /// Convolution groups.
    pub groups: usize,
}

impl ConvLayerConfig {
    /// Create a config with dense convolutions.
    pub fn new(in_channels: usize, out_channels: usize, kernel_size: usize, dropout: f64) -> Self {
        Self {
            in_channels,
            out_channels,
            kernel_size,
            dropout,
            groups: 1,
        }
    }

    /// Set the convolution groups.
    pub fn with_groups(mut self, groups: usize) -> Self {
        self.groups = groups;
        self
    }

    fn conv(&self) -> Conv1dConfig {
        Conv1dConfig::new(self.in_channels, self.out_channels, self.kernel_size)
            .with_groups(self.groups)
            .with_init(scaled_normal_init(
                self.in_channels,
                self.kernel_size,
                self.dropout,
            ))
    }
}

/// Layer norm, masked convolution, ReLU and dropout, plus a bias-free
/// linear skip from the raw input.
#[derive(Debug, Clone)]
pub struct ConvLayer<B: Backend> {
    /// Pre-convolution layer norm.
    pub norm: LayerNorm<B>,
    /// Convolution.
    pub conv: Conv1d<B>,
    /// Skip projection.
    pub skip: Linear<B>,
    dropout: Dropout,
}

impl<B: Backend> ConvLayer<B> {
    /// Create the layer on the given device.
    pub fn new(config: ConvLayerConfig, device: &B::Device) -> Self {
        Self {
            norm: LayerNormConfig::new(config.in_channels).init(device),
            conv: Conv1d::new(config.conv(), device),
            skip: LinearConfig::new(config.in_channels, config.out_channels)
                .with_bias(false)
                .init(device),
            dropout: DropoutConfig::new(config.dropout).init(),
        }
    }

    /// Apply to a `[batch, time, in_channels]` sequence.
    pub fn forward(&self, x: Tensor<B, 3>, mask: &PaddingMask<B>) -> Tensor<B, 3> {
        let skip = mask.zero_btc(self.skip.forward(x.clone()));
        let h = self.norm.forward(mask.zero_btc(x));
        let h = mask.around_btc(h, |h| self.conv.forward_btc(h));
        let h = self.dropout.forward(relu(h));
        debug_assert_finite("conv layer", &h);
        h + skip
    }
}

/// Residual variant of [`ConvLayer`] with equal input and output width.
#[derive(Debug, Clone)]
pub struct EncConvLayer<B: Backend> {
    /// Pre-convolution layer norm.
    pub norm: LayerNorm<B>,
    /// Convolution.
    pub conv: Conv1d<B>,
    dropout: Dropout,
}

impl<B: Backend> EncConvLayer<B> {
    /// Create the layer on the given device; `out_channels` is ignored.
    pub fn new(config: ConvLayerConfig, device: &B::Device) -> Self {
        let config = ConvLayerConfig {
            out_channels: config.in_channels,
            ..config
        };
        Self {
            norm: LayerNormConfig::new(config.in_channels).init(device),
            conv: Conv1d::new(config.conv(), device),
            dropout: DropoutConfig::new(config.dropout).init(),
        }
    }

    /// Apply to a `[batch, time, channels]` sequence.
    pub fn forward(&self, x: Tensor<B, 3>, mask: &PaddingMask<B>) -> Tensor<B, 3> {
        let h = self.norm.forward(mask.zero_btc(x.clone()));
        let h = mask.around_btc(h, |h| self.conv.forward_btc(h));
        let h = self.dropout.forward(relu(h));
        debug_assert_finite("enc conv layer", &h);
        h + x
    }
}
