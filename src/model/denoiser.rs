//! WaveNet-style denoising network.
//!
//! Predicts the clean code `x_start` from a noisy code, conditioned on the
//! frame-rate content embedding, the diffusion timestep and the prompt. The
//! prompt enters through a Perceiver resampler and, every third residual block,
//! a cross-attention step whose output drives a FiLM scale/shift.

use crate::config::DenoiserConfig;
use crate::error::{Error, Result};
use crate::modules::attention::{MultiHeadAttention, MultiHeadAttentionConfig};
use crate::modules::conv::{Conv1d, Conv1dConfig, ConvInit};
use crate::modules::mask::{debug_assert_finite, PaddingMask};
use crate::modules::perceiver::{PerceiverResampler, PerceiverResamplerConfig};
use crate::modules::timestep::{TimestepEmbedder, TimestepEmbedderConfig};
use crate::modules::wavenet::{ResidualBlock, ResidualBlockConfig};
use burn::tensor::{activation::relu, backend::Backend, Bool, Int, Tensor, TensorData};

/// Conditioning inputs shared by every denoiser call of one batch.
#[derive(Debug, Clone)]
pub struct Conditioning<B: Backend> {
    /// Content + pitch embedding `[batch, T, content_channels]`.
    pub content: Tensor<B, 3>,
    /// Prompt embedding `[batch, Tp, hidden]`.
    pub prompt: Tensor<B, 3>,
    /// Valid frames per example.
    pub content_lengths: Vec<usize>,
    /// Valid prompt frames per example.
    pub prompt_lengths: Vec<usize>,
}

/// Cross-attention + FiLM applied after every third residual block.
#[derive(Debug, Clone)]
pub struct FilmLayer<B: Backend> {
    /// 1x1 projection of the prompt latents.
    pub prompt_proj: Conv1d<B>,
    /// Hidden state (query) against projected latents.
    pub cross_attn: MultiHeadAttention<B>,
    /// 1x1 projection to `(scale, shift)`.
    pub film: Conv1d<B>,
}

impl<B: Backend> FilmLayer<B> {
    fn new(config: &DenoiserConfig, device: &B::Device) -> Self {
        let h = config.hidden_channels;
        Self {
            prompt_proj: Conv1d::new(
                Conv1dConfig::new(h, h, 1).with_init(ConvInit::KaimingNormal),
                device,
            ),
            cross_attn: MultiHeadAttention::new(
                MultiHeadAttentionConfig::new(h, config.n_heads)
                    .with_dropout(config.p_dropout)
                    .with_bias(false),
                device,
            ),
            film: Conv1d::new(
                Conv1dConfig::new(h, 2 * h, 1).with_init(ConvInit::KaimingNormal),
                device,
            ),
        }
    }

    /// Modulate `x` `[batch, H, T]` with the prompt latents `[batch, H, L]`.
    fn forward(
        &self,
        x: Tensor<B, 3>,
        latents: Tensor<B, 3>,
        cross_mask: Tensor<B, 3, Bool>,
        mask: &PaddingMask<B>,
    ) -> Tensor<B, 3> {
        let channels = x.dims()[1];
        let keys = self.prompt_proj.forward(latents).swap_dims(1, 2);
        let attended = self
            .cross_attn
            .forward(x.clone().swap_dims(1, 2), keys, Some(cross_mask))
            .swap_dims(1, 2);
        debug_assert_finite("film cross-attention", &attended);
        let scale_shift = mask.zero_bct(self.film.forward(attended));
        let scale = scale_shift.clone().narrow(1, 0, channels);
        let shift = scale_shift.narrow(1, channels, channels);
        mask.zero_bct(x * scale + shift)
    }
}

/// Denoising network predicting `x_start`.
#[derive(Debug, Clone)]
pub struct Denoiser<B: Backend> {
    /// Input projection `C -> H`.
    pub pre_conv: Conv1d<B>,
    /// Prompt resampler.
    pub resampler: PerceiverResampler<B>,
    /// Timestep embedding.
    pub time_mlp: TimestepEmbedder<B>,
    /// Residual blocks.
    pub residual_layers: Vec<ResidualBlock<B>>,
    /// FiLM layers, one per three residual blocks.
    pub film_layers: Vec<FilmLayer<B>>,
    /// Projection of the accumulated skips.
    pub skip_conv: Conv1d<B>,
    /// Output projection `H -> C` (zero-initialised).
    pub proj: Conv1d<B>,
    normalize_skip: bool,
}

impl<B: Backend> Denoiser<B> {
    /// Create the network on the given device.
    pub fn new(config: &DenoiserConfig, content_channels: usize, device: &B::Device) -> Self {
        let h = config.hidden_channels;
        let residual_layers = (0..config.n_layers)
            .map(|i| {
                let dilation = match config.dilation_cycle {
                    Some(cycle) => config.dilation_rate.pow((i % cycle) as u32),
                    None => config.dilation_rate,
                };
                ResidualBlock::new(
                    ResidualBlockConfig::new(content_channels, h, dilation)
                        .with_kernel_size(config.kernel_size),
                    device,
                )
            })
            .collect();
        let film_layers = (0..config.n_layers / 3)
            .map(|_| FilmLayer::new(config, device))
            .collect();
        tracing::debug!(
            n_layers = config.n_layers,
            hidden = h,
            num_latents = config.num_latents,
            "built denoiser"
        );
        Self {
            pre_conv: Conv1d::new(
                Conv1dConfig::new(config.in_channels, h, 1).with_init(ConvInit::KaimingNormal),
                device,
            ),
            resampler: PerceiverResampler::new(
                PerceiverResamplerConfig::new(h)
                    .with_num_latents(config.num_latents)
                    .with_num_heads(config.n_heads)
                    .with_dropout(config.p_dropout),
                device,
            ),
            time_mlp: TimestepEmbedder::new(TimestepEmbedderConfig::new(h), device),
            residual_layers,
            film_layers,
            skip_conv: Conv1d::new(
                Conv1dConfig::new(h, h, 1).with_init(ConvInit::KaimingNormal),
                device,
            ),
            proj: Conv1d::new(
                Conv1dConfig::new(h, config.out_channels, 1).with_init(ConvInit::Zeros),
                device,
            ),
            normalize_skip: config.normalize_skip,
        }
    }

    /// Predict `x_start` `[batch, C, T]` from the noisy code `x` at `timesteps`.
    pub fn forward(
        &self,
        x: Tensor<B, 3>,
        cond: &Conditioning<B>,
        timesteps: &[usize],
    ) -> Result<Tensor<B, 3>> {
        let [batch, _, frames] = x.dims();
        let [content_batch, content_frames, _] = cond.content.dims();
        if content_batch != batch || content_frames != frames {
            return Err(Error::shape(
                "denoiser",
                "content",
                format!(
                    "content is [{content_batch}, {content_frames}, _] for a [{batch}, _, {frames}] code"
                ),
            ));
        }
        let [prompt_batch, _, _] = cond.prompt.dims();
        if prompt_batch != batch {
            return Err(Error::shape(
                "denoiser",
                "prompt",
                format!("prompt batch {prompt_batch} for a query batch {batch}"),
            ));
        }
        if timesteps.len() != batch {
            return Err(Error::shape(
                "denoiser",
                "timesteps",
                format!("{} timesteps for a batch of {batch}", timesteps.len()),
            ));
        }
        let mask = PaddingMask::for_bct("denoiser", "content_lengths", &x, &cond.content_lengths)?;
        let prompt_mask =
            PaddingMask::for_btc("denoiser", "prompt_lengths", &cond.prompt, &cond.prompt_lengths)?;
        let device = x.device();

        let steps: Vec<i64> = timesteps.iter().map(|&t| t as i64).collect();
        let steps = Tensor::<B, 1, Int>::from_data(TensorData::new(steps, [batch]), &device);
        let step_emb = self.time_mlp.forward(steps);

        let latents = self
            .resampler
            .forward(cond.prompt.clone(), &prompt_mask)
            .swap_dims(1, 2);
        let num_latents = self.resampler.num_latents();
        let latent_mask = PaddingMask::new(&vec![num_latents; batch], num_latents, &device)?;
        let cross_mask = mask.cross(&latent_mask);
        let content = mask.zero_bct(cond.content.clone().swap_dims(1, 2));

        let mut x = mask.zero_bct(self.pre_conv.forward(x));
        let mut skip: Option<Tensor<B, 3>> = None;
        for (lid, layer) in self.residual_layers.iter().enumerate() {
            let (next, skip_part) = layer.forward(x, step_emb.clone(), content.clone(), &mask);
            x = next;
            if lid % 3 == 2 {
                let film = &self.film_layers[(lid + 1) / 3 - 1];
                x = film.forward(x, latents.clone(), cross_mask.clone(), &mask);
            }
            skip = Some(mask.zero_bct(match skip {
                Some(acc) => acc + skip_part,
                None => skip_part,
            }));
        }

        let skip = skip.unwrap_or_else(|| Tensor::zeros_like(&x));
        let x = if self.normalize_skip {
            skip.div_scalar((self.residual_layers.len().max(1) as f32).sqrt())
        } else {
            skip
        };
        let x = relu(mask.zero_bct(self.skip_conv.forward(x)));
        let out = mask.zero_bct(self.proj.forward(x));
        debug_assert_finite("denoiser output", &out);
        Ok(out)
    }
}
