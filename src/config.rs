//! Configuration types for the acoustic prior, the denoiser and the diffusion process.
//!
//! Configurations are typically loaded from YAML files using [`load_config`].
//! Every section has defaults matching the reference model, so a file only needs
//! to list the values it changes.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

/// Block variant used by the phoneme and prompt encoders.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum LayerKind {
    /// Pre-norm self-attention followed by a convolutional feed-forward.
    #[default]
    ConvSelfAttention,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
/// Phoneme (text) encoder hyperparameters.
pub struct PhonemeEncoderConfig {
    /// Size of the external symbol table (index 0 is reserved for padding on top of it).
    pub n_symbols: usize,
    /// Hidden width of the embeddings and blocks.
    pub hidden_channels: usize,
    /// Number of stacked blocks.
    pub n_layers: usize,
    /// Feed-forward convolution kernel size.
    pub kernel_size: usize,
    /// Self-attention heads.
    pub n_heads: usize,
    /// Dropout probability.
    pub p_dropout: f64,
    /// Apply a final layer norm (followed by re-masking).
    pub last_ln: bool,
    /// Block variant tag.
    pub layer: LayerKind,
}

impl Default for PhonemeEncoderConfig {
    fn default() -> Self {
        Self {
            n_symbols: 100,
            hidden_channels: 512,
            n_layers: 6,
            kernel_size: 9,
            n_heads: 8,
            p_dropout: 0.2,
            last_ln: true,
            layer: LayerKind::ConvSelfAttention,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
/// Prompt (reference audio) encoder hyperparameters.
pub struct PromptEncoderConfig {
    /// Codec code width.
    pub in_channels: usize,
    /// Hidden width.
    pub hidden_channels: usize,
    /// Number of stacked blocks.
    pub n_layers: usize,
    /// Feed-forward convolution kernel size.
    pub kernel_size: usize,
    /// Self-attention heads.
    pub n_heads: usize,
    /// Dropout probability.
    pub p_dropout: f64,
    /// Apply a final layer norm (followed by re-masking).
    pub last_ln: bool,
    /// Block variant tag.
    pub layer: LayerKind,
}

impl Default for PromptEncoderConfig {
    fn default() -> Self {
        Self {
            in_channels: 128,
            hidden_channels: 512,
            n_layers: 6,
            kernel_size: 9,
            n_heads: 8,
            p_dropout: 0.2,
            last_ln: true,
            layer: LayerKind::ConvSelfAttention,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
/// Shared hyperparameters of the duration and pitch predictors.
pub struct PredictorConfig {
    /// Input (query) width.
    pub in_channels: usize,
    /// Hidden width; must match the prompt embedding width.
    pub hidden_channels: usize,
    /// Number of conv + cross-attention blocks.
    pub attention_layers: usize,
    /// Cross-attention heads.
    pub n_heads: usize,
    /// Dropout probability.
    pub p_dropout: f64,
    /// Convolution kernel size.
    pub kernel_size: usize,
    /// Convolution groups inside each block (1 = full, `hidden_channels` = depthwise).
    #[serde(default = "default_conv_groups")]
    pub conv_groups: usize,
}

fn default_conv_groups() -> usize {
    1
}

impl PredictorConfig {
    /// Defaults for the duration predictor (kernel 3).
    pub fn duration() -> Self {
        Self {
            in_channels: 512,
            hidden_channels: 512,
            attention_layers: 10,
            n_heads: 8,
            p_dropout: 0.5,
            kernel_size: 3,
            conv_groups: 1,
        }
    }

    /// Defaults for the pitch predictor (kernel 5).
    pub fn pitch() -> Self {
        Self {
            kernel_size: 5,
            ..Self::duration()
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
/// Denoising network (WaveNet-style encoder) hyperparameters.
pub struct DenoiserConfig {
    /// Code channels of the noisy input.
    pub in_channels: usize,
    /// Code channels of the prediction.
    pub out_channels: usize,
    /// Residual width; must match the prompt embedding width.
    pub hidden_channels: usize,
    /// Dilated convolution kernel size.
    pub kernel_size: usize,
    /// Dilation of every residual block.
    pub dilation_rate: usize,
    /// When set, dilation grows as `dilation_rate^(i % cycle)`.
    pub dilation_cycle: Option<usize>,
    /// Number of residual blocks.
    pub n_layers: usize,
    /// Cross-attention heads.
    pub n_heads: usize,
    /// Attention dropout probability.
    pub p_dropout: f64,
    /// Number of Perceiver latents the prompt is resampled to.
    pub num_latents: usize,
    /// Divide the accumulated skip connections by `sqrt(n_layers)`.
    pub normalize_skip: bool,
}

impl Default for DenoiserConfig {
    fn default() -> Self {
        Self {
            in_channels: 128,
            out_channels: 128,
            hidden_channels: 512,
            kernel_size: 3,
            dilation_rate: 2,
            dilation_cycle: None,
            n_layers: 40,
            n_heads: 8,
            p_dropout: 0.2,
            num_latents: 32,
            normalize_skip: false,
        }
    }
}

/// Beta schedule used to build the noise schedule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum BetaScheduleKind {
    /// DDPM linear schedule scaled to the number of timesteps.
    #[default]
    Linear,
    /// Improved-DDPM cosine schedule.
    Cosine,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
/// Diffusion process options.
pub struct DiffusionConfig {
    /// Total forward-process steps `T`.
    pub timesteps: usize,
    /// Steps used by the strided sampler; `< timesteps` selects it.
    pub sampling_timesteps: usize,
    /// Interpolation coefficient of the strided sampler, in `[0, 1]`.
    pub ddim_sampling_eta: f64,
    /// Beta schedule.
    pub beta_schedule: BetaScheduleKind,
    /// Clip the SNR loss weight at `min_snr_gamma`.
    pub min_snr_loss_weight: bool,
    /// SNR clip value.
    pub min_snr_gamma: f64,
}

impl Default for DiffusionConfig {
    fn default() -> Self {
        Self {
            timesteps: 1000,
            sampling_timesteps: 1000,
            ddim_sampling_eta: 0.0,
            beta_schedule: BetaScheduleKind::Linear,
            min_snr_loss_weight: false,
            min_snr_gamma: 5.0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
/// Weights of the training loss terms.
pub struct LossConfig {
    /// Diffusion reconstruction term.
    pub diff: f64,
    /// Log-duration L1 term.
    pub duration: f64,
    /// Log-pitch L1 term.
    pub f0: f64,
    /// Residual quantizer cross-entropy term.
    pub rvq_cross_entropy: f64,
    /// Number of quantizer levels used by the cross-entropy term.
    pub rvq_layers: usize,
}

impl Default for LossConfig {
    fn default() -> Self {
        Self {
            diff: 1.0,
            duration: 1.0,
            f0: 1.0,
            rvq_cross_entropy: 0.1,
            rvq_layers: 8,
        }
    }
}

/// Top-level model configuration.
///
/// # Example YAML
///
/// ```yaml
/// phoneme_encoder: { n_symbols: 178, hidden_channels: 512 }
/// prompt_encoder: { in_channels: 128, hidden_channels: 512 }
/// diffusion: { timesteps: 1000, sampling_timesteps: 50, ddim_sampling_eta: 0.0 }
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Phoneme encoder.
    #[serde(default)]
    pub phoneme_encoder: PhonemeEncoderConfig,
    /// Prompt encoder.
    #[serde(default)]
    pub prompt_encoder: PromptEncoderConfig,
    /// Duration predictor.
    #[serde(default = "PredictorConfig::duration")]
    pub duration_predictor: PredictorConfig,
    /// Pitch predictor.
    #[serde(default = "PredictorConfig::pitch")]
    pub f0_predictor: PredictorConfig,
    /// Denoising network.
    #[serde(default)]
    pub denoiser: DenoiserConfig,
    /// Diffusion process.
    #[serde(default)]
    pub diffusion: DiffusionConfig,
    /// Loss weights.
    #[serde(default)]
    pub loss: LossConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            phoneme_encoder: PhonemeEncoderConfig::default(),
            prompt_encoder: PromptEncoderConfig::default(),
            duration_predictor: PredictorConfig::duration(),
            f0_predictor: PredictorConfig::pitch(),
            denoiser: DenoiserConfig::default(),
            diffusion: DiffusionConfig::default(),
            loss: LossConfig::default(),
        }
    }
}

impl Config {
    /// Reject configurations that cannot be built into a working model.
    pub fn validate(&self) -> Result<()> {
        let d = &self.diffusion;
        if d.timesteps == 0 {
            return invalid("diffusion.timesteps must be positive");
        }
        if d.sampling_timesteps == 0 || d.sampling_timesteps > d.timesteps {
            return invalid(format!(
                "diffusion.sampling_timesteps must be in 1..={}, got {}",
                d.timesteps, d.sampling_timesteps
            ));
        }
        if !(0.0..=1.0).contains(&d.ddim_sampling_eta) {
            return invalid(format!(
                "diffusion.ddim_sampling_eta must be in [0, 1], got {}",
                d.ddim_sampling_eta
            ));
        }
        if d.min_snr_loss_weight && d.min_snr_gamma <= 0.0 {
            return invalid("diffusion.min_snr_gamma must be positive");
        }

        let phoneme = &self.phoneme_encoder;
        let prompt = &self.prompt_encoder;
        let denoiser = &self.denoiser;
        check_heads("phoneme_encoder", phoneme.hidden_channels, phoneme.n_heads)?;
        check_heads("prompt_encoder", prompt.hidden_channels, prompt.n_heads)?;
        check_heads("denoiser", denoiser.hidden_channels, denoiser.n_heads)?;
        for (name, predictor) in [
            ("duration_predictor", &self.duration_predictor),
            ("f0_predictor", &self.f0_predictor),
        ] {
            check_heads(name, predictor.hidden_channels, predictor.n_heads)?;
            if predictor.in_channels != phoneme.hidden_channels {
                return invalid(format!(
                    "{name}.in_channels ({}) must equal phoneme_encoder.hidden_channels ({})",
                    predictor.in_channels, phoneme.hidden_channels
                ));
            }
            if predictor.hidden_channels != prompt.hidden_channels {
                return invalid(format!(
                    "{name}.hidden_channels ({}) must equal prompt_encoder.hidden_channels ({})",
                    predictor.hidden_channels, prompt.hidden_channels
                ));
            }
            if predictor.conv_groups == 0 || predictor.hidden_channels % predictor.conv_groups != 0
            {
                return invalid(format!(
                    "{name}.conv_groups ({}) must divide hidden_channels ({})",
                    predictor.conv_groups, predictor.hidden_channels
                ));
            }
        }
        if denoiser.hidden_channels != prompt.hidden_channels {
            return invalid(format!(
                "denoiser.hidden_channels ({}) must equal prompt_encoder.hidden_channels ({})",
                denoiser.hidden_channels, prompt.hidden_channels
            ));
        }
        if denoiser.in_channels != prompt.in_channels
            || denoiser.out_channels != prompt.in_channels
        {
            return invalid(format!(
                "denoiser in/out channels ({}/{}) must equal the codec width ({})",
                denoiser.in_channels, denoiser.out_channels, prompt.in_channels
            ));
        }
        if denoiser.n_layers == 0 || denoiser.num_latents == 0 {
            return invalid("denoiser.n_layers and denoiser.num_latents must be positive");
        }
        if denoiser.kernel_size % 2 == 0 {
            return invalid("denoiser.kernel_size must be odd");
        }
        if denoiser.dilation_cycle == Some(0) {
            return invalid("denoiser.dilation_cycle must be positive when set");
        }
        Ok(())
    }
}

fn check_heads(name: &str, hidden: usize, heads: usize) -> Result<()> {
    if heads == 0 || hidden % heads != 0 {
        return invalid(format!(
            "{name}: hidden_channels ({hidden}) must be divisible by n_heads ({heads})"
        ));
    }
    Ok(())
}

fn invalid<T>(message: impl Into<String>) -> Result<T> {
    Err(Error::InvalidConfig(message.into()))
}

/// Load a model configuration from a YAML file.
///
/// # Errors
///
/// Returns an error if the file doesn't exist, contains invalid YAML, or
/// describes an inconsistent model.
pub fn load_config(path: impl AsRef<Path>) -> anyhow::Result<Config> {
    let path = path.as_ref();
    if !path.exists() {
        anyhow::bail!("Config file not found: {}", path.display());
    }

    let data = fs::read_to_string(path)?;
    let config: Config = serde_yaml::from_str(&data)?;
    config.validate()?;
    Ok(config)
}
