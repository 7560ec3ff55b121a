//! # voxdiff - Latent Diffusion Text-to-Speech
//!
//! A Rust implementation of a non-autoregressive, latent-diffusion TTS core built
//! on [burn](https://burn.dev). Speech is generated as continuous neural-codec codes
//! that an external codec decodes into a waveform.
//!
//! ## Architecture Overview
//!
//! The pipeline consists of two stages:
//!
//! 1. **Acoustic prior** ([`PriorModel`]): a phoneme encoder and a prompt encoder
//!    (convolution + self-attention stacks) feed a duration predictor and a pitch
//!    predictor that cross-attend to the voice prompt. A length regulator expands
//!    phonemes to frame rate and a coarse pitch embedding is added on top.
//!
//! 2. **Diffusion process** ([`GaussianDiffusion`]): a DDPM over normalised codec
//!    codes. The [`Denoiser`] is a WaveNet-style stack of gated dilated convolutions,
//!    conditioned on the content embedding, the timestep and a Perceiver-resampled
//!    prompt that modulates every third block through cross-attention and FiLM.
//!    Inference runs either the ancestral sampler or the strided DDIM sampler.
//!
//! The codec itself is a collaborator behind the [`NeuralCodec`] trait.
//!
//! ## Quick Start
//!
//! ```no_run
//! use burn::tensor::{Int, Tensor, TensorData};
//! use burn_ndarray::{NdArray, NdArrayDevice};
//! use voxdiff::{load_config, GaussianDiffusion, NoiseRng};
//!
//! let config = load_config("config.yaml")?;
//! let device = NdArrayDevice::default();
//! let model = GaussianDiffusion::<NdArray<f32>>::new(config, &device)?;
//!
//! let phonemes = Tensor::<NdArray<f32>, 2, Int>::from_data(
//!     TensorData::new(vec![3i64, 14, 15, 9], [1, 4]),
//!     &device,
//! );
//! // Reference codes of the target voice, `[batch, frames, codec_channels]`.
//! let prompt = Tensor::<NdArray<f32>, 3>::zeros([1, 50, model.code_channels()], &device);
//!
//! let mut rng = NoiseRng::seed_from_u64(7);
//! let sampled = model.sample_codes(phonemes, prompt, &[4], &[50], &mut rng)?;
//! println!("predicted frames: {:?}", sampled.lengths);
//! # Ok::<(), anyhow::Error>(())
//! ```
//!
//! ## Reproducibility
//!
//! Every stochastic call takes a caller-owned [`NoiseRng`]; two calls with the same
//! seed, model and inputs produce the same result.
//!
//! ## Configuration
//!
//! Models are configured via YAML files with one section per component. See
//! [`Config`] for the full configuration structure.

// Public modules - these are part of the stable API
pub mod config;
pub mod error;
pub mod noise;

// Internal modules - exposed for integration tests but not part of stable API.
// These may change without notice between versions.
#[doc(hidden)]
pub mod conditioner;
#[doc(hidden)]
pub mod model;
#[doc(hidden)]
pub mod modules;

// Re-exports forming the public API
pub use config::{load_config, BetaScheduleKind, Config};
pub use error::{Error, Result};
pub use model::codec::NeuralCodec;
pub use model::denoiser::{Conditioning, Denoiser};
pub use model::diffusion::{
    denormalize, normalize, GaussianDiffusion, SampledCodes, Sampler, TrainBatch, TrainOutput,
    Waveform,
};
pub use model::prior::{PriorBatch, PriorModel};
pub use model::schedule::NoiseSchedule;
pub use noise::NoiseRng;
