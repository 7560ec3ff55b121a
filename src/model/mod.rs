//! Model components of the latent diffusion TTS pipeline.
//!
//! The acoustic prior turns phonemes and a voice prompt into frame-rate
//! content; the diffusion process and its denoiser turn that content into
//! codec codes.

pub mod codec;
pub mod denoiser;
pub mod diffusion;
pub mod length_regulator;
pub mod predictor;
pub mod prior;
pub mod schedule;
