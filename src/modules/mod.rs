//! Neural network building blocks shared by the encoders, predictors and
//! denoiser.
//!
//! Everything here is mask-aware: sequences travel with a [`mask::PaddingMask`]
//! and padded timesteps stay zero through every mixing operation.

pub mod attention;
pub mod conv;
pub mod mask;
pub mod perceiver;
pub mod timestep;
pub mod transformer;
pub mod wavenet;
