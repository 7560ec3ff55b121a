//! Conditioning inputs of the acoustic prior.
//!
//! Conditioners embed phoneme ids, reference codes and pitch into the model's
//! hidden width.

pub mod phoneme;
pub mod pitch;
pub mod prompt;
