//! Error types shared by every component of the diffusion TTS core.
//!
//! Failures are reported with the name of the component and tensor that
//! triggered them so an aborted run points straight at the offending stage.

use std::fmt;

/// Errors raised by the TTS core.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// A sequence and its declared lengths (or two collaborating tensors) disagree.
    #[error("{component}: shape mismatch on `{tensor}`: {detail}")]
    ShapeMismatch {
        component: &'static str,
        tensor: &'static str,
        detail: String,
    },
    /// A NaN or infinite value reached a checked tensor.
    #[error("{component}: non-finite values in `{tensor}`")]
    NonFinite {
        component: &'static str,
        tensor: &'static str,
    },
    /// Configuration values that cannot produce a working model.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
    /// Failure reported by the external neural codec.
    #[error("codec: {0}")]
    Codec(String),
}

impl Error {
    /// Build a [`Error::ShapeMismatch`] with a formatted detail message.
    pub fn shape(component: &'static str, tensor: &'static str, detail: impl fmt::Display) -> Self {
        Self::ShapeMismatch {
            component,
            tensor,
            detail: detail.to_string(),
        }
    }
}

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::Error;

    #[test]
    fn messages_name_component_and_tensor() {
        let err = Error::shape("phoneme_encoder", "lengths", "expected 2 entries, got 3");
        assert_eq!(
            err.to_string(),
            "phoneme_encoder: shape mismatch on `lengths`: expected 2 entries, got 3"
        );

        let err = Error::NonFinite {
            component: "train_step",
            tensor: "loss_diff",
        };
        assert!(err.to_string().contains("loss_diff"));
    }
}
