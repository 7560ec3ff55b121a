//! Neural codec interface and residual-quantizer helpers.
//!
//! The codec itself is external; this module defines what the diffusion
//! core needs from it and the quantisation-aware cross-entropy loss built on
//! its codebooks.

use crate::error::{Error, Result};
use crate::modules::mask::PaddingMask;
use burn::tensor::{activation::log_softmax, backend::Backend, Int, Tensor};

/// Continuous neural audio codec.
///
/// Codes use the `[batch, frames, channels]` layout.
pub trait NeuralCodec<B: Backend> {
    /// Encode a waveform `[batch, audio_channels, samples]` into codes.
    fn encode(&self, waveform: Tensor<B, 3>) -> Result<Tensor<B, 3>>;

    /// Decode codes into a waveform `[batch, audio_channels, samples]`.
    fn decode(&self, codes: Tensor<B, 3>) -> Result<Tensor<B, 3>>;

    /// Residual vector quantizer codebooks, one `[entries, channels]` tensor per level.
    fn codebooks(&self) -> Vec<Tensor<B, 2>>;
}

/// Result of residual quantisation.
#[derive(Debug, Clone)]
pub struct RvqEncoding<B: Backend> {
    /// Sum of the selected codebook vectors `[batch, frames, channels]`.
    pub quantized: Tensor<B, 3>,
    /// Selected entry per level, each `[batch, frames]`.
    pub indices: Vec<Tensor<B, 2, Int>>,
    /// Quantised sum accumulated before each level, each `[batch, frames, channels]`.
    pub prefixes: Vec<Tensor<B, 3>>,
}

/// Negative squared distance between every frame and every codebook entry, `[batch, frames, entries]`.
fn neg_distance<B: Backend>(x: Tensor<B, 3>, codebook: Tensor<B, 2>) -> Tensor<B, 3> {
    let [batch, _, _] = x.dims();
    let x_sq = x.clone().powf_scalar(2.0).sum_dim(2);
    let e_sq = codebook.clone().powf_scalar(2.0).sum_dim(1).transpose().unsqueeze_dim::<3>(0);
    let embed = codebook.transpose().unsqueeze_dim::<3>(0).repeat_dim(0, batch);
    let cross = x.matmul(embed).mul_scalar(2.0);
    (x_sq - cross + e_sq).neg()
}

/// Residual-quantise `codes` `[batch, frames, channels]` with the first `levels` codebooks.
pub fn rvq_encode<B: Backend>(
    codes: Tensor<B, 3>,
    codebooks: &[Tensor<B, 2>],
    levels: usize,
) -> Result<RvqEncoding<B>> {
    let [batch, frames, channels] = codes.dims();
    if codebooks.len() < levels {
        return Err(Error::Codec(format!(
            "{levels} quantizer levels requested, codec has {}",
            codebooks.len()
        )));
    }
    let mut residual = codes.clone();
    let mut quantized = Tensor::zeros_like(&codes);
    let mut indices = Vec::with_capacity(levels);
    let mut prefixes = Vec::with_capacity(levels);
    for codebook in &codebooks[..levels] {
        let [_, width] = codebook.dims();
        if width != channels {
            return Err(Error::shape(
                "rvq_encode",
                "codebook",
                format!("codebook width {width} for {channels}-channel codes"),
            ));
        }
        prefixes.push(quantized.clone());
        let index = neg_distance(residual.clone(), codebook.clone())
            .argmax(2)
            .reshape([batch, frames]);
        let selected = codebook
            .clone()
            .select(0, index.clone().reshape([batch * frames]))
            .reshape([batch, frames, channels]);
        residual = residual - selected.clone();
        quantized = quantized + selected;
        indices.push(index);
    }
    Ok(RvqEncoding {
        quantized,
        indices,
        prefixes,
    })
}

/// Cross-entropy between predicted residuals and the ground-truth quantizer indices.
///
/// For every level, `prediction - prefix` is scored against the codebook with
/// negative squared distances as logits. The loss is averaged over valid frames
/// and summed over levels.
pub fn rvq_ce_loss<B: Backend>(
    prediction: Tensor<B, 3>,
    encoding: &RvqEncoding<B>,
    codebooks: &[Tensor<B, 2>],
    mask: &PaddingMask<B>,
) -> Tensor<B, 1> {
    let device = prediction.device();
    let valid = mask.lengths().iter().sum::<usize>().max(1) as f32;
    let keep = mask.mask().bool_not().float();
    let mut loss = Tensor::<B, 1>::zeros([1], &device);
    for ((codebook, index), prefix) in codebooks
        .iter()
        .zip(&encoding.indices)
        .zip(&encoding.prefixes)
    {
        let residual = prediction.clone() - prefix.clone();
        let log_probs = log_softmax(neg_distance(residual, codebook.clone()), 2);
        let picked = log_probs.gather(2, index.clone().unsqueeze_dim::<3>(2));
        let [batch, frames, _] = picked.dims();
        let nll = picked.reshape([batch, frames]).neg() * keep.clone();
        loss = loss + nll.sum().div_scalar(valid);
    }
    loss
}
