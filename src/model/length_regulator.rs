//! Length regulation: expand token-rate sequences to frame rate.
//!
//! Each token's vector is repeated `duration` times, examples are expanded
//! independently and then zero-padded to a common length. The expansion is a
//! gather, so gradients flow back to the token sequence.

use crate::error::{Error, Result};
use burn::tensor::{backend::Backend, Int, Tensor, TensorData};

/// Read integer durations `[batch, N]` into per-example host vectors,
/// clamping negative values to zero.
pub fn durations_to_host<B: Backend>(durations: Tensor<B, 2, Int>) -> Result<Vec<Vec<usize>>> {
    let [batch, tokens] = durations.dims();
    let values = durations
        .into_data()
        .convert::<i64>()
        .to_vec::<i64>()
        .map_err(|err| {
            Error::shape("length_regulator", "durations", format!("unreadable data: {err:?}"))
        })?;
    Ok((0..batch)
        .map(|b| {
            values[b * tokens..(b + 1) * tokens]
                .iter()
                .map(|&d| d.max(0) as usize)
                .collect()
        })
        .collect())
}

/// Trim per-token durations so that no example expands past `max_len`.
///
/// Tokens are consumed in order; the token crossing the cap is shortened and
/// every later token gets duration zero.
pub fn cap_durations(durations: &mut [Vec<usize>], max_len: usize) {
    for row in durations.iter_mut() {
        let mut remaining = max_len;
        for d in row.iter_mut() {
            *d = (*d).min(remaining);
            remaining -= *d;
        }
    }
}

/// Stateless length regulator.
#[derive(Debug, Clone, Copy, Default)]
pub struct LengthRegulator;

impl LengthRegulator {
    /// Expand `sequence` `[batch, N, C]` by integer `durations` `[batch, N]`.
    ///
    /// Returns the padded `[batch, L, C]` sequence and the true expanded length
    /// of every example, where `L` is `max_len` or the batch maximum.
    pub fn regulate<B: Backend>(
        &self,
        sequence: Tensor<B, 3>,
        durations: Tensor<B, 2, Int>,
        max_len: Option<usize>,
    ) -> Result<(Tensor<B, 3>, Vec<usize>)> {
        let [batch, tokens, _] = sequence.dims();
        if durations.dims() != [batch, tokens] {
            return Err(Error::shape(
                "length_regulator",
                "durations",
                format!(
                    "expected [{batch}, {tokens}], got {:?}",
                    durations.dims()
                ),
            ));
        }
        self.regulate_host(sequence, &durations_to_host(durations)?, max_len)
    }

    /// Same as [`regulate`](Self::regulate) with host-side durations.
    pub fn regulate_host<B: Backend>(
        &self,
        sequence: Tensor<B, 3>,
        durations: &[Vec<usize>],
        max_len: Option<usize>,
    ) -> Result<(Tensor<B, 3>, Vec<usize>)> {
        let [batch, tokens, channels] = sequence.dims();
        if durations.len() != batch || durations.iter().any(|row| row.len() != tokens) {
            return Err(Error::shape(
                "length_regulator",
                "durations",
                format!("expected {batch} rows of {tokens} durations"),
            ));
        }

        let lengths: Vec<usize> = durations.iter().map(|row| row.iter().sum()).collect();
        let batch_max = lengths.iter().copied().max().unwrap_or(0);
        let out_len = max_len.unwrap_or(batch_max);
        if batch_max > out_len {
            return Err(Error::shape(
                "length_regulator",
                "durations",
                format!("expanded length {batch_max} exceeds max_len {out_len}"),
            ));
        }

        let device = sequence.device();
        if out_len == 0 || tokens == 0 {
            return Ok((Tensor::zeros([batch, out_len, channels], &device), lengths));
        }

        let mut index = Vec::with_capacity(batch * out_len);
        let mut keep = Vec::with_capacity(batch * out_len);
        for row in durations {
            let expanded = row
                .iter()
                .enumerate()
                .flat_map(|(token, &d)| std::iter::repeat_n(token as i64, d));
            let start = index.len();
            index.extend(expanded);
            let valid = index.len() - start;
            keep.extend(std::iter::repeat_n(1.0f32, valid));
            index.extend(std::iter::repeat_n(0i64, out_len - valid));
            keep.extend(std::iter::repeat_n(0.0f32, out_len - valid));
        }

        let index = Tensor::<B, 2, Int>::from_data(TensorData::new(index, [batch, out_len]), &device)
            .unsqueeze_dim::<3>(2)
            .repeat_dim(2, channels);
        let keep = Tensor::<B, 2>::from_data(TensorData::new(keep, [batch, out_len]), &device)
            .unsqueeze_dim::<3>(2);
        Ok((sequence.gather(1, index) * keep, lengths))
    }
}
