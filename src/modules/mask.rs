//! Padding masks for variable-length batches.
//!
//! Masks are boolean `[batch, time]` tensors where `true` marks a padded
//! position. They are built host-side from per-example lengths, which keeps
//! the lengths available for length regulation and bookkeeping.

use crate::error::{Error, Result};
use burn::tensor::{backend::Backend, Bool, Tensor, TensorData};

/// Build a padding mask from per-example lengths.
///
/// Entry `[b, t]` is `true` when `t >= lengths[b]`. When `max_len` is `None`
/// the batch maximum is used. A length above `max_len` is rejected.
pub fn sequence_mask<B: Backend>(
    lengths: &[usize],
    max_len: Option<usize>,
    device: &B::Device,
) -> Result<Tensor<B, 2, Bool>> {
    let batch_max = lengths.iter().copied().max().unwrap_or(0);
    let max_len = max_len.unwrap_or(batch_max);
    if batch_max > max_len {
        return Err(Error::shape(
            "sequence_mask",
            "lengths",
            format!("length {batch_max} exceeds max_len {max_len}"),
        ));
    }
    let mut values = Vec::with_capacity(lengths.len() * max_len);
    for &len in lengths {
        values.extend((0..max_len).map(|t| t >= len));
    }
    Ok(Tensor::from_data(
        TensorData::new(values, [lengths.len(), max_len]),
        device,
    ))
}

/// Combine query and key padding into an attention mask `[batch, q_len, k_len]`.
///
/// An entry is masked iff either its query or its key position is padded.
pub fn cross_padding_mask<B: Backend>(
    query_mask: Tensor<B, 2, Bool>,
    key_mask: Tensor<B, 2, Bool>,
) -> Tensor<B, 3, Bool> {
    let [_, q_len] = query_mask.dims();
    let [_, k_len] = key_mask.dims();
    let query = query_mask.unsqueeze_dim::<3>(2).repeat_dim(2, k_len);
    let key = key_mask.unsqueeze_dim::<3>(1).repeat_dim(1, q_len);
    query.bool_or(key)
}

/// Padding mask bundled with the lengths it was built from.
///
/// Provides the "zero padding, apply, zero padding" combinator used around
/// every convolution and attention stage.
#[derive(Debug, Clone)]
pub struct PaddingMask<B: Backend> {
    mask: Tensor<B, 2, Bool>,
    lengths: Vec<usize>,
}

impl<B: Backend> PaddingMask<B> {
    /// Build a mask of width `max_len` from per-example lengths.
    pub fn new(lengths: &[usize], max_len: usize, device: &B::Device) -> Result<Self> {
        let mask = sequence_mask(lengths, Some(max_len), device)?;
        Ok(Self {
            mask,
            lengths: lengths.to_vec(),
        })
    }

    /// Build a mask for a `[batch, time, channels]` sequence, checking the batch size.
    pub fn for_btc(
        component: &'static str,
        tensor: &'static str,
        sequence: &Tensor<B, 3>,
        lengths: &[usize],
    ) -> Result<Self> {
        let [batch, time, _] = sequence.dims();
        if lengths.len() != batch {
            return Err(Error::shape(
                component,
                tensor,
                format!("batch of {batch} with {} lengths", lengths.len()),
            ));
        }
        Self::new(lengths, time, &sequence.device()).map_err(|_| {
            Error::shape(
                component,
                tensor,
                format!("lengths {lengths:?} exceed time axis {time}"),
            )
        })
    }

    /// Build a mask for a `[batch, channels, time]` sequence, checking the batch size.
    pub fn for_bct(
        component: &'static str,
        tensor: &'static str,
        sequence: &Tensor<B, 3>,
        lengths: &[usize],
    ) -> Result<Self> {
        let [batch, _, time] = sequence.dims();
        if lengths.len() != batch {
            return Err(Error::shape(
                component,
                tensor,
                format!("batch of {batch} with {} lengths", lengths.len()),
            ));
        }
        Self::new(lengths, time, &sequence.device()).map_err(|_| {
            Error::shape(
                component,
                tensor,
                format!("lengths {lengths:?} exceed time axis {time}"),
            )
        })
    }

    /// Boolean mask `[batch, time]`, `true` at padded positions.
    pub fn mask(&self) -> Tensor<B, 2, Bool> {
        self.mask.clone()
    }

    /// Per-example valid lengths.
    pub fn lengths(&self) -> &[usize] {
        &self.lengths
    }

    /// Padded width of the mask.
    pub fn max_len(&self) -> usize {
        self.mask.dims()[1]
    }

    /// Float keep-mask `[batch, time, 1]` (1 = valid, 0 = padded).
    pub fn keep_btc(&self) -> Tensor<B, 3> {
        self.mask.clone().bool_not().float().unsqueeze_dim::<3>(2)
    }

    /// Float keep-mask `[batch, 1, time]`.
    pub fn keep_bct(&self) -> Tensor<B, 3> {
        self.mask.clone().bool_not().float().unsqueeze_dim::<3>(1)
    }

    /// Zero padded timesteps of a `[batch, time, channels]` tensor.
    pub fn zero_btc(&self, x: Tensor<B, 3>) -> Tensor<B, 3> {
        let channels = x.dims()[2];
        let mask = self.mask.clone().unsqueeze_dim::<3>(2).repeat_dim(2, channels);
        x.mask_fill(mask, 0.0)
    }

    /// Zero padded timesteps of a `[batch, channels, time]` tensor.
    pub fn zero_bct(&self, x: Tensor<B, 3>) -> Tensor<B, 3> {
        let channels = x.dims()[1];
        let mask = self.mask.clone().unsqueeze_dim::<3>(1).repeat_dim(1, channels);
        x.mask_fill(mask, 0.0)
    }

    /// Zero padding, apply `op`, then zero padding again (`[batch, time, channels]`).
    pub fn around_btc<F>(&self, x: Tensor<B, 3>, op: F) -> Tensor<B, 3>
    where
        F: FnOnce(Tensor<B, 3>) -> Tensor<B, 3>,
    {
        self.zero_btc(op(self.zero_btc(x)))
    }

    /// Zero padding, apply `op`, then zero padding again (`[batch, channels, time]`).
    pub fn around_bct<F>(&self, x: Tensor<B, 3>, op: F) -> Tensor<B, 3>
    where
        F: FnOnce(Tensor<B, 3>) -> Tensor<B, 3>,
    {
        self.zero_bct(op(self.zero_bct(x)))
    }

    /// Attention mask against another padded sequence (`self` on the query side).
    pub fn cross(&self, keys: &PaddingMask<B>) -> Tensor<B, 3, Bool> {
        cross_padding_mask(self.mask.clone(), keys.mask.clone())
    }
}

/// Return `true` when every element of the tensor is finite.
pub fn all_finite<B: Backend, const D: usize>(x: &Tensor<B, D>) -> bool {
    x.to_data()
        .convert::<f32>()
        .iter::<f32>()
        .all(|v| v.is_finite())
}

/// Check a tensor for NaN/Inf, naming the stage that produced it.
pub fn ensure_finite<B: Backend, const D: usize>(
    component: &'static str,
    tensor: &'static str,
    x: &Tensor<B, D>,
) -> Result<()> {
    if all_finite(x) {
        Ok(())
    } else {
        Err(Error::NonFinite { component, tensor })
    }
}

/// Debug-build invariant: a block stage never produces NaN.
#[inline]
pub fn debug_assert_finite<B: Backend, const D: usize>(stage: &str, x: &Tensor<B, D>) {
    if cfg!(debug_assertions) {
        assert!(all_finite(x), "non-finite values after {stage}");
    }
}
