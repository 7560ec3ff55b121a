//! Multi-head attention over padded sequences.
//!
//! Queries, keys and values use the `[batch, time, channels]` layout. Masks are
//! `[batch, q_len, k_len]` with `true` marking pairs that must not attend;
//! masked scores are set to a large negative value before the softmax so rows
//! that are entirely padded stay finite.

use burn::tensor::{activation::softmax, backend::Backend, Bool, Tensor};
use burn_nn::{Dropout, DropoutConfig, Linear, LinearConfig};

const MASKED_SCORE: f32 = -1.0e9;

/// Configuration for [`MultiHeadAttention`].
#[derive(Debug, Clone)]
pub struct MultiHeadAttentionConfig {
    /// Model width (query, key and value).
    pub d_model: usize,
    /// Number of heads; must divide `d_model`.
    pub num_heads: usize,
    /// Dropout on attention weights.
    pub dropout: f64,
    /// Use biases on the input/output projections.
    pub bias: bool,
}

impl MultiHeadAttentionConfig {
    /// Create a config with biased projections and no dropout.
    pub fn new(d_model: usize, num_heads: usize) -> Self {
        Self {
            d_model,
            num_heads,
            dropout: 0.0,
            bias: true,
        }
    }

    /// Set the attention dropout probability.
    pub fn with_dropout(mut self, dropout: f64) -> Self {
        self.dropout = dropout;
        self
    }

    /// Enable or disable projection biases.
    pub fn with_bias(mut self, bias: bool) -> Self {
        self.bias = bias;
        self
    }
}

/// Multi-head scaled dot-product attention.
#[derive(Debug, Clone)]
pub struct MultiHeadAttention<B: Backend> {
    /// Query projection.
    pub q_proj: Linear<B>,
    /// Key projection.
    pub k_proj: Linear<B>,
    /// Value projection.
    pub v_proj: Linear<B>,
    /// Output projection.
    pub out_proj: Linear<B>,
    dropout: Dropout,
    num_heads: usize,
    head_dim: usize,
}

impl<B: Backend> MultiHeadAttention<B> {
    /// Create attention projections on the given device.
    pub fn new(config: MultiHeadAttentionConfig, device: &B::Device) -> Self {
        let d = config.d_model;
        let linear = || {
            LinearConfig::new(d, d)
                .with_bias(config.bias)
                .init::<B>(device)
        };
        Self {
            q_proj: linear(),
            k_proj: linear(),
            v_proj: linear(),
            out_proj: linear(),
            dropout: DropoutConfig::new(config.dropout).init(),
            num_heads: config.num_heads,
            head_dim: d / config.num_heads,
        }
    }

    /// Attend `query` `[B, Tq, D]` over `key_value` `[B, Tk, D]`.
    pub fn forward(
        &self,
        query: Tensor<B, 3>,
        key_value: Tensor<B, 3>,
        mask: Option<Tensor<B, 3, Bool>>,
    ) -> Tensor<B, 3> {
        let [batch, q_len, d_model] = query.dims();
        let k_len = key_value.dims()[1];

        let queries = self.split_heads(self.q_proj.forward(query), q_len);
        let keys = self.split_heads(self.k_proj.forward(key_value.clone()), k_len);
        let values = self.split_heads(self.v_proj.forward(key_value), k_len);

        let scale = (self.head_dim as f32).sqrt();
        let scores = queries.matmul(keys.swap_dims(2, 3)).div_scalar(scale);
        let scores = match mask {
            Some(mask) => {
                let mask = mask.unsqueeze_dim::<4>(1).repeat_dim(1, self.num_heads);
                scores.mask_fill(mask, MASKED_SCORE)
            }
            None => scores,
        };
        let weights = self.dropout.forward(softmax(scores, 3));
        let context = weights
            .matmul(values)
            .swap_dims(1, 2)
            .reshape([batch, q_len, d_model]);
        self.out_proj.forward(context)
    }

    fn split_heads(&self, x: Tensor<B, 3>, len: usize) -> Tensor<B, 4> {
        let batch = x.dims()[0];
        x.reshape([batch, len, self.num_heads, self.head_dim])
            .swap_dims(1, 2)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::modules::mask::{all_finite, cross_padding_mask, sequence_mask};
    use burn::tensor::{Distribution, Tolerance};
    use burn_ndarray::{NdArray, NdArrayDevice};

    type TestBackend = NdArray<f32>;

    #[test]
    fn output_keeps_query_shape() {
        let device = NdArrayDevice::default();
        let attn =
            MultiHeadAttention::<TestBackend>::new(MultiHeadAttentionConfig::new(8, 2), &device);
        let q = Tensor::<TestBackend, 3>::random([2, 5, 8], Distribution::Default, &device);
        let kv = Tensor::<TestBackend, 3>::random([2, 7, 8], Distribution::Default, &device);
        assert_eq!(attn.forward(q, kv, None).dims(), [2, 5, 8]);
    }

    #[test]
    fn padded_keys_do_not_change_valid_rows() {
        let device = NdArrayDevice::default();
        let attn = MultiHeadAttention::<TestBackend>::new(
            MultiHeadAttentionConfig::new(4, 2).with_bias(false),
            &device,
        );
        let q = Tensor::<TestBackend, 3>::random([1, 2, 4], Distribution::Default, &device);
        let kv = Tensor::<TestBackend, 3>::random([1, 3, 4], Distribution::Default, &device);
        let garbage = Tensor::<TestBackend, 3>::random([1, 2, 4], Distribution::Default, &device)
            .mul_scalar(100.0);
        let padded_kv = Tensor::cat(vec![kv.clone(), garbage], 1);

        let q_mask = sequence_mask::<TestBackend>(&[2], Some(2), &device).unwrap();
        let k_short = sequence_mask::<TestBackend>(&[3], Some(3), &device).unwrap();
        let k_long = sequence_mask::<TestBackend>(&[3], Some(5), &device).unwrap();

        let short = attn.forward(
            q.clone(),
            kv,
            Some(cross_padding_mask(q_mask.clone(), k_short)),
        );
        let long = attn.forward(q, padded_kv, Some(cross_padding_mask(q_mask, k_long)));
        short
            .to_data()
            .assert_approx_eq(&long.to_data(), Tolerance::<f32>::absolute(1e-5));
    }

    #[test]
    fn fully_masked_rows_stay_finite() {
        let device = NdArrayDevice::default();
        let attn =
            MultiHeadAttention::<TestBackend>::new(MultiHeadAttentionConfig::new(4, 1), &device);
        let q = Tensor::<TestBackend, 3>::random([1, 2, 4], Distribution::Default, &device);
        let kv = Tensor::<TestBackend, 3>::random([1, 2, 4], Distribution::Default, &device);
        let q_mask = sequence_mask::<TestBackend>(&[1], Some(2), &device).unwrap();
        let k_mask = sequence_mask::<TestBackend>(&[2], Some(2), &device).unwrap();
        let out = attn.forward(q, kv, Some(cross_padding_mask(q_mask, k_mask)));
        assert!(all_finite(&out));
    }
}
