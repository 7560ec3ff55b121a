//! Duration and pitch predictors.
//!
//! Both predictors read encoder outputs through [`Detached`] values, which can
//! only be built by cutting the autodiff graph, so predictor losses never
//! reach the encoders.

use crate::config::PredictorConfig;
use crate::error::{Error, Result};
use crate::modules::attention::{MultiHeadAttention, MultiHeadAttentionConfig};
use crate::modules::conv::{ConvLayer, ConvLayerConfig, EncConvLayer};
use crate::modules::mask::{debug_assert_finite, PaddingMask};
use burn::tensor::{backend::Backend, Tensor};
use burn_nn::{LayerNorm, LayerNormConfig};

/// A tensor cut from the autodiff graph.
#[derive(Debug, Clone)]
pub struct Detached<B: Backend, const D: usize>(Tensor<B, D>);

impl<B: Backend, const D: usize> Detached<B, D> {
    /// Detach `tensor` from the graph.
    pub fn new(tensor: Tensor<B, D>) -> Self {
        Self(tensor.detach())
    }

    /// The detached tensor.
    pub fn into_inner(self) -> Tensor<B, D> {
        self.0
    }
}

/// Three residual convolutions, a layer norm and a cross-attention step.
#[derive(Debug, Clone)]
pub struct PredictorBlock<B: Backend> {
    /// Residual convolutions.
    pub convs: Vec<EncConvLayer<B>>,
    /// Norm before the cross-attention.
    pub norm: LayerNorm<B>,
    /// Cross-attention against the prompt (no projection bias).
    pub attn: MultiHeadAttention<B>,
}

/// Shared body of the duration and pitch predictors.
#[derive(Debug, Clone)]
pub struct CrossAttentionPredictor<B: Backend> {
    /// Input projection.
    pub pre: ConvLayer<B>,
    /// Conv + cross-attention blocks.
    pub blocks: Vec<PredictorBlock<B>>,
    /// Projection to one channel.
    pub proj: ConvLayer<B>,
    /// Optional layer norm applied to the prompt first.
    pub prompt_norm: Option<LayerNorm<B>>,
    component: &'static str,
}

impl<B: Backend> CrossAttentionPredictor<B> {
    /// Create the predictor on the given device.
    pub fn new(
        component: &'static str,
        config: &PredictorConfig,
        prompt_norm: bool,
        device: &B::Device,
    ) -> Self {
        let hidden = config.hidden_channels;
        let k = config.kernel_size;
        let p = config.p_dropout;
        let blocks = (0..config.attention_layers)
            .map(|_| PredictorBlock {
                convs: (0..3)
                    .map(|_| {
                        EncConvLayer::new(
                            ConvLayerConfig::new(hidden, hidden, k, p)
                                .with_groups(config.conv_groups),
                            device,
                        )
                    })
                    .collect(),
                norm: LayerNormConfig::new(hidden).init(device),
                attn: MultiHeadAttention::new(
                    MultiHeadAttentionConfig::new(hidden, config.n_heads)
                        .with_dropout(p)
                        .with_bias(false),
                    device,
                ),
            })
            .collect();
        Self {
            pre: ConvLayer::new(ConvLayerConfig::new(config.in_channels, hidden, k, p), device),
            blocks,
            proj: ConvLayer::new(ConvLayerConfig::new(hidden, 1, k, p), device),
            prompt_norm: prompt_norm.then(|| LayerNormConfig::new(hidden).init(device)),
            component,
        }
    }

    /// Predict one value per query timestep, `[batch, T, 1]`.
    pub fn forward(
        &self,
        query: Detached<B, 3>,
        prompt: Detached<B, 3>,
        query_lengths: &[usize],
        prompt_lengths: &[usize],
    ) -> Result<Tensor<B, 3>> {
        let query = query.into_inner();
        let prompt = prompt.into_inner();
        check_prompt_batch(self.component, &query, &prompt)?;
        let query_mask = PaddingMask::for_btc(self.component, "query_lengths", &query, query_lengths)?;
        let prompt_mask =
            PaddingMask::for_btc(self.component, "prompt_lengths", &prompt, prompt_lengths)?;

        let prompt = match &self.prompt_norm {
            Some(norm) => norm.forward(prompt),
            None => prompt,
        };
        let prompt = prompt_mask.zero_btc(prompt);
        let cross_mask = query_mask.cross(&prompt_mask);

        let mut x = query_mask.zero_btc(self.pre.forward(query, &query_mask));
        for block in &self.blocks {
            for conv in &block.convs {
                x = conv.forward(x, &query_mask);
            }
            let h = block.norm.forward(x);
            let residual = block
                .attn
                .forward(h.clone(), prompt.clone(), Some(cross_mask.clone()));
            x = h + residual;
            debug_assert_finite(self.component, &x);
        }
        let x = query_mask.zero_btc(x);
        Ok(query_mask.zero_btc(self.proj.forward(x, &query_mask)))
    }
}

/// Reject a prompt whose batch differs from the query batch.
pub(crate) fn check_prompt_batch<B: Backend>(
    component: &'static str,
    query: &Tensor<B, 3>,
    prompt: &Tensor<B, 3>,
) -> Result<()> {
    let [bq, _, _] = query.dims();
    let [bp, _, _] = prompt.dims();
    if bq != bp {
        return Err(Error::shape(
            component,
            "prompt",
            format!("prompt batch {bp} for a query batch {bq}"),
        ));
    }
    Ok(())
}

/// Log-duration predictor at phoneme resolution.
#[derive(Debug, Clone)]
pub struct DurationPredictor<B: Backend> {
    /// Predictor body (prompt layer norm enabled).
    pub inner: CrossAttentionPredictor<B>,
}

impl<B: Backend> DurationPredictor<B> {
    /// Create the predictor on the given device.
    pub fn new(config: &PredictorConfig, device: &B::Device) -> Self {
        Self {
            inner: CrossAttentionPredictor::new("duration_predictor", config, true, device),
        }
    }

    /// Predict log-durations `[batch, N]` for phoneme embeddings `[batch, N, C]`.
    pub fn forward(
        &self,
        phonemes: Detached<B, 3>,
        prompt: Detached<B, 3>,
        phoneme_lengths: &[usize],
        prompt_lengths: &[usize],
    ) -> Result<Tensor<B, 2>> {
        let out = self
            .inner
            .forward(phonemes, prompt, phoneme_lengths, prompt_lengths)?;
        let [batch, tokens, _] = out.dims();
        Ok(out.reshape([batch, tokens]))
    }
}

/// Log-pitch predictor at frame resolution.
#[derive(Debug, Clone)]
pub struct F0Predictor<B: Backend> {
    /// Predictor body.
    pub inner: CrossAttentionPredictor<B>,
}

impl<B: Backend> F0Predictor<B> {
    /// Create the predictor on the given device.
    pub fn new(config: &PredictorConfig, device: &B::Device) -> Self {
        Self {
            inner: CrossAttentionPredictor::new("f0_predictor", config, false, device),
        }
    }

    /// Predict lf0 `[batch, 1, T]` for frame-rate content `[batch, T, C]`.
    pub fn forward(
        &self,
        content: Detached<B, 3>,
        prompt: Detached<B, 3>,
        content_lengths: &[usize],
        prompt_lengths: &[usize],
    ) -> Result<Tensor<B, 3>> {
        let out = self
            .inner
            .forward(content, prompt, content_lengths, prompt_lengths)?;
        Ok(out.swap_dims(1, 2))
    }
}
