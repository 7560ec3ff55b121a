//! Acoustic prior: phoneme and prompt encoding, duration and pitch
//! prediction, and length regulation to the frame-rate content embedding.

use crate::conditioner::phoneme::PhonemeEncoder;
use crate::conditioner::pitch::{f0_to_lf0, lf0_to_f0, PitchEmbedding};
use crate::conditioner::prompt::PromptEncoder;
use crate::config::Config;
use crate::error::{Error, Result};
use crate::model::diffusion::normalize;
use crate::model::length_regulator::{cap_durations, durations_to_host, LengthRegulator};
use crate::model::predictor::{check_prompt_batch, Detached, DurationPredictor, F0Predictor};
use crate::modules::mask::PaddingMask;
use burn::tensor::{backend::Backend, Int, Tensor, TensorData};

/// Training inputs of the prior.
#[derive(Debug, Clone)]
pub struct PriorBatch<B: Backend> {
    /// Phoneme ids `[batch, N]`.
    pub phonemes: Tensor<B, 2, Int>,
    /// Valid phonemes per example.
    pub phoneme_lengths: Vec<usize>,
    /// Ground-truth frames per phoneme `[batch, N]`.
    pub durations: Tensor<B, 2, Int>,
    /// Reference (prompt) codes `[batch, Tp, codec_channels]`, unnormalised.
    pub reference: Tensor<B, 3>,
    /// Valid reference frames per example.
    pub reference_lengths: Vec<usize>,
    /// Ground-truth pitch in Hz `[batch, T]`.
    pub f0: Tensor<B, 2>,
    /// Valid target frames per example.
    pub frame_lengths: Vec<usize>,
}

/// Training outputs of the prior.
#[derive(Debug, Clone)]
pub struct PriorOutput<B: Backend> {
    /// Content + coarse pitch embedding `[batch, T, hidden]`.
    pub content: Tensor<B, 3>,
    /// Prompt embedding `[batch, Tp, hidden]`.
    pub prompt: Tensor<B, 3>,
    /// Target lf0 `[batch, 1, T]`.
    pub lf0: Tensor<B, 3>,
    /// Predicted lf0 `[batch, 1, T]`.
    pub lf0_pred: Tensor<B, 3>,
    /// Predicted log-durations `[batch, N]`.
    pub log_duration_pred: Tensor<B, 2>,
    /// Target log-durations `log(d + 1)` `[batch, N]`.
    pub log_duration_target: Tensor<B, 2>,
}

/// Inference outputs of the prior.
#[derive(Debug, Clone)]
pub struct PriorInference<B: Backend> {
    /// Content + coarse pitch embedding `[batch, T, hidden]`, zero past each length.
    pub content: Tensor<B, 3>,
    /// Prompt embedding `[batch, Tp, hidden]`.
    pub prompt: Tensor<B, 3>,
    /// Predicted frames per example.
    pub lengths: Vec<usize>,
    /// Rounded durations per phoneme.
    pub durations: Vec<Vec<usize>>,
}

/// Invert predicted log-durations: `round(exp(x) - 1)` clamped at zero.
pub fn log_durations_to_frames<B: Backend>(log_durations: Tensor<B, 2>) -> Tensor<B, 2, Int> {
    log_durations
        .exp()
        .sub_scalar(1.0)
        .round()
        .clamp_min(0.0)
        .int()
}

/// Phoneme/prompt encoders, predictors and the length regulator.
#[derive(Debug, Clone)]
pub struct PriorModel<B: Backend> {
    pub phoneme_encoder: PhonemeEncoder<B>,
    pub prompt_encoder: PromptEncoder<B>,
    pub duration_predictor: DurationPredictor<B>,
    pub f0_predictor: F0Predictor<B>,
    pub pitch_embedding: PitchEmbedding<B>,
    length_regulator: LengthRegulator,
}

impl<B: Backend> PriorModel<B> {
    /// Create the prior on the given device.
    pub fn new(config: &Config, device: &B::Device) -> Self {
        Self {
            phoneme_encoder: PhonemeEncoder::new(&config.phoneme_encoder, device),
            prompt_encoder: PromptEncoder::new(&config.prompt_encoder, device),
            duration_predictor: DurationPredictor::new(&config.duration_predictor, device),
            f0_predictor: F0Predictor::new(&config.f0_predictor, device),
            pitch_embedding: PitchEmbedding::new(config.phoneme_encoder.hidden_channels, device),
            length_regulator: LengthRegulator,
        }
    }

    /// Teacher-forced pass with ground-truth durations and pitch.
    pub fn forward(&self, batch: &PriorBatch<B>) -> Result<PriorOutput<B>> {
        let phoneme_emb = self
            .phoneme_encoder
            .forward(batch.phonemes.clone(), &batch.phoneme_lengths)?;
        let prompt = self
            .prompt_encoder
            .forward(normalize(batch.reference.clone()), &batch.reference_lengths)?;
        check_prompt_batch("prior", &phoneme_emb, &prompt)?;

        let log_duration_pred = self.duration_predictor.forward(
            Detached::new(phoneme_emb.clone()),
            Detached::new(prompt.clone()),
            &batch.phoneme_lengths,
            &batch.reference_lengths,
        )?;
        let log_duration_target = batch.durations.clone().float().add_scalar(1.0).log();

        let [_, frames] = batch.f0.dims();
        let mut durations = durations_to_host(batch.durations.clone())?;
        cap_durations(&mut durations, frames);
        let (content, _) = self
            .length_regulator
            .regulate_host(phoneme_emb, &durations, Some(frames))?;

        let lf0_pred = self.f0_predictor.forward(
            Detached::new(content.clone()),
            Detached::new(prompt.clone()),
            &batch.frame_lengths,
            &batch.reference_lengths,
        )?;
        let lf0 = f0_to_lf0(batch.f0.clone()).unsqueeze_dim::<3>(1);
        let content = content + self.pitch_embedding.forward(batch.f0.clone());

        Ok(PriorOutput {
            content,
            prompt,
            lf0,
            lf0_pred,
            log_duration_pred,
            log_duration_target,
        })
    }

    /// Predict durations and pitch and build the content embedding.
    pub fn infer(
        &self,
        phonemes: Tensor<B, 2, Int>,
        reference: Tensor<B, 3>,
        phoneme_lengths: &[usize],
        reference_lengths: &[usize],
    ) -> Result<PriorInference<B>> {
        let phoneme_emb = self.phoneme_encoder.forward(phonemes, phoneme_lengths)?;
        let prompt = self
            .prompt_encoder
            .forward(normalize(reference), reference_lengths)?;
        check_prompt_batch("prior", &phoneme_emb, &prompt)?;

        let log_durations = self.duration_predictor.forward(
            Detached::new(phoneme_emb.clone()),
            Detached::new(prompt.clone()),
            phoneme_lengths,
            reference_lengths,
        )?;
        let durations = durations_to_host(log_durations_to_frames(log_durations))?;
        let (content, lengths) = self
            .length_regulator
            .regulate_host(phoneme_emb, &durations, None)?;
        if lengths.iter().all(|&l| l == 0) {
            return Err(Error::shape(
                "prior",
                "durations",
                "every predicted duration rounds to zero frames",
            ));
        }
        tracing::debug!(?lengths, "predicted frame lengths");

        let lf0_pred = self.f0_predictor.forward(
            Detached::new(content.clone()),
            Detached::new(prompt.clone()),
            &lengths,
            reference_lengths,
        )?;
        let [batch, _, frames] = lf0_pred.dims();
        let f0_pred = lf0_to_f0(lf0_pred).reshape([batch, frames]);

        let mask = PaddingMask::for_btc("prior", "predicted_lengths", &content, &lengths)?;
        let content = mask.zero_btc(content + self.pitch_embedding.forward(f0_pred));
        Ok(PriorInference {
            content,
            prompt,
            lengths,
            durations,
        })
    }
}

/// Build an integer `[batch, N]` tensor from per-example rows (zero-padded).
pub fn int_matrix<B: Backend>(rows: &[Vec<i64>], device: &B::Device) -> Tensor<B, 2, Int> {
    let width = rows.iter().map(Vec::len).max().unwrap_or(0);
    let mut values = Vec::with_capacity(rows.len() * width);
    for row in rows {
        values.extend(row.iter().copied());
        values.extend(std::iter::repeat_n(0, width - row.len()));
    }
    Tensor::from_data(TensorData::new(values, [rows.len(), width]), device)
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::module::Param;
    use burn::tensor::Distribution;
    use burn_ndarray::{NdArray, NdArrayDevice};

    type TestBackend = NdArray<f32>;

    #[test]
    fn duration_inversion_round_trips_integers() {
        let device = NdArrayDevice::default();
        let durations: Vec<f32> = (0..40).map(|d| d as f32).collect();
        let log = Tensor::<TestBackend, 2>::from_data(TensorData::new(durations, [1, 40]), &device)
            .add_scalar(1.0)
            .log();
        let frames = log_durations_to_frames(log)
            .into_data()
            .convert::<i64>()
            .to_vec::<i64>()
            .unwrap();
        assert_eq!(frames, (0..40).collect::<Vec<i64>>());
    }

    #[test]
    fn teacher_forced_pass_aligns_to_frames() {
        let device = NdArrayDevice::default();
        let prior = PriorModel::<TestBackend>::new(&crate::model::tests::tiny_config(), &device);
        let batch = PriorBatch {
            phonemes: int_matrix(&[vec![1, 2, 3], vec![4, 5]], &device),
            phoneme_lengths: vec![3, 2],
            durations: int_matrix(&[vec![2, 1, 3], vec![4, 9]], &device),
            reference: Tensor::random([2, 5, 4], Distribution::Default, &device),
            reference_lengths: vec![5, 3],
            f0: Tensor::random([2, 6], Distribution::Uniform(80.0, 300.0), &device),
            frame_lengths: vec![6, 6],
        };
        let out = prior.forward(&batch).unwrap();
        assert_eq!(out.content.dims(), [2, 6, 8]);
        assert_eq!(out.lf0.dims(), [2, 1, 6]);
        assert_eq!(out.lf0_pred.dims(), [2, 1, 6]);
        assert_eq!(out.log_duration_pred.dims(), [2, 3]);
        assert_eq!(out.log_duration_target.dims(), [2, 3]);
    }

    #[test]
    fn inference_masks_content_past_predicted_length() {
        let device = NdArrayDevice::default();
        let mut prior = PriorModel::<TestBackend>::new(&crate::model::tests::tiny_config(), &device);
        // Constant log-duration ln(3): every phoneme lasts two frames.
        let proj = &mut prior.duration_predictor.inner.proj;
        proj.conv.weight = Param::from_tensor(proj.conv.weight.val().zeros_like());
        proj.skip.weight = Param::from_tensor(proj.skip.weight.val().zeros_like());
        proj.conv.bias = Some(Param::from_tensor(
            Tensor::<TestBackend, 1>::ones([1], &device).mul_scalar(3.0f32.ln()),
        ));

        let out = prior
            .infer(
                int_matrix(&[vec![1, 2, 3, 4, 5], vec![6, 7, 8]], &device),
                Tensor::random([2, 4, 4], Distribution::Default, &device),
                &[5, 3],
                &[4, 2],
            )
            .unwrap();
        assert_eq!(out.lengths, vec![10, 6]);
        assert_eq!(out.content.dims(), [2, 10, 8]);
        let tail = out.content.narrow(0, 1, 1).narrow(1, 6, 4).abs().sum().into_scalar();
        assert_eq!(tail, 0.0);
    }

    #[test]
    fn prompt_batch_mismatch_is_an_error() {
        let device = NdArrayDevice::default();
        let prior = PriorModel::<TestBackend>::new(&crate::model::tests::tiny_config(), &device);
        let err = prior
            .infer(
                int_matrix(&[vec![1, 2, 3], vec![4, 5, 6]], &device),
                Tensor::random([3, 6, 4], Distribution::Default, &device),
                &[3, 3],
                &[6, 6, 6],
            )
            .unwrap_err();
        assert!(matches!(
            err,
            Error::ShapeMismatch { component: "prior", tensor: "prompt", .. }
        ));
    }
}
