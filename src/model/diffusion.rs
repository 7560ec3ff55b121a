//! Gaussian diffusion over normalised codec codes.
//!
//! [`GaussianDiffusion`] owns the acoustic prior, the denoiser and a shared
//! [`NoiseSchedule`]. Training noises ground-truth codes at one random step per
//! example; sampling walks the chain back either one step at a time
//! (ancestral) or along a strided set of steps (DDIM).

use std::sync::Arc;

use crate::config::Config;
use crate::error::{Error, Result};
use crate::model::codec::{rvq_ce_loss, rvq_encode, NeuralCodec};
use crate::model::denoiser::{Conditioning, Denoiser};
use crate::model::prior::{PriorBatch, PriorModel};
use crate::model::schedule::{ddim_time_pairs, NoiseSchedule};
use crate::modules::mask::{ensure_finite, PaddingMask};
use crate::noise::NoiseRng;
use burn::tensor::{backend::Backend, Int, Tensor};

/// Scale between codec codes and the diffusion space.
pub const CODE_SCALE: f32 = 10.0;

/// Map codec codes into the diffusion space.
pub fn normalize<B: Backend, const D: usize>(codes: Tensor<B, D>) -> Tensor<B, D> {
    codes.div_scalar(CODE_SCALE)
}

/// Map diffusion-space codes back to codec codes.
pub fn denormalize<B: Backend, const D: usize>(codes: Tensor<B, D>) -> Tensor<B, D> {
    codes.mul_scalar(CODE_SCALE)
}

/// Denoiser output expressed both as noise and as clean code.
#[derive(Debug, Clone)]
pub struct ModelPrediction<B: Backend> {
    pub pred_noise: Tensor<B, 3>,
    pub pred_x_start: Tensor<B, 3>,
}

/// Moments of `q(x_{t-1} | x_t, x_0)`.
#[derive(Debug, Clone)]
pub struct Posterior<B: Backend> {
    pub mean: Tensor<B, 3>,
    pub variance: Tensor<B, 3>,
    pub log_variance: Tensor<B, 3>,
}

/// Reverse-process sampler.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Sampler {
    /// One denoising step per timestep, `T - 1` down to `0`.
    Ancestral,
    /// Strided deterministic/stochastic sampler.
    Ddim { steps: usize, eta: f64 },
}

/// One training example batch.
#[derive(Debug, Clone)]
pub struct TrainBatch<B: Backend> {
    /// Prior inputs; `frame_lengths` also gives the valid code frames.
    pub prior: PriorBatch<B>,
    /// Ground-truth codec codes `[batch, channels, T]`, unnormalised.
    pub codes: Tensor<B, 3>,
}

/// Losses and diagnostics of one training step.
#[derive(Debug, Clone)]
pub struct TrainOutput<B: Backend> {
    /// Weighted sum of the component losses.
    pub loss: Tensor<B, 1>,
    pub diff_loss: Tensor<B, 1>,
    pub duration_loss: Tensor<B, 1>,
    pub f0_loss: Tensor<B, 1>,
    pub ce_loss: Tensor<B, 1>,
    pub lf0: Tensor<B, 3>,
    pub lf0_pred: Tensor<B, 3>,
    pub log_duration_pred: Tensor<B, 2>,
    pub log_duration_target: Tensor<B, 2>,
    /// Denoiser prediction of `x_start` `[batch, channels, T]`.
    pub prediction: Tensor<B, 3>,
    /// Normalised ground truth `[batch, channels, T]`.
    pub target: Tensor<B, 3>,
    /// Timestep drawn for every example.
    pub timesteps: Vec<usize>,
}

/// Sampled normalised codes `[batch, channels, T]` with their valid lengths.
#[derive(Debug, Clone)]
pub struct SampledCodes<B: Backend> {
    pub codes: Tensor<B, 3>,
    pub lengths: Vec<usize>,
}

/// Decoded audio.
#[derive(Debug, Clone)]
pub enum Waveform<B: Backend> {
    /// Single-channel codec output `[batch, samples]`.
    Mono(Tensor<B, 2>),
    /// `[batch, channels, samples]`.
    MultiChannel(Tensor<B, 3>),
}

impl<B: Backend> Waveform<B> {
    /// Decoded samples per example.
    pub fn samples(&self) -> usize {
        match self {
            Self::Mono(wave) => wave.dims()[1],
            Self::MultiChannel(wave) => wave.dims()[2],
        }
    }
}

/// Prior, denoiser and noise schedule of the latent diffusion model.
#[derive(Debug, Clone)]
pub struct GaussianDiffusion<B: Backend> {
    pub prior: PriorModel<B>,
    pub denoiser: Denoiser<B>,
    schedule: Arc<NoiseSchedule>,
    config: Config,
}

impl<B: Backend> GaussianDiffusion<B> {
    /// Validate `config` and build a freshly initialised model.
    pub fn new(config: Config, device: &B::Device) -> Result<Self> {
        config.validate()?;
        let diffusion = &config.diffusion;
        let schedule = NoiseSchedule::new(
            diffusion.timesteps,
            diffusion.beta_schedule,
            diffusion
                .min_snr_loss_weight
                .then_some(diffusion.min_snr_gamma),
        )?;
        Self::with_schedule(config, Arc::new(schedule), device)
    }

    /// Build a model around an existing schedule.
    pub fn with_schedule(
        config: Config,
        schedule: Arc<NoiseSchedule>,
        device: &B::Device,
    ) -> Result<Self> {
        config.validate()?;
        if schedule.timesteps() != config.diffusion.timesteps {
            return Err(Error::InvalidConfig(format!(
                "schedule has {} steps, config expects {}",
                schedule.timesteps(),
                config.diffusion.timesteps
            )));
        }
        let prior = PriorModel::new(&config, device);
        let denoiser = Denoiser::new(
            &config.denoiser,
            config.phoneme_encoder.hidden_channels,
            device,
        );
        let model = Self {
            prior,
            denoiser,
            schedule,
            config,
        };
        tracing::info!(
            timesteps = model.schedule.timesteps(),
            sampler = ?model.sampler(),
            code_channels = model.code_channels(),
            "built diffusion model"
        );
        Ok(model)
    }

    /// Shared coefficient tables.
    pub fn schedule(&self) -> &Arc<NoiseSchedule> {
        &self.schedule
    }

    /// Configuration the model was built from.
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Channels of the diffusion codes.
    pub fn code_channels(&self) -> usize {
        self.config.denoiser.in_channels
    }

    /// Sampler selected by the configuration.
    pub fn sampler(&self) -> Sampler {
        let diffusion = &self.config.diffusion;
        if diffusion.sampling_timesteps < diffusion.timesteps {
            Sampler::Ddim {
                steps: diffusion.sampling_timesteps,
                eta: diffusion.ddim_sampling_eta,
            }
        } else {
            Sampler::Ancestral
        }
    }

    fn coef(&self, table: &[f64], t: &[usize], device: &B::Device) -> Tensor<B, 3> {
        NoiseSchedule::extract::<B>(table, t, device)
    }

    /// Forward process: `sqrt(ac[t]) * x_start + sqrt(1 - ac[t]) * noise`.
    pub fn q_sample(&self, x_start: Tensor<B, 3>, t: &[usize], noise: Tensor<B, 3>) -> Tensor<B, 3> {
        let device = x_start.device();
        let s = &self.schedule;
        x_start * self.coef(&s.sqrt_alphas_cumprod, t, &device)
            + noise * self.coef(&s.sqrt_one_minus_alphas_cumprod, t, &device)
    }

    /// Noise implied by `x_t` and a clean estimate `x0`.
    pub fn predict_noise_from_start(
        &self,
        x_t: Tensor<B, 3>,
        t: &[usize],
        x0: Tensor<B, 3>,
    ) -> Tensor<B, 3> {
        let device = x_t.device();
        let s = &self.schedule;
        (x_t * self.coef(&s.sqrt_recip_alphas_cumprod, t, &device) - x0)
            / self.coef(&s.sqrt_recipm1_alphas_cumprod, t, &device)
    }

    /// Posterior `q(x_{t-1} | x_t, x_start)`.
    pub fn q_posterior(&self, x_start: Tensor<B, 3>, x_t: Tensor<B, 3>, t: &[usize]) -> Posterior<B> {
        let device = x_t.device();
        let s = &self.schedule;
        let [batch, channels, frames] = x_t.dims();
        let shape = [batch, channels, frames];
        Posterior {
            mean: x_start * self.coef(&s.posterior_mean_coef1, t, &device)
                + x_t * self.coef(&s.posterior_mean_coef2, t, &device),
            variance: self
                .coef(&s.posterior_variance, t, &device)
                .expand(shape),
            log_variance: self
                .coef(&s.posterior_log_variance_clipped, t, &device)
                .expand(shape),
        }
    }

    /// Run the denoiser and derive the implied noise.
    pub fn model_predictions(
        &self,
        x: Tensor<B, 3>,
        cond: &Conditioning<B>,
        t: &[usize],
    ) -> Result<ModelPrediction<B>> {
        let pred_x_start = self.denoiser.forward(x.clone(), cond, t)?;
        let pred_noise = self.predict_noise_from_start(x, t, pred_x_start.clone());
        Ok(ModelPrediction {
            pred_noise,
            pred_x_start,
        })
    }

    /// Posterior moments around the denoiser's `x_start` estimate.
    pub fn p_mean_variance(
        &self,
        x: Tensor<B, 3>,
        cond: &Conditioning<B>,
        t: &[usize],
    ) -> Result<(Posterior<B>, Tensor<B, 3>)> {
        let preds = self.model_predictions(x.clone(), cond, t)?;
        let posterior = self.q_posterior(preds.pred_x_start.clone(), x, t);
        Ok((posterior, preds.pred_x_start))
    }

    /// One ancestral step at timestep `t`; no noise is added at `t == 0`.
    ///
    /// Returns the next state and the `x_start` estimate.
    pub fn p_sample(
        &self,
        x: Tensor<B, 3>,
        t: usize,
        cond: &Conditioning<B>,
        rng: &mut NoiseRng,
    ) -> Result<(Tensor<B, 3>, Tensor<B, 3>)> {
        let [batch, channels, frames] = x.dims();
        let device = x.device();
        let steps = vec![t; batch];
        let (posterior, x_start) = self.p_mean_variance(x, cond, &steps)?;
        let mask = PaddingMask::for_bct("diffusion", "content_lengths", &x_start, &cond.content_lengths)?;
        let next = if t > 0 {
            let noise = mask.zero_bct(rng.normal([batch, channels, frames], &device));
            posterior.mean + posterior.log_variance.mul_scalar(0.5).exp() * noise
        } else {
            posterior.mean
        };
        Ok((mask.zero_bct(next), x_start))
    }

    fn initial_noise(&self, cond: &Conditioning<B>, rng: &mut NoiseRng) -> Result<Tensor<B, 3>> {
        let [batch, frames, _] = cond.content.dims();
        let device = cond.content.device();
        let noise = rng.normal([batch, self.code_channels(), frames], &device);
        let mask = PaddingMask::for_bct("diffusion", "content_lengths", &noise, &cond.content_lengths)?;
        Ok(mask.zero_bct(noise))
    }

    /// Ancestral sampling over every timestep.
    pub fn p_sample_loop(&self, cond: &Conditioning<B>, rng: &mut NoiseRng) -> Result<Tensor<B, 3>> {
        let mut x = self.initial_noise(cond, rng)?;
        let total = self.schedule.timesteps();
        tracing::debug!(steps = total, "ancestral sampling");
        for t in (0..total).rev() {
            let (next, _) = self.p_sample(x, t, cond, rng)?;
            x = next;
            tracing::trace!(t, "ancestral step");
        }
        ensure_finite("ancestral_sampler", "x", &x)?;
        Ok(x)
    }

    /// Strided sampling with interpolation coefficient `eta`.
    pub fn ddim_sample(
        &self,
        cond: &Conditioning<B>,
        steps: usize,
        eta: f64,
        rng: &mut NoiseRng,
    ) -> Result<Tensor<B, 3>> {
        let mut x = self.initial_noise(cond, rng)?;
        let [batch, channels, frames] = x.dims();
        let device = x.device();
        let mask = PaddingMask::for_bct("diffusion", "content_lengths", &x, &cond.content_lengths)?;
        let ac = &self.schedule.alphas_cumprod;
        let pairs = ddim_time_pairs(self.schedule.timesteps(), steps);
        tracing::debug!(steps = pairs.len(), eta, "ddim sampling");

        for (time, time_next) in pairs {
            let t = time.max(0) as usize;
            let preds = self.model_predictions(x, cond, &vec![t; batch])?;
            if time_next < 0 {
                x = preds.pred_x_start;
                continue;
            }
            let alpha = ac[t];
            let alpha_next = ac[time_next as usize];
            let sigma =
                eta * ((1.0 - alpha / alpha_next) * (1.0 - alpha_next) / (1.0 - alpha)).sqrt();
            let c = (1.0 - alpha_next - sigma * sigma).max(0.0).sqrt();

            let mut next = preds.pred_x_start.mul_scalar(alpha_next.sqrt() as f32)
                + preds.pred_noise.mul_scalar(c as f32);
            if sigma > 0.0 {
                let noise = mask.zero_bct(rng.normal([batch, channels, frames], &device));
                next = next + noise.mul_scalar(sigma as f32);
            }
            x = mask.zero_bct(next);
            tracing::trace!(time, time_next, sigma, "ddim step");
        }
        ensure_finite("ddim_sampler", "x", &x)?;
        Ok(x)
    }

    /// Predict durations and pitch, then sample normalised codes.
    pub fn sample_codes(
        &self,
        phonemes: Tensor<B, 2, Int>,
        prompt_codes: Tensor<B, 3>,
        phoneme_lengths: &[usize],
        prompt_lengths: &[usize],
        rng: &mut NoiseRng,
    ) -> Result<SampledCodes<B>> {
        let inference = self
            .prior
            .infer(phonemes, prompt_codes, phoneme_lengths, prompt_lengths)?;
        let cond = Conditioning {
            content: inference.content,
            prompt: inference.prompt,
            content_lengths: inference.lengths.clone(),
            prompt_lengths: prompt_lengths.to_vec(),
        };
        let codes = match self.sampler() {
            Sampler::Ancestral => self.p_sample_loop(&cond, rng)?,
            Sampler::Ddim { steps, eta } => self.ddim_sample(&cond, steps, eta, rng)?,
        };
        Ok(SampledCodes {
            codes,
            lengths: inference.lengths,
        })
    }

    /// Synthesise audio: sample codes, denormalise and decode with `codec`.
    pub fn sample<C: NeuralCodec<B>>(
        &self,
        phonemes: Tensor<B, 2, Int>,
        prompt_codes: Tensor<B, 3>,
        phoneme_lengths: &[usize],
        prompt_lengths: &[usize],
        codec: &C,
        rng: &mut NoiseRng,
    ) -> Result<Waveform<B>> {
        let sampled = self.sample_codes(phonemes, prompt_codes, phoneme_lengths, prompt_lengths, rng)?;
        let audio = codec.decode(denormalize(sampled.codes.swap_dims(1, 2)))?;
        let [batch, audio_channels, samples] = audio.dims();
        Ok(if audio_channels == 1 {
            Waveform::Mono(audio.reshape([batch, samples]))
        } else {
            Waveform::MultiChannel(audio)
        })
    }

    /// Compute every training loss for one batch.
    pub fn train_step<C: NeuralCodec<B>>(
        &self,
        batch: &TrainBatch<B>,
        codec: &C,
        rng: &mut NoiseRng,
    ) -> Result<TrainOutput<B>> {
        let [b, channels, frames] = batch.codes.dims();
        if channels != self.code_channels() {
            return Err(Error::shape(
                "diffusion",
                "codes",
                format!("{channels} code channels, model expects {}", self.code_channels()),
            ));
        }
        let device = batch.codes.device();
        let lengths = &batch.prior.frame_lengths;
        let mask = PaddingMask::for_bct("diffusion", "codes", &batch.codes, lengths)?;
        let codes = mask.zero_bct(batch.codes.clone());
        let x_start = normalize(codes.clone());

        let prior = self.prior.forward(&batch.prior)?;
        let timesteps = rng.timesteps(b, self.schedule.timesteps());
        let noise = mask.zero_bct(rng.normal([b, channels, frames], &device));
        let x = self.q_sample(x_start.clone(), &timesteps, noise);

        let cond = Conditioning {
            content: prior.content,
            prompt: prior.prompt,
            content_lengths: lengths.clone(),
            prompt_lengths: batch.prior.reference_lengths.clone(),
        };
        let prediction = self.denoiser.forward(x, &cond, &timesteps)?;

        let per_example = (prediction.clone() - x_start.clone())
            .powf_scalar(2.0)
            .reshape([b, channels * frames])
            .mean_dim(1);
        let snr_weight = self
            .coef(&self.schedule.loss_weight, &timesteps, &device)
            .reshape([b, 1]);
        let diff_loss = (per_example * snr_weight).mean();
        let duration_loss = (prior.log_duration_pred.clone() - prior.log_duration_target.clone())
            .abs()
            .mean();
        let f0_loss = (prior.lf0_pred.clone() - prior.lf0.clone()).abs().mean();

        let weights = &self.config.loss;
        let ce_loss = if weights.rvq_cross_entropy > 0.0 {
            let codebooks = codec.codebooks();
            let encoding = rvq_encode(codes.swap_dims(1, 2), &codebooks, weights.rvq_layers)?;
            rvq_ce_loss(
                denormalize(prediction.clone()).swap_dims(1, 2),
                &encoding,
                &codebooks[..weights.rvq_layers],
                &mask,
            )
        } else {
            Tensor::zeros([1], &device)
        };

        let loss = diff_loss.clone().mul_scalar(weights.diff)
            + duration_loss.clone().mul_scalar(weights.duration)
            + f0_loss.clone().mul_scalar(weights.f0)
            + ce_loss.clone().mul_scalar(weights.rvq_cross_entropy);
        ensure_finite("diffusion", "prediction", &prediction)?;
        ensure_finite("diffusion", "loss", &loss)?;
        tracing::debug!(?timesteps, "train step");

        Ok(TrainOutput {
            loss,
            diff_loss,
            duration_loss,
            f0_loss,
            ce_loss,
            lf0: prior.lf0,
            lf0_pred: prior.lf0_pred,
            log_duration_pred: prior.log_duration_pred,
            log_duration_target: prior.log_duration_target,
            prediction,
            target: x_start,
            timesteps,
        })
    }
}
