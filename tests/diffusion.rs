mod common;

use burn::tensor::{Distribution, Tensor, TensorData, Tolerance};
use burn_ndarray::NdArrayDevice;
use common::{
    activate_denoiser, fix_durations, fixture_config, padded_energy_bct, tensor2_int, to_vec,
    TestBackend,
};
use std::sync::Arc;
use voxdiff::model::schedule::ddim_time_pairs;
use voxdiff::{
    BetaScheduleKind, Conditioning, Error, GaussianDiffusion, NoiseRng, NoiseSchedule, Sampler,
};

fn model_with(timesteps: usize, sampling_timesteps: usize, eta: f64) -> GaussianDiffusion<TestBackend> {
    let mut config = fixture_config("tiny.yaml");
    config.diffusion.timesteps = timesteps;
    config.diffusion.sampling_timesteps = sampling_timesteps;
    config.diffusion.ddim_sampling_eta = eta;
    let mut model = GaussianDiffusion::new(config, &NdArrayDevice::default()).unwrap();
    activate_denoiser(&mut model);
    model
}

fn conditioning(model: &GaussianDiffusion<TestBackend>, lengths: Vec<usize>) -> Conditioning<TestBackend> {
    let device = NdArrayDevice::default();
    let frames = lengths.iter().copied().max().unwrap_or(0);
    let batch = lengths.len();
    let hidden = model.config().phoneme_encoder.hidden_channels;
    Conditioning {
        content: Tensor::random([batch, frames, hidden], Distribution::Default, &device),
        prompt: Tensor::random([batch, 5, hidden], Distribution::Default, &device),
        content_lengths: lengths,
        prompt_lengths: vec![5; batch],
    }
}

#[test]
fn forward_process_ends_near_pure_noise() {
    let schedule = NoiseSchedule::new(1000, BetaScheduleKind::Linear, None).unwrap();
    assert!(schedule.sqrt_alphas_cumprod[999] < 0.01);
    assert!(schedule.sqrt_one_minus_alphas_cumprod[999] > 0.9999);

    let device = NdArrayDevice::default();
    let model = model_with(1000, 50, 0.0);
    let x0 = Tensor::<TestBackend, 3>::ones([4, 4, 256], &device).mul_scalar(3.0);
    let mut rng = NoiseRng::seed_from_u64(3);
    let noise = rng.normal::<TestBackend, 3>([4, 4, 256], &device);
    let x_t = model.q_sample(x0, &[999; 4], noise);
    let values = to_vec(x_t);
    let n = values.len() as f32;
    let mean = values.iter().sum::<f32>() / n;
    let var = values.iter().map(|v| (v - mean).powi(2)).sum::<f32>() / n;
    assert!(mean.abs() < 0.1, "mean {mean}");
    assert!((var - 1.0).abs() < 0.1, "var {var}");
}

#[test]
fn cosine_schedule_is_monotone() {
    let schedule = NoiseSchedule::new(500, BetaScheduleKind::Cosine, None).unwrap();
    for w in schedule.alphas_cumprod.windows(2) {
        assert!(w[1] < w[0]);
    }
    assert!(schedule.alphas_cumprod[499] < 1e-3);
}

#[test]
fn ddim_pairs_cover_the_range() {
    for (total, steps) in [(1000, 50), (1000, 1000), (200, 7), (100, 1)] {
        let pairs = ddim_time_pairs(total, steps);
        assert_eq!(pairs.len(), steps);
        assert_eq!(pairs[0].0, total as i64 - 1);
        assert_eq!(pairs[steps - 1].1, -1);
        for (t, next) in pairs {
            assert!(next < t);
        }
    }
}

#[test]
fn inconsistent_sampling_steps_are_rejected_at_construction() {
    let mut config = fixture_config("tiny.yaml");
    config.diffusion.sampling_timesteps = config.diffusion.timesteps + 1;
    let err = GaussianDiffusion::<TestBackend>::new(config, &NdArrayDevice::default()).unwrap_err();
    assert!(matches!(err, Error::InvalidConfig(_)));
}

#[test]
fn final_ancestral_step_adds_no_noise() {
    let model = model_with(100, 100, 0.0);
    let cond = conditioning(&model, vec![6, 3]);
    let device = NdArrayDevice::default();
    let x = Tensor::<TestBackend, 3>::random([2, 4, 6], Distribution::Default, &device);
    let (a, _) = model
        .p_sample(x.clone(), 0, &cond, &mut NoiseRng::seed_from_u64(1))
        .unwrap();
    let (b, _) = model
        .p_sample(x.clone(), 0, &cond, &mut NoiseRng::seed_from_u64(2))
        .unwrap();
    a.to_data().assert_approx_eq(&b.to_data(), Tolerance::<f32>::absolute(1e-6));

    let (c, _) = model
        .p_sample(x.clone(), 10, &cond, &mut NoiseRng::seed_from_u64(1))
        .unwrap();
    let (d, _) = model
        .p_sample(x, 10, &cond, &mut NoiseRng::seed_from_u64(2))
        .unwrap();
    let diff = (c - d).abs().sum().into_scalar();
    assert!(diff > 0.0);
}

#[test]
fn ancestral_sampler_is_reproducible_and_masked() {
    let model = model_with(100, 100, 0.0);
    assert_eq!(model.sampler(), Sampler::Ancestral);
    let cond = conditioning(&model, vec![7, 4]);
    let a = model
        .p_sample_loop(&cond, &mut NoiseRng::seed_from_u64(42))
        .unwrap();
    let b = model
        .p_sample_loop(&cond, &mut NoiseRng::seed_from_u64(42))
        .unwrap();
    assert_eq!(a.dims(), [2, 4, 7]);
    a.to_data().assert_approx_eq(&b.to_data(), Tolerance::<f32>::absolute(1e-6));
    assert_eq!(padded_energy_bct(a, &[7, 4]), 0.0);
}

#[test]
fn deterministic_ddim_depends_only_on_initial_noise() {
    let model = model_with(1000, 20, 0.0);
    let cond = conditioning(&model, vec![5, 5]);
    let a = model
        .ddim_sample(&cond, 20, 0.0, &mut NoiseRng::seed_from_u64(9))
        .unwrap();
    let b = model
        .ddim_sample(&cond, 20, 0.0, &mut NoiseRng::seed_from_u64(9))
        .unwrap();
    a.to_data().assert_approx_eq(&b.to_data(), Tolerance::<f32>::absolute(1e-6));

    let stochastic = model
        .ddim_sample(&cond, 20, 1.0, &mut NoiseRng::seed_from_u64(9))
        .unwrap();
    let diff = (a - stochastic).abs().sum().into_scalar();
    assert!(diff > 0.0);
}

#[test]
fn deterministic_ddim_draws_only_the_initial_noise() {
    let device = NdArrayDevice::default();
    let model = model_with(100, 100, 0.0);
    let cond = conditioning(&model, vec![6, 4]);
    let mut rng = NoiseRng::seed_from_u64(17);
    let out = model.ddim_sample(&cond, 100, 0.0, &mut rng).unwrap();
    assert!(to_vec(out).iter().all(|v| v.is_finite()));

    let mut reference = NoiseRng::seed_from_u64(17);
    let _initial = reference.normal::<TestBackend, 3>([2, 4, 6], &device);
    let next = to_vec(rng.normal::<TestBackend, 1>([8], &device));
    let expected = to_vec(reference.normal::<TestBackend, 1>([8], &device));
    assert_eq!(next, expected);
}

#[test]
fn prompt_batch_mismatch_is_reported_not_panicked() {
    let device = NdArrayDevice::default();
    let model = model_with(100, 10, 0.0);
    let phonemes = tensor2_int(vec![vec![1, 2, 3], vec![4, 5, 6]], &device);
    let prompt = Tensor::<TestBackend, 3>::random([3, 6, 4], Distribution::Default, &device);
    let err = model
        .sample_codes(phonemes, prompt, &[3, 3], &[6, 6, 6], &mut NoiseRng::seed_from_u64(0))
        .unwrap_err();
    assert!(matches!(err, Error::ShapeMismatch { .. }), "{err}");
}

#[test]
fn strided_sampling_end_to_end() {
    let device = NdArrayDevice::default();
    let mut model = model_with(1000, 50, 0.0);
    fix_durations(&mut model, 2);
    assert_eq!(model.sampler(), Sampler::Ddim { steps: 50, eta: 0.0 });

    let phonemes = tensor2_int(vec![vec![1, 2, 3, 4, 5], vec![6, 7, 8]], &device);
    let prompt = Tensor::<TestBackend, 3>::random([2, 10, 4], Distribution::Normal(0.0, 10.0), &device);
    let sampled = model
        .sample_codes(phonemes, prompt, &[5, 3], &[10, 7], &mut NoiseRng::seed_from_u64(0))
        .unwrap();
    assert_eq!(sampled.lengths, vec![10, 6]);
    assert_eq!(sampled.codes.dims(), [2, 4, 10]);
    let values = to_vec(sampled.codes.clone());
    assert!(values.iter().all(|v| v.is_finite()));
    assert!(values.iter().any(|&v| v != 0.0));
    assert_eq!(padded_energy_bct(sampled.codes, &sampled.lengths), 0.0);
}

#[test]
fn sampling_decodes_through_the_codec() {
    let device = NdArrayDevice::default();
    let mut model = model_with(100, 10, 0.0);
    fix_durations(&mut model, 3);
    let codec = common::ToyCodec::<TestBackend>::new(4, 2, 8, &device);
    let phonemes = tensor2_int(vec![vec![4, 5]], &device);
    let prompt = Tensor::<TestBackend, 3>::random([1, 6, 4], Distribution::Default, &device);
    let waveform = model
        .sample(phonemes, prompt, &[2], &[6], &codec, &mut NoiseRng::seed_from_u64(1))
        .unwrap();
    match waveform {
        voxdiff::Waveform::Mono(wave) => assert_eq!(wave.dims(), [1, 6 * codec.hop]),
        other => panic!("expected mono output, got {other:?}"),
    }
}

#[test]
fn models_can_share_one_schedule() {
    let config = fixture_config("tiny.yaml");
    let schedule = Arc::new(NoiseSchedule::new(1000, BetaScheduleKind::Linear, None).unwrap());
    let device = NdArrayDevice::default();
    let a = GaussianDiffusion::<TestBackend>::with_schedule(config.clone(), schedule.clone(), &device)
        .unwrap();
    let b = GaussianDiffusion::<TestBackend>::with_schedule(config, schedule.clone(), &device).unwrap();
    assert!(Arc::ptr_eq(a.schedule(), b.schedule()));
    assert_eq!(Arc::strong_count(&schedule), 3);
}

#[test]
fn schedule_tables_read_as_f32_tensors() {
    let schedule = NoiseSchedule::new(1000, BetaScheduleKind::Linear, None).unwrap();
    let device = NdArrayDevice::default();
    let coef = NoiseSchedule::extract::<TestBackend>(&schedule.betas, &[0, 999], &device);
    coef.reshape([2]).to_data().assert_approx_eq(
        &TensorData::new(vec![1e-4f32, 0.02], [2]),
        Tolerance::<f32>::absolute(1e-7),
    );
}
