mod common;

use burn::tensor::{Distribution, Tensor};
use burn_ndarray::NdArrayDevice;
use common::{tensor2_int, to_vec, TestBackend};
use rand::{rngs::StdRng, Rng, SeedableRng};
use voxdiff::conditioner::phoneme::PhonemeEncoder;
use voxdiff::config::PhonemeEncoderConfig;
use voxdiff::model::length_regulator::{cap_durations, LengthRegulator};
use voxdiff::model::prior::log_durations_to_frames;
use voxdiff::modules::mask::{sequence_mask, PaddingMask};
use voxdiff::Error;

#[test]
fn sequence_mask_marks_exactly_the_tail() {
    let device = NdArrayDevice::default();
    let mut rng = StdRng::seed_from_u64(11);
    for _ in 0..50 {
        let batch = rng.random_range(1..5);
        let lengths: Vec<usize> = (0..batch).map(|_| rng.random_range(0..12)).collect();
        let max_len = lengths.iter().copied().max().unwrap_or(0) + rng.random_range(0..3);
        let mask = sequence_mask::<TestBackend>(&lengths, Some(max_len), &device).unwrap();
        assert_eq!(mask.dims(), [batch, max_len]);
        let values = mask.into_data().to_vec::<bool>().unwrap();
        for (b, &len) in lengths.iter().enumerate() {
            for t in 0..max_len {
                assert_eq!(values[b * max_len + t], t >= len, "b={b} t={t} len={len}");
            }
        }
    }
}

#[test]
fn mask_defaults_to_batch_max_and_rejects_short_caps() {
    let device = NdArrayDevice::default();
    let mask = sequence_mask::<TestBackend>(&[3, 7, 1], None, &device).unwrap();
    assert_eq!(mask.dims(), [3, 7]);
    let err = sequence_mask::<TestBackend>(&[3, 7], Some(5), &device).unwrap_err();
    assert!(matches!(err, Error::ShapeMismatch { .. }));
}

#[test]
fn padding_mask_checks_sequence_shape() {
    let device = NdArrayDevice::default();
    let x = Tensor::<TestBackend, 3>::zeros([2, 6, 4], &device);
    assert!(PaddingMask::for_btc("test", "x", &x, &[6, 2]).is_ok());
    let err = PaddingMask::for_btc("test", "x", &x, &[6]).unwrap_err();
    assert!(err.to_string().contains("test"));
    assert!(PaddingMask::for_btc("test", "x", &x, &[7, 2]).is_err());
}

#[test]
fn ragged_encoder_batch_has_no_energy_in_padding() {
    let device = NdArrayDevice::default();
    let config = PhonemeEncoderConfig {
        n_symbols: 20,
        hidden_channels: 8,
        n_layers: 2,
        kernel_size: 5,
        n_heads: 2,
        ..PhonemeEncoderConfig::default()
    };
    let encoder = PhonemeEncoder::<TestBackend>::new(&config, &device);
    let ids = tensor2_int(vec![vec![1, 2, 3, 4, 5, 6], vec![7, 8], vec![9, 10, 11]], &device);
    let out = encoder.forward(ids, &[6, 2, 3]).unwrap();
    assert_eq!(out.dims(), [3, 6, 8]);
    let tail_b1 = out.clone().narrow(0, 1, 1).narrow(1, 2, 4).abs().sum().into_scalar();
    let tail_b2 = out.narrow(0, 2, 1).narrow(1, 3, 3).abs().sum().into_scalar();
    assert_eq!(tail_b1, 0.0);
    assert_eq!(tail_b2, 0.0);
}

#[test]
fn regulated_length_is_sum_of_durations() {
    let device = NdArrayDevice::default();
    let mut rng = StdRng::seed_from_u64(5);
    for _ in 0..30 {
        let batch = rng.random_range(1..4);
        let tokens = rng.random_range(1..6);
        let durations: Vec<Vec<usize>> = (0..batch)
            .map(|_| (0..tokens).map(|_| rng.random_range(0..4)).collect())
            .collect();
        let seq = Tensor::<TestBackend, 3>::random([batch, tokens, 3], Distribution::Default, &device);
        let (out, lengths) = LengthRegulator
            .regulate_host(seq.clone(), &durations, None)
            .unwrap();
        let expected: Vec<usize> = durations.iter().map(|row| row.iter().sum()).collect();
        assert_eq!(lengths, expected);
        let max = expected.iter().copied().max().unwrap_or(0);
        assert_eq!(out.dims(), [batch, max, 3]);

        let seq_values = to_vec(seq);
        let out_values = to_vec(out);
        for (b, row) in durations.iter().enumerate() {
            let mut frame = 0;
            for (token, &d) in row.iter().enumerate() {
                for _ in 0..d {
                    for c in 0..3 {
                        assert_eq!(
                            out_values[(b * max + frame) * 3 + c],
                            seq_values[(b * tokens + token) * 3 + c]
                        );
                    }
                    frame += 1;
                }
            }
            for rest in frame..max {
                for c in 0..3 {
                    assert_eq!(out_values[(b * max + rest) * 3 + c], 0.0);
                }
            }
        }
    }
}

#[test]
fn capped_durations_fit_the_frame_budget() {
    let mut durations = vec![vec![3, 4, 5], vec![1, 1, 1]];
    cap_durations(&mut durations, 6);
    assert_eq!(durations, vec![vec![3, 3, 0], vec![1, 1, 1]]);

    let device = NdArrayDevice::default();
    let seq = Tensor::<TestBackend, 3>::ones([2, 3, 2], &device);
    let (out, lengths) = LengthRegulator
        .regulate_host(seq.clone(), &durations, Some(6))
        .unwrap();
    assert_eq!(out.dims(), [2, 6, 2]);
    assert_eq!(lengths, vec![6, 3]);

    let err = LengthRegulator
        .regulate_host(seq, &[vec![4, 4, 0], vec![0, 0, 0]], Some(6))
        .unwrap_err();
    assert!(matches!(err, Error::ShapeMismatch { .. }));
}

#[test]
fn log_duration_round_trip() {
    let device = NdArrayDevice::default();
    let mut rng = StdRng::seed_from_u64(21);
    let durations: Vec<i64> = (0..64).map(|_| rng.random_range(0..60)).collect();
    let ints = tensor2_int(vec![durations.clone()], &device);
    let log = ints.float().add_scalar(1.0).log();
    let back = log_durations_to_frames(log)
        .into_data()
        .convert::<i64>()
        .to_vec::<i64>()
        .unwrap();
    assert_eq!(back, durations);
}
