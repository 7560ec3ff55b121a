//! Shared test utilities: fixtures, tensor builders and a toy codec.

#![allow(dead_code)]

use burn::module::Param;
use burn::tensor::{backend::Backend, Int, Tensor, TensorData};
use burn_ndarray::{NdArray, NdArrayDevice};
use voxdiff::{load_config, Config, GaussianDiffusion, NeuralCodec};

pub type TestBackend = NdArray<f32>;

pub const FIXTURE_DIR: &str = "tests/fixtures";

/// Load a YAML config fixture.
pub fn fixture_config(name: &str) -> Config {
    let path = format!("{FIXTURE_DIR}/{name}");
    load_config(&path).unwrap_or_else(|e| panic!("failed to load fixture {path}: {e:#}"))
}

/// Create a 2D tensor from nested Vecs.
pub fn tensor2(data: Vec<Vec<f32>>, device: &NdArrayDevice) -> Tensor<TestBackend, 2> {
    let rows = data.len();
    let cols = data.first().map(|r| r.len()).unwrap_or(0);
    let flat: Vec<f32> = data.into_iter().flatten().collect();
    Tensor::from_data(TensorData::new(flat, [rows, cols]), device)
}

/// Create a 2D int tensor from ragged rows, zero-padding to the longest.
pub fn tensor2_int(data: Vec<Vec<i64>>, device: &NdArrayDevice) -> Tensor<TestBackend, 2, Int> {
    let rows = data.len();
    let cols = data.iter().map(Vec::len).max().unwrap_or(0);
    let flat: Vec<i64> = data
        .into_iter()
        .flat_map(|mut row| {
            row.resize(cols, 0);
            row
        })
        .collect();
    Tensor::from_data(TensorData::new(flat, [rows, cols]), device)
}

/// Read a float tensor into a flat Vec.
pub fn to_vec<const D: usize>(tensor: Tensor<TestBackend, D>) -> Vec<f32> {
    tensor.into_data().convert::<f32>().to_vec::<f32>().unwrap()
}

/// Sum of absolute values at frames `>= length` of a `[batch, channels, T]` tensor.
pub fn padded_energy_bct(tensor: Tensor<TestBackend, 3>, lengths: &[usize]) -> f32 {
    let [_, _, frames] = tensor.dims();
    lengths
        .iter()
        .enumerate()
        .filter(|(_, &len)| len < frames)
        .map(|(b, &len)| {
            tensor
                .clone()
                .narrow(0, b, 1)
                .narrow(2, len, frames - len)
                .abs()
                .sum()
                .into_scalar()
        })
        .sum()
}

/// Pin the duration predictor to a constant log-duration of `ln(frames + 1)`,
/// so every phoneme lasts `frames` frames.
pub fn fix_durations<B: Backend>(model: &mut GaussianDiffusion<B>, frames: usize) {
    let device = model.denoiser.proj.weight.val().device();
    let proj = &mut model.prior.duration_predictor.inner.proj;
    proj.conv.weight = Param::from_tensor(proj.conv.weight.val().zeros_like());
    proj.skip.weight = Param::from_tensor(proj.skip.weight.val().zeros_like());
    proj.conv.bias = Some(Param::from_tensor(
        Tensor::<B, 1>::ones([1], &device).mul_scalar(((frames + 1) as f32).ln()),
    ));
}

/// Replace the zero-initialised output projection so the denoiser predicts
/// something other than zero.
pub fn activate_denoiser<B: Backend>(model: &mut GaussianDiffusion<B>) {
    use voxdiff::modules::conv::{Conv1d, Conv1dConfig};
    let [out, hidden, _] = model.denoiser.proj.weight.val().dims();
    let device = model.denoiser.proj.weight.val().device();
    model.denoiser.proj = Conv1d::new(Conv1dConfig::new(hidden, out, 1), &device);
}

/// Codec stand-in: each frame becomes `hop` samples of its channel mean, and
/// the codebooks are fixed scaled grids.
#[derive(Debug, Clone)]
pub struct ToyCodec<B: Backend> {
    pub hop: usize,
    pub codebooks: Vec<Tensor<B, 2>>,
}

impl<B: Backend> ToyCodec<B> {
    pub fn new(channels: usize, levels: usize, entries: usize, device: &B::Device) -> Self {
        let codebooks = (0..levels)
            .map(|level| {
                let scale = 4.0 / (level + 1) as f32;
                let values: Vec<f32> = (0..entries * channels)
                    .map(|i| {
                        let (entry, channel) = (i / channels, i % channels);
                        scale * (((entry * 7 + channel * 3) % 5) as f32 - 2.0)
                    })
                    .collect();
                Tensor::from_data(TensorData::new(values, [entries, channels]), device)
            })
            .collect();
        Self { hop: 4, codebooks }
    }
}

impl<B: Backend> NeuralCodec<B> for ToyCodec<B> {
    fn encode(&self, waveform: Tensor<B, 3>) -> voxdiff::Result<Tensor<B, 3>> {
        let [batch, _, samples] = waveform.dims();
        let frames = samples / self.hop;
        let channels = self.codebooks.first().map(|c| c.dims()[1]).unwrap_or(1);
        let framed = waveform
            .narrow(1, 0, 1)
            .narrow(2, 0, frames * self.hop)
            .reshape([batch, frames, self.hop])
            .mean_dim(2);
        Ok(framed.repeat_dim(2, channels))
    }

    fn decode(&self, codes: Tensor<B, 3>) -> voxdiff::Result<Tensor<B, 3>> {
        let [batch, frames, _] = codes.dims();
        let mean = codes.mean_dim(2);
        Ok(mean
            .repeat_dim(2, self.hop)
            .reshape([batch, 1, frames * self.hop]))
    }

    fn codebooks(&self) -> Vec<Tensor<B, 2>> {
        self.codebooks.clone()
    }
}
