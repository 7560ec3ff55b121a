//! Command-line interface for the voxdiff diffusion TTS core.
//!
//! The CLI inspects noise schedules and runs the full prior + sampler pipeline
//! on synthetic inputs, writing results as JSON.

#![recursion_limit = "256"]

use anyhow::{Context, Result};
use burn::tensor::backend::Backend;
use burn::tensor::{Int, Tensor, TensorData};
use burn_ndarray::{NdArray, NdArrayDevice};
use clap::{Parser, Subcommand, ValueEnum};
use serde::Serialize;
use std::path::{Path, PathBuf};
use tracing_subscriber::EnvFilter;
use voxdiff::{
    denormalize, load_config, BetaScheduleKind, Config, GaussianDiffusion, NoiseRng, NoiseSchedule,
};

#[cfg(feature = "backend-wgpu")]
use burn_wgpu::graphics::AutoGraphicsApi;
#[cfg(feature = "backend-wgpu")]
use burn_wgpu::{init_setup, Wgpu, WgpuDevice};

/// Supported compute backends.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
#[value(rename_all = "kebab-case")]
enum BackendChoice {
    /// Use the WGPU backend (GPU acceleration when available).
    Wgpu,
    /// Use the ndarray backend (CPU).
    Ndarray,
}

#[cfg(feature = "backend-wgpu")]
const DEFAULT_BACKEND: BackendChoice = BackendChoice::Wgpu;
#[cfg(not(feature = "backend-wgpu"))]
const DEFAULT_BACKEND: BackendChoice = BackendChoice::Ndarray;

/// Beta schedule names accepted on the command line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum ScheduleChoice {
    Linear,
    Cosine,
}

impl From<ScheduleChoice> for BetaScheduleKind {
    fn from(choice: ScheduleChoice) -> Self {
        match choice {
            ScheduleChoice::Linear => BetaScheduleKind::Linear,
            ScheduleChoice::Cosine => BetaScheduleKind::Cosine,
        }
    }
}

/// Top-level CLI options.
#[derive(Parser)]
#[command(name = "voxdiff")]
#[command(about = "Latent diffusion text-to-speech core", long_about = None)]
struct Cli {
    /// Log construction and sampler progress to stderr.
    #[arg(long, short, global = true)]
    verbose: bool,
    /// Compute backend to use.
    #[arg(long, value_enum, default_value_t = DEFAULT_BACKEND, global = true)]
    backend: BackendChoice,
    /// Subcommand to execute.
    #[command(subcommand)]
    command: Commands,
}

/// CLI subcommands.
#[derive(Subcommand)]
enum Commands {
    /// Print noise schedule coefficients as JSON.
    Schedule {
        /// Model config; its diffusion section provides the defaults.
        #[arg(long)]
        config: Option<PathBuf>,
        /// Override the number of diffusion steps.
        #[arg(long)]
        timesteps: Option<usize>,
        /// Override the beta schedule.
        #[arg(long, value_enum)]
        kind: Option<ScheduleChoice>,
        /// Timesteps to report (defaults to first, middle and last).
        #[arg(long = "at", value_delimiter = ',')]
        at: Vec<usize>,
        /// Write JSON here instead of stdout.
        #[arg(long)]
        output: Option<PathBuf>,
    },
    /// Sample codes from a randomly initialised model on a synthetic batch.
    Sample {
        /// Model config.
        #[arg(long)]
        config: Option<PathBuf>,
        /// Comma-separated phoneme ids of one utterance.
        #[arg(long, value_delimiter = ',', default_values_t = vec![3, 14, 15, 9, 2, 6])]
        phonemes: Vec<i64>,
        /// Frames of random reference codes used as the voice prompt.
        #[arg(long, default_value_t = 20)]
        prompt_frames: usize,
        /// Seed of the prompt and sampler noise.
        #[arg(long, default_value_t = 0)]
        seed: u64,
        /// Write JSON here instead of stdout.
        #[arg(long)]
        output: Option<PathBuf>,
    },
}

/// Coefficients of one timestep.
#[derive(Debug, Serialize)]
struct ScheduleRow {
    t: usize,
    beta: f64,
    alphas_cumprod: f64,
    alphas_cumprod_prev: f64,
    sqrt_alphas_cumprod: f64,
    sqrt_one_minus_alphas_cumprod: f64,
    posterior_variance: f64,
    posterior_log_variance_clipped: f64,
    posterior_mean_coef1: f64,
    posterior_mean_coef2: f64,
    loss_weight: f64,
}

#[derive(Debug, Serialize)]
struct ScheduleReport {
    timesteps: usize,
    kind: BetaScheduleKind,
    rows: Vec<ScheduleRow>,
}

#[derive(Debug, Serialize)]
struct SampleReport {
    sampler: String,
    shape: [usize; 3],
    lengths: Vec<usize>,
    /// Normalised codes `[batch][channel][frame]`.
    codes: Vec<Vec<Vec<f32>>>,
}

/// Entry point for the CLI.
fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    match cli.command {
        Commands::Schedule {
            config,
            timesteps,
            kind,
            at,
            output,
        } => {
            let config = config_or_default(config.as_deref())?;
            let report = schedule_report(&config, timesteps, kind.map(Into::into), &at)?;
            write_json(output.as_deref(), &report)?;
        }
        Commands::Sample {
            config,
            phonemes,
            prompt_frames,
            seed,
            output,
        } => {
            let config = config_or_default(config.as_deref())?;
            let args = SampleArgs {
                config,
                phonemes,
                prompt_frames,
                seed,
            };
            let report = match cli.backend {
                BackendChoice::Wgpu => {
                    #[cfg(feature = "backend-wgpu")]
                    {
                        let device = WgpuDevice::default();
                        init_setup::<AutoGraphicsApi>(&device, Default::default());
                        run_sample::<Wgpu>(args, &device)?
                    }
                    #[cfg(not(feature = "backend-wgpu"))]
                    {
                        let _ = args;
                        anyhow::bail!("WGPU backend not enabled; build with --features backend-wgpu");
                    }
                }
                BackendChoice::Ndarray => {
                    let device = NdArrayDevice::default();
                    run_sample::<NdArray<f32>>(args, &device)?
                }
            };
            write_json(output.as_deref(), &report)?;
        }
    }

    Ok(())
}

fn init_tracing(verbose: bool) {
    let default = if verbose { "voxdiff=debug" } else { "warn" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn config_or_default(path: Option<&Path>) -> Result<Config> {
    match path {
        Some(path) => load_config(path),
        None => Ok(Config::default()),
    }
}

fn schedule_report(
    config: &Config,
    timesteps: Option<usize>,
    kind: Option<BetaScheduleKind>,
    at: &[usize],
) -> Result<ScheduleReport> {
    let diffusion = &config.diffusion;
    let timesteps = timesteps.unwrap_or(diffusion.timesteps);
    let kind = kind.unwrap_or(diffusion.beta_schedule);
    let schedule = NoiseSchedule::new(
        timesteps,
        kind,
        diffusion
            .min_snr_loss_weight
            .then_some(diffusion.min_snr_gamma),
    )?;
    let at = if at.is_empty() {
        vec![0, timesteps / 2, timesteps - 1]
    } else {
        at.to_vec()
    };
    let rows = at
        .into_iter()
        .map(|t| {
            if t >= timesteps {
                anyhow::bail!("timestep {t} is outside 0..{timesteps}");
            }
            let s = &schedule;
            Ok(ScheduleRow {
                t,
                beta: s.betas[t],
                alphas_cumprod: s.alphas_cumprod[t],
                alphas_cumprod_prev: s.alphas_cumprod_prev[t],
                sqrt_alphas_cumprod: s.sqrt_alphas_cumprod[t],
                sqrt_one_minus_alphas_cumprod: s.sqrt_one_minus_alphas_cumprod[t],
                posterior_variance: s.posterior_variance[t],
                posterior_log_variance_clipped: s.posterior_log_variance_clipped[t],
                posterior_mean_coef1: s.posterior_mean_coef1[t],
                posterior_mean_coef2: s.posterior_mean_coef2[t],
                loss_weight: s.loss_weight[t],
            })
        })
        .collect::<Result<Vec<_>>>()?;
    Ok(ScheduleReport {
        timesteps,
        kind,
        rows,
    })
}

struct SampleArgs {
    config: Config,
    phonemes: Vec<i64>,
    prompt_frames: usize,
    seed: u64,
}

fn run_sample<B: Backend>(args: SampleArgs, device: &B::Device) -> Result<SampleReport> {
    let n_symbols = args.config.phoneme_encoder.n_symbols as i64;
    if let Some(bad) = args.phonemes.iter().find(|&&p| p < 0 || p > n_symbols) {
        anyhow::bail!("phoneme id {bad} is outside 0..={n_symbols}");
    }
    if args.phonemes.is_empty() || args.prompt_frames == 0 {
        anyhow::bail!("need at least one phoneme and one prompt frame");
    }

    let model = GaussianDiffusion::<B>::new(args.config, device)?;
    let mut rng = NoiseRng::seed_from_u64(args.seed);
    let tokens = args.phonemes.len();
    let phonemes =
        Tensor::<B, 2, Int>::from_data(TensorData::new(args.phonemes, [1, tokens]), device);
    let prompt = denormalize(rng.normal::<B, 3>(
        [1, args.prompt_frames, model.code_channels()],
        device,
    ));

    let sampled = model
        .sample_codes(phonemes, prompt, &[tokens], &[args.prompt_frames], &mut rng)
        .context("sampling failed")?;
    let shape = sampled.codes.dims();
    let values = sampled
        .codes
        .into_data()
        .convert::<f32>()
        .to_vec::<f32>()
        .map_err(|e| anyhow::anyhow!("failed to read sampled codes: {e:?}"))?;
    let [batch, channels, frames] = shape;
    let codes = (0..batch)
        .map(|b| {
            (0..channels)
                .map(|c| {
                    let start = (b * channels + c) * frames;
                    values[start..start + frames].to_vec()
                })
                .collect()
        })
        .collect();
    Ok(SampleReport {
        sampler: format!("{:?}", model.sampler()),
        shape,
        lengths: sampled.lengths,
        codes,
    })
}

fn write_json<T: Serialize>(output: Option<&Path>, value: &T) -> Result<()> {
    let json = serde_json::to_string_pretty(value)?;
    match output {
        Some(path) => std::fs::write(path, json)
            .with_context(|| format!("failed to write {}", path.display()))?,
        None => println!("{json}"),
    }
    Ok(())
}
