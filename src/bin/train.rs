#![recursion_limit = "256"]
use anyhow::{Context, Result};
use burn::backend::wgpu::graphics::AutoGraphicsApi;
use burn::backend::wgpu::{init_setup, RuntimeOptions, WgpuDevice};
use burn::backend::{Autodiff, Wgpu};
use burn::config::Config;
use clap::Parser;
use parsing_gan_burn::model::layers::conv_out;
use parsing_gan_burn::model::ModelConfig;
use parsing_gan_burn::training::Stage1Config;
use std::path::PathBuf;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(about = "Train the Stage I parsing GAN with Burn")]
struct Args {
    #[arg(long, default_value = "config.json")]
    config: PathBuf,
    /// Overrides `data_dir` from the config file.
    #[arg(long)]
    data_dir: Option<PathBuf>,
    /// Resume from `state.json` and the `latest` checkpoints.
    #[arg(long, default_value_t = false)]
    continue_train: bool,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();
    let args = Args::parse();

    let mut config = Stage1Config::load(&args.config)
        .with_context(|| format!("failed to load config from {}", args.config.display()))?;
    if let Some(data_dir) = &args.data_dir {
        config.data_dir = data_dir.to_string_lossy().into_owned();
    }
    if args.continue_train {
        config.continue_train = true;
    }

    type Backend = Wgpu<f32, i32>;
    type AutodiffBackend = Autodiff<Backend>;
    let device = WgpuDevice::default();
    let setup = init_setup::<AutoGraphicsApi>(&device, RuntimeOptions::default());
    let buffer_limit = setup.device.limits().max_storage_buffer_binding_size as u64;
    adjust_batch_size_for_wgpu(&mut config, buffer_limit)?;

    info!(
        "training {} for {} epochs into {}",
        config.name,
        config.niter + config.niter_decay,
        config.save_dir().display()
    );
    parsing_gan_burn::training::train::<AutodiffBackend>(config, device)?;
    Ok(())
}

/// Clamp `batch_size` so the biggest convolution workspace fits one wgpu storage buffer.
fn adjust_batch_size_for_wgpu(config: &mut Stage1Config, buffer_limit: u64) -> Result<()> {
    let per_sample = conv_workspace_bytes(&config.model, config.load_size as u64);
    let max_batch = match per_sample {
        0 => return Ok(()),
        bytes => (buffer_limit.saturating_sub(1) / bytes) as usize,
    };
    if max_batch == 0 {
        return Err(anyhow::anyhow!(
            "one sample needs about {per_sample} bytes of conv workspace but wgpu buffers hold {buffer_limit}; lower load_size, ngf or ndf"
        ));
    }
    if config.batch_size > max_batch {
        warn!(
            batch_size = config.batch_size,
            max_batch,
            per_sample,
            buffer_limit,
            "batch does not fit a wgpu storage buffer; clamping"
        );
        config.batch_size = max_batch;
    }
    Ok(())
}

/// Per-sample workspace in bytes of f32 elements.
fn conv_workspace_bytes(model: &ModelConfig, load_size: u64) -> u64 {
    estimate_max_conv_workspace_elems(model, load_size)
        .saturating_mul(std::mem::size_of::<f32>() as u64)
}

/// Largest im2col/col2im buffer of any 4x4 convolution for one sample.
fn estimate_max_conv_workspace_elems(model: &ModelConfig, load_size: u64) -> u64 {
    let kernel_area = 16u64;
    let mut max_elems = 0u64;

    // Generator encoder.
    let generator = model.generator_config();
    let widths = generator.encoder_channels();
    let mut size = load_size;
    let mut in_channels = model.generator_input_channels() as u64;
    let mut enc_sizes = Vec::with_capacity(widths.len());
    for &out_channels in &widths {
        size = conv_out(size as usize, 4, 2, 1) as u64;
        enc_sizes.push(size);
        max_elems = max_elems.max(in_channels * size * size * kernel_area);
        in_channels = out_channels as u64;
    }

    // Generator decoder, innermost first.
    for (idx, &input_size) in enc_sizes.iter().rev().enumerate() {
        let out_channels = widths
            .iter()
            .rev()
            .nth(idx + 1)
            .copied()
            .unwrap_or(model.parsing_label_nc) as u64;
        max_elems = max_elems.max(out_channels * input_size * input_size * kernel_area);
    }

    // Full-resolution discriminator scale.
    let mut size = load_size;
    let mut in_channels = model.discriminator_input_channels() as u64;
    let mut width = model.ndf as u64;
    for layer in 0..=model.n_layers_d {
        let stride = if layer < model.n_layers_d { 2 } else { 1 };
        size = conv_out(size as usize, 4, stride, 2) as u64;
        max_elems = max_elems.max(in_channels * size * size * kernel_area);
        in_channels = width;
        width = (width * 2).min(512);
    }

    max_elems
}

#[cfg(test)]
mod tests {
    use super::*;
    use parsing_gan_burn::model::LossConfig;

    fn config() -> Stage1Config {
        Stage1Config::new(
            ModelConfig::new(),
            LossConfig::new(),
            "run".to_string(),
            "checkpoints".to_string(),
            "data".to_string(),
        )
        .with_batch_size(64)
    }

    #[test]
    fn clamps_batch_to_buffer_limit() {
        let mut config = config();
        let per_sample = conv_workspace_bytes(&config.model, config.load_size as u64);
        assert!(per_sample > 0);

        adjust_batch_size_for_wgpu(&mut config, per_sample * 3 + 1).unwrap();
        assert_eq!(config.batch_size, 3);
    }

    #[test]
    fn rejects_buffers_below_one_sample() {
        let mut config = config();
        let per_sample = conv_workspace_bytes(&config.model, config.load_size as u64);

        assert!(adjust_batch_size_for_wgpu(&mut config, per_sample).is_err());
        assert_eq!(config.batch_size, 64);
    }
}
