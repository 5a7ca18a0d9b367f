#![recursion_limit = "256"]
use anyhow::{Context, Result};
use burn::backend::wgpu::WgpuDevice;
use burn::backend::{Autodiff, Wgpu};
use burn::config::Config;
use clap::Parser;
use parsing_gan_burn::data::{build_batch, load_manifest};
use parsing_gan_burn::training::{Stage1Config, Stage1Trainer};
use parsing_gan_burn::utils::{
    colorize_label_map, pair_output_stem, save_label_map, tensor_to_label_maps,
};
use std::path::{Path, PathBuf};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(about = "Predict target parsing maps with a trained Stage I generator")]
struct Args {
    /// Run directory holding `config.json` and the checkpoints.
    #[arg(long)]
    model_dir: PathBuf,
    #[arg(long, default_value = "latest")]
    which_epoch: String,
    /// Defaults to `<data_dir>/test.json` from the run config.
    #[arg(long)]
    manifest: Option<PathBuf>,
    #[arg(long)]
    save_dir: PathBuf,
    #[arg(long, default_value_t = 8)]
    batch_size: usize,
    /// Also write palette-colored previews next to the label maps.
    #[arg(long, default_value_t = false)]
    colorize: bool,
}

type Backend = Wgpu<f32, i32>;
type AutodiffBackend = Autodiff<Backend>;

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();
    let args = Args::parse();

    let config_path = args.model_dir.join("config.json");
    let mut config = Stage1Config::load(&config_path)
        .with_context(|| format!("failed to load config from {}", config_path.display()))?;
    point_at_run_dir(&mut config, &args.model_dir)?;
    config.is_train = false;
    config.require_pretrained = true;
    config.which_epoch = args.which_epoch.clone();
    config.pool_size = 0;

    let manifest = args
        .manifest
        .clone()
        .unwrap_or_else(|| Path::new(&config.data_dir).join("test.json"));
    let items = load_manifest(&manifest)?;
    info!("#test pairs = {}", items.len());

    let device = WgpuDevice::default();
    let data_config = config.data_config();
    let trainer = Stage1Trainer::<AutodiffBackend>::new(config, device.clone())?;

    std::fs::create_dir_all(&args.save_dir)
        .with_context(|| format!("failed to create {}", args.save_dir.display()))?;

    let batch_size = args.batch_size.max(1);
    for (chunk_idx, chunk) in items.chunks(batch_size).enumerate() {
        let batch = build_batch::<Backend>(chunk, &data_config, &device)?;
        let logits = trainer.inference(batch.source_parsing, batch.target_pose)?;
        let maps = tensor_to_label_maps(logits)?;

        for (offset, (item, map)) in chunk.iter().zip(&maps).enumerate() {
            let stem = pair_output_stem(chunk_idx * batch_size + offset, item);
            let path = args.save_dir.join(format!("{stem}.png"));
            save_label_map(map, &path)?;
            if args.colorize {
                let preview = args.save_dir.join(format!("{stem}_vis.png"));
                colorize_label_map(map)
                    .save(&preview)
                    .with_context(|| format!("failed to save {}", preview.display()))?;
            }
        }
    }

    info!("wrote predictions to {}", args.save_dir.display());
    Ok(())
}

/// Make `save_dir()` resolve to `model_dir` wherever the run was moved.
fn point_at_run_dir(config: &mut Stage1Config, model_dir: &Path) -> Result<()> {
    let name = model_dir
        .file_name()
        .context("model_dir has no final component")?;
    config.name = name.to_string_lossy().into_owned();
    config.checkpoints_dir = model_dir
        .parent()
        .unwrap_or_else(|| Path::new("."))
        .to_string_lossy()
        .into_owned();
    Ok(())
}
