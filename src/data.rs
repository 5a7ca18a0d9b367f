use crate::error::Stage1Error;
use crate::model::POSE_CHANNELS;
use anyhow::{Context, Result};
use burn::data::dataloader::batcher::Batcher;
use burn::data::dataset::Dataset;
use burn::prelude::*;
use burn::tensor::TensorData;
use image::GrayImage;
use serde::Deserialize;
use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};

/// One source/target pair listed in a manifest.
///
/// Keypoints are `[y, x]` in `load_size` pixel coordinates; a negative
/// coordinate marks a missing joint.
#[derive(Debug, Clone, Deserialize)]
pub struct PairItem {
    pub source_parsing: PathBuf,
    #[serde(default)]
    pub target_parsing: Option<PathBuf>,
    pub target_keypoints: Vec<[f32; 2]>,
}

/// Settings for decoding label maps and rendering pose heatmaps.
#[derive(Debug, Clone)]
pub struct DataConfig {
    pub parsing_label_nc: usize,
    pub load_size: u32,
    pub pose_sigma: f32,
}

/// A batch of one-hot parsing maps and pose heatmaps.
#[derive(Clone, Debug)]
pub struct Stage1Batch<B: Backend> {
    pub source_parsing: Tensor<B, 4>,
    pub target_pose: Tensor<B, 4>,
    /// Absent for inference-only manifests.
    pub target_parsing: Option<Tensor<B, 4>>,
}

/// Load a JSON manifest, resolving relative paths against its directory.
pub fn load_manifest(path: &Path) -> Result<Vec<PairItem>> {
    let file = File::open(path).with_context(|| format!("failed to open {}", path.display()))?;
    let mut items: Vec<PairItem> = serde_json::from_reader(BufReader::new(file))
        .with_context(|| format!("failed to parse manifest {}", path.display()))?;

    let root = path.parent().unwrap_or_else(|| Path::new("."));
    for item in &mut items {
        item.source_parsing = root.join(&item.source_parsing);
        if let Some(target) = item.target_parsing.as_mut() {
            *target = root.join(&*target);
        }
        if item.target_keypoints.len() != POSE_CHANNELS {
            return Err(Stage1Error::Data(format!(
                "{} lists {} keypoints, expected {POSE_CHANNELS}",
                item.source_parsing.display(),
                item.target_keypoints.len()
            ))
            .into());
        }
    }
    Ok(items)
}

#[derive(Clone, Debug)]
pub struct Stage1Dataset {
    items: Vec<PairItem>,
}

impl Stage1Dataset {
    pub fn new(items: Vec<PairItem>) -> Self {
        Self { items }
    }

    pub fn from_manifest(path: &Path) -> Result<Self> {
        Ok(Self::new(load_manifest(path)?))
    }
}

impl Dataset<PairItem> for Stage1Dataset {
    fn get(&self, index: usize) -> Option<PairItem> {
        self.items.get(index).cloned()
    }

    fn len(&self) -> usize {
        self.items.len()
    }
}

#[derive(Clone, Debug)]
pub struct Stage1Batcher {
    config: DataConfig,
}

impl Stage1Batcher {
    pub fn new(config: DataConfig) -> Self {
        Self { config }
    }
}

impl<B: Backend> Batcher<B, PairItem, Stage1Batch<B>> for Stage1Batcher {
    fn batch(&self, items: Vec<PairItem>, device: &B::Device) -> Stage1Batch<B> {
        build_batch::<B>(&items, &self.config, device).expect("failed to build batch")
    }
}

/// Decode label maps and render heatmaps for a list of pairs.
pub fn build_batch<B: Backend>(
    items: &[PairItem],
    config: &DataConfig,
    device: &B::Device,
) -> Result<Stage1Batch<B>> {
    let batch_size = items.len();
    let size = config.load_size as usize;
    let nc = config.parsing_label_nc;
    let with_targets = items.iter().all(|item| item.target_parsing.is_some());

    let mut source = Vec::with_capacity(batch_size * nc * size * size);
    let mut pose = Vec::with_capacity(batch_size * POSE_CHANNELS * size * size);
    let mut target = Vec::new();

    for item in items {
        let labels = load_label_map(&item.source_parsing, config.load_size)?;
        source.append(&mut one_hot_labels(&labels, nc).with_context(|| {
            format!("bad labels in {}", item.source_parsing.display())
        })?);
        pose.append(&mut pose_heatmaps(
            &item.target_keypoints,
            config.load_size,
            config.pose_sigma,
        ));
        if let (true, Some(path)) = (with_targets, &item.target_parsing) {
            let labels = load_label_map(path, config.load_size)?;
            target.append(
                &mut one_hot_labels(&labels, nc)
                    .with_context(|| format!("bad labels in {}", path.display()))?,
            );
        }
    }

    let source_parsing =
        Tensor::<B, 4>::from_data(TensorData::new(source, [batch_size, nc, size, size]), device);
    let target_pose = Tensor::<B, 4>::from_data(
        TensorData::new(pose, [batch_size, POSE_CHANNELS, size, size]),
        device,
    );
    let target_parsing = with_targets.then(|| {
        Tensor::<B, 4>::from_data(TensorData::new(target, [batch_size, nc, size, size]), device)
    });

    Ok(Stage1Batch {
        source_parsing,
        target_pose,
        target_parsing,
    })
}

/// Read a grayscale label-index PNG, resized with nearest-neighbour to `size`.
fn load_label_map(path: &Path, size: u32) -> Result<GrayImage> {
    let img = image::open(path)
        .with_context(|| format!("failed to open {}", path.display()))?
        .to_luma8();
    if img.width() == size && img.height() == size {
        return Ok(img);
    }
    Ok(image::imageops::resize(
        &img,
        size,
        size,
        image::imageops::FilterType::Nearest,
    ))
}

/// Expand a label-index image to CHW one-hot floats.
pub fn one_hot_labels(labels: &GrayImage, nc: usize) -> crate::error::Result<Vec<f32>> {
    let (width, height) = labels.dimensions();
    let hw = (width * height) as usize;
    let mut out = vec![0.0f32; nc * hw];

    for (idx, pixel) in labels.pixels().enumerate() {
        let label = pixel.0[0] as usize;
        if label >= nc {
            return Err(Stage1Error::Data(format!(
                "label {label} out of range for {nc} classes"
            )));
        }
        out[label * hw + idx] = 1.0;
    }
    Ok(out)
}

/// One Gaussian heatmap per keypoint, all-zero for missing joints.
pub fn pose_heatmaps(keypoints: &[[f32; 2]], size: u32, sigma: f32) -> Vec<f32> {
    let size = size as usize;
    let hw = size * size;
    let mut out = vec![0.0f32; POSE_CHANNELS * hw];
    let denom = 2.0 * sigma * sigma;

    for (channel, &[y0, x0]) in keypoints.iter().take(POSE_CHANNELS).enumerate() {
        if y0 < 0.0 || x0 < 0.0 {
            continue;
        }
        let base = channel * hw;
        for y in 0..size {
            for x in 0..size {
                let dy = y as f32 - y0;
                let dx = x as f32 - x0;
                out[base + y * size + x] = (-(dy * dy + dx * dx) / denom).exp();
            }
        }
    }
    out
}
