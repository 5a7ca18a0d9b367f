use crate::data::PairItem;
use anyhow::{Context, Result};
use burn::prelude::*;
use image::{GrayImage, Luma, Rgb, RgbImage};
use std::path::Path;

/// Convert BCHW parsing logits to one label-index image per sample (argmax over channels).
pub fn tensor_to_label_maps<B: Backend>(tensor: Tensor<B, 4>) -> Result<Vec<GrayImage>> {
    let data = tensor.to_data().convert::<f32>();
    let shape = data.shape.clone();
    if shape.len() != 4 {
        return Err(anyhow::anyhow!(
            "expected rank-4 tensor for label maps, got shape {shape:?}"
        ));
    }

    let batch = shape[0];
    let channels = shape[1];
    let height = shape[2];
    let width = shape[3];

    if channels == 0 || channels > 256 {
        return Err(anyhow::anyhow!(
            "cannot store {channels} classes in an 8-bit label map"
        ));
    }

    let values = data
        .to_vec::<f32>()
        .context("failed to read tensor data as f32")?;
    let hw = height * width;
    let mut maps = Vec::with_capacity(batch);

    for b in 0..batch {
        let base = b * channels * hw;
        let mut img = GrayImage::new(width as u32, height as u32);
        for y in 0..height {
            for x in 0..width {
                let idx = base + y * width + x;
                let mut best = 0;
                for c in 1..channels {
                    if values[idx + c * hw] > values[idx + best * hw] {
                        best = c;
                    }
                }
                img.put_pixel(x as u32, y as u32, Luma([best as u8]));
            }
        }
        maps.push(img);
    }

    Ok(maps)
}

/// Bit-interleaved label palette; label 0 is black.
pub fn label_color(label: u8) -> Rgb<u8> {
    let mut id = label;
    let (mut r, mut g, mut b) = (0u8, 0u8, 0u8);
    for shift in (0..8).rev().take(3) {
        r |= (id & 1) << shift;
        g |= ((id >> 1) & 1) << shift;
        b |= ((id >> 2) & 1) << shift;
        id >>= 3;
    }
    Rgb([r, g, b])
}

/// Render a label-index map with [`label_color`] for inspection.
pub fn colorize_label_map(labels: &GrayImage) -> RgbImage {
    let mut img = RgbImage::new(labels.width(), labels.height());
    for (x, y, pixel) in labels.enumerate_pixels() {
        img.put_pixel(x, y, label_color(pixel.0[0]));
    }
    img
}

/// File stem for the prediction of manifest entry `index`.
///
/// Led by the index, since a source map recurs across pairs; the target stem is
/// appended when the manifest names one.
pub fn pair_output_stem(index: usize, item: &PairItem) -> String {
    let stem = |path: &Path| {
        path.file_stem()
            .map(|stem| stem.to_string_lossy().into_owned())
            .unwrap_or_else(|| "sample".to_string())
    };
    match &item.target_parsing {
        Some(target) => format!("{index:05}_{}_to_{}", stem(&item.source_parsing), stem(target)),
        None => format!("{index:05}_{}", stem(&item.source_parsing)),
    }
}

pub fn save_label_map(labels: &GrayImage, path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    labels
        .save(path)
        .with_context(|| format!("failed to save {}", path.display()))
}
