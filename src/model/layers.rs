use burn::nn::conv::{Conv2d, Conv2dConfig};
use burn::nn::{BatchNorm, BatchNormConfig, InstanceNorm, InstanceNormConfig, PaddingConfig2d};
use burn::prelude::*;
use serde::{Deserialize, Serialize};

/// Normalization used after every hidden convolution.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum NormKind {
    Batch,
    Instance,
}

/// Normalization layer wrapper shared by the generator and discriminator blocks.
#[derive(Module, Debug)]
pub struct NormLayer<B: Backend> {
    batch: Option<BatchNorm<B>>,
    instance: Option<InstanceNorm<B>>,
}

impl<B: Backend> NormLayer<B> {
    pub fn new(kind: NormKind, num_channels: usize, device: &B::Device) -> Self {
        match kind {
            NormKind::Batch => Self {
                batch: Some(BatchNormConfig::new(num_channels).init(device)),
                instance: None,
            },
            NormKind::Instance => Self {
                batch: None,
                instance: Some(InstanceNormConfig::new(num_channels).init(device)),
            },
        }
    }

    pub fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        match (&self.batch, &self.instance) {
            (Some(batch), _) => batch.forward(x),
            (_, Some(instance)) => instance.forward(x),
            _ => x,
        }
    }
}

/// 4x4 convolution with explicit symmetric padding.
pub fn conv4<B: Backend>(
    in_channels: usize,
    out_channels: usize,
    stride: usize,
    padding: usize,
    bias: bool,
    device: &B::Device,
) -> Conv2d<B> {
    Conv2dConfig::new([in_channels, out_channels], [4, 4])
        .with_stride([stride, stride])
        .with_padding(PaddingConfig2d::Explicit(padding, padding))
        .with_bias(bias)
        .init(device)
}

/// Spatial output size of a convolution.
pub fn conv_out(input: usize, kernel: usize, stride: usize, padding: usize) -> usize {
    (input + 2 * padding - (kernel - 1) - 1) / stride + 1
}
