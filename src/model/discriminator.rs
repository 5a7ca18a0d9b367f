use crate::model::layers::{conv4, NormKind, NormLayer};
use crate::model::{DiscriminatorOutput, ParsingDiscriminator};
use burn::nn::conv::Conv2d;
use burn::nn::pool::{AvgPool2d, AvgPool2dConfig};
use burn::nn::PaddingConfig2d;
use burn::prelude::*;
use burn::tensor::activation::leaky_relu;

const MAX_WIDTH: usize = 512;
const PADDING: usize = 2;

/// Configuration for the multi-scale PatchGAN discriminator.
#[derive(Config, Debug)]
pub struct DiscriminatorConfig {
    pub input_channels: usize,
    #[config(default = 64)]
    pub ndf: usize,
    #[config(default = 3)]
    pub n_layers: usize,
    #[config(default = 2)]
    pub num_d: usize,
    /// Return every hidden activation per scale, not only the prediction map.
    #[config(default = true)]
    pub intermediate_features: bool,
    #[config(default = "NormKind::Instance")]
    pub norm: NormKind,
}

/// One PatchGAN scale: `n_layers + 2` convolutions ending in a 1-channel map.
#[derive(Module, Debug)]
pub struct NLayerDiscriminator<B: Backend> {
    convs: Vec<Conv2d<B>>,
    norms: Vec<NormLayer<B>>,
}

/// `num_d` PatchGAN discriminators applied to progressively downsampled inputs.
#[derive(Module, Debug)]
pub struct Discriminator<B: Backend> {
    scales: Vec<NLayerDiscriminator<B>>,
    downsample: AvgPool2d,
    #[module(ignore)]
    intermediate_features: bool,
}

impl DiscriminatorConfig {
    /// Initialize every scale on the given device.
    pub fn init<B: Backend>(&self, device: &B::Device) -> Discriminator<B> {
        let scales = (0..self.num_d).map(|_| self.init_scale(device)).collect();
        let downsample = AvgPool2dConfig::new([3, 3])
            .with_strides([2, 2])
            .with_padding(PaddingConfig2d::Explicit(1, 1))
            .with_count_include_pad(false)
            .init();

        Discriminator {
            scales,
            downsample,
            intermediate_features: self.intermediate_features,
        }
    }

    fn init_scale<B: Backend>(&self, device: &B::Device) -> NLayerDiscriminator<B> {
        let mut convs = Vec::with_capacity(self.n_layers + 2);
        let mut norms = Vec::with_capacity(self.n_layers);

        let mut width = self.ndf;
        convs.push(conv4(self.input_channels, width, 2, PADDING, true, device));
        for layer in 1..=self.n_layers {
            let previous = width;
            width = (width * 2).min(MAX_WIDTH);
            let stride = if layer == self.n_layers { 1 } else { 2 };
            convs.push(conv4(previous, width, stride, PADDING, true, device));
            norms.push(NormLayer::new(self.norm, width, device));
        }
        convs.push(conv4(width, 1, 1, PADDING, true, device));

        NLayerDiscriminator { convs, norms }
    }
}

impl<B: Backend> NLayerDiscriminator<B> {
    /// Every activation in order; the last entry is the real/fake prediction map.
    pub fn forward(&self, input: Tensor<B, 4>) -> Vec<Tensor<B, 4>> {
        let mut features = Vec::with_capacity(self.convs.len());
        let mut x = leaky_relu(self.convs[0].forward(input), 0.2);
        features.push(x.clone());
        for (conv, norm) in self.convs[1..self.convs.len() - 1].iter().zip(&self.norms) {
            x = leaky_relu(norm.forward(conv.forward(x)), 0.2);
            features.push(x.clone());
        }
        if let Some(last) = self.convs.last() {
            features.push(last.forward(x));
        }
        features
    }
}

impl<B: Backend> Discriminator<B> {
    /// Forward pass over all scales, full resolution first.
    pub fn forward(&self, input: Tensor<B, 4>) -> DiscriminatorOutput<B> {
        let mut x = input;
        let mut outputs = Vec::with_capacity(self.scales.len());
        for (idx, scale) in self.scales.iter().enumerate() {
            let mut features = scale.forward(x.clone());
            if !self.intermediate_features {
                features = features.split_off(features.len() - 1);
            }
            outputs.push(features);
            if idx + 1 < self.scales.len() {
                x = self.downsample.forward(x);
            }
        }
        DiscriminatorOutput::MultiScale(outputs)
    }

    pub fn num_scales(&self) -> usize {
        self.scales.len()
    }
}

impl<B: Backend> ParsingDiscriminator<B> for Discriminator<B> {
    fn forward(&self, input: Tensor<B, 4>) -> DiscriminatorOutput<B> {
        Discriminator::forward(self, input)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::NdArray;
    use burn::tensor::Distribution;

    type TestBackend = NdArray<f32>;

    fn input(device: &<TestBackend as Backend>::Device) -> Tensor<TestBackend, 4> {
        Tensor::random([2, 6, 16, 16], Distribution::Default, device)
    }

    #[test]
    fn returns_every_layer_per_scale() {
        let device = Default::default();
        let discriminator = DiscriminatorConfig::new(6)
            .with_ndf(4)
            .with_n_layers(2)
            .with_num_d(2)
            .init::<TestBackend>(&device);

        let DiscriminatorOutput::MultiScale(scales) = discriminator.forward(input(&device)) else {
            panic!("expected multi-scale output");
        };
        assert_eq!(scales.len(), 2);
        for features in &scales {
            assert_eq!(features.len(), 4);
            assert_eq!(features.last().unwrap().dims()[1], 1);
        }
        assert_eq!(scales[0][3].dims(), [2, 1, 7, 7]);
        assert_eq!(scales[1][3].dims(), [2, 1, 5, 5]);
    }

    #[test]
    fn prediction_only_without_intermediate_features() {
        let device = Default::default();
        let discriminator = DiscriminatorConfig::new(6)
            .with_ndf(4)
            .with_n_layers(2)
            .with_num_d(3)
            .with_intermediate_features(false)
            .init::<TestBackend>(&device);

        let output = discriminator.forward(input(&device));
        let DiscriminatorOutput::MultiScale(scales) = &output else {
            panic!("expected multi-scale output");
        };
        assert_eq!(scales.len(), 3);
        assert!(scales.iter().all(|features| features.len() == 1));
        assert_eq!(output.predictions().len(), 3);
    }

    #[test]
    fn width_is_capped() {
        let device = Default::default();
        let discriminator = DiscriminatorConfig::new(2)
            .with_ndf(300)
            .with_n_layers(1)
            .with_num_d(1)
            .init::<TestBackend>(&device);
        let x = Tensor::<TestBackend, 4>::random([1, 2, 8, 8], Distribution::Default, &device);

        let DiscriminatorOutput::MultiScale(scales) = discriminator.forward(x) else {
            panic!("expected multi-scale output");
        };
        assert_eq!(scales[0][1].dims()[1], MAX_WIDTH);
    }
}
