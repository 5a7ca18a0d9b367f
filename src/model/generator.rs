use crate::model::layers::{conv4, NormKind, NormLayer};
use burn::nn::conv::{Conv2d, ConvTranspose2d, ConvTranspose2dConfig};
use burn::prelude::*;
use burn::tensor::activation::{leaky_relu, relu};

/// Configuration for the U-Net parsing generator.
#[derive(Config, Debug)]
pub struct GeneratorConfig {
    pub input_channels: usize,
    pub output_channels: usize,
    #[config(default = 64)]
    pub ngf: usize,
    #[config(default = 4)]
    pub n_downsampling: usize,
    #[config(default = "NormKind::Instance")]
    pub norm: NormKind,
}

/// U-Net generator mapping `source parsing + target pose` to target parsing logits.
#[derive(Module, Debug)]
pub struct Generator<B: Backend> {
    enc_convs: Vec<Conv2d<B>>,
    enc_norms: Vec<NormLayer<B>>,
    dec_convs: Vec<ConvTranspose2d<B>>,
    dec_norms: Vec<NormLayer<B>>,
}

impl GeneratorConfig {
    /// Encoder widths, doubling per level and capped at `8 * ngf`.
    pub fn encoder_channels(&self) -> Vec<usize> {
        (0..self.n_downsampling)
            .map(|level| self.ngf * (1usize << level.min(3)))
            .collect()
    }

    /// Initialize generator layers on the given device.
    pub fn init<B: Backend>(&self, device: &B::Device) -> Generator<B> {
        let channels = self.encoder_channels();
        let depth = channels.len();

        let mut enc_convs = Vec::with_capacity(depth);
        let mut enc_norms = Vec::with_capacity(depth.saturating_sub(1));
        enc_convs.push(conv4(self.input_channels, channels[0], 2, 1, true, device));
        for level in 1..depth {
            enc_convs.push(conv4(channels[level - 1], channels[level], 2, 1, false, device));
            enc_norms.push(NormLayer::new(self.norm, channels[level], device));
        }

        let mut dec_convs = Vec::with_capacity(depth);
        let mut dec_norms = Vec::with_capacity(depth.saturating_sub(1));
        for idx in 0..depth {
            let in_channels = if idx == 0 {
                channels[depth - 1]
            } else {
                channels[depth - 1 - idx] * 2
            };
            if idx == depth - 1 {
                dec_convs.push(dec_conv(in_channels, self.output_channels, true, device));
            } else {
                let out_channels = channels[depth - 2 - idx];
                dec_convs.push(dec_conv(in_channels, out_channels, false, device));
                dec_norms.push(NormLayer::new(self.norm, out_channels, device));
            }
        }

        Generator {
            enc_convs,
            enc_norms,
            dec_convs,
            dec_norms,
        }
    }
}

impl<B: Backend> Generator<B> {
    /// Forward pass returning unnormalized per-class parsing logits.
    pub fn forward(&self, input: Tensor<B, 4>) -> Tensor<B, 4> {
        let enc_layers = self.encode(input);
        self.decode(&enc_layers)
    }

    fn encode(&self, input: Tensor<B, 4>) -> Vec<Tensor<B, 4>> {
        let mut layers = Vec::with_capacity(self.enc_convs.len());
        let mut x = self.enc_convs[0].forward(input);
        layers.push(x.clone());
        for idx in 1..self.enc_convs.len() {
            x = leaky_relu(x, 0.2);
            x = self.enc_convs[idx].forward(x);
            x = self.enc_norms[idx - 1].forward(x);
            layers.push(x.clone());
        }
        layers
    }

    fn decode(&self, enc_layers: &[Tensor<B, 4>]) -> Tensor<B, 4> {
        let depth = self.dec_convs.len();
        let mut x = enc_layers[depth - 1].clone();
        for idx in 0..depth {
            x = relu(x);
            x = self.dec_convs[idx].forward(x);
            if idx != depth - 1 {
                x = self.dec_norms[idx].forward(x);
                let skip = enc_layers[depth - 2 - idx].clone();
                x = Tensor::cat(vec![x, skip], 1);
            }
        }
        x
    }
}

fn dec_conv<B: Backend>(
    in_channels: usize,
    out_channels: usize,
    bias: bool,
    device: &B::Device,
) -> ConvTranspose2d<B> {
    ConvTranspose2dConfig::new([in_channels, out_channels], [4, 4])
        .with_stride([2, 2])
        .with_padding([1, 1])
        .with_bias(bias)
        .init(device)
}
