use crate::error::{Result, Stage1Error};
use crate::model::{DiscriminatorOutput, LossConfig, ModelConfig};
use burn::nn::loss::BinaryCrossEntropyLossConfig;
use burn::prelude::*;
use burn::tensor::activation::log_softmax;

/// Weighted loss terms for the Stage I parsing GAN.
///
/// Every method is stateless; the criterion only carries the weights and the
/// discriminator layout needed to normalize feature matching.
#[derive(Clone, Debug)]
pub struct Stage1Criterion {
    config: LossConfig,
    parsing_label_nc: usize,
    num_d: usize,
    n_layers_d: usize,
}

impl Stage1Criterion {
    pub fn new(config: LossConfig, parsing_label_nc: usize, num_d: usize, n_layers_d: usize) -> Self {
        Self {
            config,
            parsing_label_nc,
            num_d,
            n_layers_d,
        }
    }

    pub fn from_config(model: &ModelConfig, loss: &LossConfig) -> Self {
        Self::new(loss.clone(), model.parsing_label_nc, model.num_d, model.n_layers_d)
    }

    pub fn config(&self) -> &LossConfig {
        &self.config
    }

    /// Zero placeholder for a disabled term, on the same device as the live terms.
    pub fn zero<B: Backend>(device: &B::Device) -> Tensor<B, 1> {
        Tensor::zeros([1], device)
    }

    /// Adversarial loss against an all-real or all-fake target.
    ///
    /// Multi-scale outputs contribute one term per scale, computed on the last
    /// (prediction) entry of each scale and summed.
    pub fn gan_loss<B: Backend>(
        &self,
        output: &DiscriminatorOutput<B>,
        target_is_real: bool,
    ) -> Tensor<B, 1> {
        output
            .predictions()
            .into_iter()
            .map(|prediction| self.prediction_loss(prediction, target_is_real))
            .reduce(|acc, loss| acc.add(loss))
            .unwrap_or_else(|| Self::zero(&output.device().unwrap_or_default()))
    }

    fn prediction_loss<B: Backend>(&self, prediction: Tensor<B, 4>, target_is_real: bool) -> Tensor<B, 1> {
        if self.config.lsgan {
            let target = if target_is_real { 1.0 } else { 0.0 };
            return prediction.sub_scalar(target).square().mean();
        }

        let device = prediction.device();
        let [batch, channels, height, width] = prediction.dims();
        let logits = prediction.reshape([batch, channels * height * width]);
        let targets = if target_is_real {
            Tensor::<B, 2, Int>::ones(logits.dims(), &device)
        } else {
            Tensor::<B, 2, Int>::zeros(logits.dims(), &device)
        };
        BinaryCrossEntropyLossConfig::new()
            .with_logits(true)
            .init(&device)
            .forward(logits, targets)
    }

    /// L1 distance between discriminator activations of fake and real inputs.
    ///
    /// The real branch is detached. The prediction layer of each scale is skipped;
    /// each remaining layer is weighted by `4 / (n_layers_d + 1)`, each scale by
    /// `1 / num_d`, and the sum by `lambda_feat`.
    pub fn feature_matching<B: Backend>(
        &self,
        fake: &DiscriminatorOutput<B>,
        real: &DiscriminatorOutput<B>,
    ) -> Result<Tensor<B, 1>> {
        let (fake_scales, real_scales) = match (fake, real) {
            (DiscriminatorOutput::MultiScale(fake), DiscriminatorOutput::MultiScale(real)) => {
                (fake, real)
            }
            _ => {
                return Err(Stage1Error::Configuration(
                    "feature matching needs multi-scale discriminator features".to_string(),
                ))
            }
        };
        if fake_scales.len() != self.num_d {
            return Err(Stage1Error::shape(
                "feature matching scales",
                &[self.num_d],
                &[fake_scales.len()],
            ));
        }
        if real_scales.len() != self.num_d {
            return Err(Stage1Error::shape(
                "feature matching scales",
                &[self.num_d],
                &[real_scales.len()],
            ));
        }

        let feat_weight = 4.0 / (self.n_layers_d as f64 + 1.0);
        let d_weight = 1.0 / self.num_d as f64;
        let weight = d_weight * feat_weight * self.config.lambda_feat;

        let mut loss = Self::zero(&fake.device().unwrap_or_default());
        for (fake_layers, real_layers) in fake_scales.iter().zip(real_scales) {
            if fake_layers.is_empty() || fake_layers.len() != real_layers.len() {
                return Err(Stage1Error::shape(
                    "feature matching layers",
                    &[real_layers.len()],
                    &[fake_layers.len()],
                ));
            }
            for (fake_feat, real_feat) in fake_layers.iter().zip(real_layers).take(fake_layers.len() - 1) {
                if fake_feat.dims() != real_feat.dims() {
                    return Err(Stage1Error::shape(
                        "feature matching activation",
                        &real_feat.dims(),
                        &fake_feat.dims(),
                    ));
                }
                let diff = fake_feat.clone().sub(real_feat.clone().detach()).abs().mean();
                loss = loss.add(diff.mul_scalar(weight));
            }
        }
        Ok(loss)
    }

    /// Mean absolute error between generated and target parsing maps, times `lambda_l1`.
    pub fn l1_loss<B: Backend>(&self, fake: Tensor<B, 4>, target: Tensor<B, 4>) -> Result<Tensor<B, 1>> {
        if fake.dims() != target.dims() {
            return Err(Stage1Error::shape("l1 loss", &target.dims(), &fake.dims()));
        }
        Ok(fake.sub(target).abs().mean().mul_scalar(self.config.lambda_l1))
    }

    /// Per-pixel cross-entropy of the generated logits against a one-hot parsing map.
    pub fn parsing_loss<B: Backend>(&self, fake: Tensor<B, 4>, target: Tensor<B, 4>) -> Result<Tensor<B, 1>> {
        let [batch, channels, height, width] = fake.dims();
        if channels != self.parsing_label_nc {
            return Err(Stage1Error::shape(
                "parsing loss logits",
                &[batch, self.parsing_label_nc, height, width],
                &fake.dims(),
            ));
        }
        if target.dims() != fake.dims() {
            return Err(Stage1Error::shape("parsing loss target", &fake.dims(), &target.dims()));
        }

        let log_probs = log_softmax(fake, 1);
        Ok(log_probs
            .mul(target)
            .sum_dim(1)
            .mean()
            .neg()
            .mul_scalar(self.config.lambda_parsing))
    }
}
