pub mod discriminator;
pub mod generator;
pub mod layers;
pub mod losses;

use crate::error::Stage1Error;
use crate::pool::FakePool;
use burn::prelude::*;
use serde::Serialize;

pub use discriminator::{Discriminator, DiscriminatorConfig};
pub use generator::{Generator, GeneratorConfig};
pub use layers::NormKind;
pub use losses::Stage1Criterion;

/// Keypoint heatmap channels appended to the source parsing map.
pub const POSE_CHANNELS: usize = 18;

/// Names of the loss bundle entries, in bundle order.
pub const LOSS_NAMES: [&str; 6] = ["G_GAN", "G_GAN_Feat", "G_L1", "G_parsing", "D_real", "D_fake"];

/// Hyperparameters for the generator and discriminator.
#[derive(Config, Debug)]
pub struct ModelConfig {
    #[config(default = 20)]
    pub parsing_label_nc: usize,
    #[config(default = 64)]
    pub ngf: usize,
    #[config(default = 4)]
    pub n_downsample_g: usize,
    #[config(default = 64)]
    pub ndf: usize,
    #[config(default = 3)]
    pub n_layers_d: usize,
    #[config(default = 2)]
    pub num_d: usize,
    #[config(default = "NormKind::Instance")]
    pub norm: NormKind,
}

/// Toggles and weights for each loss term used during training.
#[derive(Config, Debug)]
pub struct LossConfig {
    #[config(default = true)]
    pub gan_loss: bool,
    /// Least-squares adversarial loss instead of binary cross-entropy.
    #[config(default = true)]
    pub lsgan: bool,
    #[config(default = true)]
    pub gan_feat_loss: bool,
    #[config(default = true)]
    pub l1_loss: bool,
    #[config(default = true)]
    pub parsing_loss: bool,
    #[config(default = 10.0)]
    pub lambda_l1: f64,
    #[config(default = 1.0)]
    pub lambda_parsing: f64,
    #[config(default = 10.0)]
    pub lambda_feat: f64,
}

impl ModelConfig {
    pub fn generator_input_channels(&self) -> usize {
        self.parsing_label_nc + POSE_CHANNELS
    }

    /// Conditioning channels plus one parsing map.
    pub fn discriminator_input_channels(&self) -> usize {
        self.generator_input_channels() + self.parsing_label_nc
    }

    pub fn generator_config(&self) -> GeneratorConfig {
        GeneratorConfig::new(self.generator_input_channels(), self.parsing_label_nc)
            .with_ngf(self.ngf)
            .with_n_downsampling(self.n_downsample_g)
            .with_norm(self.norm)
    }

    pub fn discriminator_config(&self, intermediate_features: bool) -> DiscriminatorConfig {
        DiscriminatorConfig::new(self.discriminator_input_channels())
            .with_ndf(self.ndf)
            .with_n_layers(self.n_layers_d)
            .with_num_d(self.num_d)
            .with_intermediate_features(intermediate_features)
            .with_norm(self.norm)
    }

    pub fn init_generator<B: Backend>(&self, device: &B::Device) -> Generator<B> {
        self.generator_config().init(device)
    }

    pub fn init_discriminator<B: Backend>(
        &self,
        intermediate_features: bool,
        device: &B::Device,
    ) -> Discriminator<B> {
        self.discriminator_config(intermediate_features).init(device)
    }
}

/// Generator seam: conditioning tensor in, parsing logits out.
pub trait ParsingGenerator<B: Backend> {
    fn forward(&self, input: Tensor<B, 4>) -> Tensor<B, 4>;
}

/// Discriminator seam: conditioning concatenated with a parsing map in.
pub trait ParsingDiscriminator<B: Backend> {
    fn forward(&self, input: Tensor<B, 4>) -> DiscriminatorOutput<B>;
}

impl<B: Backend> ParsingGenerator<B> for Generator<B> {
    fn forward(&self, input: Tensor<B, 4>) -> Tensor<B, 4> {
        Generator::forward(self, input)
    }
}

/// Raw discriminator output.
#[derive(Clone, Debug)]
pub enum DiscriminatorOutput<B: Backend> {
    /// A single real/fake prediction map.
    Single(Tensor<B, 4>),
    /// Per scale, every activation in order; the last one is the prediction map.
    MultiScale(Vec<Vec<Tensor<B, 4>>>),
}

impl<B: Backend> DiscriminatorOutput<B> {
    /// Final prediction map of every scale.
    pub fn predictions(&self) -> Vec<Tensor<B, 4>> {
        match self {
            DiscriminatorOutput::Single(prediction) => vec![prediction.clone()],
            DiscriminatorOutput::MultiScale(scales) => {
                scales.iter().filter_map(|scale| scale.last().cloned()).collect()
            }
        }
    }

    pub fn device(&self) -> Option<B::Device> {
        match self {
            DiscriminatorOutput::Single(prediction) => Some(prediction.device()),
            DiscriminatorOutput::MultiScale(scales) => scales
                .iter()
                .flat_map(|scale| scale.iter())
                .next()
                .map(|tensor| tensor.device()),
        }
    }
}

/// The six loss terms of one training step, disabled terms as explicit zeros.
#[derive(Clone, Debug)]
pub struct Stage1Losses<B: Backend> {
    pub g_gan: Tensor<B, 1>,
    pub g_gan_feat: Tensor<B, 1>,
    pub g_l1: Tensor<B, 1>,
    pub g_parsing: Tensor<B, 1>,
    pub d_real: Tensor<B, 1>,
    pub d_fake: Tensor<B, 1>,
}

/// Host-side copy of a loss bundle for logging.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize)]
pub struct LossScalars {
    pub g_gan: f64,
    pub g_gan_feat: f64,
    pub g_l1: f64,
    pub g_parsing: f64,
    pub d_real: f64,
    pub d_fake: f64,
}

impl<B: Backend> Stage1Losses<B> {
    /// Objective minimized by the generator optimizer.
    pub fn generator_loss(&self) -> Tensor<B, 1> {
        self.g_gan
            .clone()
            .add(self.g_gan_feat.clone())
            .add(self.g_l1.clone())
            .add(self.g_parsing.clone())
    }

    /// Objective minimized by the discriminator optimizer.
    pub fn discriminator_loss(&self) -> Tensor<B, 1> {
        self.d_fake.clone().add(self.d_real.clone()).mul_scalar(0.5)
    }

    /// Terms in `LOSS_NAMES` order.
    pub fn into_ordered(self) -> [Tensor<B, 1>; 6] {
        [
            self.g_gan,
            self.g_gan_feat,
            self.g_l1,
            self.g_parsing,
            self.d_real,
            self.d_fake,
        ]
    }

    pub fn scalars(&self) -> LossScalars {
        let value = |tensor: &Tensor<B, 1>| tensor.clone().into_scalar().elem::<f64>();
        LossScalars {
            g_gan: value(&self.g_gan),
            g_gan_feat: value(&self.g_gan_feat),
            g_l1: value(&self.g_l1),
            g_parsing: value(&self.g_parsing),
            d_real: value(&self.d_real),
            d_fake: value(&self.d_fake),
        }
    }
}

impl LossScalars {
    /// `(name, value)` pairs in `LOSS_NAMES` order.
    pub fn named(&self) -> [(&'static str, f64); 6] {
        let values = [
            self.g_gan,
            self.g_gan_feat,
            self.g_l1,
            self.g_parsing,
            self.d_real,
            self.d_fake,
        ];
        let mut named = [("", 0.0); 6];
        for (slot, (name, value)) in named.iter_mut().zip(LOSS_NAMES.iter().zip(values)) {
            *slot = (*name, value);
        }
        named
    }
}

/// Discriminator-side losses of one adversarial step.
#[derive(Clone, Debug)]
pub struct GanLosses<B: Backend> {
    pub d_real: Tensor<B, 1>,
    pub d_fake: Tensor<B, 1>,
    pub g_gan: Tensor<B, 1>,
    pub g_gan_feat: Tensor<B, 1>,
}

/// Losses of a training forward pass, plus the generated map when requested.
#[derive(Clone, Debug)]
pub struct Stage1Output<B: Backend> {
    pub losses: Stage1Losses<B>,
    pub fake_parsing: Option<Tensor<B, 4>>,
}

/// Build the generator input: source parsing map followed by the target pose heatmaps.
pub fn encode_input<B: Backend>(
    source_parsing: Tensor<B, 4>,
    target_pose: Tensor<B, 4>,
    parsing_label_nc: usize,
) -> crate::Result<Tensor<B, 4>> {
    let [batch, channels, height, width] = source_parsing.dims();
    if channels != parsing_label_nc {
        return Err(Stage1Error::shape(
            "source parsing",
            &[batch, parsing_label_nc, height, width],
            &source_parsing.dims(),
        ));
    }
    if target_pose.dims() != [batch, POSE_CHANNELS, height, width] {
        return Err(Stage1Error::shape(
            "target pose",
            &[batch, POSE_CHANNELS, height, width],
            &target_pose.dims(),
        ));
    }
    Ok(Tensor::cat(vec![source_parsing, target_pose], 1))
}

/// Run the discriminator on `conditioning ++ candidate` with gradients cut at the input.
///
/// When a pool is given, the detached input is swapped through it first.
pub fn discriminate<B: Backend, D: ParsingDiscriminator<B>>(
    discriminator: &D,
    conditioning: Tensor<B, 4>,
    candidate: Tensor<B, 4>,
    pool: Option<&mut FakePool<B>>,
) -> DiscriminatorOutput<B> {
    let input = Tensor::cat(vec![conditioning, candidate], 1).detach();
    let input = match pool {
        Some(pool) => pool.query(input),
        None => input,
    };
    discriminator.forward(input)
}

/// Real, fake and generator adversarial losses plus discriminator feature matching.
pub fn get_gan_losses<B: Backend, D: ParsingDiscriminator<B>>(
    discriminator: &D,
    pool: &mut FakePool<B>,
    criterion: &Stage1Criterion,
    conditioning: Tensor<B, 4>,
    real_parsing: Tensor<B, 4>,
    fake_parsing: Tensor<B, 4>,
) -> crate::Result<GanLosses<B>> {
    if real_parsing.dims() != fake_parsing.dims() {
        return Err(Stage1Error::shape(
            "discriminator candidates",
            &real_parsing.dims(),
            &fake_parsing.dims(),
        ));
    }
    let device = fake_parsing.device();

    let pred_fake_pool = discriminate(
        discriminator,
        conditioning.clone(),
        fake_parsing.clone(),
        Some(pool),
    );
    let d_fake = criterion.gan_loss(&pred_fake_pool, false);

    let pred_real = discriminate(discriminator, conditioning.clone(), real_parsing, None);
    let d_real = criterion.gan_loss(&pred_real, true);

    // Not detached: this pass carries the generator's adversarial gradient.
    let pred_fake = discriminator.forward(Tensor::cat(vec![conditioning, fake_parsing], 1));
    let g_gan = criterion.gan_loss(&pred_fake, true);

    let g_gan_feat = if criterion.config().gan_feat_loss {
        criterion.feature_matching(&pred_fake, &pred_real)?
    } else {
        Stage1Criterion::zero(&device)
    };

    Ok(GanLosses {
        d_real,
        d_fake,
        g_gan,
        g_gan_feat,
    })
}

/// One training forward pass: generate, then evaluate every enabled loss term.
pub fn compute_losses<B, G, D>(
    generator: &G,
    discriminator: Option<&D>,
    pool: &mut FakePool<B>,
    criterion: &Stage1Criterion,
    input_all: Tensor<B, 4>,
    target_parsing: Tensor<B, 4>,
    want_output: bool,
) -> crate::Result<Stage1Output<B>>
where
    B: Backend,
    G: ParsingGenerator<B>,
    D: ParsingDiscriminator<B>,
{
    let device = input_all.device();
    let config = criterion.config();
    let fake_parsing = generator.forward(input_all.clone());

    let gan = if config.gan_loss {
        let discriminator = discriminator.ok_or_else(|| {
            Stage1Error::Configuration("GAN loss is enabled but no discriminator was built".to_string())
        })?;
        get_gan_losses(
            discriminator,
            pool,
            criterion,
            input_all,
            target_parsing.clone(),
            fake_parsing.clone(),
        )?
    } else {
        GanLosses {
            d_real: Stage1Criterion::zero(&device),
            d_fake: Stage1Criterion::zero(&device),
            g_gan: Stage1Criterion::zero(&device),
            g_gan_feat: Stage1Criterion::zero(&device),
        }
    };

    let g_l1 = if config.l1_loss {
        criterion.l1_loss(fake_parsing.clone(), target_parsing.clone())?
    } else {
        Stage1Criterion::zero(&device)
    };

    let g_parsing = if config.parsing_loss {
        criterion.parsing_loss(fake_parsing.clone(), target_parsing)?
    } else {
        Stage1Criterion::zero(&device)
    };

    Ok(Stage1Output {
        losses: Stage1Losses {
            g_gan: gan.g_gan,
            g_gan_feat: gan.g_gan_feat,
            g_l1,
            g_parsing,
            d_real: gan.d_real,
            d_fake: gan.d_fake,
        },
        fake_parsing: want_output.then_some(fake_parsing),
    })
}

/// Predict target parsing logits. Callers pass a non-autodiff module, so no graph is built.
pub fn inference<B: Backend, G: ParsingGenerator<B>>(
    generator: &G,
    source_parsing: Tensor<B, 4>,
    target_pose: Tensor<B, 4>,
    parsing_label_nc: usize,
) -> crate::Result<Tensor<B, 4>> {
    let input_all = encode_input(source_parsing, target_pose, parsing_label_nc)?;
    Ok(generator.forward(input_all))
}
