use crate::checkpoint::{load_network, save_network, NetworkRole};
use crate::data::{DataConfig, PairItem, Stage1Batch, Stage1Batcher, Stage1Dataset};
use crate::error::Stage1Error;
use crate::model::{
    compute_losses, encode_input, inference, Discriminator, Generator, LossConfig, LossScalars,
    ModelConfig, Stage1Criterion,
};
use crate::pool::FakePool;
use anyhow::Context;
use burn::config::Config;
use burn::data::dataloader::DataLoaderBuilder;
use burn::data::dataset::Dataset;
use burn::module::AutodiffModule;
use burn::optim::adaptor::OptimizerAdaptor;
use burn::optim::{Adam, AdamConfig, GradientsParams, Optimizer};
use burn::prelude::*;
use burn::tensor::backend::AutodiffBackend;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::{info, warn};

/// Pose heatmap spread in pixels at `load_size`.
const POSE_SIGMA: f32 = 6.0;

/// Run configuration loaded from `config.json`.
#[derive(Config, Debug)]
pub struct Stage1Config {
    pub model: ModelConfig,
    pub loss: LossConfig,
    /// Experiment name; checkpoints go to `<checkpoints_dir>/<name>`.
    pub name: String,
    pub checkpoints_dir: String,
    /// Directory holding `train.json` and `test.json`.
    pub data_dir: String,
    #[config(default = true)]
    pub is_train: bool,
    #[config(default = false)]
    pub continue_train: bool,
    /// Directory of pretrained weights to start training from.
    pub load_pretrain: Option<String>,
    #[config(default = "String::from(\"latest\")")]
    pub which_epoch: String,
    /// Treat a missing or unreadable checkpoint as fatal.
    #[config(default = false)]
    pub require_pretrained: bool,
    #[config(default = 0)]
    pub pool_size: usize,
    #[config(default = "vec![0]")]
    pub devices: Vec<usize>,
    #[config(default = 1)]
    pub batch_size: usize,
    #[config(default = 256)]
    pub load_size: u32,
    #[config(default = 0.0002)]
    pub lr: f64,
    #[config(default = 0.5)]
    pub beta1: f32,
    #[config(default = 0.999)]
    pub beta2: f32,
    /// Epochs at the initial learning rate.
    #[config(default = 100)]
    pub niter: usize,
    /// Epochs of linear decay to zero.
    #[config(default = 100)]
    pub niter_decay: usize,
    /// Epoch after which the generator optimizer is rebuilt; 0 disables.
    #[config(default = 0)]
    pub niter_fix_global: usize,
    #[config(default = 100)]
    pub print_freq: usize,
    #[config(default = 1000)]
    pub save_latest_freq: usize,
    #[config(default = 10)]
    pub save_epoch_freq: usize,
    #[config(default = 42)]
    pub seed: u64,
}

impl Stage1Config {
    /// Reject option combinations before anything is built.
    pub fn validate(&self) -> crate::Result<()> {
        let fail = |msg: String| Err(Stage1Error::Configuration(msg));

        if self.devices.is_empty() {
            return fail("at least one device is required".to_string());
        }
        if self.devices.len() > 1 && self.pool_size > 0 {
            return fail(format!(
                "fake pool (size {}) cannot be used with {} devices",
                self.pool_size,
                self.devices.len()
            ));
        }
        if self.model.parsing_label_nc == 0 {
            return fail("parsing_label_nc must be positive".to_string());
        }
        if self.model.num_d == 0 || self.model.n_layers_d == 0 {
            return fail("num_d and n_layers_d must be positive".to_string());
        }
        if self.model.n_downsample_g == 0 {
            return fail("n_downsample_g must be positive".to_string());
        }
        let loss = &self.loss;
        if !(loss.gan_loss || loss.l1_loss || loss.parsing_loss) {
            return fail("every generator loss is disabled".to_string());
        }
        let factor = 1u32 << self.model.n_downsample_g;
        if self.load_size % factor != 0 {
            return fail(format!(
                "load_size {} is not divisible by {factor}",
                self.load_size
            ));
        }
        Ok(())
    }

    /// `<checkpoints_dir>/<name>`
    pub fn save_dir(&self) -> PathBuf {
        Path::new(&self.checkpoints_dir).join(&self.name)
    }

    pub fn data_config(&self) -> DataConfig {
        DataConfig {
            parsing_label_nc: self.model.parsing_label_nc,
            load_size: self.load_size,
            pose_sigma: POSE_SIGMA,
        }
    }
}

type GeneratorOptimizer<B> = OptimizerAdaptor<Adam, Generator<B>, B>;
type DiscriminatorOptimizer<B> = OptimizerAdaptor<Adam, Discriminator<B>, B>;

struct Optimizers<B: AutodiffBackend> {
    generator: GeneratorOptimizer<B>,
    discriminator: DiscriminatorOptimizer<B>,
}

/// Losses of one step, plus the generated map when requested.
#[derive(Clone, Debug)]
pub struct StepOutput<B: Backend> {
    pub losses: LossScalars,
    pub fake_parsing: Option<Tensor<B, 4>>,
}

/// Owns both networks, their optimizers and the fake pool for one run.
pub struct Stage1Trainer<B: AutodiffBackend> {
    config: Stage1Config,
    criterion: Stage1Criterion,
    generator: Generator<B>,
    /// Built only when training.
    discriminator: Option<Discriminator<B>>,
    optimizers: Option<Optimizers<B>>,
    pool: FakePool<B>,
    learning_rate: f64,
    decay_steps: usize,
    device: B::Device,
}

impl<B: AutodiffBackend> Stage1Trainer<B> {
    pub fn new(config: Stage1Config, device: B::Device) -> crate::Result<Self> {
        config.validate()?;
        B::seed(&device, config.seed);

        let criterion = Stage1Criterion::from_config(&config.model, &config.loss);
        let mut generator = config.model.init_generator::<B>(&device);
        let mut discriminator = config
            .is_train
            .then(|| config.model.init_discriminator::<B>(config.loss.gan_feat_loss, &device));

        if !config.is_train || config.continue_train || config.load_pretrain.is_some() {
            let dir = match (&config.load_pretrain, config.is_train) {
                (Some(pretrained), true) => PathBuf::from(pretrained),
                _ => config.save_dir(),
            };
            info!("loading networks from {} (tag {})", dir.display(), config.which_epoch);
            generator = load_network(
                generator,
                &dir,
                &config.which_epoch,
                NetworkRole::Generator,
                config.require_pretrained,
                &device,
            )?;
            if let Some(fresh) = discriminator.take() {
                discriminator = Some(load_network(
                    fresh,
                    &dir,
                    &config.which_epoch,
                    NetworkRole::Discriminator,
                    config.require_pretrained,
                    &device,
                )?);
            }
        }

        let optimizers = config.is_train.then(|| Optimizers {
            generator: adam(&config).init::<B, Generator<B>>(),
            discriminator: adam(&config).init::<B, Discriminator<B>>(),
        });

        Ok(Self {
            pool: FakePool::new(config.pool_size, config.seed),
            learning_rate: config.lr,
            decay_steps: 0,
            criterion,
            generator,
            discriminator,
            optimizers,
            config,
            device,
        })
    }

    /// Forward every loss term, then update the generator and, with GAN loss on, the discriminator.
    pub fn train_step(&mut self, batch: Stage1Batch<B>, want_output: bool) -> crate::Result<StepOutput<B>> {
        let Some(optimizers) = self.optimizers.as_mut() else {
            return Err(Stage1Error::Configuration(
                "train_step needs is_train".to_string(),
            ));
        };
        let target_parsing = batch
            .target_parsing
            .ok_or_else(|| Stage1Error::Data("training batch has no target parsing".to_string()))?;
        let input_all = encode_input(
            batch.source_parsing,
            batch.target_pose,
            self.config.model.parsing_label_nc,
        )?;

        let output = compute_losses(
            &self.generator,
            self.discriminator.as_ref(),
            &mut self.pool,
            &self.criterion,
            input_all,
            target_parsing,
            want_output,
        )?;
        let losses = output.losses.scalars();

        let grads = output.losses.generator_loss().backward();
        let grads = GradientsParams::from_grads(grads, &self.generator);
        self.generator = optimizers
            .generator
            .step(self.learning_rate, self.generator.clone(), grads);

        if self.config.loss.gan_loss {
            if let Some(discriminator) = self.discriminator.take() {
                let grads = output.losses.discriminator_loss().backward();
                let grads = GradientsParams::from_grads(grads, &discriminator);
                self.discriminator = Some(optimizers.discriminator.step(
                    self.learning_rate,
                    discriminator,
                    grads,
                ));
            }
        }

        Ok(StepOutput {
            losses,
            fake_parsing: output.fake_parsing.map(|fake| fake.detach()),
        })
    }

    /// Predict parsing logits without recording a graph. The pool is untouched.
    pub fn inference(
        &self,
        source_parsing: Tensor<B::InnerBackend, 4>,
        target_pose: Tensor<B::InnerBackend, 4>,
    ) -> crate::Result<Tensor<B::InnerBackend, 4>> {
        let generator = self.generator.valid();
        inference(
            &generator,
            source_parsing,
            target_pose,
            self.config.model.parsing_label_nc,
        )
    }

    /// Write `<tag>_net_G` and, when GAN loss is on, `<tag>_net_D`.
    pub fn save(&self, tag: &str) -> crate::Result<()> {
        let dir = self.config.save_dir();
        save_network(&self.generator, &dir, tag, NetworkRole::Generator)?;
        if self.config.loss.gan_loss {
            if let Some(discriminator) = &self.discriminator {
                save_network(discriminator, &dir, tag, NetworkRole::Discriminator)?;
            }
        }
        Ok(())
    }

    /// Start optimizing every generator parameter with fresh Adam state.
    pub fn update_fixed_params(&mut self) -> crate::Result<()> {
        let optimizers = self.optimizers.as_mut().ok_or_else(|| {
            Stage1Error::Configuration("optimizers exist only when training".to_string())
        })?;
        optimizers.generator = adam(&self.config).init::<B, Generator<B>>();
        info!("now also finetuning the full generator");
        Ok(())
    }

    /// Linear decay by `lr / niter_decay` per call, shared by both optimizers.
    pub fn update_learning_rate(&mut self) -> f64 {
        if self.config.niter_decay == 0 {
            warn!("niter_decay is 0; learning rate stays at {}", self.learning_rate);
            return self.learning_rate;
        }
        let old = self.learning_rate;
        self.decay_steps += 1;
        self.learning_rate = self.decayed_rate(self.decay_steps);
        info!("update learning rate: {old} -> {}", self.learning_rate);
        self.learning_rate
    }

    /// Resume the decay schedule after `decay_steps` earlier updates.
    pub fn restore_schedule(&mut self, decay_steps: usize) {
        self.decay_steps = decay_steps;
        self.learning_rate = if self.config.niter_decay == 0 {
            self.config.lr
        } else {
            self.decayed_rate(decay_steps)
        };
    }

    fn decayed_rate(&self, steps: usize) -> f64 {
        let total = self.config.niter_decay as f64;
        let remaining = (total - steps as f64).max(0.0);
        self.config.lr * remaining / total
    }

    pub fn learning_rate(&self) -> f64 {
        self.learning_rate
    }

    pub fn decay_steps(&self) -> usize {
        self.decay_steps
    }

    pub fn config(&self) -> &Stage1Config {
        &self.config
    }

    pub fn pool(&self) -> &FakePool<B> {
        &self.pool
    }

    pub fn generator(&self) -> &Generator<B> {
        &self.generator
    }

    pub fn device(&self) -> &B::Device {
        &self.device
    }
}

fn adam(config: &Stage1Config) -> AdamConfig {
    AdamConfig::new()
        .with_beta_1(config.beta1)
        .with_beta_2(config.beta2)
}

/// Persisted training state for resume support.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct TrainingState {
    pub epoch: usize,
    pub step: usize,
    /// Learning-rate updates applied so far; the rate itself is recomputed from it.
    pub decay_steps: usize,
}

impl TrainingState {
    fn fresh() -> Self {
        Self {
            epoch: 1,
            step: 0,
            decay_steps: 0,
        }
    }

    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        serde_json::from_str(&contents).with_context(|| format!("failed to parse {}", path.display()))
    }

    pub fn save(&self, path: &Path) -> anyhow::Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json).with_context(|| format!("failed to write {}", path.display()))
    }
}

/// Train for `niter + niter_decay` epochs, checkpointing under `save_dir()`.
pub fn train<B: AutodiffBackend>(config: Stage1Config, device: B::Device) -> anyhow::Result<()> {
    let save_dir = config.save_dir();
    std::fs::create_dir_all(&save_dir)
        .with_context(|| format!("failed to create {}", save_dir.display()))?;
    config.save(save_dir.join("config.json"))?;

    let state_path = save_dir.join("state.json");
    let mut state = if config.continue_train && state_path.exists() {
        TrainingState::load(&state_path)?
    } else {
        TrainingState::fresh()
    };
    state.epoch = state.epoch.max(1);

    let train_path = Path::new(&config.data_dir).join("train.json");
    let dataset = Stage1Dataset::from_manifest(&train_path)?;
    let dataset_len = dataset.len();
    if dataset_len == 0 {
        return Err(anyhow::anyhow!("no training pairs in {}", train_path.display()));
    }
    info!("#training pairs = {dataset_len}");

    let mut trainer = Stage1Trainer::<B>::new(config.clone(), device.clone())?;
    trainer.restore_schedule(state.decay_steps);
    if state.step > 0 {
        info!(
            "resuming at epoch {}, step {}, learning rate {}",
            state.epoch,
            state.step,
            trainer.learning_rate()
        );
    }

    let loader = DataLoaderBuilder::<B, PairItem, Stage1Batch<B>>::new(Stage1Batcher::new(
        config.data_config(),
    ))
    .batch_size(config.batch_size)
    .shuffle(config.seed)
    .set_device(device)
    .build(dataset);

    let last_epoch = config.niter + config.niter_decay;
    if state.epoch > last_epoch {
        info!("nothing to do: resumed at epoch {} of {last_epoch}", state.epoch);
    }

    for epoch in state.epoch..=last_epoch {
        let mut iterator = loader.iter();
        while let Some(batch) = iterator.next() {
            state.step += 1;
            let output = trainer.train_step(batch, false)?;

            if config.print_freq > 0 && state.step % config.print_freq == 0 {
                let message = output
                    .losses
                    .named()
                    .iter()
                    .map(|(name, value)| format!("{name}: {value:.3}"))
                    .collect::<Vec<_>>()
                    .join(" ");
                info!("(epoch: {epoch}, iters: {}) {message}", state.step);
            }

            if config.save_latest_freq > 0 && state.step % config.save_latest_freq == 0 {
                info!("saving the latest model (epoch {epoch}, total_steps {})", state.step);
                trainer.save("latest")?;
                state.epoch = epoch;
                state.decay_steps = trainer.decay_steps();
                state.save(&state_path)?;
            }
        }

        trainer.save("latest")?;
        if config.save_epoch_freq > 0 && epoch % config.save_epoch_freq == 0 {
            info!("saving the model at the end of epoch {epoch}, iters {}", state.step);
            trainer.save(&epoch.to_string())?;
        }

        if config.niter_fix_global != 0 && epoch == config.niter_fix_global {
            trainer.update_fixed_params()?;
        }
        if epoch > config.niter {
            trainer.update_learning_rate();
        }

        state.epoch = epoch + 1;
        state.decay_steps = trainer.decay_steps();
        state.save(&state_path)?;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checkpoint::checkpoint_file;
    use crate::model::POSE_CHANNELS;
    use burn::backend::{Autodiff, NdArray};
    use burn::tensor::Distribution;

    type TestBackend = Autodiff<NdArray<f32>>;
    type InnerBackend = NdArray<f32>;
    type Device = <TestBackend as Backend>::Device;

    const NC: usize = 3;
    const SIZE: usize = 16;

    fn tiny_config(dir: &Path) -> Stage1Config {
        let model = ModelConfig::new()
            .with_parsing_label_nc(NC)
            .with_ngf(4)
            .with_n_downsample_g(2)
            .with_ndf(4)
            .with_n_layers_d(2)
            .with_num_d(2);
        Stage1Config::new(
            model,
            LossConfig::new(),
            "run".to_string(),
            dir.to_string_lossy().into_owned(),
            dir.to_string_lossy().into_owned(),
        )
        .with_load_size(SIZE as u32)
    }

    fn batch(size: usize, device: &Device) -> Stage1Batch<TestBackend> {
        let random = |channels| {
            Tensor::random([size, channels, SIZE, SIZE], Distribution::Uniform(0.0, 1.0), device)
        };
        Stage1Batch {
            source_parsing: random(NC),
            target_pose: random(POSE_CHANNELS),
            target_parsing: Some(random(NC)),
        }
    }

    #[test]
    fn pool_with_several_devices_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let config = tiny_config(dir.path()).with_pool_size(4).with_devices(vec![0, 1]);
        assert!(matches!(config.validate(), Err(Stage1Error::Configuration(_))));

        let single = tiny_config(dir.path()).with_pool_size(4);
        assert!(single.validate().is_ok());
    }

    #[test]
    fn rejects_indivisible_load_size() {
        let dir = tempfile::tempdir().unwrap();
        let config = tiny_config(dir.path()).with_load_size(18);
        assert!(matches!(config.validate(), Err(Stage1Error::Configuration(_))));
    }

    #[test]
    fn learning_rate_decays_linearly() {
        let dir = tempfile::tempdir().unwrap();
        let config = tiny_config(dir.path()).with_lr(0.01).with_niter_decay(10);
        let mut trainer = Stage1Trainer::<TestBackend>::new(config, Default::default()).unwrap();

        for expected in [0.009, 0.008, 0.007] {
            let lr = trainer.update_learning_rate();
            assert!((lr - expected).abs() < 1e-12, "{lr} vs {expected}");
        }

        trainer.restore_schedule(12);
        assert_eq!(trainer.learning_rate(), 0.0);
    }

    #[test]
    fn decay_is_a_no_op_without_decay_epochs() {
        let dir = tempfile::tempdir().unwrap();
        let config = tiny_config(dir.path()).with_lr(0.01).with_niter_decay(0);
        let mut trainer = Stage1Trainer::<TestBackend>::new(config, Default::default()).unwrap();

        assert_eq!(trainer.update_learning_rate(), 0.01);
        assert_eq!(trainer.decay_steps(), 0);
    }

    #[test]
    fn discriminator_is_not_saved_without_gan_loss() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = tiny_config(dir.path());
        config.loss = LossConfig::new().with_gan_loss(false);
        let trainer = Stage1Trainer::<TestBackend>::new(config.clone(), Default::default()).unwrap();

        trainer.save("latest").unwrap();

        let save_dir = config.save_dir();
        assert!(checkpoint_file(&save_dir, "latest", NetworkRole::Generator).exists());
        assert!(!checkpoint_file(&save_dir, "latest", NetworkRole::Discriminator).exists());
    }

    #[test]
    fn required_checkpoint_must_exist() {
        let dir = tempfile::tempdir().unwrap();
        let config = tiny_config(dir.path())
            .with_is_train(false)
            .with_require_pretrained(true);

        let result = Stage1Trainer::<TestBackend>::new(config, Default::default());
        assert!(matches!(result, Err(Stage1Error::CheckpointLoad { .. })));
    }

    #[test]
    fn continue_train_restores_saved_weights() {
        let dir = tempfile::tempdir().unwrap();
        let device: Device = Default::default();
        let trainer =
            Stage1Trainer::<TestBackend>::new(tiny_config(dir.path()), device.clone()).unwrap();
        trainer.save("latest").unwrap();

        let config = tiny_config(dir.path())
            .with_continue_train(true)
            .with_require_pretrained(true)
            .with_seed(7);
        let restored = Stage1Trainer::<TestBackend>::new(config, device.clone()).unwrap();

        let source =
            Tensor::<InnerBackend, 4>::random([1, NC, SIZE, SIZE], Distribution::Default, &device);
        let pose = Tensor::<InnerBackend, 4>::random(
            [1, POSE_CHANNELS, SIZE, SIZE],
            Distribution::Default,
            &device,
        );
        let expected = trainer.inference(source.clone(), pose.clone()).unwrap();
        let actual = restored.inference(source, pose).unwrap();
        let expected = expected.into_data().to_vec::<f32>().unwrap();
        let actual = actual.into_data().to_vec::<f32>().unwrap();
        for (a, e) in actual.iter().zip(&expected) {
            // Checkpoints are stored in half precision.
            assert!((a - e).abs() < 5e-2 * (1.0 + e.abs()), "{a} vs {e}");
        }
    }

    #[test]
    fn train_step_updates_and_fills_pool() {
        let dir = tempfile::tempdir().unwrap();
        let device: Device = Default::default();
        let config = tiny_config(dir.path()).with_pool_size(4);
        let mut trainer = Stage1Trainer::<TestBackend>::new(config, device.clone()).unwrap();

        let output = trainer.train_step(batch(2, &device), true).unwrap();

        assert!(output.losses.named().iter().all(|(_, value)| value.is_finite()));
        assert!(output.losses.g_parsing > 0.0);
        assert_eq!(output.fake_parsing.unwrap().dims(), [2, NC, SIZE, SIZE]);
        assert_eq!(trainer.pool().len(), 2);
    }

    #[test]
    fn train_step_without_target_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let device: Device = Default::default();
        let mut trainer =
            Stage1Trainer::<TestBackend>::new(tiny_config(dir.path()), device.clone()).unwrap();
        let mut input = batch(1, &device);
        input.target_parsing = None;

        let result = trainer.train_step(input, false);
        assert!(matches!(result, Err(Stage1Error::Data(_))));
    }

    #[test]
    fn inference_leaves_state_untouched() {
        let dir = tempfile::tempdir().unwrap();
        let config = tiny_config(dir.path()).with_pool_size(2);
        let trainer = Stage1Trainer::<TestBackend>::new(config, Default::default()).unwrap();
        let device: Device = Default::default();
        let source =
            Tensor::<InnerBackend, 4>::random([1, NC, SIZE, SIZE], Distribution::Default, &device);
        let pose = Tensor::<InnerBackend, 4>::random(
            [1, POSE_CHANNELS, SIZE, SIZE],
            Distribution::Default,
            &device,
        );

        let first = trainer.inference(source.clone(), pose.clone()).unwrap();
        let second = trainer.inference(source, pose).unwrap();

        assert_eq!(
            first.into_data().to_vec::<f32>().unwrap(),
            second.into_data().to_vec::<f32>().unwrap()
        );
        assert!(trainer.pool().is_empty());
    }

    #[test]
    fn fixed_params_update_needs_training_mode() {
        let dir = tempfile::tempdir().unwrap();
        let device: Device = Default::default();
        let mut trainer =
            Stage1Trainer::<TestBackend>::new(tiny_config(dir.path()), device.clone()).unwrap();
        assert!(trainer.update_fixed_params().is_ok());

        trainer.save("latest").unwrap();
        let config = tiny_config(dir.path()).with_is_train(false);
        let mut inference_only = Stage1Trainer::<TestBackend>::new(config, device).unwrap();
        assert!(matches!(
            inference_only.update_fixed_params(),
            Err(Stage1Error::Configuration(_))
        ));
    }

    #[test]
    fn training_state_round_trips_through_json() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");
        let state = TrainingState {
            epoch: 4,
            step: 120,
            decay_steps: 2,
        };

        state.save(&path).unwrap();
        assert_eq!(TrainingState::load(&path).unwrap(), state);
    }
}
