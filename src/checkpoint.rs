use crate::error::{Result, Stage1Error};
use burn::prelude::*;
use burn::record::{CompactRecorder, Recorder};
use std::path::{Path, PathBuf};
use tracing::{info, warn};

/// Which network a checkpoint file belongs to.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum NetworkRole {
    Generator,
    Discriminator,
}

impl NetworkRole {
    /// Short label used in file names.
    pub fn label(self) -> &'static str {
        match self {
            NetworkRole::Generator => "G",
            NetworkRole::Discriminator => "D",
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            NetworkRole::Generator => "generator",
            NetworkRole::Discriminator => "discriminator",
        }
    }
}

/// `<dir>/<tag>_net_<G|D>`; the recorder appends its own extension.
pub fn checkpoint_stem(dir: &Path, tag: &str, role: NetworkRole) -> PathBuf {
    dir.join(format!("{tag}_net_{}", role.label()))
}

/// Path of the file actually written by [`save_network`].
pub fn checkpoint_file(dir: &Path, tag: &str, role: NetworkRole) -> PathBuf {
    checkpoint_stem(dir, tag, role).with_extension("mpk")
}

/// Persist network weights only; optimizer state is not saved.
pub fn save_network<B: Backend, M: Module<B>>(
    module: &M,
    dir: &Path,
    tag: &str,
    role: NetworkRole,
) -> Result<PathBuf> {
    let stem = checkpoint_stem(dir, tag, role);
    std::fs::create_dir_all(dir).map_err(|err| Stage1Error::CheckpointSave {
        role: role.name(),
        path: stem.clone(),
        reason: err.to_string(),
    })?;
    module
        .clone()
        .save_file(stem.clone(), &CompactRecorder::new())
        .map_err(|err| Stage1Error::CheckpointSave {
            role: role.name(),
            path: stem.clone(),
            reason: err.to_string(),
        })?;
    Ok(checkpoint_file(dir, tag, role))
}

/// Load weights into `module`.
///
/// A missing or unreadable file is an error only when `required`; otherwise the
/// freshly initialized module is returned unchanged.
pub fn load_network<B: Backend, M: Module<B>>(
    module: M,
    dir: &Path,
    tag: &str,
    role: NetworkRole,
    required: bool,
    device: &B::Device,
) -> Result<M> {
    let stem = checkpoint_stem(dir, tag, role);
    let loaded: std::result::Result<M::Record, _> =
        Recorder::<B>::load(&CompactRecorder::new(), stem.clone(), device);

    match loaded {
        Ok(record) => {
            info!("loaded {} weights from {}", role.name(), stem.display());
            Ok(module.load_record(record))
        }
        Err(err) if required => Err(Stage1Error::CheckpointLoad {
            role: role.name(),
            path: stem,
            reason: err.to_string(),
        }),
        Err(err) => {
            warn!(
                "{} checkpoint {} not loaded ({err}); keeping fresh weights",
                role.name(),
                stem.display()
            );
            Ok(module)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::GeneratorConfig;
    use burn::backend::NdArray;
    use burn::tensor::Distribution;

    type TestBackend = NdArray<f32>;

    fn generator(device: &<TestBackend as Backend>::Device) -> crate::model::Generator<TestBackend> {
        GeneratorConfig::new(4, 2)
            .with_ngf(2)
            .with_n_downsampling(2)
            .init(device)
    }

    #[test]
    fn file_names_follow_tag_and_role() {
        let dir = Path::new("/tmp/run");
        assert_eq!(
            checkpoint_file(dir, "latest", NetworkRole::Generator),
            PathBuf::from("/tmp/run/latest_net_G.mpk")
        );
        assert_eq!(
            checkpoint_stem(dir, "12", NetworkRole::Discriminator),
            PathBuf::from("/tmp/run/12_net_D")
        );
    }

    #[test]
    fn saved_weights_load_back() {
        let device = Default::default();
        let dir = tempfile::tempdir().unwrap();
        let saved = generator(&device);
        let path = save_network(&saved, dir.path(), "3", NetworkRole::Generator).unwrap();
        assert!(path.exists());

        let restored = load_network(generator(&device), dir.path(), "3", NetworkRole::Generator, true, &device)
            .unwrap();
        let input = Tensor::<TestBackend, 4>::random([1, 4, 8, 8], Distribution::Default, &device);
        let expected = saved.forward(input.clone()).into_data().to_vec::<f32>().unwrap();
        let actual = restored.forward(input).into_data().to_vec::<f32>().unwrap();
        for (a, e) in actual.iter().zip(&expected) {
            // CompactRecorder stores half precision.
            assert!((a - e).abs() < 5e-2 * (1.0 + e.abs()), "{a} vs {e}");
        }
    }

    #[test]
    fn missing_file_follows_policy() {
        let device = Default::default();
        let dir = tempfile::tempdir().unwrap();

        let required = load_network(generator(&device), dir.path(), "9", NetworkRole::Generator, true, &device);
        assert!(matches!(required, Err(Stage1Error::CheckpointLoad { role: "generator", .. })));

        let optional = load_network(generator(&device), dir.path(), "9", NetworkRole::Generator, false, &device);
        assert!(optional.is_ok());
    }

    #[test]
    fn corrupt_file_follows_policy() {
        let device = Default::default();
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(checkpoint_file(dir.path(), "1", NetworkRole::Generator), b"not a record").unwrap();

        let required = load_network(generator(&device), dir.path(), "1", NetworkRole::Generator, true, &device);
        assert!(matches!(required, Err(Stage1Error::CheckpointLoad { .. })));
    }
}
