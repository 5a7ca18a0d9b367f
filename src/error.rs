use std::path::PathBuf;
use thiserror::Error;

/// Errors raised by the Stage I model, its checkpoints and its input pipeline.
#[derive(Debug, Error)]
pub enum Stage1Error {
    /// Rejected option combination, detected before any training starts.
    #[error("invalid configuration: {0}")]
    Configuration(String),

    /// A required checkpoint was missing or could not be decoded.
    #[error("failed to load {role} checkpoint from {}: {reason}", path.display())]
    CheckpointLoad {
        role: &'static str,
        path: PathBuf,
        reason: String,
    },

    #[error("failed to save {role} checkpoint to {}: {reason}", path.display())]
    CheckpointSave {
        role: &'static str,
        path: PathBuf,
        reason: String,
    },

    /// Tensor dims disagree with the configured channel layout.
    #[error("shape mismatch in {context}: expected {expected:?}, got {actual:?}")]
    ShapeMismatch {
        context: &'static str,
        expected: Vec<usize>,
        actual: Vec<usize>,
    },

    #[error("invalid input data: {0}")]
    Data(String),
}

impl Stage1Error {
    pub(crate) fn shape(context: &'static str, expected: &[usize], actual: &[usize]) -> Self {
        Stage1Error::ShapeMismatch {
            context,
            expected: expected.to_vec(),
            actual: actual.to_vec(),
        }
    }
}

pub type Result<T> = std::result::Result<T, Stage1Error>;
