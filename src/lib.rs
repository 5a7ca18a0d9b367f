//! Stage I of pose-guided person generation: predicts the target human parsing
//! map from a source parsing map and target pose keypoints.

pub mod checkpoint;
pub mod data;
pub mod error;
pub mod model;
pub mod pool;
pub mod training;
pub mod utils;

pub use error::{Result, Stage1Error};
