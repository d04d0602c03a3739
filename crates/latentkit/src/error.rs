//! Pipeline-level error taxonomy.

use std::path::PathBuf;

use latentkit_models::ModelError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum PipelineError {
    /// A required artifact or tokenizer asset is absent; construction fails.
    /// Missing optional artifacts downgrade capabilities instead.
    #[error("resource missing: {0}")]
    ResourceMissing(PathBuf),

    /// A `SampleInput` invariant was violated.
    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error(transparent)]
    Model(#[from] ModelError),
}
