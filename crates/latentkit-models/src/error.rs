//! Model-layer error taxonomy.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum ModelError {
    /// The loader refused an artifact. Fatal to the current request only; the
    /// owning [`ManagedModel`](crate::ManagedModel) stays usable.
    #[error("failed to load model {name}: {reason}")]
    LoadFailed { name: String, reason: String },

    /// A prediction failed inside the inference backend.
    #[error("inference failed for {name}: {reason}")]
    InferenceFailed { name: String, reason: String },

    /// A tensor did not match the artifact's declared shape. Indicates
    /// mis-packaged models and is fatal.
    #[error("shape mismatch for {feature}: expected {expected:?}, got {actual:?}")]
    ShapeMismatch {
        feature: String,
        expected: Vec<usize>,
        actual: Vec<usize>,
    },

    /// Tokenizer assets are unusable or produced ids outside the vocabulary.
    #[error("tokenization failed: {0}")]
    TokenizationFailed(String),
}
