//! Per-model metadata shipped next to each artifact (`guernika.json`).
//!
//! Unknown string values decode to an `Unknown` sentinel instead of failing,
//! so newer converters never break older runtimes.

use std::path::Path;

use serde::de::Deserializer;
use serde::Deserialize;

/// File name of the metadata document.
pub const METADATA_FILE_NAME: &str = "guernika.json";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AttentionImplementation {
    #[default]
    Original,
    SplitEinsum,
    Unknown,
}

impl<'de> Deserialize<'de> for AttentionImplementation {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = String::deserialize(deserializer)?;
        Ok(match value.as_str() {
            "ORIGINAL" => Self::Original,
            "SPLIT_EINSUM" => Self::SplitEinsum,
            _ => Self::Unknown,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ModelFunction {
    #[default]
    Standard,
    Inpaint,
    Instructions,
    Unknown,
}

impl<'de> Deserialize<'de> for ModelFunction {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = String::deserialize(deserializer)?;
        Ok(match value.as_str() {
            "standard" => Self::Standard,
            "inpaint" => Self::Inpaint,
            "instructions" => Self::Instructions,
            _ => Self::Unknown,
        })
    }
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct ModelMetadata {
    #[serde(default)]
    pub identifier: Option<String>,
    #[serde(default)]
    pub converter_version: Option<String>,
    #[serde(default)]
    pub attention_implementation: AttentionImplementation,
    /// Output image width in pixels.
    #[serde(default)]
    pub width: Option<usize>,
    /// Output image height in pixels.
    #[serde(default)]
    pub height: Option<usize>,
    #[serde(default)]
    pub controlnet_support: bool,
    #[serde(default)]
    pub function: ModelFunction,
    #[serde(default)]
    pub hidden_size: Option<usize>,
}

impl ModelMetadata {
    /// Metadata for an artifact: `guernika.json` inside the artifact
    /// directory, or next to the artifact file. Absent or unreadable metadata
    /// is treated as not present.
    pub fn for_artifact(path: &Path) -> Option<Self> {
        let candidate = if path.is_dir() {
            path.join(METADATA_FILE_NAME)
        } else {
            path.parent()?.join(METADATA_FILE_NAME)
        };
        let content = std::fs::read_to_string(candidate).ok()?;
        serde_json::from_str(&content).ok()
    }
}
