//! Model descriptors and the process-wide registry of loaded models

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::path::PathBuf;

pub mod registry;

pub use registry::{LoadedModel, ModelRegistry};

/// On-disk model family, as detected by the loader factory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModelFormat {
    Gguf,
    #[serde(rename = "safetensors")]
    SafeTensors,
    /// MLX-converted exports targeting Apple silicon
    AcceleratorNative,
    #[serde(rename = "pytorch")]
    PyTorch,
    Onnx,
    Unknown,
}

impl ModelFormat {
    pub fn as_str(&self) -> &'static str {
        match self {
            ModelFormat::Gguf => "gguf",
            ModelFormat::SafeTensors => "safetensors",
            ModelFormat::AcceleratorNative => "accelerator_native",
            ModelFormat::PyTorch => "pytorch",
            ModelFormat::Onnx => "onnx",
            ModelFormat::Unknown => "unknown",
        }
    }
}

impl fmt::Display for ModelFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Capability {
    TextGeneration,
    Chat,
    Embedding,
    Vision,
    CodeGeneration,
}

/// Everything the server knows about a model, loaded or merely discovered.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelDescriptor {
    pub id: String,
    pub path: PathBuf,
    pub format: ModelFormat,
    pub capabilities: BTreeSet<Capability>,
    pub context_length: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parameter_count: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub quantization: Option<String>,
    pub loaded: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub load_time: Option<DateTime<Utc>>,
    /// Resident size estimate in bytes
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory_usage: Option<u64>,
}

impl ModelDescriptor {
    pub fn new(id: impl Into<String>, path: impl Into<PathBuf>, format: ModelFormat) -> Self {
        Self {
            id: id.into(),
            path: path.into(),
            format,
            capabilities: BTreeSet::new(),
            context_length: 0,
            parameter_count: None,
            quantization: None,
            loaded: false,
            load_time: None,
            memory_usage: None,
        }
    }

    pub fn with_capabilities(mut self, caps: impl IntoIterator<Item = Capability>) -> Self {
        self.capabilities.extend(caps);
        self
    }

    pub fn with_context_length(mut self, context_length: usize) -> Self {
        self.context_length = context_length;
        self
    }

    pub fn supports(&self, capability: Capability) -> bool {
        self.capabilities.contains(&capability)
    }
}

/// Text-generation capability set, plus code generation when the model name
/// advertises it.
pub fn generation_capabilities(name: &str) -> BTreeSet<Capability> {
    let mut caps = BTreeSet::from([Capability::TextGeneration, Capability::Chat]);
    let lower = name.to_ascii_lowercase();
    if lower.contains("code") || lower.contains("coder") || lower.contains("starcoder") {
        caps.insert(Capability::CodeGeneration);
    }
    if lower.contains("vision") || lower.contains("-vl") || lower.contains("llava") {
        caps.insert(Capability::Vision);
    }
    caps
}
