//! Format-specific model loaders
//!
//! Loaders are tried in a fixed priority order; the generic pass-through
//! loader is last and claims anything that exists, so the factory never has
//! to special-case "no loader found".

use std::collections::HashSet;
use std::path::Path;
use std::sync::Arc;
use tokenizers::Tokenizer;

use super::device::DevicePreference;
use super::ModelLoader;
use crate::error::ModelLoadError;

pub mod detect;
pub mod generic;
pub mod gguf;
pub mod mlx;
pub mod safetensors;

pub use detect::{detect_format, probe_descriptor};
pub use generic::GenericLoader;
pub use gguf::GgufLoader;
pub use mlx::AcceleratorNativeLoader;
pub use safetensors::SafeTensorsLoader;

/// GGUF, accelerator-native, SafeTensors, then generic pass-through.
pub fn default_loaders(preference: DevicePreference) -> Vec<Arc<dyn ModelLoader>> {
    vec![
        Arc::new(GgufLoader::new(preference)),
        Arc::new(AcceleratorNativeLoader::new()),
        Arc::new(SafeTensorsLoader::new(preference)),
        Arc::new(GenericLoader::new()),
    ]
}

const EOS_CANDIDATES: &[&str] = &[
    "</s>",
    "<|endoftext|>",
    "<|im_end|>",
    "<|eot_id|>",
    "<|end_of_text|>",
    "<end_of_turn>",
];

pub(crate) fn load_tokenizer(path: &Path) -> Result<Tokenizer, ModelLoadError> {
    if !path.exists() {
        return Err(ModelLoadError::corrupt(
            path,
            "tokenizer.json is required alongside the weights",
        ));
    }
    Tokenizer::from_file(path).map_err(|e| ModelLoadError::corrupt(path, e))
}

/// End-of-sequence ids: whatever the metadata declares plus well-known
/// special tokens present in the vocabulary.
pub(crate) fn eos_tokens(tokenizer: &Tokenizer, declared: &[u32]) -> HashSet<u32> {
    let mut eos: HashSet<u32> = declared.iter().copied().collect();
    for candidate in EOS_CANDIDATES {
        if let Some(id) = tokenizer.token_to_id(candidate) {
            eos.insert(id);
        }
    }
    eos
}
