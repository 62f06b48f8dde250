//! Model runtime: loader/backends abstraction, dispatch, caching and warmup
//!
//! The two seams are [`ModelLoader`] (one implementation per on-disk format,
//! tried in priority order by the [`model_factory::ModelLoaderFactory`]) and
//! [`ModelBackend`] (the resident native model a loader produces). Everything
//! above these traits is format-agnostic.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{InferenceError, ModelLoadError};
use crate::models::{ModelDescriptor, ModelFormat};

pub mod device;
pub mod dispatcher;
pub mod generation;
pub mod kv_cache;
pub mod loaders;
pub mod model_factory;
pub mod prompt;
pub mod stop;
pub mod utf8_decoder;
pub mod warmup;

#[cfg(test)]
pub(crate) mod test_support;

pub use dispatcher::{GenerationStream, InferenceDispatcher, StreamEvent};
pub use kv_cache::{KvCacheManager, KvCacheSettings, TruncationPolicy};
pub use model_factory::{LoadOutcome, ModelLoaderFactory};
pub use prompt::{ChatTurn, PromptInput};
pub use warmup::{WarmupMode, WarmupService, WarmupStatus};

/// Control signal returned by a [`TokenSink`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContinueGeneration {
    Continue,
    Stop,
}

/// Receives decoded text increments from a backend's token loop.
///
/// Backends call `is_cancelled` between token productions so that a client
/// disconnect stops generation promptly.
pub trait TokenSink: Send {
    fn on_token(&mut self, text: &str) -> ContinueGeneration;

    fn is_cancelled(&self) -> bool {
        false
    }
}

/// Why a generation ended
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FinishReason {
    /// Model emitted an end-of-sequence token
    EndOfSequence,
    /// Hit `max_tokens`
    MaxTokens,
    /// The sink asked to stop (a stop sequence matched)
    StopSequence,
    Cancelled,
}

impl FinishReason {
    /// OpenAI `finish_reason` string
    pub fn as_openai_str(&self) -> &'static str {
        match self {
            FinishReason::MaxTokens => "length",
            FinishReason::EndOfSequence | FinishReason::StopSequence | FinishReason::Cancelled => {
                "stop"
            }
        }
    }
}

/// Sampling configuration for one request.
///
/// Built once per request and clamped into range with [`GenerationConfig::clamped`]
/// rather than rejected, so loosely validated clients still get an answer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerationConfig {
    pub max_tokens: usize,
    pub temperature: f32,
    pub top_p: f32,
    pub top_k: usize,
    pub repetition_penalty: f32,
    #[serde(default)]
    pub stream: bool,
    #[serde(default)]
    pub stop_sequences: Vec<String>,
    #[serde(default)]
    pub seed: Option<u64>,
}

pub const DEFAULT_TOP_K: usize = 40;

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            max_tokens: 256,
            temperature: 0.7,
            top_p: 0.95,
            top_k: DEFAULT_TOP_K,
            repetition_penalty: 1.1,
            stream: false,
            stop_sequences: Vec::new(),
            seed: None,
        }
    }
}

fn clamp_finite(value: f32, min: f32, max: f32, fallback: f32) -> f32 {
    if value.is_finite() {
        value.clamp(min, max)
    } else {
        fallback
    }
}

impl GenerationConfig {
    /// Clamp every numeric field into its supported range.
    pub fn clamped(mut self) -> Self {
        let defaults = Self::default();
        self.max_tokens = self.max_tokens.max(1);
        self.temperature = clamp_finite(self.temperature, 0.0, 2.0, defaults.temperature);
        self.top_p = clamp_finite(self.top_p, 0.0, 1.0, defaults.top_p);
        self.top_k = self.top_k.max(1);
        self.repetition_penalty =
            clamp_finite(self.repetition_penalty, 0.1, 2.0, defaults.repetition_penalty);
        self.stop_sequences.retain(|s| !s.is_empty());
        self
    }

    /// Temperature zero means greedy decoding
    pub fn is_greedy(&self) -> bool {
        self.temperature <= 0.0
    }
}

/// Outcome of a completed generation
#[derive(Debug, Clone)]
pub struct GenerationResult {
    pub text: String,
    pub finish_reason: FinishReason,
    pub tokens_generated: usize,
    pub prompt_tokens: usize,
    /// Prompt tokens already covered by this conversation's KV cache entry
    pub cached_tokens: usize,
    pub generation_time: Duration,
    pub tokens_per_second: f64,
}

impl GenerationResult {
    pub fn generation_time_ms(&self) -> f64 {
        self.generation_time.as_secs_f64() * 1000.0
    }
}

/// What a backend reports when its token loop exits
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackendOutput {
    pub tokens_generated: usize,
    pub finish_reason: FinishReason,
}

/// Attention geometry of a decoder, used to size KV cache entries
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct KvGeometry {
    pub layers: usize,
    pub kv_heads: usize,
    pub head_dim: usize,
}

/// A resident model: native weights plus tokenizer.
///
/// Implementations serialize access to their own native state; every method
/// takes `&self` so a handle can be shared across request tasks.
pub trait ModelBackend: Send + Sync {
    fn context_length(&self) -> usize;

    fn encode(&self, text: &str) -> Result<Vec<u32>, InferenceError>;

    fn kv_geometry(&self) -> Option<KvGeometry> {
        None
    }

    /// Run the token loop for `prompt`, pushing decoded increments into
    /// `sink`. Must check `sink.is_cancelled()` between tokens.
    fn generate(
        &self,
        prompt: &[u32],
        config: &GenerationConfig,
        sink: &mut dyn TokenSink,
    ) -> Result<BackendOutput, InferenceError>;

    fn embed(&self, _inputs: &[String]) -> Result<Vec<Vec<f32>>, InferenceError> {
        Err(InferenceError::Unsupported(
            "this model does not produce embeddings".to_owned(),
        ))
    }

    /// Drop native tensors and any accelerator-side caches. Called by the
    /// factory before the handle is removed from the registry.
    fn release(&self);
}

/// Options accepted by [`ModelLoader::load`]
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LoadOptions {
    /// Override the context window declared by the model metadata
    #[serde(default)]
    pub context_length: Option<usize>,
    /// Force CPU execution even when an accelerator is available
    #[serde(default)]
    pub cpu_only: bool,
}

#[derive(Debug, Clone)]
pub struct LoadRequest {
    pub model_id: String,
    pub path: PathBuf,
    pub options: LoadOptions,
    /// Used when the model metadata declares no context window
    pub default_context_length: usize,
}

/// What a loader hands back to the factory
pub struct LoadedBackend {
    pub descriptor: ModelDescriptor,
    pub backend: Box<dyn ModelBackend>,
}

/// One implementation per supported on-disk model family.
pub trait ModelLoader: Send + Sync {
    fn name(&self) -> &'static str;

    fn format(&self) -> ModelFormat;

    fn can_load(&self, path: &Path) -> bool;

    /// Blocking; the factory runs this on the blocking pool.
    fn load(&self, request: &LoadRequest) -> Result<LoadedBackend, ModelLoadError>;

    fn unload(&self, backend: &dyn ModelBackend) {
        backend.release();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generation_config_clamps_out_of_range_values() {
        let config = GenerationConfig {
            max_tokens: 0,
            temperature: 5.0,
            top_p: 1.5,
            top_k: 0,
            repetition_penalty: 0.0,
            stream: false,
            stop_sequences: vec![String::new(), "###".to_owned()],
            seed: None,
        }
        .clamped();

        assert_eq!(config.max_tokens, 1);
        assert_eq!(config.temperature, 2.0);
        assert_eq!(config.top_p, 1.0);
        assert_eq!(config.top_k, 1);
        assert_eq!(config.repetition_penalty, 0.1);
        assert_eq!(config.stop_sequences, vec!["###".to_owned()]);
    }

    #[test]
    fn test_non_finite_sampling_values_fall_back_to_defaults() {
        let config = GenerationConfig {
            temperature: f32::NAN,
            top_p: f32::INFINITY,
            ..Default::default()
        }
        .clamped();
        let defaults = GenerationConfig::default();
        assert_eq!(config.temperature, defaults.temperature);
        assert_eq!(config.top_p, defaults.top_p);
    }

    #[test]
    fn test_finish_reason_openai_mapping() {
        assert_eq!(FinishReason::MaxTokens.as_openai_str(), "length");
        assert_eq!(FinishReason::EndOfSequence.as_openai_str(), "stop");
        assert_eq!(FinishReason::StopSequence.as_openai_str(), "stop");
    }

    #[test]
    fn test_zero_temperature_is_greedy() {
        let config = GenerationConfig {
            temperature: -1.0,
            ..Default::default()
        }
        .clamped();
        assert!(config.is_greedy());
    }
}
