//! Error taxonomy for the lodestar core
//!
//! Each concern gets its own enum so callers can match on exactly the
//! conditions they are able to handle. The HTTP layer maps these onto status
//! codes in [`crate::server::error`].

use thiserror::Error;

/// Failures while resolving, detecting or loading a model.
#[derive(Debug, Error)]
pub enum ModelLoadError {
    /// The path or reference does not resolve to anything on disk, or the
    /// model is not currently registered (for unload).
    #[error("model not found: {0}")]
    NotFound(String),

    #[error("unsupported model format: {0}")]
    UnsupportedFormat(String),

    #[error("corrupt model at {path}: {detail}")]
    CorruptFile { path: String, detail: String },

    #[error(
        "insufficient memory to load '{model_id}': needs ~{required_mb} MB, {available_mb} MB available"
    )]
    InsufficientMemory {
        model_id: String,
        required_mb: u64,
        available_mb: u64,
    },

    #[error("model load failed: {0}")]
    Internal(String),
}

impl ModelLoadError {
    pub fn corrupt(path: impl AsRef<std::path::Path>, detail: impl std::fmt::Display) -> Self {
        Self::CorruptFile {
            path: path.as_ref().display().to_string(),
            detail: detail.to_string(),
        }
    }
}

/// Failures while executing a generation or embedding request.
#[derive(Debug, Error)]
pub enum InferenceError {
    #[error("model '{0}' is not loaded")]
    NotLoaded(String),

    #[error("prompt is {prompt_tokens} tokens but the model context window is {context_length}")]
    ContextExceeded {
        prompt_tokens: usize,
        context_length: usize,
    },

    #[error("generation failed: {0}")]
    GenerationFailed(String),

    #[error("generation cancelled")]
    Cancelled,

    #[error("operation not supported: {0}")]
    Unsupported(String),
}

impl From<candle_core::Error> for InferenceError {
    fn from(err: candle_core::Error) -> Self {
        Self::GenerationFailed(err.to_string())
    }
}

/// Failures from the per-conversation KV cache.
#[derive(Debug, Error)]
pub enum CacheError {
    #[error("no cache entry for conversation '{conversation_id}' of model '{model_id}'")]
    NotFound {
        model_id: String,
        conversation_id: String,
    },

    #[error("kv cache is disabled")]
    Disabled,

    #[error("kv shape mismatch: {0}")]
    ShapeMismatch(String),

    #[error("kv tensor operation failed: {0}")]
    Tensor(#[from] candle_core::Error),
}

/// Failures from a retrieval backend
#[derive(Debug, Error)]
pub enum RetrievalError {
    #[error("cannot ingest an empty document")]
    EmptyDocument,

    #[error("failed to read document {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("retrieval backend failed: {0}")]
    Backend(String),
}

impl RetrievalError {
    pub fn io(path: impl AsRef<std::path::Path>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.as_ref().display().to_string(),
            source,
        }
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum AuthError {
    #[error("API key required")]
    Missing,
    #[error("Invalid API key")]
    Invalid,
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("missing required field '{0}'")]
    MissingField(String),

    #[error("field '{field}' out of range: {detail}")]
    OutOfRange { field: String, detail: String },
}

impl ValidationError {
    pub fn missing(field: impl Into<String>) -> Self {
        Self::MissingField(field.into())
    }

    pub fn out_of_range(field: impl Into<String>, detail: impl Into<String>) -> Self {
        Self::OutOfRange {
            field: field.into(),
            detail: detail.into(),
        }
    }
}
