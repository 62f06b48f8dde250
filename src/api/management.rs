//! Request and response bodies of the model and cache management API

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::models::ModelDescriptor;
use crate::runtime::{KvCacheSettings, TruncationPolicy, WarmupStatus};
use crate::error::ValidationError;

#[derive(Debug, Clone, Default, Deserialize)]
pub struct LoadModelRequest {
    pub model_id: Option<String>,
    pub path: Option<PathBuf>,
    pub auto_warmup: Option<bool>,
    pub warmup_prompts: Option<usize>,
    pub context_length: Option<usize>,
    #[serde(default)]
    pub cpu_only: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct LoadModelResponse {
    pub status: String,
    pub model_id: String,
    pub message: String,
    pub model: ModelDescriptor,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct UnloadModelRequest {
    pub model_id: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct StatusResponse {
    pub status: String,
    pub message: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct ModelListResponse {
    pub models: Vec<ModelDescriptor>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct WarmupRequest {
    pub num_prompts: Option<usize>,
    #[serde(rename = "async", default)]
    pub run_async: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct WarmupResponse {
    /// `warmed`, `warming` or `failed`
    pub status: String,
    pub model_id: String,
    pub is_warmed: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub warmup_time_ms: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub kernel_compilation_time_ms: Option<f64>,
    pub warmup_prompts_used: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl WarmupResponse {
    pub fn from_status(status: WarmupStatus, background: bool) -> Self {
        let label = if status.is_warmed {
            "warmed"
        } else if background && status.error.is_none() {
            "warming"
        } else {
            "failed"
        };
        let timings = status.is_warmed || status.last_warmup.is_some();
        Self {
            status: label.to_string(),
            model_id: status.model_id,
            is_warmed: status.is_warmed,
            warmup_time_ms: timings.then_some(status.warmup_time_ms),
            kernel_compilation_time_ms: timings.then_some(status.kernel_compilation_time_ms),
            warmup_prompts_used: status.warmup_prompts_used,
            error: status.error,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct CacheSettingsUpdate {
    pub enabled: Option<bool>,
    pub max_memory_mb: Option<f64>,
    pub max_conversations: Option<usize>,
    pub truncation: Option<TruncationPolicy>,
}

impl CacheSettingsUpdate {
    pub fn apply(self, mut settings: KvCacheSettings) -> Result<KvCacheSettings, ValidationError> {
        if let Some(enabled) = self.enabled {
            settings.enabled = enabled;
        }
        if let Some(mb) = self.max_memory_mb {
            if !mb.is_finite() || mb <= 0.0 {
                return Err(ValidationError::out_of_range(
                    "max_memory_mb",
                    "must be a positive number",
                ));
            }
            settings.max_memory_mb = mb;
        }
        if let Some(max) = self.max_conversations {
            if max == 0 {
                return Err(ValidationError::out_of_range(
                    "max_conversations",
                    "must be at least 1",
                ));
            }
            settings.max_conversations = max;
        }
        if let Some(truncation) = self.truncation {
            settings.truncation = truncation;
        }
        Ok(settings)
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct CacheClearRequest {
    pub model_id: Option<String>,
    pub conversation_id: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct CacheClearResponse {
    pub status: String,
    pub cleared: usize,
}
