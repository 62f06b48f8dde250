//! Server configuration with builder pattern
//!
//! Combines the network settings, request limits, CORS, sampling defaults,
//! KV cache and warmup tuning, and logging.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::runtime::{GenerationConfig, KvCacheSettings};

/// CORS configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CorsConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Allowed origins (`["*"]` allows any origin)
    #[serde(default = "default_cors_origins")]
    pub allowed_origins: Vec<String>,

    #[serde(default)]
    pub allow_credentials: bool,

    /// Max age for preflight cache (in seconds)
    #[serde(default = "default_cors_max_age")]
    pub max_age: u64,
}

fn default_cors_origins() -> Vec<String> {
    vec![
        "http://localhost:3000".to_string(),
        "http://127.0.0.1:3000".to_string(),
    ]
}
fn default_cors_max_age() -> u64 {
    3600
}

impl Default for CorsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            allowed_origins: default_cors_origins(),
            allow_credentials: false,
            max_age: default_cors_max_age(),
        }
    }
}

impl CorsConfig {
    pub fn allows_any_origin(&self) -> bool {
        self.allowed_origins.iter().any(|o| o == "*")
    }
}

/// Sampling parameters applied when a request leaves them out
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SamplingParamDefaults {
    #[serde(default = "default_max_tokens")]
    pub max_tokens: usize,

    #[serde(default = "default_temperature")]
    pub temperature: f32,

    #[serde(default = "default_top_p")]
    pub top_p: f32,

    #[serde(default = "default_top_k")]
    pub top_k: usize,

    #[serde(default = "default_repeat_penalty")]
    pub repetition_penalty: f32,
}

fn default_max_tokens() -> usize {
    256
}
fn default_temperature() -> f32 {
    0.7
}
fn default_top_p() -> f32 {
    0.95
}
fn default_top_k() -> usize {
    crate::runtime::DEFAULT_TOP_K
}
fn default_repeat_penalty() -> f32 {
    1.1
}

impl Default for SamplingParamDefaults {
    fn default() -> Self {
        Self {
            max_tokens: default_max_tokens(),
            temperature: default_temperature(),
            top_p: default_top_p(),
            top_k: default_top_k(),
            repetition_penalty: default_repeat_penalty(),
        }
    }
}

impl SamplingParamDefaults {
    pub fn to_generation_config(&self) -> GenerationConfig {
        GenerationConfig {
            max_tokens: self.max_tokens,
            temperature: self.temperature,
            top_p: self.top_p,
            top_k: self.top_k,
            repetition_penalty: self.repetition_penalty,
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WarmupConfig {
    /// Warm every model in the background right after it loads
    #[serde(default = "default_true")]
    pub auto_warmup: bool,

    /// Prompt count; unset means derive it from the hardware hint
    #[serde(default)]
    pub num_prompts: Option<usize>,

    #[serde(default = "default_warmup_max_tokens")]
    pub max_tokens: usize,

    /// JSON file holding warmup timing history
    #[serde(default)]
    pub history_file: Option<PathBuf>,

    /// First real request to a cold model starts a background warmup
    #[serde(default = "default_true")]
    pub warm_on_first_use: bool,
}

fn default_warmup_max_tokens() -> usize {
    crate::runtime::warmup::DEFAULT_WARMUP_MAX_TOKENS
}

impl Default for WarmupConfig {
    fn default() -> Self {
        Self {
            auto_warmup: true,
            num_prompts: None,
            max_tokens: default_warmup_max_tokens(),
            history_file: None,
            warm_on_first_use: true,
        }
    }
}

/// Retrieval for requests that set `use_rag`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RagConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// `*.txt` and `*.md` files ingested into the store at startup
    #[serde(default)]
    pub documents_dir: Option<PathBuf>,

    /// Passages retrieved when a request gives no `rag_top_k`
    #[serde(default = "default_rag_top_k")]
    pub default_top_k: usize,
}

fn default_rag_top_k() -> usize {
    3
}

impl Default for RagConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            documents_dir: None,
            default_top_k: default_rag_top_k(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Base level (`trace`, `debug`, `info`, `warn`, `error`)
    #[serde(default)]
    pub level: Option<String>,

    /// Extra `EnvFilter` directives, e.g. `lodestar_core::runtime=debug`
    #[serde(default)]
    pub filter: Option<String>,

    /// Directory for daily-rotated log files
    #[serde(default)]
    pub dir: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    // Network settings
    #[serde(default = "default_host")]
    pub host: String,

    #[serde(default = "default_port")]
    pub port: u16,

    /// Bearer token required on every `/v1` and `/api` route when set
    #[serde(default)]
    pub api_key: Option<String>,

    #[serde(default = "default_models_dir")]
    pub models_dir: PathBuf,

    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,

    #[serde(default = "default_max_tokens_limit")]
    pub max_tokens_limit: usize,

    /// Context window for models whose metadata declares none
    #[serde(default = "default_context_length")]
    pub default_context_length: usize,

    #[serde(default = "default_true")]
    pub auto_load_on_request: bool,

    #[serde(default)]
    pub cors: CorsConfig,

    #[serde(default)]
    pub sampling_defaults: SamplingParamDefaults,

    #[serde(default)]
    pub kv_cache: KvCacheSettings,

    #[serde(default)]
    pub warmup: WarmupConfig,

    #[serde(default)]
    pub rag: RagConfig,

    #[serde(default)]
    pub logging: LoggingConfig,

    #[serde(default)]
    pub preload_models: Vec<String>,
}

// Default value functions for serde
fn default_host() -> String {
    "127.0.0.1".to_string()
}
fn default_port() -> u16 {
    8000
}
fn default_models_dir() -> PathBuf {
    PathBuf::from("./models")
}
fn default_request_timeout_secs() -> u64 {
    300
}
fn default_max_tokens_limit() -> usize {
    4096
}
fn default_context_length() -> usize {
    4096
}
fn default_true() -> bool {
    true
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            api_key: None,
            models_dir: default_models_dir(),
            request_timeout_secs: default_request_timeout_secs(),
            max_tokens_limit: default_max_tokens_limit(),
            default_context_length: default_context_length(),
            auto_load_on_request: true,
            cors: CorsConfig::default(),
            sampling_defaults: SamplingParamDefaults::default(),
            kv_cache: KvCacheSettings::default(),
            warmup: WarmupConfig::default(),
            rag: RagConfig::default(),
            logging: LoggingConfig::default(),
            preload_models: Vec::new(),
        }
    }
}

/// Builder for ServerConfig with chainable methods
#[derive(Debug, Default)]
pub struct ServerConfigBuilder {
    config: ServerConfig,
}

impl ServerConfigBuilder {
    pub fn new() -> Self {
        Self {
            config: ServerConfig::default(),
        }
    }

    /// Start from an existing config
    pub fn from_config(config: ServerConfig) -> Self {
        Self { config }
    }

    pub fn host(mut self, host: impl Into<String>) -> Self {
        self.config.host = host.into();
        self
    }

    pub fn port(mut self, port: u16) -> Self {
        self.config.port = port;
        self
    }

    pub fn api_key(mut self, key: impl Into<String>) -> Self {
        self.config.api_key = Some(key.into());
        self
    }

    pub fn models_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.config.models_dir = dir.into();
        self
    }

    pub fn request_timeout_secs(mut self, timeout: u64) -> Self {
        self.config.request_timeout_secs = timeout;
        self
    }

    pub fn max_tokens_limit(mut self, limit: usize) -> Self {
        self.config.max_tokens_limit = limit;
        self
    }

    pub fn default_context_length(mut self, context_length: usize) -> Self {
        self.config.default_context_length = context_length;
        self
    }

    pub fn auto_load_on_request(mut self, enabled: bool) -> Self {
        self.config.auto_load_on_request = enabled;
        self
    }

    pub fn cors(mut self, cors: CorsConfig) -> Self {
        self.config.cors = cors;
        self
    }

    pub fn cors_enabled(mut self, enabled: bool) -> Self {
        self.config.cors.enabled = enabled;
        self
    }

    pub fn sampling_defaults(mut self, defaults: SamplingParamDefaults) -> Self {
        self.config.sampling_defaults = defaults;
        self
    }

    pub fn kv_cache(mut self, settings: KvCacheSettings) -> Self {
        self.config.kv_cache = settings;
        self
    }

    pub fn warmup(mut self, warmup: WarmupConfig) -> Self {
        self.config.warmup = warmup;
        self
    }

    pub fn auto_warmup(mut self, enabled: bool) -> Self {
        self.config.warmup.auto_warmup = enabled;
        self
    }

    pub fn warm_on_first_use(mut self, enabled: bool) -> Self {
        self.config.warmup.warm_on_first_use = enabled;
        self
    }

    pub fn warmup_history_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.warmup.history_file = Some(path.into());
        self
    }

    pub fn rag(mut self, rag: RagConfig) -> Self {
        self.config.rag = rag;
        self
    }

    pub fn rag_documents_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.config.rag.documents_dir = Some(dir.into());
        self
    }

    pub fn logging(mut self, logging: LoggingConfig) -> Self {
        self.config.logging = logging;
        self
    }

    pub fn preload_models(mut self, models: Vec<String>) -> Self {
        self.config.preload_models = models;
        self
    }

    pub fn add_preload_model(mut self, model: impl Into<String>) -> Self {
        self.config.preload_models.push(model.into());
        self
    }

    pub fn build(self) -> ServerConfig {
        self.config
    }
}

impl ServerConfig {
    pub fn builder() -> ServerConfigBuilder {
        ServerConfigBuilder::new()
    }

    pub fn to_builder(self) -> ServerConfigBuilder {
        ServerConfigBuilder::from_config(self)
    }

    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}
