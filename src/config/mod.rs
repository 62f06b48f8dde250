//! Configuration loading
//!
//! Sources are layered with the `config` crate: serialized defaults, then an
//! optional TOML/JSON file, then `LODESTAR_*` environment variables (nested
//! keys separated by `__`, e.g. `LODESTAR_KV_CACHE__MAX_MEMORY_MB`). CLI
//! flags are applied on top by the binary.

pub mod server;

pub use server::{
    CorsConfig, LoggingConfig, RagConfig, SamplingParamDefaults, ServerConfig,
    ServerConfigBuilder, WarmupConfig,
};

use config::{Config, ConfigError, Environment, File};
use std::path::Path;

pub const ENV_PREFIX: &str = "LODESTAR";

impl ServerConfig {
    /// Load configuration from defaults, `path` (if given) and the environment
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut builder = Config::builder().add_source(Config::try_from(&ServerConfig::default())?);
        if let Some(path) = path {
            builder = builder.add_source(File::from(path).required(true));
        }
        builder
            .add_source(
                Environment::with_prefix(ENV_PREFIX)
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::TruncationPolicy;

    #[test]
    fn test_defaults() {
        let config = ServerConfig::default();
        assert_eq!(config.bind_address(), "127.0.0.1:8000");
        assert!(config.api_key.is_none());
        assert!(config.auto_load_on_request);
        assert!(config.kv_cache.enabled);
        assert_eq!(config.kv_cache.max_conversations, 100);
        assert_eq!(config.warmup.max_tokens, 8);
        assert!(config.warmup.num_prompts.is_none());
    }

    #[test]
    fn test_load_from_toml_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("lodestar.toml");
        std::fs::write(
            &path,
            r#"
port = 9100
api_key = "secret"
models_dir = "/srv/models"

[kv_cache]
max_memory_mb = 512.0
truncation = "reset"

[warmup]
auto_warmup = false
num_prompts = 3
"#,
        )
        .unwrap();

        let config = ServerConfig::load(Some(&path)).unwrap();
        assert_eq!(config.port, 9100);
        assert_eq!(config.api_key.as_deref(), Some("secret"));
        assert_eq!(config.models_dir, std::path::PathBuf::from("/srv/models"));
        assert_eq!(config.kv_cache.max_memory_mb, 512.0);
        assert_eq!(config.kv_cache.truncation, TruncationPolicy::Reset);
        assert_eq!(config.kv_cache.max_conversations, 100);
        assert!(!config.warmup.auto_warmup);
        assert_eq!(config.warmup.num_prompts, Some(3));
        // Untouched sections keep their defaults
        assert_eq!(config.host, "127.0.0.1");
    }

    #[test]
    fn test_missing_file_is_an_error() {
        let err = ServerConfig::load(Some(Path::new("/nonexistent/lodestar.toml")));
        assert!(err.is_err());
    }

    #[test]
    fn test_builder_chains() {
        let config = ServerConfig::builder()
            .port(1234)
            .api_key("k")
            .auto_warmup(false)
            .add_preload_model("tiny")
            .build();
        assert_eq!(config.port, 1234);
        assert_eq!(config.api_key.as_deref(), Some("k"));
        assert!(!config.warmup.auto_warmup);
        assert_eq!(config.preload_models, vec!["tiny".to_string()]);
    }
}
