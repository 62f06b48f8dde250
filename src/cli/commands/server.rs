//! Server CLI commands and arguments
//!
//! Configuration loading lives in [`crate::config`]; these flags are merged
//! on top of it.

use clap::Args;
use std::path::PathBuf;

use crate::config::ServerConfigBuilder;

/// CLI overrides for the server configuration
#[derive(Debug, Clone, Default, Args)]
pub struct ServerCliArgs {
    /// Server host address
    #[arg(long, env = "LODESTAR_HOST")]
    pub host: Option<String>,

    /// Server port
    #[arg(long, env = "LODESTAR_PORT")]
    pub port: Option<u16>,

    /// Directory scanned for model files
    #[arg(long, value_name = "DIR", env = "LODESTAR_MODELS_DIR")]
    pub models_dir: Option<PathBuf>,

    /// Require this key on every /v1 and /api request
    #[arg(long, env = "LODESTAR_API_KEY", hide_env_values = true)]
    pub api_key: Option<String>,

    /// Text documents ingested for `use_rag` requests
    #[arg(long, value_name = "DIR", env = "LODESTAR_RAG_DOCUMENTS")]
    pub rag_documents: Option<PathBuf>,

    /// Models to load before accepting requests
    #[arg(long, value_name = "MODEL", num_args = 1..)]
    pub preload: Vec<String>,
}

impl ServerCliArgs {
    /// Merge these CLI args into a ServerConfigBuilder
    pub fn apply_to_builder(&self, mut builder: ServerConfigBuilder) -> ServerConfigBuilder {
        if let Some(ref host) = self.host {
            builder = builder.host(host.clone());
        }
        if let Some(port) = self.port {
            builder = builder.port(port);
        }
        if let Some(ref dir) = self.models_dir {
            builder = builder.models_dir(dir.clone());
        }
        if let Some(ref key) = self.api_key {
            builder = builder.api_key(key.clone());
        }
        if let Some(ref dir) = self.rag_documents {
            builder = builder.rag_documents_dir(dir.clone());
        }
        for model in &self.preload {
            builder = builder.add_preload_model(model.clone());
        }
        builder
    }
}

#[derive(Debug, Args)]
pub struct ServeCommand {
    #[command(flatten)]
    pub server: ServerCliArgs,
}
