use anyhow::{Context, Result};
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::{info, warn};

use crate::config::ServerConfig;
use crate::engine::Engine;
use crate::integrations::ingest_dir;
use crate::models::ModelDescriptor;
use crate::server::{self, state::ServerState};

/// Run the HTTP server until Ctrl-C, then stop warmups and unload models
pub async fn handle_serve(config: ServerConfig) -> Result<()> {
    let addr: SocketAddr = config
        .bind_address()
        .parse()
        .with_context(|| format!("Invalid bind address {}", config.bind_address()))?;

    if !config.models_dir.exists() {
        warn!(
            "Models directory {} does not exist; only explicit paths can be loaded",
            config.models_dir.display()
        );
    }

    let engine = Arc::new(Engine::new(config));
    engine.preload().await;

    let state = ServerState::new(Arc::clone(&engine));
    if let (Some(store), Some(dir)) = (&state.vector_store, &engine.config().rag.documents_dir) {
        let stored = ingest_dir(store.as_ref(), dir)
            .await
            .with_context(|| format!("Failed to ingest documents from {}", dir.display()))?;
        info!("Ingested {} documents from {} for retrieval", stored, dir.display());
    }
    server::start_server(addr, state, shutdown_signal()).await?;

    engine.shutdown().await;
    Ok(())
}

async fn shutdown_signal() {
    match tokio::signal::ctrl_c().await {
        Ok(()) => info!("Received Ctrl-C, shutting down"),
        Err(e) => warn!("Failed to listen for Ctrl-C: {}", e),
    }
}

/// Print what the models directory offers
pub fn handle_models(config: ServerConfig, json: bool) -> Result<()> {
    let dir = config.models_dir.clone();
    let engine = Engine::builder(config).without_telemetry().build();
    let models: Vec<ModelDescriptor> = engine.factory().list_available().collect();

    if json {
        println!("{}", serde_json::to_string_pretty(&models)?);
        return Ok(());
    }

    if models.is_empty() {
        println!("No models found in {}", dir.display());
        return Ok(());
    }

    println!("{:<32} {:<16} {:>8} {:>10}", "ID", "FORMAT", "CONTEXT", "SIZE");
    for model in &models {
        let size = model
            .memory_usage
            .map(|b| format!("{:.1} MB", b as f64 / (1024.0 * 1024.0)))
            .unwrap_or_else(|| "-".to_string());
        println!(
            "{:<32} {:<16} {:>8} {:>10}",
            model.id, model.format, model.context_length, size
        );
    }
    Ok(())
}
