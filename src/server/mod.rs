//! Lodestar HTTP server
//!
//! - OpenAI-compatible API at `/v1`
//! - Model, warmup and KV cache management at `/api/models`
//! - Unauthenticated health check at `/` and `/health`

use anyhow::Result;
use axum::{extract::State, middleware::from_fn_with_state, routing::get, Json, Router};
use std::future::Future;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::TcpListener;
use tower_http::{timeout::TimeoutLayer, trace::TraceLayer};
use tracing::info;

pub mod error;
pub mod middleware;
pub mod routes;
pub mod state;

pub use error::ApiError;
use state::ServerState;

/// Create the main application router
pub fn create_app(state: ServerState) -> Router {
    let cors_config = state.config.cors.clone();
    let timeout_duration = Duration::from_secs(state.config.request_timeout_secs);

    let protected = Router::new()
        .nest("/v1", routes::openai::create_router())
        .nest(
            "/api/models",
            routes::models::create_router().merge(routes::cache::create_router()),
        )
        .route_layer(from_fn_with_state(
            state.clone(),
            middleware::auth_middleware,
        ));

    let mut app = Router::new()
        .route("/", get(health_check))
        .route("/health", get(health_check))
        .merge(protected)
        .layer(TimeoutLayer::new(timeout_duration))
        .layer(TraceLayer::new_for_http())
        .with_state(state);

    // CORS must be outermost
    if cors_config.enabled {
        app = app.layer(middleware::cors_layer(&cors_config));
    }

    app
}

async fn health_check(State(state): State<ServerState>) -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "healthy",
        "service": "lodestar",
        "version": env!("CARGO_PKG_VERSION"),
        "loaded_models": state.engine.registry().ids(),
        "optimization_hint": state.engine.optimization_hint(),
        "metrics": state.metrics.snapshot(),
    }))
}

/// Serve until `shutdown` resolves
pub async fn start_server<F>(addr: SocketAddr, state: ServerState, shutdown: F) -> Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let app = create_app(state);

    info!("Starting Lodestar server on {}", addr);
    info!("OpenAI-compatible API available at http://{}/v1", addr);

    let listener = TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await?;

    Ok(())
}
