//! Model management endpoints

use axum::{
    extract::{rejection::JsonRejection, Path, State},
    routing::{get, post},
    Json, Router,
};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::info;

use crate::api::management::{
    LoadModelRequest, LoadModelResponse, ModelListResponse, StatusResponse, UnloadModelRequest,
    WarmupRequest, WarmupResponse,
};
use crate::engine::ModelLoadRequest;
use crate::error::{ModelLoadError, ValidationError};
use crate::runtime::{LoadOptions, WarmupMode, WarmupStatus};
use crate::server::error::ApiError;
use crate::server::state::ServerState;

/// Create model management router
pub fn create_router() -> Router<ServerState> {
    Router::new()
        .route("/load", post(load_model))
        .route("/unload", post(unload_model))
        .route("/list", get(list_models))
        .route("/warmup/status", get(warmup_status))
        .route("/warmup/:model_id", post(warmup_model))
}

fn required_id(model_id: Option<String>) -> Result<String, ValidationError> {
    model_id
        .map(|id| id.trim().to_owned())
        .filter(|id| !id.is_empty())
        .ok_or_else(|| ValidationError::missing("model_id"))
}

/// Load a model by id, or from an explicit path
async fn load_model(
    State(state): State<ServerState>,
    payload: Result<Json<LoadModelRequest>, JsonRejection>,
) -> Result<Json<LoadModelResponse>, ApiError> {
    let Json(request) = payload?;
    let model_id = required_id(request.model_id)?;

    let mut load = ModelLoadRequest::new(&model_id);
    load.path = request.path;
    load.options = LoadOptions {
        context_length: request.context_length,
        cpu_only: request.cpu_only,
    };
    load.auto_warmup = request.auto_warmup;
    load.warmup_prompts = request.warmup_prompts;

    let outcome = state.engine.load_model(load).await?;
    let message = if outcome.is_new() {
        format!("Model '{model_id}' loaded successfully")
    } else {
        format!("Model '{model_id}' is already loaded")
    };
    info!("{}", message);

    Ok(Json(LoadModelResponse {
        status: outcome.status().to_string(),
        model_id,
        message,
        model: outcome.descriptor().clone(),
    }))
}

async fn unload_model(
    State(state): State<ServerState>,
    payload: Result<Json<UnloadModelRequest>, JsonRejection>,
) -> Result<Json<StatusResponse>, ApiError> {
    let Json(request) = payload?;
    let model_id = required_id(request.model_id)?;

    match state.engine.unload_model(&model_id).await {
        Ok(_) => Ok(Json(StatusResponse {
            status: "success".to_string(),
            message: format!("Model '{model_id}' unloaded"),
        })),
        Err(ModelLoadError::NotFound(_)) => Err(ApiError::model_not_found(format!(
            "Model '{model_id}' is not currently loaded"
        ))),
        Err(e) => Err(e.into()),
    }
}

async fn list_models(State(state): State<ServerState>) -> Result<Json<ModelListResponse>, ApiError> {
    let factory = Arc::clone(state.engine.factory());
    let models = tokio::task::spawn_blocking(move || factory.catalog())
        .await
        .map_err(|e| ApiError::internal(format!("Model scan failed: {e}")))?;
    Ok(Json(ModelListResponse { models }))
}

/// Warm a loaded model. The body is optional; `{"async": true}` returns
/// immediately with status `warming`.
async fn warmup_model(
    State(state): State<ServerState>,
    Path(model_id): Path<String>,
    payload: Option<Json<WarmupRequest>>,
) -> Result<Json<WarmupResponse>, ApiError> {
    let request = payload.map(|Json(r)| r).unwrap_or_default();
    let model = state.engine.registry().get(&model_id).ok_or_else(|| {
        ApiError::model_not_found(format!("Model '{model_id}' is not loaded"))
            .with_suggestion("Load it first with POST /api/models/load")
    })?;

    let num_prompts = request
        .num_prompts
        .unwrap_or_else(|| state.engine.default_warmup_prompts());
    let mode = if request.run_async {
        WarmupMode::Async
    } else {
        WarmupMode::Sync
    };
    let status = state.engine.warmup().warmup(model, num_prompts, mode).await;
    Ok(Json(WarmupResponse::from_status(status, request.run_async)))
}

async fn warmup_status(State(state): State<ServerState>) -> Json<BTreeMap<String, WarmupStatus>> {
    Json(state.engine.warmup().all_statuses())
}
