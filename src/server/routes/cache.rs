//! KV cache inspection and control

use axum::{
    extract::{
        rejection::{JsonRejection, QueryRejection},
        Query, State,
    },
    routing::{get, post},
    Json, Router,
};
use tracing::info;

use crate::api::management::{CacheClearRequest, CacheClearResponse, CacheSettingsUpdate};
use crate::error::{CacheError, ValidationError};
use crate::runtime::kv_cache::KvCacheStats;
use crate::runtime::KvCacheSettings;
use crate::server::error::ApiError;
use crate::server::state::ServerState;

pub fn create_router() -> Router<ServerState> {
    Router::new()
        .route("/cache/status", get(cache_status))
        .route("/cache/settings", get(get_settings).post(update_settings))
        .route("/cache/clear", get(clear_cache_query).post(clear_cache))
}

async fn cache_status(State(state): State<ServerState>) -> Json<KvCacheStats> {
    Json(state.engine.kv_cache().stats())
}

async fn get_settings(State(state): State<ServerState>) -> Json<KvCacheSettings> {
    Json(state.engine.kv_cache().settings())
}

/// Partial update; eviction re-runs against the new limits
async fn update_settings(
    State(state): State<ServerState>,
    payload: Result<Json<CacheSettingsUpdate>, JsonRejection>,
) -> Result<Json<KvCacheSettings>, ApiError> {
    let Json(update) = payload?;
    let kv_cache = state.engine.kv_cache();
    let settings = update.apply(kv_cache.settings())?;
    kv_cache.update_settings(settings.clone());
    info!("KV cache settings updated: {:?}", settings);
    Ok(Json(settings))
}

async fn clear_cache(
    State(state): State<ServerState>,
    payload: Option<Json<CacheClearRequest>>,
) -> Result<Json<CacheClearResponse>, ApiError> {
    clear_entries(&state, payload.map(|Json(r)| r).unwrap_or_default())
}

/// `GET /cache/clear?model_id=..&conversation_id=..`
async fn clear_cache_query(
    State(state): State<ServerState>,
    query: Result<Query<CacheClearRequest>, QueryRejection>,
) -> Result<Json<CacheClearResponse>, ApiError> {
    let Query(request) = query?;
    clear_entries(&state, request)
}

/// Clear one conversation, every conversation of one model, or everything
fn clear_entries(
    state: &ServerState,
    request: CacheClearRequest,
) -> Result<Json<CacheClearResponse>, ApiError> {
    let kv_cache = state.engine.kv_cache();

    let cleared = match (request.model_id, request.conversation_id) {
        (Some(model_id), Some(conversation_id)) => {
            if !kv_cache.clear(&model_id, &conversation_id) {
                return Err(CacheError::NotFound {
                    model_id,
                    conversation_id,
                }
                .into());
            }
            1
        }
        (Some(model_id), None) => kv_cache.clear_model(&model_id),
        (None, Some(_)) => return Err(ValidationError::missing("model_id").into()),
        (None, None) => {
            let count = kv_cache.len();
            kv_cache.clear_all();
            count
        }
    };

    info!("Cleared {} KV cache entries", cleared);
    Ok(Json(CacheClearResponse {
        status: "success".to_string(),
        cleared,
    }))
}
