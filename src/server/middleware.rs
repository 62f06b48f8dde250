//! Middleware for authentication and CORS

use axum::{
    extract::{Request, State},
    http::header,
    middleware::Next,
    response::{IntoResponse, Response},
};
use tracing::warn;

use super::error::ApiError;
use crate::error::AuthError;
use crate::server::state::{CorsConfig, ServerState};

/// Extract the presented key from `Authorization: Bearer` or `x-api-key`
fn presented_key(request: &Request) -> Option<&str> {
    let headers = request.headers();
    headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|h| h.strip_prefix("Bearer "))
        .or_else(|| headers.get("x-api-key").and_then(|v| v.to_str().ok()))
        .map(str::trim)
}

pub fn check_api_key(expected: Option<&str>, presented: Option<&str>) -> Result<(), AuthError> {
    let Some(expected) = expected else {
        return Ok(());
    };
    match presented {
        Some(key) if key == expected => Ok(()),
        Some(_) => Err(AuthError::Invalid),
        None => Err(AuthError::Missing),
    }
}

/// API key authentication middleware. Rejects before any handler runs, so a
/// refused request never resolves, loads or warms a model.
pub async fn auth_middleware(
    State(state): State<ServerState>,
    request: Request,
    next: Next,
) -> Response {
    if let Err(e) = check_api_key(state.config.api_key.as_deref(), presented_key(&request)) {
        if e == AuthError::Invalid {
            warn!("Invalid API key attempt on {}", request.uri().path());
        }
        return ApiError::from(e).into_response();
    }
    next.run(request).await
}

/// CORS middleware configuration
pub fn cors_layer(config: &CorsConfig) -> tower_http::cors::CorsLayer {
    use axum::http::{HeaderName, HeaderValue, Method};
    use tower_http::cors::{Any, CorsLayer};

    let mut cors = CorsLayer::new()
        .allow_methods([Method::GET, Method::POST, Method::DELETE, Method::OPTIONS])
        .allow_headers([
            header::CONTENT_TYPE,
            header::AUTHORIZATION,
            header::ACCEPT,
            header::ORIGIN,
            HeaderName::from_static("x-api-key"),
            HeaderName::from_static("x-request-id"),
            HeaderName::from_static("openai-organization"),
            HeaderName::from_static("openai-project"),
        ])
        .max_age(std::time::Duration::from_secs(config.max_age));

    if config.allows_any_origin() {
        // Credentials are never combined with a wildcard origin
        cors = cors.allow_origin(Any).allow_credentials(false);
    } else {
        let origins: Vec<HeaderValue> = config
            .allowed_origins
            .iter()
            .filter_map(|o| o.parse::<HeaderValue>().ok())
            .collect();
        cors = cors.allow_origin(origins);
        if config.allow_credentials {
            cors = cors.allow_credentials(true);
        }
    }
    cors
}
