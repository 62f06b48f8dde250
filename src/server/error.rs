//! HTTP error envelope
//!
//! Every failure leaves the server as `{error: {message, type, code,
//! suggestions?}}` with a status code derived from the core error.

use axum::{
    extract::rejection::{JsonRejection, QueryRejection},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use tracing::{error, warn};

use crate::api::openai_compat::{ErrorDetail, ErrorResponse};
use crate::error::{AuthError, CacheError, InferenceError, ModelLoadError, ValidationError};

#[derive(Debug, Clone)]
pub struct ApiError {
    pub status: StatusCode,
    pub error_type: &'static str,
    pub code: &'static str,
    pub message: String,
    pub suggestions: Vec<String>,
}

impl ApiError {
    pub fn new(
        status: StatusCode,
        error_type: &'static str,
        code: &'static str,
        message: impl Into<String>,
    ) -> Self {
        Self {
            status,
            error_type,
            code,
            message: message.into(),
            suggestions: Vec::new(),
        }
    }

    pub fn with_suggestion(mut self, suggestion: impl Into<String>) -> Self {
        self.suggestions.push(suggestion.into());
        self
    }

    pub fn model_not_found(message: impl Into<String>) -> Self {
        Self::new(
            StatusCode::NOT_FOUND,
            "invalid_request_error",
            "model_not_found",
            message,
        )
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(
            StatusCode::INTERNAL_SERVER_ERROR,
            "server_error",
            "internal_error",
            message,
        )
    }

    pub fn body(&self) -> ErrorResponse {
        ErrorResponse {
            error: ErrorDetail {
                message: self.message.clone(),
                error_type: self.error_type.to_string(),
                code: self.code.to_string(),
                suggestions: self.suggestions.clone(),
            },
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        if self.status.is_server_error() {
            error!("{} ({}): {}", self.status, self.code, self.message);
        } else {
            warn!("{} ({}): {}", self.status, self.code, self.message);
        }
        (self.status, Json(self.body())).into_response()
    }
}

impl From<ModelLoadError> for ApiError {
    fn from(err: ModelLoadError) -> Self {
        let message = err.to_string();
        match err {
            ModelLoadError::NotFound(id) => Self::model_not_found(message)
                .with_suggestion(format!(
                    "Place '{id}' under the models directory or pass an explicit path to /api/models/load"
                )),
            ModelLoadError::InsufficientMemory { .. } => Self::new(
                StatusCode::SERVICE_UNAVAILABLE,
                "server_error",
                "insufficient_memory",
                message,
            )
            .with_suggestion("Unload another model or use a smaller quantization"),
            ModelLoadError::UnsupportedFormat(_) => Self::new(
                StatusCode::INTERNAL_SERVER_ERROR,
                "server_error",
                "unsupported_format",
                message,
            ),
            ModelLoadError::CorruptFile { .. } => Self::new(
                StatusCode::INTERNAL_SERVER_ERROR,
                "server_error",
                "corrupt_model",
                message,
            ),
            ModelLoadError::Internal(_) => Self::new(
                StatusCode::INTERNAL_SERVER_ERROR,
                "server_error",
                "model_load_error",
                message,
            ),
        }
    }
}

impl From<InferenceError> for ApiError {
    fn from(err: InferenceError) -> Self {
        let message = err.to_string();
        match err {
            InferenceError::NotLoaded(_) => Self::model_not_found(message),
            InferenceError::ContextExceeded { .. } => Self::new(
                StatusCode::BAD_REQUEST,
                "invalid_request_error",
                "context_length_exceeded",
                message,
            )
            .with_suggestion("Shorten the prompt or start a new conversation"),
            InferenceError::Unsupported(_) => Self::new(
                StatusCode::BAD_REQUEST,
                "invalid_request_error",
                "unsupported_operation",
                message,
            ),
            InferenceError::GenerationFailed(_) | InferenceError::Cancelled => Self::new(
                StatusCode::INTERNAL_SERVER_ERROR,
                "generation_error",
                "internal_error",
                message,
            ),
        }
    }
}

impl From<CacheError> for ApiError {
    fn from(err: CacheError) -> Self {
        let message = err.to_string();
        match err {
            CacheError::NotFound { .. } => Self::new(
                StatusCode::NOT_FOUND,
                "invalid_request_error",
                "cache_not_found",
                message,
            ),
            CacheError::Disabled => Self::new(
                StatusCode::BAD_REQUEST,
                "invalid_request_error",
                "cache_disabled",
                message,
            ),
            CacheError::ShapeMismatch(_) => Self::new(
                StatusCode::BAD_REQUEST,
                "invalid_request_error",
                "shape_mismatch",
                message,
            ),
            CacheError::Tensor(_) => Self::internal(message),
        }
    }
}

impl From<AuthError> for ApiError {
    fn from(err: AuthError) -> Self {
        let code = match err {
            AuthError::Missing => "missing_api_key",
            AuthError::Invalid => "invalid_api_key",
        };
        Self::new(
            StatusCode::UNAUTHORIZED,
            "authentication_error",
            code,
            err.to_string(),
        )
    }
}

impl From<ValidationError> for ApiError {
    fn from(err: ValidationError) -> Self {
        let code = match err {
            ValidationError::MissingField(_) => "missing_field",
            ValidationError::OutOfRange { .. } => "out_of_range",
        };
        Self::new(
            StatusCode::BAD_REQUEST,
            "invalid_request_error",
            code,
            err.to_string(),
        )
    }
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        Self::new(
            rejection.status(),
            "invalid_request_error",
            "invalid_json",
            rejection.body_text(),
        )
    }
}

impl From<QueryRejection> for ApiError {
    fn from(rejection: QueryRejection) -> Self {
        Self::new(
            rejection.status(),
            "invalid_request_error",
            "invalid_query",
            rejection.body_text(),
        )
    }
}
