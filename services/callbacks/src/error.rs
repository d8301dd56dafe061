use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use thiserror::Error;
use tracing::error;

/// Errors returned by the callback endpoints
#[derive(Debug, Error)]
pub enum ApiError {
    /// Missing or invalid callback signature
    #[error("forbidden")]
    Forbidden,

    /// Malformed payload, key, state or extra parameter
    #[error("validation failed: {0}")]
    Validation(String),

    /// The targeted object does not exist
    #[error("object not found")]
    NotFound,

    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

/// Error response
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub code: String,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        match self {
            ApiError::Forbidden => (StatusCode::FORBIDDEN, Json("Forbidden")).into_response(),
            ApiError::Validation(message) => (
                StatusCode::BAD_REQUEST,
                Json(ErrorResponse {
                    error: message,
                    code: "VALIDATION_ERROR".to_string(),
                }),
            )
                .into_response(),
            ApiError::NotFound => (
                StatusCode::NOT_FOUND,
                Json(serde_json::json!({ "success": false })),
            )
                .into_response(),
            ApiError::Internal(e) => {
                error!(error = %e, "Callback processing failed");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    Json(ErrorResponse {
                        error: "Internal server error".to_string(),
                        code: "INTERNAL_ERROR".to_string(),
                    }),
                )
                    .into_response()
            }
        }
    }
}
