//! HTTP surface error responses.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;

use crate::state::StateError;

/// Errors surfaced to HTTP callers. Everything else is swallowed by the
/// pipeline and reflected through module health instead.
#[derive(Debug)]
pub enum ApiError {
    BadRequest(String),
    NotFound(String),
    Unauthorized,
    /// The pipeline produced no reply (policy unavailable or deferred).
    NoResponse,
}

impl From<StateError> for ApiError {
    fn from(error: StateError) -> Self {
        ApiError::NotFound(error.to_string())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, detail) = match self {
            ApiError::BadRequest(detail) => (StatusCode::BAD_REQUEST, detail),
            ApiError::NotFound(detail) => (StatusCode::NOT_FOUND, detail),
            ApiError::Unauthorized => (
                StatusCode::UNAUTHORIZED,
                "Invalid or missing API key".to_string(),
            ),
            ApiError::NoResponse => (
                StatusCode::ACCEPTED,
                "No response generated yet".to_string(),
            ),
        };
        (status, Json(json!({ "detail": detail }))).into_response()
    }
}
