//! HTTP error taxonomy
//!
//! Every handler returns `Result<T, AppError>`; axum turns an `AppError`
//! straight into a response via `IntoResponse`, so handlers never format
//! error bodies themselves.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("validation error: {0}")]
    Validation(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("authentication required")]
    Authentication,

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("transient I/O error: {0}")]
    TransientIo(String),

    #[error("process {0} is orphaned and can no longer accept input")]
    Orphaned(String),

    #[error("internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, message) = match &self {
            AppError::Validation(msg) => (StatusCode::BAD_REQUEST, msg.clone()),
            AppError::NotFound(msg) => (StatusCode::NOT_FOUND, msg.clone()),
            AppError::Authentication => (StatusCode::UNAUTHORIZED, self.to_string()),
            AppError::Conflict(msg) => (StatusCode::CONFLICT, msg.clone()),
            AppError::TransientIo(msg) => (StatusCode::SERVICE_UNAVAILABLE, msg.clone()),
            AppError::Orphaned(_) => (StatusCode::GONE, self.to_string()),
            AppError::Internal(err) => {
                tracing::error!(error = %err, "internal error");
                (StatusCode::INTERNAL_SERVER_ERROR, "internal error".to_string())
            }
        };

        (status, Json(json!({ "error": message }))).into_response()
    }
}

pub type AppResult<T> = Result<T, AppError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn internal_error_hides_details_from_the_response_message() {
        let err = AppError::Internal(anyhow::anyhow!("leaked secret detail"));
        assert_eq!(err.to_string(), "internal error: leaked secret detail");
    }
}
