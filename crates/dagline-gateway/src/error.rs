use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use chrono::Utc;

use dagline_core::error::DaglineError;

/// API error with the documented body shape:
/// `{error, message, path, timestamp}`.
#[derive(Debug)]
pub struct ApiError {
    pub status: StatusCode,
    pub error: &'static str,
    pub message: String,
    pub path: String,
}

impl ApiError {
    pub fn validation(message: impl Into<String>, path: &str) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            error: "ValidationError",
            message: message.into(),
            path: path.to_string(),
        }
    }

    pub fn not_found(message: impl Into<String>, path: &str) -> Self {
        Self {
            status: StatusCode::NOT_FOUND,
            error: "NotFoundError",
            message: message.into(),
            path: path.to_string(),
        }
    }

    pub fn conflict(message: impl Into<String>, path: &str) -> Self {
        Self {
            status: StatusCode::CONFLICT,
            error: "InvalidTransition",
            message: message.into(),
            path: path.to_string(),
        }
    }

    pub fn internal(message: impl Into<String>, path: &str) -> Self {
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            error: "InternalError",
            message: message.into(),
            path: path.to_string(),
        }
    }

    /// Map a core error onto the HTTP error taxonomy.
    pub fn from_core(err: DaglineError, path: &str) -> Self {
        match err {
            DaglineError::Validation(_)
            | DaglineError::UnknownEngine(_)
            | DaglineError::Workflow(_) => Self::validation(err.to_string(), path),
            DaglineError::RunNotFound(_) => Self::not_found(err.to_string(), path),
            DaglineError::InvalidTransition { .. } => Self::conflict(err.to_string(), path),
            other => Self::internal(other.to_string(), path),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = Json(serde_json::json!({
            "error": self.error,
            "message": self.message,
            "path": self.path,
            "timestamp": Utc::now(),
        }));
        (self.status, body).into_response()
    }
}
