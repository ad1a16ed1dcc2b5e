//! Crate-wide error taxonomy and its HTTP mapping.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde_json::json;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("validation: {0}")]
    Validation(String),

    #[error("auth: key mismatch")]
    Auth,

    #[error("not found: {0}")]
    NotFound(String),

    #[error("forbidden: {0}")]
    Forbidden(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("connect failed: {0}")]
    ConnectFailed(String),

    #[error("action error: {0}")]
    ActionError(String),

    #[error("timeout: {0}")]
    Timeout(String),

    #[error("unsupported: {0}")]
    Unsupported(String),
}

impl GatewayError {
    pub fn kind(&self) -> &'static str {
        match self {
            GatewayError::Validation(_) => "validation",
            GatewayError::Auth => "auth",
            GatewayError::NotFound(_) => "not_found",
            GatewayError::Forbidden(_) => "forbidden",
            GatewayError::Conflict(_) => "conflict",
            GatewayError::ConnectFailed(_) => "connect_failed",
            GatewayError::ActionError(_) => "action_error",
            GatewayError::Timeout(_) => "timeout",
            GatewayError::Unsupported(_) => "unsupported",
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            GatewayError::Validation(_) => StatusCode::BAD_REQUEST,
            GatewayError::Auth => StatusCode::UNAUTHORIZED,
            GatewayError::NotFound(_) => StatusCode::NOT_FOUND,
            GatewayError::Forbidden(_) => StatusCode::FORBIDDEN,
            GatewayError::Conflict(_) => StatusCode::CONFLICT,
            GatewayError::ConnectFailed(_)
            | GatewayError::ActionError(_)
            | GatewayError::Timeout(_)
            | GatewayError::Unsupported(_) => StatusCode::BAD_REQUEST,
        }
    }
}

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        let status = self.status();
        let body = json!({
            "error": self.kind(),
            "message": self.to_string(),
        });
        (status, axum::Json(body)).into_response()
    }
}

/// `timeout` is surfaced as `action_error` per the taxonomy; this helper keeps
/// that mapping in one place instead of repeating it at every call site.
pub fn as_action_error(err: GatewayError) -> GatewayError {
    match err {
        GatewayError::Timeout(detail) => GatewayError::ActionError(detail),
        other => other,
    }
}
