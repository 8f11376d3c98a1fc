use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use thiserror::Error;

use drip_common::store::StoreError;

/// Enumeration of errors surfaced by the ingress API.
#[derive(Error, Debug)]
pub enum ApiError {
    #[error("missing x-webhook-secret header")]
    MissingSecret,
    #[error("invalid webhook secret")]
    InvalidSecret,
    #[error("rate limited")]
    RateLimited,
    #[error("Unknown tool: {tool}")]
    UnknownTool {
        tool: String,
        available: Vec<&'static str>,
    },
    #[error("{0}")]
    Validation(String),
    #[error("batch not found: {0}")]
    BatchNotFound(String),
    #[error("store operation failed: {0}")]
    Store(#[from] StoreError),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self {
            ApiError::MissingSecret => StatusCode::UNAUTHORIZED,
            ApiError::InvalidSecret => StatusCode::FORBIDDEN,
            ApiError::RateLimited => StatusCode::TOO_MANY_REQUESTS,
            ApiError::UnknownTool { .. } | ApiError::Validation(_) => StatusCode::BAD_REQUEST,
            ApiError::BatchNotFound(_) => StatusCode::NOT_FOUND,
            ApiError::Store(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };

        let body = match &self {
            ApiError::UnknownTool { available, .. } => json!({
                "error": self.to_string(),
                "available_tools": available,
            }),
            _ => json!({ "error": self.to_string() }),
        };

        if status.is_server_error() {
            tracing::error!("request failed: {}", self);
        }

        (status, Json(body)).into_response()
    }
}
