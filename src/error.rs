use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;

/// Errors returned by HTTP handlers.
///
/// Storage failures carry the underlying cause for the log line and a
/// generic message for the client. Each error is logged once, here.
#[derive(Debug, Error)]
pub enum AppError {
    #[error("invalid request: {0}")]
    Validation(String),

    #[error("origin not allowed")]
    Forbidden,

    #[error("storage write failed: {0}")]
    StorageWrite(#[source] anyhow::Error),

    #[error("storage query failed: {source}")]
    StorageQuery {
        /// Client-facing message
        message: &'static str,
        #[source]
        source: anyhow::Error,
    },
}

impl AppError {
    pub fn query(message: &'static str) -> impl FnOnce(anyhow::Error) -> Self {
        move |source| AppError::StorageQuery { message, source }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, message) = match &self {
            AppError::Validation(msg) => (StatusCode::BAD_REQUEST, msg.clone()),
            AppError::Forbidden => (StatusCode::FORBIDDEN, "Origin not allowed".to_string()),
            AppError::StorageWrite(e) => {
                tracing::error!("Error saving event: {e:#}");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "Failed to save event data".to_string(),
                )
            }
            AppError::StorageQuery { message, source } => {
                tracing::error!("{message}: {source:#}");
                (StatusCode::INTERNAL_SERVER_ERROR, message.to_string())
            }
        };

        (status, Json(json!({ "error": message }))).into_response()
    }
}
