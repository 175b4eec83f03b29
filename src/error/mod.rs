use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;

/// Core error taxonomy (`spec.md` §7). All values, no exceptional control
/// flow — callers map these to HTTP statuses or WebSocket-close behavior.
#[derive(Error, Debug, PartialEq, Eq, Clone)]
pub enum AppError {
    #[error("call not found")]
    NotFound,

    #[error("call ended")]
    Ended,

    #[error("call is full")]
    Full,

    #[error("invalid peer_id")]
    InvalidPeer,

    #[error("internal error: {0}")]
    Internal(String),
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, message): (StatusCode, String) = match &self {
            AppError::NotFound => (StatusCode::NOT_FOUND, "call not found".into()),
            AppError::Ended => (StatusCode::CONFLICT, "call ended".into()),
            AppError::Full => (StatusCode::CONFLICT, "call is full".into()),
            AppError::InvalidPeer => (StatusCode::FORBIDDEN, "invalid peer_id".into()),
            AppError::Internal(msg) => {
                tracing::error!(error = %msg, "internal error");
                (StatusCode::INTERNAL_SERVER_ERROR, msg.clone())
            }
        };

        (status, Json(json!({ "error": message }))).into_response()
    }
}

pub type AppResult<T> = Result<T, AppError>;
