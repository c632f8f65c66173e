use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("missing or invalid credential")]
    Unauthorized,

    #[error("forbidden: {0}")]
    Forbidden(String),

    #[error("invalid request: {0}")]
    BadRequest(String),

    #[error("conversation not found")]
    ConversationNotFound,

    #[error("conversation is closed")]
    ConversationClosed,

    #[error("attachment too large: {size} bytes (max {max})")]
    AttachmentTooLarge { size: usize, max: usize },

    #[error("signed link expired")]
    LinkExpired,

    #[error("invalid signature")]
    InvalidSignature,

    #[error("storage error: {0}")]
    Storage(String),

    #[error("corrupt stored value: {0}")]
    Decode(String),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, message) = match &self {
            AppError::Unauthorized => (StatusCode::UNAUTHORIZED, self.to_string()),
            AppError::Forbidden(_) => (StatusCode::FORBIDDEN, self.to_string()),
            AppError::BadRequest(_) => (StatusCode::BAD_REQUEST, self.to_string()),
            AppError::ConversationNotFound => (StatusCode::NOT_FOUND, self.to_string()),
            AppError::ConversationClosed => (StatusCode::CONFLICT, self.to_string()),
            AppError::AttachmentTooLarge { .. } => {
                (StatusCode::PAYLOAD_TOO_LARGE, self.to_string())
            }
            AppError::LinkExpired => (StatusCode::GONE, self.to_string()),
            AppError::InvalidSignature => (StatusCode::FORBIDDEN, self.to_string()),
            AppError::Storage(_) => {
                (StatusCode::INTERNAL_SERVER_ERROR, "storage error".to_string())
            }
            AppError::Decode(_) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "internal server error".to_string(),
            ),
            AppError::Database(_) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "internal server error".to_string(),
            ),
        };

        let body = serde_json::json!({ "error": message });
        (status, axum::Json(body)).into_response()
    }
}
