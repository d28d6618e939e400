use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use serde_json::json;
use thiserror::Error;
use uuid::Uuid;

use crate::error::GameError;

#[derive(Debug, Error)]
pub enum WebError {
    #[error("Bad request: {0}")]
    BadRequest(String),
    #[error("Game not found: {0}")]
    GameNotFound(Uuid),
    #[error("Precondition failed: {0}")]
    PreconditionFailed(String),
    #[error("Internal server error: {0}")]
    InternalServerError(String),
    #[error("JSON serialization error: {0}")]
    JsonSerialization(#[from] serde_json::Error),
}

impl WebError {
    /// Maps session-level failures onto HTTP semantics: unmet start
    /// preconditions become 409, everything else 500.
    pub fn from_game_error(err: GameError) -> Self {
        match err {
            GameError::Precondition(reason) => WebError::PreconditionFailed(reason),
            other => WebError::InternalServerError(other.to_string()),
        }
    }
}

impl IntoResponse for WebError {
    fn into_response(self) -> Response {
        let (status, error_message) = match &self {
            WebError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg.clone()),
            WebError::GameNotFound(id) => {
                (StatusCode::NOT_FOUND, format!("Game {} not found", id))
            }
            WebError::PreconditionFailed(msg) => (StatusCode::CONFLICT, msg.clone()),
            WebError::InternalServerError(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg.clone()),
            WebError::JsonSerialization(err) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                format!("JSON error: {}", err),
            ),
        };

        let body = Json(json!({
            "error": error_message,
            "status": status.as_u16()
        }));

        (status, body).into_response()
    }
}

pub type Result<T, E = WebError> = std::result::Result<T, E>;
