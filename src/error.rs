//! Core error kinds surfaced by the delivery and rollout engine

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum CoreError {
    #[error("Malformed frame: {0}")]
    MalformedFrame(String),

    #[error("Recipient not found: {0}")]
    RecipientNotFound(Uuid),

    #[error("Recipient not connected: {0}")]
    RecipientNotConnected(Uuid),

    #[error("Send failed: {0}")]
    SendFailed(String),

    #[error("Invalid bitmap: {0}")]
    InvalidBitmap(String),

    #[error("No firmware binary for version {version} on platform {platform}")]
    FirmwareUnavailable { version: String, platform: String },

    #[error("Store unavailable: {0}")]
    StoreUnavailable(#[from] anyhow::Error),
}

impl IntoResponse for CoreError {
    fn into_response(self) -> Response {
        let (status, message) = match &self {
            CoreError::MalformedFrame(_) => (StatusCode::BAD_REQUEST, self.to_string()),
            CoreError::RecipientNotFound(_) => (StatusCode::NOT_FOUND, self.to_string()),
            CoreError::RecipientNotConnected(_) => (StatusCode::CONFLICT, self.to_string()),
            CoreError::SendFailed(_) => (StatusCode::BAD_GATEWAY, self.to_string()),
            CoreError::InvalidBitmap(_) => (StatusCode::BAD_REQUEST, self.to_string()),
            CoreError::FirmwareUnavailable { .. } => (StatusCode::NOT_FOUND, self.to_string()),
            CoreError::StoreUnavailable(_) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "Persistence error".to_string(),
            ),
        };

        let body = serde_json::json!({
            "error": message,
        });

        (status, axum::Json(body)).into_response()
    }
}
