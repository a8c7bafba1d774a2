use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use roomhub_core::CollaboratorError;
use thiserror::Error;

/// Why a connection request was turned away before upgrade.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum HandshakeError {
    #[error("missing required parameter: {0}")]
    MissingParameter(&'static str),
}

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("failed to bind listener: {0}")]
    Bind(#[from] std::io::Error),

    #[error("hub is not running")]
    HubClosed,

    #[error(transparent)]
    Handshake(#[from] HandshakeError),

    #[error(transparent)]
    Collaborator(#[from] CollaboratorError),
}

impl ServerError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::Handshake(_) => StatusCode::BAD_REQUEST,
            Self::HubClosed => StatusCode::SERVICE_UNAVAILABLE,
            Self::Collaborator(e) if e.is_retryable() => StatusCode::SERVICE_UNAVAILABLE,
            Self::Bind(_) | Self::Collaborator(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ServerError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        if status.is_server_error() {
            tracing::warn!(error = %self, "request failed");
        }
        (status, Json(serde_json::json!({ "error": self.to_string() }))).into_response()
    }
}
