use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use thiserror::Error;

use crate::models::envelope::Envelope;

pub type ApiResult<T> = Result<T, ApiError>;

/// Failure taxonomy shared by the upstream client, the resolvers and the
/// HTTP handlers.
#[derive(Debug, Clone, Error)]
pub enum ApiError {
    /// Request never produced a response (connect error, timeout, reset).
    #[error("Network failure: {0}")]
    Network(String),

    /// Upstream answered with an error status or `success: false`.
    #[error("{message}")]
    ServerRejection { status: u16, message: String },

    /// Client-side check failed; nothing was sent upstream.
    #[error("{0}")]
    Validation(String),

    #[error("Session expired, please sign in again")]
    AuthExpiry,

    #[error("Unexpected response from LMS: {0}")]
    Decode(String),

    #[error("{0}")]
    NotFound(String),

    #[error("{0}")]
    Conflict(String),

    #[error("{0}")]
    Forbidden(String),
}

impl ApiError {
    pub fn rejection(status: u16, message: impl Into<String>) -> Self {
        ApiError::ServerRejection {
            status,
            message: message.into(),
        }
    }

    pub fn is_network(&self) -> bool {
        matches!(self, ApiError::Network(_))
    }

    pub fn status_code(&self) -> StatusCode {
        match self {
            ApiError::Network(_) | ApiError::Decode(_) => StatusCode::BAD_GATEWAY,
            ApiError::ServerRejection { status, .. } => {
                StatusCode::from_u16(*status).unwrap_or(StatusCode::BAD_GATEWAY)
            }
            ApiError::Validation(_) => StatusCode::BAD_REQUEST,
            ApiError::AuthExpiry => StatusCode::UNAUTHORIZED,
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::Conflict(_) => StatusCode::CONFLICT,
            ApiError::Forbidden(_) => StatusCode::FORBIDDEN,
        }
    }
}

impl From<reqwest::Error> for ApiError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_decode() {
            ApiError::Decode(err.to_string())
        } else {
            ApiError::Network(err.to_string())
        }
    }
}

impl From<validator::ValidationErrors> for ApiError {
    fn from(errors: validator::ValidationErrors) -> Self {
        ApiError::Validation(format!("Validation failed: {}", errors))
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        if status.is_server_error() {
            tracing::error!("Request failed: {}", self);
        } else {
            tracing::warn!("Request rejected ({}): {}", status, self);
        }
        (status, Json(Envelope::<()>::failure(self.to_string()))).into_response()
    }
}
