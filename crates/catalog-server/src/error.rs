use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde::Serialize;
use thiserror::Error;

use crate::service::ServiceError;

/// API errors mapped to HTTP responses.
///
/// Every error renders as
/// `{"error": {"message": "...", "status": 404, "requestId": "..."}}`.
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("Bad request: {0}")]
    BadRequest(String),
    #[error("Not found: {0}")]
    NotFound(String),
    #[error("Conflict: {0}")]
    Conflict(String),
    #[error("Service unavailable: {0}")]
    Unavailable(String),
    #[error("Internal server error: {0}")]
    Internal(String),
}

impl ApiError {
    pub fn bad_request(msg: impl Into<String>) -> Self {
        Self::BadRequest(msg.into())
    }
    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::NotFound(msg.into())
    }
    pub fn unavailable(msg: impl Into<String>) -> Self {
        Self::Unavailable(msg.into())
    }
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::BadRequest(_) => StatusCode::BAD_REQUEST,
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::Conflict(_) => StatusCode::CONFLICT,
            Self::Unavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Message shown to clients. Server-side details stay in the logs.
    fn public_message(&self) -> String {
        match self {
            Self::BadRequest(msg) | Self::NotFound(msg) | Self::Conflict(msg) => msg.clone(),
            Self::Unavailable(_) => "Service temporarily unavailable".to_string(),
            Self::Internal(_) => "Internal server error".to_string(),
        }
    }
}

impl From<ServiceError> for ApiError {
    fn from(err: ServiceError) -> Self {
        match err {
            ServiceError::NotFound { entity, .. } => Self::NotFound(format!("{entity} not found")),
            ServiceError::Conflict(msg) => Self::Conflict(msg),
            ServiceError::InvalidInput(msg) => Self::BadRequest(msg),
            ServiceError::Unavailable(msg) => Self::Unavailable(msg),
            ServiceError::Origin(e) => Self::internal(e.to_string()),
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ErrorDetail {
    message: String,
    status: u16,
    request_id: String,
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: ErrorDetail,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let request_id =
            crate::middleware::current_request_id().unwrap_or_else(|| "unknown".to_string());

        if status.is_server_error() {
            tracing::error!(error = %self, request_id = %request_id, status = status.as_u16(), "Request error");
        } else {
            tracing::debug!(error = %self, request_id = %request_id, status = status.as_u16(), "Request rejected");
        }

        let body = ErrorBody {
            error: ErrorDetail {
                message: self.public_message(),
                status: status.as_u16(),
                request_id,
            },
        };
        (status, Json(body)).into_response()
    }
}
