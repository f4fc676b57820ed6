//! API error handling for consistent JSON error responses.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;

use crate::credentials::CredentialError;
use crate::integrations::{ErrorKind, GatewayError};
use crate::suggestions::SuggestionError;
use crate::workflow::RegistryError;

/// API error type that converts to JSON responses.
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    message: String,
    retry_after: Option<u64>,
}

impl ApiError {
    pub fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
            retry_after: None,
        }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, message)
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(StatusCode::NOT_FOUND, message)
    }

    pub fn rate_limited(message: impl Into<String>, retry_after: Option<u64>) -> Self {
        Self {
            retry_after,
            ..Self::new(StatusCode::TOO_MANY_REQUESTS, message)
        }
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = Json(json!({
            "error": true,
            "message": self.message,
            "retry_after": self.retry_after,
        }));
        (self.status, body).into_response()
    }
}

impl From<anyhow::Error> for ApiError {
    fn from(err: anyhow::Error) -> Self {
        Self::internal(err.to_string())
    }
}

impl From<RegistryError> for ApiError {
    fn from(err: RegistryError) -> Self {
        match err {
            RegistryError::NotFound(_) => Self::not_found(err.to_string()),
            RegistryError::Closed(_) => Self::new(StatusCode::GONE, err.to_string()),
        }
    }
}

impl From<SuggestionError> for ApiError {
    fn from(err: SuggestionError) -> Self {
        match err {
            SuggestionError::MissingTranscript => Self::bad_request(err.to_string()),
            SuggestionError::RateLimited { retry_after_secs } => {
                Self::rate_limited(err.to_string(), Some(retry_after_secs))
            }
            SuggestionError::Service(_) => Self::new(StatusCode::BAD_GATEWAY, err.to_string()),
        }
    }
}

impl From<GatewayError> for ApiError {
    fn from(err: GatewayError) -> Self {
        let message = err.user_message();
        match &err {
            GatewayError::Credential(CredentialError::NotFound { .. }) => Self::not_found(message),
            GatewayError::Provider(e) if e.kind == ErrorKind::NotFound => Self::not_found(message),
            GatewayError::Provider(e) if e.kind == ErrorKind::RateLimited => {
                Self::rate_limited(message, err.retry_after())
            }
            GatewayError::Provider(e) if e.kind == ErrorKind::Validation => Self::bad_request(message),
            GatewayError::Unsupported(_) => Self::bad_request(message),
            _ => Self::new(StatusCode::BAD_GATEWAY, message),
        }
    }
}

/// Result type for API handlers.
pub type ApiResult<T> = Result<T, ApiError>;
