//! Error types and handling for the gateway.
//!
//! This module provides a unified error type [`AppError`] covering routing,
//! credential and device-flow failures, plus HTTP response conversion.

use crate::core::error_types::{openai_error_code, ErrorKind};
use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;

/// Main error type for the application.
#[derive(Error, Debug)]
pub enum AppError {
    /// Configuration-related errors (file not found, parse errors, etc.)
    #[error("Configuration error: {0}")]
    Config(#[from] anyhow::Error),

    /// HTTP request errors from the reqwest client
    #[error("HTTP request error: {0}")]
    Request(#[from] reqwest::Error),

    /// JSON serialization/deserialization errors
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Caller key missing, unknown or inactive
    #[error("invalid API key")]
    InvalidApiKey,

    #[error("insufficient quota")]
    InsufficientQuota,

    /// No active upstream advertises the requested model
    #[error("no configuration available for model")]
    NoConfigAvailable,

    /// A load balancer was handed an empty candidate set
    #[error("no available config")]
    NoAvailableConfig,

    /// Upstream call failed; wraps the upstream cause
    #[error("API call failed: {0}")]
    ApiCallFailed(String),

    #[error("no healthy credential available")]
    NoHealthyCredential,

    #[error("provider not found: {0}")]
    ProviderNotFound(String),

    #[error("failed to create adapter: {0}")]
    AdapterCreation(String),

    #[error("token refresh failed: {0}")]
    TokenRefresh(String),

    /// Health check verdict for a single credential
    #[error("{0}")]
    CredentialUnhealthy(String),

    #[error("pool not found: {0}")]
    PoolNotFound(String),

    /// Client sent a body that does not decode
    #[error("malformed request{}: {message}", field_suffix(.field))]
    MalformedRequest {
        field: Option<String>,
        message: String,
    },

    /// Device-code polling signal, the user has not approved yet
    #[error("authorization_pending")]
    AuthorizationPending,

    #[error("provider does not support device code flow: {0}")]
    DeviceFlowUnsupported(String),

    #[error("device code session not found: {0}")]
    SessionNotFound(String),

    #[error("storage error: {0}")]
    Storage(String),

    /// Generic internal server errors with custom message
    #[error("Internal server error: {0}")]
    Internal(String),
}

impl AppError {
    /// Shorthand for a [`AppError::MalformedRequest`] naming the offending field.
    pub fn malformed(field: impl Into<String>, message: impl Into<String>) -> Self {
        AppError::MalformedRequest {
            field: Some(field.into()),
            message: message.into(),
        }
    }

    /// HTTP status shared by all protocol families.
    pub fn status_code(&self) -> StatusCode {
        match self {
            AppError::MalformedRequest { .. } | AppError::DeviceFlowUnsupported(_) => {
                StatusCode::BAD_REQUEST
            }
            AppError::InvalidApiKey => StatusCode::UNAUTHORIZED,
            AppError::InsufficientQuota => StatusCode::PAYMENT_REQUIRED,
            AppError::NoConfigAvailable
            | AppError::SessionNotFound(_)
            | AppError::PoolNotFound(_) => StatusCode::NOT_FOUND,
            AppError::AuthorizationPending => StatusCode::ACCEPTED,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            AppError::MalformedRequest { .. } | AppError::DeviceFlowUnsupported(_) => {
                ErrorKind::InvalidRequest
            }
            AppError::InvalidApiKey => ErrorKind::Authentication,
            AppError::InsufficientQuota => ErrorKind::InsufficientQuota,
            AppError::NoConfigAvailable
            | AppError::SessionNotFound(_)
            | AppError::PoolNotFound(_) => ErrorKind::NotFound,
            _ => ErrorKind::Api,
        }
    }

    /// Wire name of [`AppError::kind`], e.g. `not_found_error`.
    pub fn error_type(&self) -> &'static str {
        self.kind().as_str()
    }

    /// Client-facing message. Routing errors get fixed wording, everything
    /// else exposes the error display.
    pub fn public_message(&self) -> String {
        match self {
            AppError::InvalidApiKey => "Invalid API key".to_string(),
            AppError::InsufficientQuota => "Insufficient quota".to_string(),
            AppError::NoConfigAvailable => {
                "No configuration available for the requested model".to_string()
            }
            other => other.to_string(),
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let body = Json(json!({
            "error": {
                "code": openai_error_code(status.as_u16()),
                "message": self.public_message(),
                "details": self.error_type(),
            }
        }));

        (status, body).into_response()
    }
}

fn field_suffix(field: &Option<String>) -> String {
    field
        .as_deref()
        .map(|f| format!(" ({f})"))
        .unwrap_or_default()
}

/// Convenience type alias for Results using [`AppError`].
pub type Result<T> = std::result::Result<T, AppError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        assert_eq!(AppError::InvalidApiKey.to_string(), "invalid API key");
        assert_eq!(
            AppError::ApiCallFailed("boom".to_string()).to_string(),
            "API call failed: boom"
        );
        assert_eq!(
            AppError::AdapterCreation("no token".to_string()).to_string(),
            "failed to create adapter: no token"
        );
    }

    #[test]
    fn test_malformed_display_includes_field() {
        let err = AppError::malformed("messages", "at least one message is required");
        assert_eq!(
            err.to_string(),
            "malformed request (messages): at least one message is required"
        );

        let err = AppError::MalformedRequest {
            field: None,
            message: "bad json".to_string(),
        };
        assert_eq!(err.to_string(), "malformed request: bad json");
    }

    #[test]
    fn test_status_mapping() {
        assert_eq!(AppError::InvalidApiKey.status_code(), StatusCode::UNAUTHORIZED);
        assert_eq!(
            AppError::InsufficientQuota.status_code(),
            StatusCode::PAYMENT_REQUIRED
        );
        assert_eq!(AppError::NoConfigAvailable.status_code(), StatusCode::NOT_FOUND);
        assert_eq!(
            AppError::PoolNotFound("p".into()).status_code(),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            AppError::ApiCallFailed("x".into()).status_code(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
        assert_eq!(
            AppError::malformed("model", "missing").status_code(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            AppError::NoHealthyCredential.status_code(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[test]
    fn test_error_into_response() {
        let response = AppError::InvalidApiKey.into_response();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

        let response = AppError::Internal("custom error".to_string()).into_response();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[test]
    fn test_error_from_anyhow() {
        let app_err: AppError = anyhow::anyhow!("test error").into();
        assert!(matches!(app_err, AppError::Config(_)));
    }

    #[test]
    fn test_error_from_serde_json() {
        let json_err = serde_json::from_str::<serde_json::Value>("invalid").unwrap_err();
        let app_err: AppError = json_err.into();
        assert!(matches!(app_err, AppError::Serialization(_)));
    }

    #[test]
    fn test_kind_mapping() {
        assert_eq!(AppError::InvalidApiKey.kind(), ErrorKind::Authentication);
        assert_eq!(AppError::NoConfigAvailable.kind(), ErrorKind::NotFound);
        assert_eq!(AppError::ProviderNotFound("x".into()).kind(), ErrorKind::Api);
    }
}
