//! # Error Handling
//!
//! Unified error handling for the credential broker: a domain-level taxonomy
//! ([`BrokerError`]) plus the problem+json HTTP response type ([`ApiError`])
//! with trace ID propagation.

use axum::{
    extract::rejection::JsonRejection,
    http::{HeaderMap, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
};
use serde::Serialize;
use serde_json::json;
use thiserror::Error;
use utoipa::ToSchema;

use crate::telemetry;
use crate::vault::VaultError;

/// Domain error taxonomy for broker operations.
///
/// Each variant maps to exactly one HTTP surface status; adapter-level errors
/// are wrapped with provider+operation context once and never re-wrapped.
#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("credential not found")]
    CredentialNotFound,

    /// Lock exhaustion on read, or a refresh that cannot recover. The caller
    /// cannot distinguish "refresh in progress too long" from "unrecoverable"
    /// and should restart the authorization flow.
    #[error("credential expired; please re-authorize with the provider")]
    CredentialExpired,

    #[error("invalid credential type: {0}")]
    InvalidCredentialType(String),

    #[error("provider '{0}' does not support token refresh")]
    RefreshNotSupported(String),

    #[error("invalid parameters: {0}")]
    InvalidParameters(String),

    /// Token missing, malformed, or rejected by the provider (401/403).
    #[error("credential error: {0}")]
    BadCredential(String),

    #[error("operation '{0}' not supported")]
    OperationNotSupported(String),

    /// Upstream provider error, wrapped once with provider and operation.
    #[error("provider '{provider}' failed during {operation}: {message}")]
    ProviderApi {
        provider: String,
        operation: String,
        message: String,
    },

    #[error(transparent)]
    Vault(#[from] VaultError),

    #[error("redirect url rejected: {0}")]
    RedirectRejected(String),

    #[error("oauth state not found")]
    OAuthStateNotFound,

    #[error("event publish failed: {0}")]
    EventPublish(String),

    #[error(transparent)]
    Database(#[from] sea_orm::DbErr),
}

impl BrokerError {
    /// Wrap a provider adapter failure with its context. Applied exactly once
    /// at the call site that crossed the port.
    pub fn provider<S: Into<String>>(provider: &str, operation: &str, message: S) -> Self {
        Self::ProviderApi {
            provider: provider.to_string(),
            operation: operation.to_string(),
            message: message.into(),
        }
    }
}

/// Unified API error response structure
#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct ApiError {
    /// HTTP status code for the response
    #[serde(skip_serializing, skip_deserializing)]
    pub status: StatusCode,
    /// Error code for programmatic handling
    pub code: Box<str>,
    /// Human-readable error message
    pub message: Box<str>,
    /// Additional error details (optional)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<Box<serde_json::Value>>,
    /// Suggested retry delay in seconds (optional)
    pub retry_after: Option<u64>,
    /// Correlation trace ID for debugging (optional)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub trace_id: Option<Box<str>>,
}

impl ApiError {
    /// Create a new API error with the given status code and message
    pub fn new<S: Into<String>>(status: StatusCode, code: S, message: S) -> Self {
        Self {
            status,
            code: code.into().into_boxed_str(),
            message: message.into().into_boxed_str(),
            details: None,
            retry_after: None,
            trace_id: Self::current_trace_id(),
        }
    }

    /// Add details to the error
    pub fn with_details<V: Into<serde_json::Value>>(mut self, details: V) -> Self {
        self.details = Some(Box::new(details.into()));
        self
    }

    /// Set retry after delay
    pub fn with_retry_after(mut self, seconds: u64) -> Self {
        self.retry_after = Some(seconds);
        self
    }

    /// Extract current trace ID from the active tracing span (falls back to generated correlation ID)
    fn current_trace_id() -> Option<Box<str>> {
        telemetry::current_trace_id()
            .map(|trace_id| trace_id.into_boxed_str())
            .or_else(|| {
                // Fallback: generate a correlation ID for basic client-server log correlation
                Some(format!("corr-{}", &uuid::Uuid::new_v4().to_string()[..8]).into_boxed_str())
            })
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let mut headers = HeaderMap::new();
        headers.insert(
            "content-type",
            HeaderValue::from_static("application/problem+json"),
        );

        if let Some(retry_after) = self.retry_after
            && let Ok(header_value) = HeaderValue::from_str(&retry_after.to_string())
        {
            headers.insert("retry-after", header_value);
        }

        (self.status, headers, axum::Json(self)).into_response()
    }
}

impl From<BrokerError> for ApiError {
    fn from(error: BrokerError) -> Self {
        match error {
            BrokerError::CredentialNotFound => Self::new(
                StatusCode::NOT_FOUND,
                "CREDENTIAL_NOT_FOUND",
                "Credential not found",
            ),
            BrokerError::CredentialExpired => Self::new(
                StatusCode::UNAUTHORIZED,
                "CREDENTIAL_EXPIRED",
                "Credential expired; please re-authorize with the provider",
            ),
            BrokerError::InvalidCredentialType(_) => Self::new(
                StatusCode::INTERNAL_SERVER_ERROR,
                "INVALID_CREDENTIAL_TYPE",
                "Internal credential type dispatch failed",
            ),
            BrokerError::RefreshNotSupported(ref provider) => Self::new(
                StatusCode::NOT_IMPLEMENTED,
                "REFRESH_NOT_SUPPORTED",
                &format!("provider '{}' does not support token refresh", provider),
            ),
            BrokerError::InvalidParameters(ref message) => Self::new(
                StatusCode::BAD_REQUEST,
                "VALIDATION_FAILED",
                message.as_str(),
            ),
            BrokerError::BadCredential(ref message) => Self::new(
                StatusCode::UNAUTHORIZED,
                "CREDENTIAL_ERROR",
                message.as_str(),
            ),
            BrokerError::OperationNotSupported(ref op) => Self::new(
                StatusCode::NOT_FOUND,
                "OPERATION_NOT_SUPPORTED",
                &format!("operation '{}' not supported", op),
            ),
            BrokerError::ProviderApi {
                ref provider,
                ref operation,
                ref message,
            } => Self::new(
                StatusCode::BAD_GATEWAY,
                "PROVIDER_ERROR",
                &format!("Provider {} failed during {}", provider, operation),
            )
            .with_details(json!({
                "provider": provider,
                "operation": operation,
                "message": truncate_snippet(message),
            })),
            BrokerError::Vault(ref err) => {
                // Log the kind only; vault errors must not leak material.
                tracing::error!(error = %err, "Vault operation failed");
                Self::new(
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "VAULT_ERROR",
                    "Encryption service error",
                )
            }
            BrokerError::RedirectRejected(ref message) => Self::new(
                StatusCode::BAD_REQUEST,
                "REDIRECT_REJECTED",
                message.as_str(),
            ),
            BrokerError::OAuthStateNotFound => Self::new(
                StatusCode::INTERNAL_SERVER_ERROR,
                "OAUTH_STATE_NOT_FOUND",
                "Unknown or expired OAuth state",
            ),
            BrokerError::EventPublish(ref message) => {
                tracing::error!(error = %message, "Event publish failed");
                Self::new(
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "INTERNAL_SERVER_ERROR",
                    "An internal error occurred",
                )
            }
            BrokerError::Database(db_err) => db_err.into(),
        }
    }
}

impl IntoResponse for BrokerError {
    fn into_response(self) -> Response {
        ApiError::from(self).into_response()
    }
}

impl From<anyhow::Error> for ApiError {
    fn from(error: anyhow::Error) -> Self {
        tracing::error!("Internal error: {:?}", error);

        Self::new(
            StatusCode::INTERNAL_SERVER_ERROR,
            "INTERNAL_SERVER_ERROR",
            "An internal error occurred",
        )
    }
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        let message = match rejection {
            JsonRejection::JsonDataError(err) => format!("Invalid JSON: {}", err),
            JsonRejection::JsonSyntaxError(err) => format!("JSON syntax error: {}", err),
            JsonRejection::MissingJsonContentType(_) => {
                "Missing 'Content-Type: application/json' header".to_string()
            }
            _ => "Invalid request body".to_string(),
        };

        Self::new(StatusCode::BAD_REQUEST, "VALIDATION_FAILED", &message)
    }
}

impl From<sea_orm::DbErr> for ApiError {
    fn from(error: sea_orm::DbErr) -> Self {
        match error {
            sea_orm::DbErr::RecordNotFound(record) => Self::new(
                StatusCode::NOT_FOUND,
                "NOT_FOUND",
                &format!("Record not found: {}", record),
            ),
            sea_orm::DbErr::Conn(connection_err) => {
                tracing::error!("Database connection error: {:?}", connection_err);
                Self::new(
                    StatusCode::SERVICE_UNAVAILABLE,
                    "SERVICE_UNAVAILABLE",
                    "Database service unavailable",
                )
            }
            other => {
                tracing::error!("Database error: {:?}", other);
                Self::new(
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "INTERNAL_SERVER_ERROR",
                    "Database error occurred",
                )
            }
        }
    }
}

/// Create an unauthorized error (401)
pub fn unauthorized(message: Option<&str>) -> ApiError {
    let msg = message.unwrap_or("Authentication required");
    ApiError::new(StatusCode::UNAUTHORIZED, "UNAUTHORIZED", msg)
}

/// Create an unauthorized error (401) with explicit trace_id
pub fn unauthorized_with_trace_id(message: Option<&str>, trace_id: String) -> ApiError {
    let mut error = unauthorized(message);
    error.trace_id = Some(trace_id.into_boxed_str());
    error
}

/// Create a forbidden error (403)
pub fn forbidden(message: Option<&str>) -> ApiError {
    let msg = message.unwrap_or("Insufficient permissions");
    ApiError::new(StatusCode::FORBIDDEN, "FORBIDDEN", msg)
}

/// Create a validation error with field details
pub fn validation_error(message: &str, field_errors: serde_json::Value) -> ApiError {
    ApiError::new(StatusCode::BAD_REQUEST, "VALIDATION_FAILED", message).with_details(field_errors)
}

fn truncate_snippet(body: &str) -> String {
    if body.chars().count() > 200 {
        let truncated: String = body.chars().take(200).collect();
        format!("{}...", truncated)
    } else {
        body.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::StatusCode;

    #[test]
    fn test_api_error_basic() {
        let error = ApiError::new(
            StatusCode::BAD_REQUEST,
            "VALIDATION_FAILED",
            "Test error message",
        );

        assert_eq!(error.code, Box::from("VALIDATION_FAILED"));
        assert_eq!(error.message, Box::from("Test error message"));
        assert_eq!(error.details, None);
        assert_eq!(error.retry_after, None);
        assert!(error.trace_id.is_some());
    }

    #[test]
    fn test_broker_error_status_mapping() {
        let cases: Vec<(BrokerError, StatusCode, &str)> = vec![
            (
                BrokerError::CredentialNotFound,
                StatusCode::NOT_FOUND,
                "CREDENTIAL_NOT_FOUND",
            ),
            (
                BrokerError::CredentialExpired,
                StatusCode::UNAUTHORIZED,
                "CREDENTIAL_EXPIRED",
            ),
            (
                BrokerError::InvalidCredentialType("bogus".into()),
                StatusCode::INTERNAL_SERVER_ERROR,
                "INVALID_CREDENTIAL_TYPE",
            ),
            (
                BrokerError::RefreshNotSupported("tmdb".into()),
                StatusCode::NOT_IMPLEMENTED,
                "REFRESH_NOT_SUPPORTED",
            ),
            (
                BrokerError::InvalidParameters("api_key must not be empty".into()),
                StatusCode::BAD_REQUEST,
                "VALIDATION_FAILED",
            ),
            (
                BrokerError::BadCredential("token missing".into()),
                StatusCode::UNAUTHORIZED,
                "CREDENTIAL_ERROR",
            ),
            (
                BrokerError::OperationNotSupported("frobnicate".into()),
                StatusCode::NOT_FOUND,
                "OPERATION_NOT_SUPPORTED",
            ),
            (
                BrokerError::RedirectRejected("scheme not allowed".into()),
                StatusCode::BAD_REQUEST,
                "REDIRECT_REJECTED",
            ),
            (
                BrokerError::OAuthStateNotFound,
                StatusCode::INTERNAL_SERVER_ERROR,
                "OAUTH_STATE_NOT_FOUND",
            ),
        ];

        for (error, status, code) in cases {
            let api: ApiError = error.into();
            assert_eq!(api.status, status);
            assert_eq!(api.code.as_ref(), code);
        }
    }

    #[test]
    fn test_provider_error_maps_to_bad_gateway_with_details() {
        let error = BrokerError::provider("notion", "refresh", "HTTP 503: unavailable");
        let api: ApiError = error.into();

        assert_eq!(api.status, StatusCode::BAD_GATEWAY);
        assert_eq!(api.code.as_ref(), "PROVIDER_ERROR");

        let details = api.details.expect("provider errors carry details");
        let obj = details.as_object().unwrap();
        assert_eq!(obj.get("provider").unwrap(), "notion");
        assert_eq!(obj.get("operation").unwrap(), "refresh");
    }

    #[test]
    fn test_vault_error_never_leaks_material() {
        let error = BrokerError::Vault(VaultError::DecryptionFailed);
        let api: ApiError = error.into();

        assert_eq!(api.status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(api.code.as_ref(), "VAULT_ERROR");
        assert!(!api.message.contains("key"));
        assert!(api.details.is_none());
    }

    #[test]
    fn test_content_type_header() {
        let error = ApiError::new(StatusCode::BAD_REQUEST, "VALIDATION_FAILED", "Test error");
        let response = error.into_response();

        assert_eq!(
            response.headers().get("content-type").unwrap(),
            "application/problem+json"
        );
    }

    #[test]
    fn test_retry_after_header() {
        let error = ApiError::new(
            StatusCode::TOO_MANY_REQUESTS,
            "RATE_LIMITED",
            "Rate limit exceeded",
        )
        .with_retry_after(60);

        let response = error.into_response();
        assert_eq!(response.headers().get("retry-after").unwrap(), "60");
    }

    #[test]
    fn test_database_error_mapping() {
        let db_error = sea_orm::DbErr::RecordNotFound("credential".to_string());
        let api_error: ApiError = db_error.into();

        assert_eq!(api_error.status, StatusCode::NOT_FOUND);
        assert_eq!(api_error.code, Box::from("NOT_FOUND"));
    }

    #[test]
    fn test_provider_snippet_truncation() {
        let long = "x".repeat(500);
        let api: ApiError = BrokerError::provider("eodhd", "exchange_code", long).into();
        let details = api.details.unwrap();
        let snippet = details
            .as_object()
            .unwrap()
            .get("message")
            .unwrap()
            .as_str()
            .unwrap();
        assert!(snippet.chars().count() <= 203);
        assert!(snippet.ends_with("..."));
    }
}
