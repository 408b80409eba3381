//! # Authentication and Authorization
//!
//! Bearer authentication plus user-identity propagation for protected
//! endpoints. Full identity management (JWT issuance, session handling)
//! lives in the platform's identity service; this layer only verifies the
//! service token and trusts the forwarded user id.

use std::sync::Arc;

use axum::{
    extract::{FromRef, FromRequestParts, Request, State},
    http::{HeaderMap, header::AUTHORIZATION, request::Parts},
    middleware::Next,
    response::Response,
};
use subtle::ConstantTimeEq;
use uuid::Uuid;

use crate::config::AppConfig;
use crate::error::{ApiError, unauthorized, unauthorized_with_trace_id, validation_error};
use crate::server::AppState;
use crate::telemetry::TraceContext;

/// Header carrying the authenticated end-user id, set by the identity layer
/// in front of this service.
pub const USER_ID_HEADER: &str = "x-user-id";

/// The authenticated end user a request acts on behalf of.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AuthenticatedUser(pub Uuid);

impl FromRef<AppState> for Arc<AppConfig> {
    fn from_ref(app_state: &AppState) -> Self {
        Arc::clone(&app_state.config)
    }
}

/// Authentication middleware: validates the bearer token and resolves the
/// acting user.
pub async fn auth_middleware(
    State(config): State<Arc<AppConfig>>,
    request: Request,
    next: Next,
) -> Result<Response, ApiError> {
    let headers = request.headers().clone();

    let trace_id = request
        .extensions()
        .get::<TraceContext>()
        .map(|ctx| ctx.trace_id.clone());

    let token = extract_bearer_token(&headers, trace_id)?;
    validate_token(&config, token)?;

    let user = extract_user_id(&headers)?;
    tracing::debug!(user_id = %user.0, "Authenticated request");

    let mut request = request;
    request.extensions_mut().insert(user);

    Ok(next.run(request).await)
}

fn extract_bearer_token<'h>(
    headers: &'h HeaderMap,
    trace_id: Option<String>,
) -> Result<&'h str, ApiError> {
    let reject = |message: &str| match trace_id.clone() {
        Some(trace_id) => unauthorized_with_trace_id(Some(message), trace_id),
        None => unauthorized(Some(message)),
    };

    let header = headers
        .get(AUTHORIZATION)
        .ok_or_else(|| reject("Missing Authorization header"))?;
    let value = header
        .to_str()
        .map_err(|_| reject("Invalid Authorization header"))?;
    value
        .strip_prefix("Bearer ")
        .ok_or_else(|| reject("Authorization header must use Bearer scheme"))
}

fn validate_token(config: &AppConfig, token: &str) -> Result<(), ApiError> {
    let is_valid = config
        .operator_tokens
        .iter()
        .any(|configured| ConstantTimeEq::ct_eq(token.as_bytes(), configured.as_bytes()).into());

    if is_valid {
        Ok(())
    } else {
        Err(unauthorized(Some("Invalid bearer token")))
    }
}

fn extract_user_id(headers: &HeaderMap) -> Result<AuthenticatedUser, ApiError> {
    let raw = headers
        .get(USER_ID_HEADER)
        .and_then(|value| value.to_str().ok())
        .ok_or_else(|| {
            validation_error(
                "Missing user identity header",
                serde_json::json!({ USER_ID_HEADER: "required" }),
            )
        })?;

    let user_id = Uuid::parse_str(raw).map_err(|_| {
        validation_error(
            "User identity header is not a UUID",
            serde_json::json!({ USER_ID_HEADER: "must be a UUID" }),
        )
    })?;

    Ok(AuthenticatedUser(user_id))
}

impl<S> FromRequestParts<S> for AuthenticatedUser
where
    S: Send + Sync,
{
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        parts
            .extensions
            .get::<AuthenticatedUser>()
            .copied()
            .ok_or_else(|| unauthorized(Some("Request is not authenticated")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    fn config_with_tokens(tokens: &[&str]) -> AppConfig {
        AppConfig {
            operator_tokens: tokens.iter().map(|t| t.to_string()).collect(),
            ..Default::default()
        }
    }

    #[test]
    fn test_bearer_extraction() {
        let mut headers = HeaderMap::new();
        headers.insert(AUTHORIZATION, HeaderValue::from_static("Bearer secret-1"));
        assert_eq!(extract_bearer_token(&headers, None).unwrap(), "secret-1");

        let mut bad = HeaderMap::new();
        bad.insert(AUTHORIZATION, HeaderValue::from_static("Basic dXNlcg=="));
        assert!(extract_bearer_token(&bad, None).is_err());

        assert!(extract_bearer_token(&HeaderMap::new(), None).is_err());
    }

    #[test]
    fn test_token_validation_is_exact() {
        let config = config_with_tokens(&["secret-1", "secret-2"]);
        assert!(validate_token(&config, "secret-1").is_ok());
        assert!(validate_token(&config, "secret-2").is_ok());
        assert!(validate_token(&config, "secret-3").is_err());
        assert!(validate_token(&config, "secret-11").is_err());
        assert!(validate_token(&config, "").is_err());
    }

    #[test]
    fn test_user_id_extraction() {
        let user = Uuid::new_v4();
        let mut headers = HeaderMap::new();
        headers.insert(
            USER_ID_HEADER,
            HeaderValue::from_str(&user.to_string()).unwrap(),
        );
        assert_eq!(extract_user_id(&headers).unwrap(), AuthenticatedUser(user));

        let mut bad = HeaderMap::new();
        bad.insert(USER_ID_HEADER, HeaderValue::from_static("not-a-uuid"));
        assert!(extract_user_id(&bad).is_err());

        assert!(extract_user_id(&HeaderMap::new()).is_err());
    }
}
