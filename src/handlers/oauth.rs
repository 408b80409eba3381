//! # OAuth Handshake Handlers
//!
//! Start, poll, and callback endpoints for the authorization-code + PKCE
//! flow. The callback is unauthenticated (the IdP's browser redirect carries
//! no bearer token); correlation happens through the stored state.

use std::collections::HashMap;

use axum::{
    extract::{Path, Query, State},
    http::{StatusCode, header::LOCATION},
    response::{IntoResponse, Json, Response},
};
use serde::{Deserialize, Serialize};
use serde_json::Map as JsonMap;
use utoipa::ToSchema;
use uuid::Uuid;

use crate::auth::AuthenticatedUser;
use crate::error::ApiError;
use crate::models::oauth_state::OAuthStateProjection;
use crate::server::AppState;

/// Request body for starting an OAuth handshake
#[derive(Debug, Deserialize, ToSchema)]
pub struct AuthUrlRequest {
    /// Broker-level permissions to request from the provider
    #[serde(default)]
    pub permissions: Vec<String>,
    /// Where the browser should land after the handshake completes
    pub redirect_url: String,
}

/// Response for a started handshake
#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct AuthUrlResponse {
    /// Provider authorize URL to send the user to
    pub auth_url: String,
    /// Handle for polling the handshake's progress
    #[schema(value_type = String)]
    pub oauth_state_id: Uuid,
}

/// Start an OAuth handshake for a provider
#[utoipa::path(
    post,
    path = "/v1/credentials/auth/oauth/{provider_identifier}/auth-url",
    security(("bearer_auth" = [])),
    params(
        ("provider_identifier" = String, Path, description = "Provider identifier")
    ),
    request_body = AuthUrlRequest,
    responses(
        (status = 200, description = "Handshake started", body = AuthUrlResponse),
        (status = 400, description = "Redirect URL rejected", body = ApiError),
        (status = 404, description = "Unknown provider", body = ApiError)
    ),
    tag = "oauth"
)]
pub async fn create_auth_url(
    State(state): State<AppState>,
    AuthenticatedUser(user_id): AuthenticatedUser,
    Path(provider_identifier): Path<String>,
    Json(body): Json<AuthUrlRequest>,
) -> Result<Json<AuthUrlResponse>, ApiError> {
    let flow = state
        .oauth_state_service
        .start(
            user_id,
            &provider_identifier,
            &body.redirect_url,
            body.permissions,
            JsonMap::new(),
        )
        .await?;

    Ok(Json(AuthUrlResponse {
        auth_url: flow.auth_url,
        oauth_state_id: flow.oauth_state_id,
    }))
}

/// Poll an in-flight handshake's status
#[utoipa::path(
    get,
    path = "/v1/credentials/auth/oauth/state/{oauth_state_id}",
    security(("bearer_auth" = [])),
    params(
        ("oauth_state_id" = String, Path, description = "Handshake id returned by auth-url")
    ),
    responses(
        (status = 200, description = "Handshake status", body = OAuthStateProjection),
        (status = 403, description = "Handshake belongs to another user", body = ApiError)
    ),
    tag = "oauth"
)]
pub async fn poll_oauth_state(
    State(state): State<AppState>,
    AuthenticatedUser(user_id): AuthenticatedUser,
    Path(oauth_state_id): Path<Uuid>,
) -> Result<Json<OAuthStateProjection>, ApiError> {
    let projection = state
        .oauth_state_service
        .poll(oauth_state_id, user_id)
        .await?;
    Ok(Json(projection))
}

/// IdP callback: completes the handshake and bounces the browser back to the
/// client-chosen redirect
#[utoipa::path(
    get,
    path = "/v1/credentials/auth/oauth/callback",
    params(
        ("state" = String, Query, description = "CSRF state from the authorize URL"),
        ("code" = Option<String>, Query, description = "Authorization code on success"),
        ("error" = Option<String>, Query, description = "Provider error code on failure")
    ),
    responses(
        (status = 302, description = "Redirect to the stored client target"),
        (status = 500, description = "Unknown or expired state", body = ApiError)
    ),
    tag = "oauth"
)]
pub async fn oauth_callback(
    State(state): State<AppState>,
    Query(params): Query<HashMap<String, String>>,
) -> Result<Response, ApiError> {
    let Some(state_token) = params.get("state").cloned() else {
        return Err(ApiError::new(
            StatusCode::BAD_REQUEST,
            "VALIDATION_FAILED",
            "missing 'state' query parameter",
        ));
    };
    let code = params.get("code").cloned();

    let redirect = state
        .oauth_state_service
        .callback(&state_token, code, params)
        .await?;

    Ok((StatusCode::FOUND, [(LOCATION, redirect.location)]).into_response())
}
