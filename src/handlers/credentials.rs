//! # Credential Handlers
//!
//! Listing, get-for-use, deletion, and API-key creation endpoints. All of
//! them operate on the caller's own credentials; secrets never appear in
//! responses.

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::Json,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;
use uuid::Uuid;

use crate::auth::AuthenticatedUser;
use crate::error::{ApiError, forbidden};
use crate::models::credential;
use crate::server::AppState;

/// Credential metadata for API responses; never carries secret material
#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct CredentialInfo {
    /// Unique identifier for the credential
    #[schema(value_type = String)]
    pub id: Uuid,
    /// Owning user
    #[schema(value_type = String)]
    pub user_id: Uuid,
    /// Provider this credential authorizes against
    pub provider_identifier: String,
    /// Credential type: oauth | apikey | basicauth | none
    #[serde(rename = "type")]
    pub credential_type: String,
    /// Broker-level permissions granted to the credential (oauth only)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub permissions: Option<Vec<String>>,
    pub is_valid: bool,
    /// RFC3339 creation timestamp
    pub created_at: String,
}

impl From<credential::Model> for CredentialInfo {
    fn from(model: credential::Model) -> Self {
        let created_at: DateTime<Utc> = model.created_at.to_utc();
        Self {
            id: model.id,
            user_id: model.user_id,
            provider_identifier: model.provider_identifier,
            credential_type: model.credential_type,
            permissions: None,
            is_valid: model.is_valid,
            created_at: created_at.to_rfc3339(),
        }
    }
}

/// Response wrapper for credential listing
#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct CredentialsResponse {
    pub credentials: Vec<CredentialInfo>,
}

/// Request body for API-key credential creation
#[derive(Debug, Deserialize, ToSchema)]
pub struct CreateApiKeyRequest {
    /// The provider API key to store
    pub api_key: String,
}

/// List the caller's credentials, metadata only
#[utoipa::path(
    get,
    path = "/v1/credentials",
    security(("bearer_auth" = [])),
    responses(
        (status = 200, description = "The caller's credentials", body = CredentialsResponse),
        (status = 401, description = "Unauthorized", body = ApiError)
    ),
    tag = "credentials"
)]
pub async fn list_credentials(
    State(state): State<AppState>,
    AuthenticatedUser(user_id): AuthenticatedUser,
) -> Result<Json<CredentialsResponse>, ApiError> {
    let credentials = state.credential_service.list_by_user(user_id).await?;

    Ok(Json(CredentialsResponse {
        credentials: credentials.into_iter().map(CredentialInfo::from).collect(),
    }))
}

/// Get the caller's credential for a provider, refreshing it when due
#[utoipa::path(
    get,
    path = "/v1/credentials/provider/{provider_identifier}",
    security(("bearer_auth" = [])),
    params(
        ("provider_identifier" = String, Path, description = "Provider identifier")
    ),
    responses(
        (status = 200, description = "A usable credential", body = CredentialInfo),
        (status = 401, description = "Credential expired or unauthorized", body = ApiError),
        (status = 404, description = "No credential for this provider", body = ApiError)
    ),
    tag = "credentials"
)]
pub async fn get_credential_for_provider(
    State(state): State<AppState>,
    AuthenticatedUser(user_id): AuthenticatedUser,
    Path(provider_identifier): Path<String>,
) -> Result<Json<CredentialInfo>, ApiError> {
    let credential = state
        .credential_service
        .get_by_user_and_provider(user_id, &provider_identifier)
        .await?;

    // The read is a use; keep the dormancy filter honest.
    state
        .credential_service
        .update_last_used_at(&credential.base)
        .await?;

    let permissions = (!credential.scopes.is_empty())
        .then(|| {
            state
                .registry
                .get(&provider_identifier)
                .map(|adapter| adapter.permissions_from_scopes(&credential.scopes))
                .ok()
        })
        .flatten();

    let mut info = CredentialInfo::from(credential.base);
    info.permissions = permissions;
    Ok(Json(info))
}

/// Delete one of the caller's credentials
#[utoipa::path(
    delete,
    path = "/v1/credentials/{id}",
    security(("bearer_auth" = [])),
    params(
        ("id" = String, Path, description = "Credential id")
    ),
    responses(
        (status = 204, description = "Credential deleted"),
        (status = 403, description = "Credential belongs to another user", body = ApiError),
        (status = 404, description = "Credential not found", body = ApiError)
    ),
    tag = "credentials"
)]
pub async fn delete_credential(
    State(state): State<AppState>,
    AuthenticatedUser(user_id): AuthenticatedUser,
    Path(id): Path<Uuid>,
) -> Result<StatusCode, ApiError> {
    let base = state.credential_service.get_base_by_id(id).await?;
    if base.user_id != user_id {
        return Err(forbidden(Some("credential belongs to another user")));
    }

    state.credential_service.delete(id).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// Store an API key as the caller's credential for a provider
#[utoipa::path(
    post,
    path = "/v1/credentials/auth/apikey/{provider_identifier}",
    security(("bearer_auth" = [])),
    params(
        ("provider_identifier" = String, Path, description = "Provider identifier")
    ),
    request_body = CreateApiKeyRequest,
    responses(
        (status = 201, description = "Credential created", body = CredentialInfo),
        (status = 400, description = "Empty or invalid API key", body = ApiError)
    ),
    tag = "credentials"
)]
pub async fn create_apikey_credential(
    State(state): State<AppState>,
    AuthenticatedUser(user_id): AuthenticatedUser,
    Path(provider_identifier): Path<String>,
    Json(body): Json<CreateApiKeyRequest>,
) -> Result<(StatusCode, Json<CredentialInfo>), ApiError> {
    let credential = state
        .credential_service
        .create_apikey(user_id, &provider_identifier, &body.api_key)
        .await?;

    Ok((
        StatusCode::CREATED,
        Json(CredentialInfo::from(credential.base)),
    ))
}
