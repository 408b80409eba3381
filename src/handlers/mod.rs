//! # API Handlers
//!
//! HTTP endpoint handlers for the credential broker.

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::Json;

use crate::error::ApiError;
use crate::models::ServiceInfo;
use crate::server::AppState;
use crate::vault::Region;

pub mod credentials;
pub mod oauth;

/// Root handler that returns basic service information
#[utoipa::path(
    get,
    path = "/",
    responses(
        (status = 200, description = "Service information", body = ServiceInfo)
    ),
    tag = "root"
)]
pub async fn root() -> Json<ServiceInfo> {
    Json(ServiceInfo::default())
}

/// Health probe covering the database and the vault's default region
#[utoipa::path(
    get,
    path = "/healthz",
    responses(
        (status = 200, description = "Service is healthy"),
        (status = 503, description = "A dependency is unavailable", body = ApiError)
    ),
    tag = "root"
)]
pub async fn healthz(State(state): State<AppState>) -> Result<StatusCode, ApiError> {
    crate::db::health_check(&state.db).await.map_err(|e| {
        ApiError::new(
            StatusCode::SERVICE_UNAVAILABLE,
            "SERVICE_UNAVAILABLE",
            &format!("database unhealthy: {}", e),
        )
    })?;

    let region: Region = state
        .config
        .default_vault_region()
        .map_err(|e| ApiError::new(StatusCode::SERVICE_UNAVAILABLE, "SERVICE_UNAVAILABLE", &e.to_string()))?;
    state.vault.health(region).await.map_err(|_| {
        ApiError::new(
            StatusCode::SERVICE_UNAVAILABLE,
            "SERVICE_UNAVAILABLE",
            "vault unhealthy",
        )
    })?;

    Ok(StatusCode::OK)
}
