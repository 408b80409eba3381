//! # Server Configuration
//!
//! Application state wiring, router construction, and the serve loop for the
//! credential broker.

use std::sync::Arc;

use axum::http::HeaderValue;
use axum::{
    Router,
    extract::Request,
    middleware::{self, Next},
    response::Response,
    routing::{delete, get, post},
};
use migration::MigratorTrait;
use sea_orm::DatabaseConnection;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use utoipa::OpenApi;
use utoipa_swagger_ui::SwaggerUi;

use crate::auth::auth_middleware;
use crate::config::AppConfig;
use crate::events::{EventPublisher, TracingEventPublisher};
use crate::handlers;
use crate::providers::AdapterRegistry;
use crate::redirect::RedirectValidator;
use crate::repositories::OAuthStateStore;
use crate::services::{CredentialService, OAuthStateService};
use crate::telemetry::{self, TraceContext};
use crate::token_refresh::TokenRefreshEngine;
use crate::vault::{TransitVault, Vault};

/// Interval between expired-handshake cleanup passes.
const OAUTH_STATE_CLEANUP_INTERVAL: std::time::Duration = std::time::Duration::from_secs(300);

/// Application state containing shared resources
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<AppConfig>,
    pub db: Arc<DatabaseConnection>,
    pub vault: Arc<dyn Vault>,
    pub registry: Arc<AdapterRegistry>,
    pub credential_service: Arc<CredentialService>,
    pub oauth_state_service: Arc<OAuthStateService>,
    pub refresh_engine: Arc<TokenRefreshEngine>,
}

impl AppState {
    /// Wire the full service graph from configuration and a live database
    /// connection. The registry carries whatever adapters the deployment
    /// registered before calling this.
    pub fn build(
        config: Arc<AppConfig>,
        db: DatabaseConnection,
        registry: AdapterRegistry,
        publisher: Arc<dyn EventPublisher>,
    ) -> anyhow::Result<Self> {
        let db = Arc::new(db);
        let registry = Arc::new(registry);

        let vault: Arc<dyn Vault> = Arc::new(TransitVault::new(
            &config.vault.transit_base,
            &config.vault.root_keys(),
        )?);

        let refresh_engine = Arc::new(TokenRefreshEngine::new(
            db.clone(),
            config.token_refresh.clone(),
            vault.clone(),
            registry.clone(),
        ));

        let credential_service = Arc::new(CredentialService::new(
            db.clone(),
            vault.clone(),
            registry.clone(),
            refresh_engine.clone(),
            publisher,
            config.default_vault_region()?,
            config.oauth_callback_url.clone(),
        ));

        let validator = RedirectValidator::new(
            &config.redirect.allowed_schemes,
            &config.redirect.allowed_domains,
        );
        let oauth_state_service = Arc::new(OAuthStateService::new(
            Arc::new(OAuthStateStore::new(db.clone())),
            credential_service.clone(),
            validator,
            config.oauth_state_ttl_minutes,
        ));

        Ok(Self {
            config,
            db,
            vault,
            registry,
            credential_service,
            oauth_state_service,
            refresh_engine,
        })
    }
}

/// Creates and configures the Axum application router
pub fn create_app(state: AppState) -> Router {
    let protected = Router::new()
        .route("/v1/credentials", get(handlers::credentials::list_credentials))
        .route(
            "/v1/credentials/provider/{provider_identifier}",
            get(handlers::credentials::get_credential_for_provider),
        )
        .route(
            "/v1/credentials/{id}",
            delete(handlers::credentials::delete_credential),
        )
        .route(
            "/v1/credentials/auth/apikey/{provider_identifier}",
            post(handlers::credentials::create_apikey_credential),
        )
        .route(
            "/v1/credentials/auth/oauth/{provider_identifier}/auth-url",
            post(handlers::oauth::create_auth_url),
        )
        .route(
            "/v1/credentials/auth/oauth/state/{oauth_state_id}",
            get(handlers::oauth::poll_oauth_state),
        )
        .route_layer(middleware::from_fn_with_state(
            state.clone(),
            auth_middleware,
        ));

    let public = Router::new()
        .route("/", get(handlers::root))
        .route("/healthz", get(handlers::healthz))
        .route(
            "/v1/credentials/auth/oauth/callback",
            get(handlers::oauth::oauth_callback),
        );

    Router::new()
        .merge(protected)
        .merge(public)
        .layer(cors_layer(&state.config))
        .layer(TraceLayer::new_for_http())
        .layer(middleware::from_fn(trace_context_middleware))
        .with_state(state)
        .merge(SwaggerUi::new("/docs").url("/openapi.json", ApiDoc::openapi()))
}

/// Attach a per-request correlation id, both as a request extension and as
/// the task-local the error responses read.
async fn trace_context_middleware(request: Request, next: Next) -> Response {
    let context = TraceContext {
        trace_id: format!("req-{}", &Uuid::new_v4().to_string()[..8]),
    };

    let mut request = request;
    request.extensions_mut().insert(context.clone());

    telemetry::with_trace_context(context, next.run(request)).await
}

fn cors_layer(config: &AppConfig) -> CorsLayer {
    if config.cors_allowed_origins.is_empty() {
        return CorsLayer::new();
    }

    let origins: Vec<HeaderValue> = config
        .cors_allowed_origins
        .iter()
        .filter_map(|origin| origin.parse().ok())
        .collect();
    CorsLayer::new().allow_origin(origins)
}

/// Starts the server with the given configuration, including the background
/// refresh engine. Runs until interrupted.
pub async fn run_server(config: AppConfig) -> anyhow::Result<()> {
    let config = Arc::new(config);

    let db = crate::db::init_pool(&config).await?;
    migration::Migrator::up(&db, None).await?;

    // Adapters are registered by the deployment; the broker core runs with
    // whatever the registry holds.
    let registry = AdapterRegistry::new();
    let publisher: Arc<dyn EventPublisher> = Arc::new(TracingEventPublisher);

    let state = AppState::build(config.clone(), db, registry, publisher)?;

    let shutdown = CancellationToken::new();
    let engine_handle = tokio::spawn(state.refresh_engine.clone().run(shutdown.clone()));

    // Periodically sweep expired handshakes out of the durable state tier.
    let cleanup_service = state.oauth_state_service.clone();
    let cleanup_shutdown = shutdown.clone();
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = cleanup_shutdown.cancelled() => break,
                _ = tokio::time::sleep(OAUTH_STATE_CLEANUP_INTERVAL) => {
                    match cleanup_service.cleanup_expired().await {
                        Ok(removed) if removed > 0 => {
                            tracing::debug!(removed, "Removed expired oauth states");
                        }
                        Ok(_) => {}
                        Err(err) => {
                            tracing::warn!(code = %err.code, "OAuth state cleanup failed");
                        }
                    }
                }
            }
        }
    });

    let app = create_app(state);
    let addr = config.bind_addr()?;
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!(%addr, profile = %config.profile, "Server listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("Shutdown signal received");
        })
        .await?;

    shutdown.cancel();
    let _ = engine_handle.await;

    Ok(())
}

/// OpenAPI documentation
#[derive(OpenApi)]
#[openapi(
    paths(
        crate::handlers::root,
        crate::handlers::healthz,
        crate::handlers::credentials::list_credentials,
        crate::handlers::credentials::get_credential_for_provider,
        crate::handlers::credentials::delete_credential,
        crate::handlers::credentials::create_apikey_credential,
        crate::handlers::oauth::create_auth_url,
        crate::handlers::oauth::poll_oauth_state,
        crate::handlers::oauth::oauth_callback,
    ),
    components(
        schemas(
            crate::models::ServiceInfo,
            crate::models::credential::CredentialType,
            crate::models::oauth_state::OAuthStateProjection,
            crate::models::oauth_state::OAuthStateStatus,
            crate::handlers::credentials::CredentialInfo,
            crate::handlers::credentials::CredentialsResponse,
            crate::handlers::credentials::CreateApiKeyRequest,
            crate::handlers::oauth::AuthUrlRequest,
            crate::handlers::oauth::AuthUrlResponse,
            crate::error::ApiError,
        )
    ),
    info(
        title = "Credential Broker API",
        description = "API for issuing, storing, refreshing, and invalidating provider credentials",
        version = env!("CARGO_PKG_VERSION"),
    )
)]
pub struct ApiDoc;
