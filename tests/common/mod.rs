//! Shared fixtures for integration tests: in-memory database, a test vault,
//! a scripted provider adapter, and a fully wired service graph.

#![allow(dead_code)]

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use async_trait::async_trait;
use chrono::{Duration, Utc};
use migration::{Migrator, MigratorTrait};
use sea_orm::{Database, DatabaseConnection};
use url::Url;
use uuid::Uuid;

use credbroker::config::TokenRefreshConfig;
use credbroker::events::testing::RecordingPublisher;
use credbroker::events::EventPublisher;
use credbroker::models::credential::CredentialType;
use credbroker::models::oauth_credential::OAuthToken;
use credbroker::providers::{AdapterError, AdapterRegistry, ProviderAdapter};
use credbroker::redirect::RedirectValidator;
use credbroker::repositories::OAuthStateStore;
use credbroker::services::{CredentialService, OAuthStateService};
use credbroker::token_refresh::TokenRefreshEngine;
use credbroker::vault::{Region, TransitVault, Vault};

pub const PROVIDER: &str = "example";
pub const CALLBACK_URL: &str = "http://localhost:8080/v1/credentials/auth/oauth/callback";

pub async fn setup_db() -> Arc<DatabaseConnection> {
    // Unique file-based SQLite per test; a pooled in-memory database would
    // hand every pooled connection its own empty schema.
    let path = std::env::temp_dir().join(format!("credbroker_test_{}.db", Uuid::new_v4()));
    let db = Database::connect(format!("sqlite://{}?mode=rwc", path.display()))
        .await
        .expect("connect to sqlite test database");
    Migrator::up(&db, None).await.expect("apply migrations");
    Arc::new(db)
}

pub fn test_vault() -> Arc<dyn Vault> {
    Arc::new(
        TransitVault::new(
            "transit",
            &[(Region::Eu, vec![5u8; 32]), (Region::Us, vec![6u8; 32])],
        )
        .expect("valid test vault"),
    )
}

/// Scripted provider adapter with call counting.
pub struct MockAdapter {
    pub exchange_calls: AtomicU32,
    pub refresh_calls: AtomicU32,
    pub refresh_due: AtomicBool,
    pub supports_refresh: bool,
}

impl Default for MockAdapter {
    fn default() -> Self {
        Self {
            exchange_calls: AtomicU32::new(0),
            refresh_calls: AtomicU32::new(0),
            refresh_due: AtomicBool::new(false),
            supports_refresh: true,
        }
    }
}

impl MockAdapter {
    pub fn refreshing() -> Self {
        let adapter = Self::default();
        adapter.refresh_due.store(true, Ordering::SeqCst);
        adapter
    }

    pub fn without_refresh() -> Self {
        Self {
            supports_refresh: false,
            ..Self::default()
        }
    }
}

#[async_trait]
impl ProviderAdapter for MockAdapter {
    fn credential_type(&self) -> CredentialType {
        CredentialType::OAuth
    }

    fn generate_auth_url(
        &self,
        redirect_url: &str,
        state: &str,
        code_challenge: &str,
        scopes: &[String],
    ) -> Result<Url, AdapterError> {
        let mut url = Url::parse("https://idp.test/oauth/authorize").unwrap();
        url.query_pairs_mut()
            .append_pair("redirect_uri", redirect_url)
            .append_pair("response_type", "code")
            .append_pair("state", state)
            .append_pair("code_challenge", code_challenge)
            .append_pair("code_challenge_method", "S256")
            .append_pair("scope", &scopes.join(" "));
        Ok(url)
    }

    async fn exchange_code(
        &self,
        code: &str,
        _redirect_url: &str,
        _code_verifier: &str,
    ) -> Result<OAuthToken, AdapterError> {
        self.exchange_calls.fetch_add(1, Ordering::SeqCst);
        if code == "bad-code" {
            return Err(AdapterError::Authentication {
                details: "invalid_grant".to_string(),
            });
        }
        Ok(OAuthToken {
            access_token: format!("exchanged-{}", code),
            refresh_token: Some("rt-initial".to_string()),
            token_type: "Bearer".to_string(),
            expiry: Some(Utc::now() + Duration::hours(1)),
        })
    }

    fn should_refresh(&self, _token: &OAuthToken) -> bool {
        self.refresh_due.load(Ordering::SeqCst)
    }

    async fn refresh(&self, token: &OAuthToken) -> Result<OAuthToken, AdapterError> {
        if !self.supports_refresh {
            return Err(AdapterError::RefreshUnsupported);
        }
        let call = self.refresh_calls.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(OAuthToken {
            access_token: format!("refreshed-{}", call),
            refresh_token: token.refresh_token.clone(),
            token_type: "Bearer".to_string(),
            expiry: Some(Utc::now() + Duration::hours(1)),
        })
    }

    fn scopes_from_permissions(&self, permissions: &[String]) -> Vec<String> {
        permissions.iter().map(|p| format!("scope:{}", p)).collect()
    }

    fn permissions_from_scopes(&self, scopes: &[String]) -> Vec<String> {
        scopes
            .iter()
            .map(|s| s.strip_prefix("scope:").unwrap_or(s).to_string())
            .collect()
    }
}

/// Fully wired broker service graph over one database.
pub struct Broker {
    pub db: Arc<DatabaseConnection>,
    pub vault: Arc<dyn Vault>,
    pub adapter: Arc<MockAdapter>,
    pub publisher: Arc<RecordingPublisher>,
    pub engine: Arc<TokenRefreshEngine>,
    pub credentials: Arc<CredentialService>,
    pub oauth_states: Arc<OAuthStateService>,
    pub state_store: Arc<OAuthStateStore>,
}

pub async fn broker_with_adapter(adapter: MockAdapter) -> Broker {
    let db = setup_db().await;
    let vault = test_vault();
    let adapter = Arc::new(adapter);
    let publisher = Arc::new(RecordingPublisher::default());

    let mut registry = AdapterRegistry::new();
    registry.register(PROVIDER, adapter.clone());
    let registry = Arc::new(registry);

    let engine = Arc::new(TokenRefreshEngine::new(
        db.clone(),
        TokenRefreshConfig::default(),
        vault.clone(),
        registry.clone(),
    ));

    let credentials = Arc::new(CredentialService::new(
        db.clone(),
        vault.clone(),
        registry.clone(),
        engine.clone(),
        publisher.clone() as Arc<dyn EventPublisher>,
        Region::Eu,
        CALLBACK_URL.to_string(),
    ));

    let validator = RedirectValidator::new(
        &["https".to_string(), "http".to_string()],
        &["app.example.com".to_string()],
    );
    let state_store = Arc::new(OAuthStateStore::new(db.clone()));
    let oauth_states = Arc::new(OAuthStateService::new(
        state_store.clone(),
        credentials.clone(),
        validator,
        15,
    ));

    Broker {
        db,
        vault,
        adapter,
        publisher,
        engine,
        credentials,
        oauth_states,
        state_store,
    }
}

pub async fn broker() -> Broker {
    broker_with_adapter(MockAdapter::default()).await
}

pub fn user() -> Uuid {
    Uuid::new_v4()
}
