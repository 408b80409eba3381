//! Provider adapter port
//!
//! Defines the capability set the broker consumes per provider. The core
//! never inspects a provider's token beyond `{access, refresh, expiry}`;
//! everything else is opaque bytes that pass through the vault.

use async_trait::async_trait;
use thiserror::Error;
use url::Url;

use crate::models::credential::CredentialType;
use crate::models::oauth_credential::OAuthToken;

pub mod oauth2;
pub mod registry;

pub use oauth2::{OAuth2Adapter, OAuth2Config};
pub use registry::{AdapterRegistry, RegistryError};

/// Adapter-level error types for structured error handling
#[derive(Debug, Error)]
pub enum AdapterError {
    /// HTTP error from the upstream provider
    #[error("HTTP error {status}: {}", body.as_deref().unwrap_or("no body"))]
    Http { status: u16, body: Option<String> },

    /// Network or connectivity error
    #[error("network error: {details}")]
    Network { details: String, retryable: bool },

    /// Authentication/authorization rejected by the provider
    #[error("authentication error: {details}")]
    Authentication { details: String },

    /// Rate limiting from the provider
    #[error("rate limited{}", retry_after.map(|s| format!(" (retry after {}s)", s)).unwrap_or_default())]
    RateLimited { retry_after: Option<u64> },

    /// Provider response did not match the expected shape
    #[error("malformed response: {details}")]
    MalformedResponse { details: String },

    /// Adapter misconfiguration (bad URLs, missing client credentials)
    #[error("configuration error: {details}")]
    Configuration { details: String },

    /// The provider has no refresh semantics for this token
    #[error("refresh not supported")]
    RefreshUnsupported,
}

/// Per-provider capability set consumed by the broker core.
#[async_trait]
pub trait ProviderAdapter: Send + Sync {
    /// Auth mode the provider's credentials use.
    fn credential_type(&self) -> CredentialType;

    /// Compose the authorize URL for the handshake's first leg.
    fn generate_auth_url(
        &self,
        redirect_url: &str,
        state: &str,
        code_challenge: &str,
        scopes: &[String],
    ) -> Result<Url, AdapterError>;

    /// Exchange an authorization code (plus PKCE verifier) for a token.
    async fn exchange_code(
        &self,
        code: &str,
        redirect_url: &str,
        code_verifier: &str,
    ) -> Result<OAuthToken, AdapterError>;

    /// Decide whether a token is due for refresh.
    fn should_refresh(&self, token: &OAuthToken) -> bool;

    /// Obtain a fresh token. Implementations without refresh semantics
    /// return [`AdapterError::RefreshUnsupported`].
    async fn refresh(&self, token: &OAuthToken) -> Result<OAuthToken, AdapterError>;

    /// Translate broker-level permissions into provider scopes.
    fn scopes_from_permissions(&self, permissions: &[String]) -> Vec<String>;

    /// Inverse of [`Self::scopes_from_permissions`].
    fn permissions_from_scopes(&self, scopes: &[String]) -> Vec<String>;
}
