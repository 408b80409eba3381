//! Generic OAuth2 provider adapter
//!
//! Config-driven authorization-code + PKCE client. Providers that follow
//! RFC 6749/7636 token endpoints need only a config entry; anything more
//! exotic supplies its own [`ProviderAdapter`] implementation.

use std::collections::BTreeMap;
use std::time::Duration as StdDuration;

use async_trait::async_trait;
use chrono::{Duration, Utc};
use serde::Deserialize;
use tokio::time::sleep;
use tracing::{debug, warn};
use url::Url;

use crate::models::credential::CredentialType;
use crate::models::oauth_credential::OAuthToken;
use crate::providers::{AdapterError, ProviderAdapter};

/// Upstream request timeout.
const REQUEST_TIMEOUT: StdDuration = StdDuration::from_secs(30);
/// Transport/5xx retry budget.
const MAX_ATTEMPTS: u32 = 3;
/// Fixed backoff between retries.
const RETRY_BACKOFF: StdDuration = StdDuration::from_secs(1);
/// Tokens inside this window count as due for refresh.
const REFRESH_LEEWAY_MINUTES: i64 = 5;

/// OAuth2 endpoint configuration for one provider
#[derive(Debug, Clone)]
pub struct OAuth2Config {
    pub client_id: String,
    pub client_secret: String,
    /// Authorize endpoint, e.g. `https://idp.example.com/oauth/authorize`
    pub auth_url: String,
    /// Token endpoint, e.g. `https://idp.example.com/oauth/token`
    pub token_url: String,
    /// Scopes always requested regardless of permissions
    pub default_scopes: Vec<String>,
    /// Maps broker permissions to provider scopes; unmapped permissions
    /// pass through as-is
    pub permission_scopes: BTreeMap<String, Vec<String>>,
}

/// Generic OAuth2 adapter
pub struct OAuth2Adapter {
    identifier: String,
    config: OAuth2Config,
    http: reqwest::Client,
}

/// Token endpoint response shape (RFC 6749 §5.1)
#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    refresh_token: Option<String>,
    token_type: Option<String>,
    expires_in: Option<i64>,
    error: Option<String>,
    error_description: Option<String>,
}

impl OAuth2Adapter {
    pub fn new(identifier: &str, config: OAuth2Config) -> Self {
        let http = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .expect("reqwest client construction cannot fail with static config");

        Self {
            identifier: identifier.to_string(),
            config,
            http,
        }
    }

    pub fn identifier(&self) -> &str {
        &self.identifier
    }

    /// POST a token-endpoint form, retrying transport errors and 5xx
    /// responses within the adapter's retry budget.
    async fn post_token_form(
        &self,
        form: &[(&str, &str)],
    ) -> Result<TokenResponse, AdapterError> {
        let mut last_error = None;

        for attempt in 1..=MAX_ATTEMPTS {
            match self.try_post_token_form(form).await {
                Ok(token) => return Ok(token),
                Err(err) if is_retryable(&err) && attempt < MAX_ATTEMPTS => {
                    warn!(
                        provider = %self.identifier,
                        attempt,
                        error = %err,
                        "Token endpoint call failed, retrying"
                    );
                    last_error = Some(err);
                    sleep(RETRY_BACKOFF).await;
                }
                Err(err) => return Err(err),
            }
        }

        Err(last_error.unwrap_or(AdapterError::Network {
            details: "retry budget exhausted".to_string(),
            retryable: false,
        }))
    }

    async fn try_post_token_form(
        &self,
        form: &[(&str, &str)],
    ) -> Result<TokenResponse, AdapterError> {
        let response = self
            .http
            .post(&self.config.token_url)
            .header("Accept", "application/json")
            .form(form)
            .send()
            .await
            .map_err(|e| AdapterError::Network {
                details: e.to_string(),
                retryable: true,
            })?;

        let status = response.status();
        if status.as_u16() == 429 {
            let retry_after = response
                .headers()
                .get("retry-after")
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.parse().ok());
            return Err(AdapterError::RateLimited { retry_after });
        }
        if status.is_client_error() {
            let body = response.text().await.ok();
            return Err(AdapterError::Http {
                status: status.as_u16(),
                body,
            });
        }
        if !status.is_success() {
            let body = response.text().await.ok();
            return Err(AdapterError::Http {
                status: status.as_u16(),
                body,
            });
        }

        let token: TokenResponse =
            response
                .json()
                .await
                .map_err(|e| AdapterError::MalformedResponse {
                    details: e.to_string(),
                })?;

        // Some IdPs return 200 with an error field instead of a 4xx.
        if let Some(error) = token.error {
            return Err(AdapterError::Authentication {
                details: format!(
                    "{}: {}",
                    error,
                    token.error_description.unwrap_or_default()
                ),
            });
        }

        Ok(token)
    }

    fn token_from_response(&self, response: TokenResponse, prior: Option<&OAuthToken>) -> OAuthToken {
        let expiry = response
            .expires_in
            .map(|seconds| Utc::now() + Duration::seconds(seconds));

        OAuthToken {
            access_token: response.access_token,
            // Providers may omit the refresh token on rotation; keep the
            // prior one so the credential stays refreshable.
            refresh_token: response
                .refresh_token
                .or_else(|| prior.and_then(|t| t.refresh_token.clone())),
            token_type: response.token_type.unwrap_or_else(|| "Bearer".to_string()),
            expiry,
        }
    }
}

fn is_retryable(err: &AdapterError) -> bool {
    match err {
        AdapterError::Network { retryable, .. } => *retryable,
        AdapterError::Http { status, .. } => *status >= 500,
        _ => false,
    }
}

#[async_trait]
impl ProviderAdapter for OAuth2Adapter {
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
        let mut url = Url::parse(&self.config.auth_url).map_err(|e| {
            AdapterError::Configuration {
                details: format!("invalid authorize url: {}", e),
            }
        })?;

        url.query_pairs_mut()
            .append_pair("client_id", &self.config.client_id)
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
        redirect_url: &str,
        code_verifier: &str,
    ) -> Result<OAuthToken, AdapterError> {
        debug!(provider = %self.identifier, "Exchanging authorization code");

        let form = [
            ("grant_type", "authorization_code"),
            ("code", code),
            ("redirect_uri", redirect_url),
            ("code_verifier", code_verifier),
            ("client_id", self.config.client_id.as_str()),
            ("client_secret", self.config.client_secret.as_str()),
        ];

        let response = self.post_token_form(&form).await?;
        Ok(self.token_from_response(response, None))
    }

    fn should_refresh(&self, token: &OAuthToken) -> bool {
        match token.expiry {
            Some(expiry) => expiry <= Utc::now() + Duration::minutes(REFRESH_LEEWAY_MINUTES),
            // No expiry recorded: nothing to refresh against.
            None => false,
        }
    }

    async fn refresh(&self, token: &OAuthToken) -> Result<OAuthToken, AdapterError> {
        let refresh_token = token
            .refresh_token
            .as_deref()
            .ok_or(AdapterError::RefreshUnsupported)?;

        debug!(provider = %self.identifier, "Refreshing access token");

        let form = [
            ("grant_type", "refresh_token"),
            ("refresh_token", refresh_token),
            ("client_id", self.config.client_id.as_str()),
            ("client_secret", self.config.client_secret.as_str()),
        ];

        let response = self.post_token_form(&form).await?;
        Ok(self.token_from_response(response, Some(token)))
    }

    fn scopes_from_permissions(&self, permissions: &[String]) -> Vec<String> {
        let mut scopes: Vec<String> = self.config.default_scopes.clone();
        for permission in permissions {
            match self.config.permission_scopes.get(permission) {
                Some(mapped) => scopes.extend(mapped.iter().cloned()),
                None => scopes.push(permission.clone()),
            }
        }
        scopes.dedup();
        scopes
    }

    fn permissions_from_scopes(&self, scopes: &[String]) -> Vec<String> {
        scopes
            .iter()
            .map(|scope| {
                self.config
                    .permission_scopes
                    .iter()
                    .find(|(_, mapped)| mapped.contains(scope))
                    .map(|(permission, _)| permission.clone())
                    .unwrap_or_else(|| scope.clone())
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_adapter() -> OAuth2Adapter {
        let mut permission_scopes = BTreeMap::new();
        permission_scopes.insert(
            "read".to_string(),
            vec!["content.read".to_string(), "profile.read".to_string()],
        );
        permission_scopes.insert("write".to_string(), vec!["content.write".to_string()]);

        OAuth2Adapter::new(
            "example",
            OAuth2Config {
                client_id: "client-123".into(),
                client_secret: "secret-456".into(),
                auth_url: "https://idp.example.com/oauth/authorize".into(),
                token_url: "https://idp.example.com/oauth/token".into(),
                default_scopes: vec!["openid".to_string()],
                permission_scopes,
            },
        )
    }

    #[test]
    fn test_generate_auth_url_carries_pkce_material() {
        let adapter = test_adapter();
        let url = adapter
            .generate_auth_url(
                "https://app.example.com/cb",
                "state-token",
                "challenge-value",
                &["content.read".to_string()],
            )
            .unwrap();

        assert_eq!(url.host_str(), Some("idp.example.com"));
        let pairs: Vec<(String, String)> = url
            .query_pairs()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        assert!(pairs.contains(&("client_id".into(), "client-123".into())));
        assert!(pairs.contains(&("state".into(), "state-token".into())));
        assert!(pairs.contains(&("code_challenge".into(), "challenge-value".into())));
        assert!(pairs.contains(&("code_challenge_method".into(), "S256".into())));
        assert!(pairs.contains(&("response_type".into(), "code".into())));
        // The secret never appears in the authorize URL.
        assert!(!url.as_str().contains("secret-456"));
    }

    #[test]
    fn test_scope_mapping_roundtrip() {
        let adapter = test_adapter();

        let scopes = adapter.scopes_from_permissions(&["read".to_string()]);
        assert_eq!(scopes, vec!["openid", "content.read", "profile.read"]);

        let permissions =
            adapter.permissions_from_scopes(&["content.read".to_string(), "other".to_string()]);
        assert_eq!(permissions, vec!["read", "other"]);
    }

    #[test]
    fn test_should_refresh_window() {
        let adapter = test_adapter();

        let due = OAuthToken {
            access_token: "at".into(),
            refresh_token: Some("rt".into()),
            token_type: "Bearer".into(),
            expiry: Some(Utc::now() + Duration::minutes(2)),
        };
        assert!(adapter.should_refresh(&due));

        let fresh = OAuthToken {
            expiry: Some(Utc::now() + Duration::hours(2)),
            ..due.clone()
        };
        assert!(!adapter.should_refresh(&fresh));

        let no_expiry = OAuthToken {
            expiry: None,
            ..due
        };
        assert!(!adapter.should_refresh(&no_expiry));
    }

    #[tokio::test]
    async fn test_refresh_without_refresh_token_is_unsupported() {
        let adapter = test_adapter();
        let token = OAuthToken {
            access_token: "at".into(),
            refresh_token: None,
            token_type: "Bearer".into(),
            expiry: None,
        };

        let result = adapter.refresh(&token).await;
        assert!(matches!(result, Err(AdapterError::RefreshUnsupported)));
    }
}
