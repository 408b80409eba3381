//! # OAuth-State Service
//!
//! Drives the authorization-code + PKCE handshake: creates in-flight state
//! with CSRF and PKCE material, serves client polling, and runs the callback
//! state machine with open-redirect defense.

use std::collections::HashMap;
use std::sync::Arc;

use axum::http::StatusCode;
use chrono::{Duration, Utc};
use rand::RngCore;
use serde_json::{Map as JsonMap, Value as JsonValue};
use sha2::{Digest, Sha256};
use tracing::{info, instrument, warn};
use url::form_urlencoded;
use uuid::Uuid;

use crate::error::{ApiError, BrokerError, forbidden};
use crate::models::oauth_state::{OAuthStateData, OAuthStateProjection, OAuthStateStatus};
use crate::redirect::RedirectValidator;
use crate::repositories::OAuthStateStore;
use crate::services::credential::CredentialService;

/// Query parameters the callback consumes itself; everything else is
/// captured into `callback_params`.
const RESERVED_CALLBACK_PARAMS: [&str; 2] = ["state", "code"];

/// Result of starting a handshake.
#[derive(Debug, Clone)]
pub struct StartedOAuthFlow {
    pub auth_url: String,
    pub oauth_state_id: Uuid,
}

/// Where the callback sends the user's browser.
#[derive(Debug, Clone, PartialEq)]
pub struct CallbackRedirect {
    pub location: String,
}

/// OAuth handshake orchestrator
pub struct OAuthStateService {
    store: Arc<OAuthStateStore>,
    credential_service: Arc<CredentialService>,
    validator: RedirectValidator,
    state_ttl: Duration,
}

impl OAuthStateService {
    pub fn new(
        store: Arc<OAuthStateStore>,
        credential_service: Arc<CredentialService>,
        validator: RedirectValidator,
        state_ttl_minutes: i64,
    ) -> Self {
        Self {
            store,
            credential_service,
            validator,
            state_ttl: Duration::minutes(state_ttl_minutes),
        }
    }

    /// Begin a handshake: validate the redirect, mint CSRF + PKCE material,
    /// persist the pending state, and hand back the provider authorize URL.
    #[instrument(skip_all, fields(user_id = %user_id, provider_identifier = %provider_identifier))]
    pub async fn start(
        &self,
        user_id: Uuid,
        provider_identifier: &str,
        redirect_url: &str,
        permissions: Vec<String>,
        user_data: JsonMap<String, JsonValue>,
    ) -> Result<StartedOAuthFlow, ApiError> {
        self.validator.validate(redirect_url)?;

        let state = generate_url_safe_token();
        let code_verifier = generate_url_safe_token();
        let code_challenge = compute_code_challenge(&code_verifier);

        let now = Utc::now();
        let data = OAuthStateData {
            id: Uuid::new_v4(),
            state: state.clone(),
            code_verifier,
            code_challenge: code_challenge.clone(),
            status: OAuthStateStatus::Pending,
            user_id,
            provider_identifier: provider_identifier.to_string(),
            redirect_url: redirect_url.to_string(),
            permissions: permissions.clone(),
            user_data,
            callback_params: JsonMap::new(),
            expires_at: now + self.state_ttl,
            created_at: now,
            updated_at: now,
        };

        self.store
            .store(&data, self.state_ttl)
            .await
            .map_err(BrokerError::from)?;

        let auth_url = self.credential_service.get_oauth_url(
            provider_identifier,
            &state,
            &code_challenge,
            &permissions,
        )?;

        info!(oauth_state_id = %data.id, "OAuth handshake started");

        Ok(StartedOAuthFlow {
            auth_url: auth_url.to_string(),
            oauth_state_id: data.id,
        })
    }

    /// Client polling: return the public projection of a handshake. Only the
    /// user that started the flow may look at it.
    pub async fn poll(
        &self,
        oauth_state_id: Uuid,
        caller_user_id: Uuid,
    ) -> Result<OAuthStateProjection, ApiError> {
        let data = self
            .store
            .get_by_id(oauth_state_id)
            .await
            .map_err(BrokerError::from)?
            .ok_or(BrokerError::OAuthStateNotFound)?;

        if data.user_id != caller_user_id {
            return Err(forbidden(Some("oauth state belongs to another user")));
        }

        Ok(OAuthStateProjection::from(&data))
    }

    /// The callback state machine. Exactly one terminal transition happens
    /// per handshake; the browser is then sent back to the stored redirect
    /// with a status-qualified query string.
    #[instrument(skip_all)]
    pub async fn callback(
        &self,
        state: &str,
        code: Option<String>,
        raw_query_params: HashMap<String, String>,
    ) -> Result<CallbackRedirect, ApiError> {
        let mut data = self
            .store
            .get_by_state(state)
            .await
            .map_err(BrokerError::from)?
            .ok_or(BrokerError::OAuthStateNotFound)?;

        // Defense in depth: the allowlist may have tightened since the
        // handshake started.
        self.validator.validate(&data.redirect_url)?;

        // Terminal statuses are sticky.
        if data.status.is_terminal() {
            warn!(oauth_state_id = %data.id, status = %data.status.as_str(), "Callback replay on terminal state");
            return Err(ApiError::new(
                StatusCode::CONFLICT,
                "OAUTH_STATE_TERMINAL",
                "OAuth handshake already completed",
            ));
        }

        // Capture every non-reserved parameter, including `error`.
        data.callback_params = raw_query_params
            .iter()
            .filter(|(key, _)| !RESERVED_CALLBACK_PARAMS.contains(&key.as_str()))
            .map(|(key, value)| (key.clone(), JsonValue::String(value.clone())))
            .collect();

        let code = code.filter(|c| !c.is_empty());

        let (next_status, success, message) = match code {
            None => {
                // Provider error leg: no code, error captured above.
                let message = raw_query_params
                    .get("error")
                    .cloned()
                    .unwrap_or_else(|| "authorization failed".to_string());
                (OAuthStateStatus::Failed, false, message)
            }
            Some(code) => {
                match self
                    .credential_service
                    .handle_oauth_callback(
                        &code,
                        &data.provider_identifier,
                        data.user_id,
                        &data.permissions,
                        &data.code_verifier,
                    )
                    .await
                {
                    Ok(_) => (OAuthStateStatus::Success, true, "ok".to_string()),
                    Err(err) => {
                        warn!(oauth_state_id = %data.id, error = %err, "Code exchange failed");
                        (
                            OAuthStateStatus::Failed,
                            false,
                            "token exchange failed".to_string(),
                        )
                    }
                }
            }
        };

        self.transition(&mut data, next_status).await?;

        info!(
            oauth_state_id = %data.id,
            status = %data.status.as_str(),
            "OAuth handshake completed"
        );

        Ok(CallbackRedirect {
            location: compose_redirect(&data.redirect_url, success, data.id, &message),
        })
    }

    /// Drop expired handshakes from the durable tier.
    pub async fn cleanup_expired(&self) -> Result<u64, ApiError> {
        Ok(self
            .store
            .cleanup_expired()
            .await
            .map_err(BrokerError::from)?)
    }

    /// Apply a state-machine transition, enforcing pending-to-terminal at the
    /// service layer.
    async fn transition(
        &self,
        data: &mut OAuthStateData,
        next: OAuthStateStatus,
    ) -> Result<(), ApiError> {
        if !data.status.can_transition_to(next) {
            return Err(ApiError::new(
                StatusCode::CONFLICT,
                "OAUTH_STATE_TERMINAL",
                &format!(
                    "illegal oauth state transition {} -> {}",
                    data.status.as_str(),
                    next.as_str()
                ),
            ));
        }

        data.status = next;
        data.updated_at = Utc::now();
        self.store.update(data).await.map_err(BrokerError::from)?;
        Ok(())
    }
}

/// 32 random bytes, base64url without padding (43 chars).
fn generate_url_safe_token() -> String {
    let mut bytes = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut bytes);
    base64_url::encode(&bytes)
}

/// PKCE S256: base64url_no_pad(SHA256(code_verifier)).
pub fn compute_code_challenge(code_verifier: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(code_verifier.as_bytes());
    base64_url::encode(&hasher.finalize())
}

/// Append the status-qualified query to the stored redirect, preserving an
/// existing `?`.
fn compose_redirect(redirect_url: &str, success: bool, oauth_state_id: Uuid, message: &str) -> String {
    let query: String = form_urlencoded::Serializer::new(String::new())
        .append_pair("success", if success { "true" } else { "false" })
        .append_pair("oauth_state_id", &oauth_state_id.to_string())
        .append_pair("message", message)
        .append_pair("code", "200")
        .finish();

    let separator = if redirect_url.contains('?') { '&' } else { '?' };
    format!("{}{}{}", redirect_url, separator, query)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_code_challenge_matches_rfc7636_vector() {
        // RFC 7636 appendix B test vector.
        let verifier = "dBjftJeZ4CVP-mB92K27uhbUJU1p1r_wW1gFWFOEjXk";
        assert_eq!(
            compute_code_challenge(verifier),
            "E9Melhoa2OwvFrEMTJguCHaoeK1t8URWbuGJSstw-cM"
        );
    }

    #[test]
    fn test_generated_tokens_are_unique_and_url_safe() {
        let a = generate_url_safe_token();
        let b = generate_url_safe_token();
        assert_ne!(a, b);
        assert_eq!(a.len(), 43);
        assert!(
            a.chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
        );
    }

    #[test]
    fn test_challenge_verifier_invariant() {
        let verifier = generate_url_safe_token();
        let challenge = compute_code_challenge(&verifier);
        assert_eq!(challenge, compute_code_challenge(&verifier));
        assert_ne!(challenge, verifier);
        assert_eq!(challenge.len(), 43);
    }

    #[test]
    fn test_compose_redirect_without_query() {
        let id = Uuid::parse_str("00000000-0000-0000-0000-000000000001").unwrap();
        let url = compose_redirect("https://app.example.com/cb", true, id, "ok");
        assert_eq!(
            url,
            "https://app.example.com/cb?success=true&oauth_state_id=00000000-0000-0000-0000-000000000001&message=ok&code=200"
        );
    }

    #[test]
    fn test_compose_redirect_preserves_existing_query() {
        let id = Uuid::parse_str("00000000-0000-0000-0000-000000000002").unwrap();
        let url = compose_redirect("https://app.example.com/cb?tab=settings", false, id, "access_denied");
        assert!(url.starts_with("https://app.example.com/cb?tab=settings&success=false"));
        assert!(url.contains("message=access_denied"));
        assert!(url.ends_with("&code=200"));
    }

    #[test]
    fn test_compose_redirect_encodes_message() {
        let id = Uuid::new_v4();
        let url = compose_redirect("https://app.example.com/cb", false, id, "bad thing & more");
        assert!(url.contains("message=bad+thing+%26+more"));
    }
}
