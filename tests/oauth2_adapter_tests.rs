//! Generic OAuth2 adapter tests against a mock IdP: token exchange form
//! shape, refresh-token carry-over, retry policy, and error mapping.

use std::collections::BTreeMap;

use chrono::{Duration, Utc};
use credbroker::models::oauth_credential::OAuthToken;
use credbroker::providers::{AdapterError, OAuth2Adapter, OAuth2Config, ProviderAdapter};
use serde_json::json;
use wiremock::matchers::{body_string_contains, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn adapter_for(server: &MockServer) -> OAuth2Adapter {
    OAuth2Adapter::new(
        "example",
        OAuth2Config {
            client_id: "client-123".to_string(),
            client_secret: "secret-456".to_string(),
            auth_url: format!("{}/oauth/authorize", server.uri()),
            token_url: format!("{}/oauth/token", server.uri()),
            default_scopes: vec![],
            permission_scopes: BTreeMap::new(),
        },
    )
}

#[tokio::test]
async fn exchange_code_posts_pkce_form_and_maps_expiry() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/oauth/token"))
        .and(body_string_contains("grant_type=authorization_code"))
        .and(body_string_contains("code=auth-code-1"))
        .and(body_string_contains("code_verifier=verifier-1"))
        .and(body_string_contains("client_id=client-123"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "access_token": "at-1",
            "refresh_token": "rt-1",
            "token_type": "Bearer",
            "expires_in": 3600
        })))
        .expect(1)
        .mount(&server)
        .await;

    let adapter = adapter_for(&server);
    let before = Utc::now();
    let token = adapter
        .exchange_code("auth-code-1", "https://broker.example.com/cb", "verifier-1")
        .await
        .expect("exchange succeeds");

    assert_eq!(token.access_token, "at-1");
    assert_eq!(token.refresh_token.as_deref(), Some("rt-1"));
    assert_eq!(token.token_type, "Bearer");

    let expiry = token.expiry.expect("expiry mapped from expires_in");
    assert!(expiry >= before + Duration::seconds(3590));
    assert!(expiry <= Utc::now() + Duration::seconds(3610));
}

#[tokio::test]
async fn refresh_keeps_prior_refresh_token_when_response_omits_it() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/oauth/token"))
        .and(body_string_contains("grant_type=refresh_token"))
        .and(body_string_contains("refresh_token=rt-old"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "access_token": "at-new",
            "token_type": "Bearer",
            "expires_in": 1800
        })))
        .expect(1)
        .mount(&server)
        .await;

    let adapter = adapter_for(&server);
    let prior = OAuthToken {
        access_token: "at-old".to_string(),
        refresh_token: Some("rt-old".to_string()),
        token_type: "Bearer".to_string(),
        expiry: Some(Utc::now()),
    };

    let refreshed = adapter.refresh(&prior).await.expect("refresh succeeds");
    assert_eq!(refreshed.access_token, "at-new");
    // Rotation responses without a refresh token keep the old one.
    assert_eq!(refreshed.refresh_token.as_deref(), Some("rt-old"));
}

#[tokio::test]
async fn server_errors_are_retried_within_budget() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/oauth/token"))
        .respond_with(ResponseTemplate::new(503))
        .up_to_n_times(2)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/oauth/token"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "access_token": "at-retry",
            "token_type": "Bearer"
        })))
        .expect(1)
        .mount(&server)
        .await;

    let adapter = adapter_for(&server);
    let token = adapter
        .exchange_code("code", "https://broker.example.com/cb", "verifier")
        .await
        .expect("third attempt succeeds");
    assert_eq!(token.access_token, "at-retry");
}

#[tokio::test]
async fn client_errors_are_not_retried() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/oauth/token"))
        .respond_with(
            ResponseTemplate::new(400).set_body_json(json!({ "error": "invalid_grant" })),
        )
        .expect(1)
        .mount(&server)
        .await;

    let adapter = adapter_for(&server);
    let result = adapter
        .exchange_code("code", "https://broker.example.com/cb", "verifier")
        .await;
    assert!(matches!(result, Err(AdapterError::Http { status: 400, .. })));
}

#[tokio::test]
async fn rate_limits_map_to_typed_error_with_retry_after() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/oauth/token"))
        .respond_with(ResponseTemplate::new(429).insert_header("retry-after", "30"))
        .expect(1)
        .mount(&server)
        .await;

    let adapter = adapter_for(&server);
    let result = adapter
        .exchange_code("code", "https://broker.example.com/cb", "verifier")
        .await;
    assert!(matches!(
        result,
        Err(AdapterError::RateLimited {
            retry_after: Some(30)
        })
    ));
}

#[tokio::test]
async fn error_payload_on_success_status_maps_to_authentication_error() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/oauth/token"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "access_token": "",
            "error": "access_denied",
            "error_description": "user rejected the request"
        })))
        .mount(&server)
        .await;

    let adapter = adapter_for(&server);
    let result = adapter
        .exchange_code("code", "https://broker.example.com/cb", "verifier")
        .await;
    assert!(matches!(result, Err(AdapterError::Authentication { .. })));
}
