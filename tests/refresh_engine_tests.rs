//! Token refresh engine integration tests: the on-demand gate, the
//! lock-protected core with concurrent-update detection, and the periodic
//! sweep's window and dormancy filters.

mod common;

use std::sync::atomic::Ordering;

use chrono::{Duration, Utc};
use common::{MockAdapter, PROVIDER, broker, broker_with_adapter, user};
use credbroker::models::credential;
use credbroker::models::oauth_credential::OAuthToken;
use credbroker::services::CredentialSecret;
use sea_orm::{ActiveModelTrait, Set};
use tokio_util::sync::CancellationToken;

fn token(access: &str, expires_in_minutes: i64) -> OAuthToken {
    OAuthToken {
        access_token: access.to_string(),
        refresh_token: Some("rt-initial".to_string()),
        token_type: "Bearer".to_string(),
        expiry: Some(Utc::now() + Duration::minutes(expires_in_minutes)),
    }
}

#[tokio::test]
async fn due_token_is_refreshed_once_and_persisted() {
    let broker = broker_with_adapter(MockAdapter::refreshing()).await;
    let user_id = user();

    broker
        .credentials
        .create_oauth(user_id, PROVIDER, token("at-old", 2), vec!["scope:read".into()])
        .await
        .unwrap();

    let refreshed = broker
        .credentials
        .get_by_user_and_provider(user_id, PROVIDER)
        .await
        .unwrap();

    assert_eq!(broker.adapter.refresh_calls.load(Ordering::SeqCst), 1);
    let CredentialSecret::OAuth(ref new_token) = refreshed.secret else {
        panic!("expected oauth secret");
    };
    assert_eq!(new_token.access_token, "refreshed-1");
    // Scopes ride along unchanged.
    assert_eq!(refreshed.scopes, vec!["scope:read".to_string()]);

    // The persisted row decrypts to the refreshed token on a later read.
    broker.adapter.refresh_due.store(false, Ordering::SeqCst);
    let reread = broker
        .credentials
        .get_by_user_and_provider(user_id, PROVIDER)
        .await
        .unwrap();
    let CredentialSecret::OAuth(ref persisted) = reread.secret else {
        panic!("expected oauth secret");
    };
    assert_eq!(persisted.access_token, "refreshed-1");
    assert_eq!(broker.adapter.refresh_calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn fresh_token_passes_through_without_adapter_call() {
    let broker = broker().await;
    let user_id = user();

    broker
        .credentials
        .create_oauth(user_id, PROVIDER, token("at-fresh", 120), vec![])
        .await
        .unwrap();

    let fetched = broker
        .credentials
        .get_by_user_and_provider(user_id, PROVIDER)
        .await
        .unwrap();

    assert_eq!(broker.adapter.refresh_calls.load(Ordering::SeqCst), 0);
    let CredentialSecret::OAuth(ref t) = fetched.secret else {
        panic!("expected oauth secret");
    };
    assert_eq!(t.access_token, "at-fresh");
}

#[tokio::test]
async fn concurrent_update_is_detected_and_adapter_skipped() {
    let broker = broker_with_adapter(MockAdapter::refreshing()).await;
    let user_id = user();

    let created = broker
        .credentials
        .create_oauth(user_id, PROVIDER, token("at-original", 2), vec![])
        .await
        .unwrap();

    // A peer refreshed while our snapshot was in flight: the stored child
    // row no longer matches the credential we are holding.
    let peer_token = token("at-peer-refreshed", 60);
    let metadata = credbroker::vault::encrypt_struct(
        broker.vault.as_ref(),
        &peer_token,
        credbroker::vault::Region::Eu,
        credbroker::models::credential::CredentialType::OAuth,
    )
    .await
    .unwrap();
    let peer_secret = credbroker::models::oauth_credential::OAuthSecret {
        encryption_metadata: metadata,
        scopes: vec![],
    };
    credbroker::repositories::OAuthCredentialRepository::new(broker.db.clone())
        .update(&*broker.db, created.base.id, &peer_secret, peer_token.expiry)
        .await
        .unwrap();

    let result = broker
        .engine
        .refresh_if_needed(PROVIDER, created)
        .await
        .expect("refresh resolves");

    // The engine saw the newer token under the lock and returned it without
    // calling the provider.
    assert_eq!(broker.adapter.refresh_calls.load(Ordering::SeqCst), 0);
    let CredentialSecret::OAuth(ref t) = result.secret else {
        panic!("expected oauth secret");
    };
    assert_eq!(t.access_token, "at-peer-refreshed");
}

#[tokio::test]
async fn non_oauth_credentials_pass_through_the_gate() {
    let broker = broker_with_adapter(MockAdapter::refreshing()).await;
    let user_id = user();

    let created = broker
        .credentials
        .create_apikey(user_id, PROVIDER, "sk-live")
        .await
        .unwrap();

    let result = broker
        .engine
        .refresh_if_needed(PROVIDER, created)
        .await
        .unwrap();
    assert!(matches!(result.secret, CredentialSecret::ApiKey(_)));
    assert_eq!(broker.adapter.refresh_calls.load(Ordering::SeqCst), 0);
}

async fn set_last_used(
    broker: &common::Broker,
    credential_id: uuid::Uuid,
    last_used: chrono::DateTime<Utc>,
) {
    let model = credential::ActiveModel {
        id: Set(credential_id),
        last_used_at: Set(Some(last_used.into())),
        ..Default::default()
    };
    model.update(&*broker.db).await.unwrap();
}

#[tokio::test]
async fn sweep_refreshes_only_expiring_recently_used_credentials() {
    let broker = broker_with_adapter(MockAdapter::refreshing()).await;

    // Eligible: expiring inside the 30-minute window, used recently.
    let eligible_user = user();
    broker
        .credentials
        .create_oauth(eligible_user, PROVIDER, token("at-eligible", 10), vec![])
        .await
        .unwrap();

    // Dormant: expiring, but last used 48 hours ago.
    let dormant_user = user();
    let dormant = broker
        .credentials
        .create_oauth(dormant_user, PROVIDER, token("at-dormant", 10), vec![])
        .await
        .unwrap();
    set_last_used(&broker, dormant.base.id, Utc::now() - Duration::hours(48)).await;

    // Outside the window: expires in two days.
    let distant_user = user();
    broker
        .credentials
        .create_oauth(distant_user, PROVIDER, token("at-distant", 2880), vec![])
        .await
        .unwrap();

    broker
        .engine
        .refresh_all(CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(broker.adapter.refresh_calls.load(Ordering::SeqCst), 1);

    // Only the eligible credential changed.
    broker.adapter.refresh_due.store(false, Ordering::SeqCst);
    let refreshed = broker
        .credentials
        .get_by_user_and_provider(eligible_user, PROVIDER)
        .await
        .unwrap();
    let CredentialSecret::OAuth(ref t) = refreshed.secret else {
        panic!("expected oauth secret");
    };
    assert_eq!(t.access_token, "refreshed-1");

    let untouched = broker
        .credentials
        .get_by_user_and_provider(dormant_user, PROVIDER)
        .await
        .unwrap();
    let CredentialSecret::OAuth(ref t) = untouched.secret else {
        panic!("expected oauth secret");
    };
    assert_eq!(t.access_token, "at-dormant");
}

#[tokio::test]
async fn sweep_dormancy_boundary_is_inclusive() {
    let broker = broker_with_adapter(MockAdapter::refreshing()).await;

    // Exactly at the 24-hour boundary (with a second of slack toward
    // eligibility): still refreshed.
    let boundary_user = user();
    let boundary = broker
        .credentials
        .create_oauth(boundary_user, PROVIDER, token("at-boundary", 10), vec![])
        .await
        .unwrap();
    set_last_used(
        &broker,
        boundary.base.id,
        Utc::now() - Duration::hours(24) + Duration::seconds(5),
    )
    .await;

    broker
        .engine
        .refresh_all(CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(broker.adapter.refresh_calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn sweep_preserves_encryption_locality() {
    let broker = broker_with_adapter(MockAdapter::refreshing()).await;
    let user_id = user();

    broker
        .credentials
        .create_oauth(user_id, PROVIDER, token("at-old", 5), vec![])
        .await
        .unwrap();

    broker
        .engine
        .refresh_all(CancellationToken::new())
        .await
        .unwrap();

    // Re-encryption kept the prior region and credential type.
    let base = broker
        .credentials
        .list_by_user(user_id)
        .await
        .unwrap()
        .remove(0);
    let child = credbroker::repositories::OAuthCredentialRepository::new(broker.db.clone())
        .get_by_credential_id(base.id)
        .await
        .unwrap()
        .unwrap();
    let secret = child.secret().unwrap();
    assert_eq!(secret.encryption_metadata.region, credbroker::vault::Region::Eu);
    assert!(secret.encryption_metadata.ciphertext.starts_with("vault:v1:"));
}
