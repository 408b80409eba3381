//! # Credential Service
//!
//! Transactional façade over the credential stores: create/replace, read
//! with on-demand refresh, delete, and the OAuth handshake hooks. Writes run
//! in one unit-of-work including the audit event publish; a publish failure
//! rolls the database write back.

use std::sync::Arc;

use chrono::{Duration, Utc};
use sea_orm::{ColumnTrait, DatabaseConnection, EntityTrait, QueryFilter, Set, TransactionTrait};
use std::time::Duration as StdDuration;
use tracing::{info, instrument, warn};
use url::Url;
use uuid::Uuid;

use crate::error::BrokerError;
use crate::events::{CredentialEvent, CredentialEventKind, EventPublisher};
use crate::lock::{DistributedLock, access_token_lock_key};
use crate::models::apikey_credential::ApiKeySecret;
use crate::models::credential::{self, CredentialType, Entity as Credential};
use crate::models::oauth_credential::{OAuthSecret, OAuthToken};
use crate::providers::AdapterRegistry;
use crate::repositories::{
    ApiKeyCredentialRepository, CredentialRepository, OAuthCredentialRepository,
};
use crate::token_refresh::TokenRefreshEngine;
use crate::vault::{Region, Vault, decrypt_struct, encrypt_struct};

/// Lock TTL on the read path; refreshes are expected to be quick.
const READ_LOCK_TTL_SECONDS: i64 = 1;
/// Read-path lock retry budget.
const READ_LOCK_ATTEMPTS: u32 = 5;
/// Fixed backoff between read-path lock attempts.
const READ_LOCK_BACKOFF: StdDuration = StdDuration::from_millis(100);

/// A credential with its secret decrypted into process memory. Never logged,
/// never persisted in this form.
#[derive(Debug, Clone)]
pub struct BrokeredCredential {
    pub base: credential::Model,
    pub secret: CredentialSecret,
    pub scopes: Vec<String>,
}

/// Typed secret payload of a brokered credential.
#[derive(Debug, Clone)]
pub enum CredentialSecret {
    OAuth(OAuthToken),
    ApiKey(String),
    None,
}

impl BrokeredCredential {
    pub fn oauth_token(&self) -> Option<&OAuthToken> {
        match &self.secret {
            CredentialSecret::OAuth(token) => Some(token),
            _ => None,
        }
    }
}

/// Transactional credential façade
pub struct CredentialService {
    db: Arc<DatabaseConnection>,
    vault: Arc<dyn Vault>,
    credentials: CredentialRepository,
    oauth_credentials: OAuthCredentialRepository,
    apikey_credentials: ApiKeyCredentialRepository,
    registry: Arc<AdapterRegistry>,
    lock: DistributedLock,
    refresh_engine: Arc<TokenRefreshEngine>,
    publisher: Arc<dyn EventPublisher>,
    default_region: Region,
    callback_url: String,
}

impl CredentialService {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        db: Arc<DatabaseConnection>,
        vault: Arc<dyn Vault>,
        registry: Arc<AdapterRegistry>,
        refresh_engine: Arc<TokenRefreshEngine>,
        publisher: Arc<dyn EventPublisher>,
        default_region: Region,
        callback_url: String,
    ) -> Self {
        Self {
            credentials: CredentialRepository::new(db.clone()),
            oauth_credentials: OAuthCredentialRepository::new(db.clone()),
            apikey_credentials: ApiKeyCredentialRepository::new(db.clone()),
            lock: DistributedLock::new(db.clone()),
            db,
            vault,
            registry,
            refresh_engine,
            publisher,
            default_region,
            callback_url,
        }
    }

    /// Store an OAuth token as the user's credential for the provider,
    /// replacing any prior credential for the pair in the same transaction.
    /// Returns the in-memory credential including the plaintext token for
    /// immediate reuse.
    #[instrument(skip_all, fields(user_id = %user_id, provider_identifier = %provider_identifier))]
    pub async fn create_oauth(
        &self,
        user_id: Uuid,
        provider_identifier: &str,
        token: OAuthToken,
        scopes: Vec<String>,
    ) -> Result<BrokeredCredential, BrokerError> {
        if token.access_token.is_empty() {
            return Err(BrokerError::BadCredential(
                "access token must not be empty".to_string(),
            ));
        }

        let metadata = encrypt_struct(
            self.vault.as_ref(),
            &token,
            self.default_region,
            CredentialType::OAuth,
        )
        .await?;
        let secret = OAuthSecret {
            encryption_metadata: metadata,
            scopes: scopes.clone(),
        };

        let txn = self.db.begin().await?;

        self.replace_existing(&txn, user_id, provider_identifier)
            .await?;

        let base = self
            .insert_base(&txn, user_id, provider_identifier, CredentialType::OAuth)
            .await?;
        self.oauth_credentials
            .create(&txn, base.id, &secret, token.expiry)
            .await?;

        self.publish_or_rollback(
            txn,
            CredentialEvent::new(
                CredentialEventKind::Created,
                base.id,
                user_id,
                provider_identifier,
                CredentialType::OAuth.as_str(),
            ),
        )
        .await?;

        info!(credential_id = %base.id, "Created oauth credential");

        Ok(BrokeredCredential {
            base,
            secret: CredentialSecret::OAuth(token),
            scopes,
        })
    }

    /// Store an API key as the user's credential for the provider. Empty
    /// keys are rejected before any vault or database work.
    #[instrument(skip_all, fields(user_id = %user_id, provider_identifier = %provider_identifier))]
    pub async fn create_apikey(
        &self,
        user_id: Uuid,
        provider_identifier: &str,
        api_key: &str,
    ) -> Result<BrokeredCredential, BrokerError> {
        if api_key.trim().is_empty() {
            return Err(BrokerError::InvalidParameters(
                "api_key must not be empty".to_string(),
            ));
        }

        let metadata = self
            .vault
            .encrypt_bytes(
                api_key.as_bytes(),
                self.default_region,
                CredentialType::ApiKey,
            )
            .await?;
        let secret = ApiKeySecret {
            encryption_metadata: metadata,
        };

        let txn = self.db.begin().await?;

        self.replace_existing(&txn, user_id, provider_identifier)
            .await?;

        let base = self
            .insert_base(&txn, user_id, provider_identifier, CredentialType::ApiKey)
            .await?;
        self.apikey_credentials
            .create(&txn, base.id, &secret)
            .await?;

        self.publish_or_rollback(
            txn,
            CredentialEvent::new(
                CredentialEventKind::Created,
                base.id,
                user_id,
                provider_identifier,
                CredentialType::ApiKey.as_str(),
            ),
        )
        .await?;

        info!(credential_id = %base.id, "Created apikey credential");

        Ok(BrokeredCredential {
            base,
            secret: CredentialSecret::ApiKey(api_key.to_string()),
            scopes: Vec::new(),
        })
    }

    /// Fetch the user's credential for a provider, refreshing it first when
    /// the adapter says it is due. Serialized against concurrent refreshes
    /// through the per-(provider, user) lock; lock exhaustion surfaces as
    /// `CredentialExpired` with a re-authorize hint.
    #[instrument(skip_all, fields(user_id = %user_id, provider_identifier = %provider_identifier))]
    pub async fn get_by_user_and_provider(
        &self,
        user_id: Uuid,
        provider_identifier: &str,
    ) -> Result<BrokeredCredential, BrokerError> {
        let key = access_token_lock_key(provider_identifier, user_id);
        let token = self
            .lock
            .acquire_with_retry(
                &key,
                Duration::seconds(READ_LOCK_TTL_SECONDS),
                READ_LOCK_ATTEMPTS,
                READ_LOCK_BACKOFF,
            )
            .await?;
        let Some(lock_token) = token else {
            warn!("Read lock exhausted; a refresh is likely still in flight");
            return Err(BrokerError::CredentialExpired);
        };

        // Hold the lock across fetch + refresh so readers observe either the
        // pre- or post-refresh token, never a torn state. Released on every
        // exit path.
        let result = self.fetch_and_refresh(user_id, provider_identifier).await;
        if let Err(err) = self.lock.release(&key, lock_token).await {
            warn!(error = %err, "Failed to release read lock (TTL will reclaim)");
        }
        result
    }

    async fn fetch_and_refresh(
        &self,
        user_id: Uuid,
        provider_identifier: &str,
    ) -> Result<BrokeredCredential, BrokerError> {
        let base = self
            .credentials
            .get_by_user_and_provider(user_id, provider_identifier)
            .await?
            .ok_or(BrokerError::CredentialNotFound)?;

        let credential = self.load_secret(base).await?;

        // The read path already holds the per-(provider, user) lock, so the
        // engine must not re-acquire it.
        self.refresh_engine
            .refresh_if_needed_holding_lock(provider_identifier, credential)
            .await
    }

    /// Decrypt the typed child row for a base credential.
    pub(crate) async fn load_secret(
        &self,
        base: credential::Model,
    ) -> Result<BrokeredCredential, BrokerError> {
        let credential_type = base
            .credential_type()
            .map_err(BrokerError::InvalidCredentialType)?;

        match credential_type {
            CredentialType::OAuth => {
                let child = self
                    .oauth_credentials
                    .get_by_credential_id(base.id)
                    .await?
                    .ok_or(BrokerError::CredentialNotFound)?;
                let secret = child
                    .secret()
                    .map_err(|e| BrokerError::BadCredential(format!("secret column: {}", e)))?;
                let token: OAuthToken =
                    decrypt_struct(self.vault.as_ref(), &secret.encryption_metadata).await?;
                Ok(BrokeredCredential {
                    base,
                    secret: CredentialSecret::OAuth(token),
                    scopes: secret.scopes,
                })
            }
            CredentialType::ApiKey => {
                let child = self
                    .apikey_credentials
                    .get_by_credential_id(base.id)
                    .await?
                    .ok_or(BrokerError::CredentialNotFound)?;
                let secret = child
                    .secret()
                    .map_err(|e| BrokerError::BadCredential(format!("secret column: {}", e)))?;
                let key_bytes = self
                    .vault
                    .decrypt_bytes(&secret.encryption_metadata)
                    .await?;
                let api_key = String::from_utf8(key_bytes)
                    .map_err(|_| BrokerError::BadCredential("api key is not utf-8".to_string()))?;
                Ok(BrokeredCredential {
                    base,
                    secret: CredentialSecret::ApiKey(api_key),
                    scopes: Vec::new(),
                })
            }
            CredentialType::BasicAuth | CredentialType::None => Ok(BrokeredCredential {
                base,
                secret: CredentialSecret::None,
                scopes: Vec::new(),
            }),
        }
    }

    /// Fetch the base row without decrypting; handlers use this for
    /// ownership checks.
    pub async fn get_base_by_id(&self, id: Uuid) -> Result<credential::Model, BrokerError> {
        self.credentials
            .get_by_id(id)
            .await?
            .filter(|c| !c.is_deleted())
            .ok_or(BrokerError::CredentialNotFound)
    }

    /// Delete a credential: typed child row then base, with the
    /// `credential.deleted` event inside the same transaction.
    #[instrument(skip_all, fields(credential_id = %id))]
    pub async fn delete(&self, id: Uuid) -> Result<(), BrokerError> {
        let base = self.get_base_by_id(id).await?;

        let txn = self.db.begin().await?;
        self.credentials.delete(&txn, &base).await?;

        self.publish_or_rollback(
            txn,
            CredentialEvent::new(
                CredentialEventKind::Deleted,
                base.id,
                base.user_id,
                &base.provider_identifier,
                &base.credential_type,
            ),
        )
        .await?;

        info!("Deleted credential");
        Ok(())
    }

    /// Metadata-only listing for UI surfaces; no decryption happens here.
    pub async fn list_by_user(&self, user_id: Uuid) -> Result<Vec<credential::Model>, BrokerError> {
        Ok(self.credentials.list_by_user(user_id).await?)
    }

    /// Compose the provider authorize URL for a handshake.
    pub fn get_oauth_url(
        &self,
        provider_identifier: &str,
        state: &str,
        code_challenge: &str,
        permissions: &[String],
    ) -> Result<Url, BrokerError> {
        let adapter = self
            .registry
            .get(provider_identifier)
            .map_err(|e| BrokerError::OperationNotSupported(e.to_string()))?;

        let scopes = adapter.scopes_from_permissions(permissions);
        adapter
            .generate_auth_url(&self.callback_url, state, code_challenge, &scopes)
            .map_err(|e| {
                BrokerError::provider(provider_identifier, "generate_auth_url", e.to_string())
            })
    }

    /// Exchange a callback code for a token and store it as the user's
    /// credential for the provider.
    pub async fn handle_oauth_callback(
        &self,
        code: &str,
        provider_identifier: &str,
        user_id: Uuid,
        permissions: &[String],
        code_verifier: &str,
    ) -> Result<BrokeredCredential, BrokerError> {
        let adapter = self
            .registry
            .get(provider_identifier)
            .map_err(|e| BrokerError::OperationNotSupported(e.to_string()))?;

        let token = adapter
            .exchange_code(code, &self.callback_url, code_verifier)
            .await
            .map_err(|e| {
                BrokerError::provider(provider_identifier, "exchange_code", e.to_string())
            })?;

        let scopes = adapter.scopes_from_permissions(permissions);
        self.create_oauth(user_id, provider_identifier, token, scopes)
            .await
    }

    /// Record that the credential brokered a provider call just now.
    pub async fn update_last_used_at(
        &self,
        credential: &credential::Model,
    ) -> Result<(), BrokerError> {
        Ok(self.credentials.update_last_used_at(credential.id).await?)
    }

    /// Replacement semantics: at most one non-deleted credential per
    /// `(user, provider)`; the prior one is hard-deleted inside the caller's
    /// transaction before the new row is inserted.
    async fn replace_existing(
        &self,
        txn: &sea_orm::DatabaseTransaction,
        user_id: Uuid,
        provider_identifier: &str,
    ) -> Result<(), BrokerError> {
        let existing = Credential::find()
            .filter(credential::Column::UserId.eq(user_id))
            .filter(credential::Column::ProviderIdentifier.eq(provider_identifier))
            .filter(credential::Column::DeletedAt.is_null())
            .one(txn)
            .await?;

        if let Some(existing) = existing {
            info!(
                replaced_credential_id = %existing.id,
                "Replacing prior credential for (user, provider)"
            );
            self.credentials.delete(txn, &existing).await?;
        }
        Ok(())
    }

    async fn insert_base(
        &self,
        txn: &sea_orm::DatabaseTransaction,
        user_id: Uuid,
        provider_identifier: &str,
        credential_type: CredentialType,
    ) -> Result<credential::Model, BrokerError> {
        let now = Utc::now();
        let model = credential::ActiveModel {
            id: Set(Uuid::new_v4()),
            user_id: Set(user_id),
            provider_identifier: Set(provider_identifier.to_string()),
            credential_type: Set(credential_type.as_str().to_string()),
            is_valid: Set(true),
            created_at: Set(now.into()),
            updated_at: Set(now.into()),
            last_used_at: Set(Some(now.into())),
            deleted_at: Set(None),
        };
        Ok(self.credentials.create(txn, model).await?)
    }

    /// Publish inside the unit-of-work; a publish failure rolls the write
    /// back. Commit errors propagate as database errors.
    async fn publish_or_rollback(
        &self,
        txn: sea_orm::DatabaseTransaction,
        event: CredentialEvent,
    ) -> Result<(), BrokerError> {
        if let Err(err) = self.publisher.publish(event).await {
            txn.rollback().await?;
            return Err(BrokerError::EventPublish(err));
        }
        txn.commit().await?;
        Ok(())
    }
}
