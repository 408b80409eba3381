//! # Token Refresh Engine
//!
//! Keeps brokered OAuth tokens usable through two entry points that share one
//! lock-protected core routine:
//!
//! - **on-demand**: invoked synchronously before a credential read when the
//!   provider adapter says the token is due;
//! - **periodic sweep**: scans for tokens expiring inside the refresh window,
//!   drops dormant credentials, and fans out per provider under a bounded
//!   semaphore.
//!
//! The distributed per-(provider, user) lock guarantees at most one in-flight
//! refresh per credential across the whole fleet; the re-read-after-lock
//! detects updates a peer made while we waited.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::{Duration, Utc};
use metrics::{counter, histogram};
use sea_orm::DatabaseConnection;
use tokio::sync::Semaphore;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use crate::config::TokenRefreshConfig;
use crate::error::BrokerError;
use crate::lock::{DistributedLock, LockToken, access_token_lock_key};
use crate::models::credential::CredentialType;
use crate::models::oauth_credential::{OAuthSecret, OAuthToken};
use crate::providers::{AdapterError, AdapterRegistry};
use crate::repositories::{CredentialRepository, OAuthCredentialRepository};
use crate::services::credential::{BrokeredCredential, CredentialSecret};
use crate::vault::{Vault, decrypt_struct, encrypt_struct};

/// Lock TTL while refreshing; callers must finish inside it.
const REFRESH_LOCK_TTL_SECONDS: i64 = 1;
/// Refresh-core lock retry budget.
const REFRESH_LOCK_ATTEMPTS: u32 = 5;
/// Fixed backoff between refresh-core lock attempts.
const REFRESH_LOCK_BACKOFF: StdDuration = StdDuration::from_millis(500);
/// Deadline for a sweep worker to obtain a semaphore permit.
const SEMAPHORE_ACQUIRE_TIMEOUT: StdDuration = StdDuration::from_secs(30);

/// Background + on-demand token refresher
pub struct TokenRefreshEngine {
    db: Arc<DatabaseConnection>,
    config: TokenRefreshConfig,
    vault: Arc<dyn Vault>,
    registry: Arc<AdapterRegistry>,
    credentials: CredentialRepository,
    oauth_credentials: OAuthCredentialRepository,
    lock: DistributedLock,
    /// Process-wide cap on concurrent provider groups in the sweep.
    semaphore: Arc<Semaphore>,
}

#[derive(Debug, Default)]
struct SweepStats {
    candidates: u64,
    dormant_skipped: u64,
    refreshed: u64,
    failed: u64,
}

impl TokenRefreshEngine {
    pub fn new(
        db: Arc<DatabaseConnection>,
        config: TokenRefreshConfig,
        vault: Arc<dyn Vault>,
        registry: Arc<AdapterRegistry>,
    ) -> Self {
        let semaphore = Arc::new(Semaphore::new(config.concurrency));
        Self {
            credentials: CredentialRepository::new(db.clone()),
            oauth_credentials: OAuthCredentialRepository::new(db.clone()),
            lock: DistributedLock::new(db.clone()),
            db,
            config,
            vault,
            registry,
            semaphore,
        }
    }

    /// Run the periodic sweep until the shutdown token fires.
    #[instrument(skip_all)]
    pub async fn run(self: Arc<Self>, shutdown: CancellationToken) {
        info!("Starting token refresh engine");
        let tick_interval = StdDuration::from_secs(self.config.tick_seconds);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("Token refresh engine shutdown requested");
                    break;
                }
                _ = sleep(tick_interval) => {
                    let tick_started = std::time::Instant::now();
                    if let Err(err) = self.refresh_all(shutdown.child_token()).await {
                        error!(error = ?err, "Token refresh sweep failed");
                    }
                    histogram!("token_refresh_sweep_duration_ms")
                        .record(tick_started.elapsed().as_secs_f64() * 1_000.0);
                }
            }
        }

        info!("Token refresh engine stopped");
    }

    /// On-demand gate: pass non-OAuth credentials through untouched, ask the
    /// adapter whether the token is due, and run the refresh core if so.
    pub async fn refresh_if_needed(
        &self,
        provider_identifier: &str,
        credential: BrokeredCredential,
    ) -> Result<BrokeredCredential, BrokerError> {
        self.refresh_gate(provider_identifier, credential, false)
            .await
    }

    /// Same gate for the credential-read path, which already holds the
    /// per-(provider, user) lock. The core skips re-acquisition.
    pub async fn refresh_if_needed_holding_lock(
        &self,
        provider_identifier: &str,
        credential: BrokeredCredential,
    ) -> Result<BrokeredCredential, BrokerError> {
        self.refresh_gate(provider_identifier, credential, true)
            .await
    }

    async fn refresh_gate(
        &self,
        provider_identifier: &str,
        credential: BrokeredCredential,
        holding_lock: bool,
    ) -> Result<BrokeredCredential, BrokerError> {
        let credential_type = credential
            .base
            .credential_type()
            .map_err(BrokerError::InvalidCredentialType)?;
        if credential_type != CredentialType::OAuth {
            return Ok(credential);
        }

        let token = credential
            .oauth_token()
            .ok_or_else(|| BrokerError::BadCredential("oauth token missing".to_string()))?;

        let adapter = self
            .registry
            .get(provider_identifier)
            .map_err(|e| BrokerError::OperationNotSupported(e.to_string()))?;

        if !adapter.should_refresh(token) {
            return Ok(credential);
        }

        counter!("token_refresh_on_demand_attempts_total").increment(1);
        self.refresh_core(provider_identifier, credential, holding_lock)
            .await
    }

    /// Lock-protected refresh of one credential.
    #[instrument(skip_all, fields(credential_id = %credential.base.id, provider_identifier))]
    async fn refresh_core(
        &self,
        provider_identifier: &str,
        credential: BrokeredCredential,
        holding_lock: bool,
    ) -> Result<BrokeredCredential, BrokerError> {
        // Snapshot for concurrent-update detection.
        let snapshot = credential
            .oauth_token()
            .map(|t| t.access_token.clone())
            .ok_or_else(|| BrokerError::BadCredential("oauth token missing".to_string()))?;

        let key = access_token_lock_key(provider_identifier, credential.base.user_id);
        let lock_token: Option<LockToken> = if holding_lock {
            None
        } else {
            let acquired = self
                .lock
                .acquire_with_retry(
                    &key,
                    Duration::seconds(REFRESH_LOCK_TTL_SECONDS),
                    REFRESH_LOCK_ATTEMPTS,
                    REFRESH_LOCK_BACKOFF,
                )
                .await?;
            match acquired {
                Some(token) => Some(token),
                None => {
                    warn!("Refresh lock exhausted");
                    return Err(BrokerError::CredentialExpired);
                }
            }
        };

        let result = self
            .refresh_under_lock(provider_identifier, credential, &snapshot)
            .await;

        if let Some(token) = lock_token
            && let Err(err) = self.lock.release(&key, token).await
        {
            warn!(error = %err, "Failed to release refresh lock (TTL will reclaim)");
        }

        result
    }

    /// Steps executed while the per-(provider, user) lock is held.
    async fn refresh_under_lock(
        &self,
        provider_identifier: &str,
        credential: BrokeredCredential,
        snapshot: &str,
    ) -> Result<BrokeredCredential, BrokerError> {
        // Re-read the latest child row under the lock; a peer may have
        // refreshed while we waited.
        let child = self
            .oauth_credentials
            .get_by_credential_id(credential.base.id)
            .await?
            .ok_or(BrokerError::CredentialNotFound)?;
        let secret = child
            .secret()
            .map_err(|e| BrokerError::BadCredential(format!("secret column: {}", e)))?;
        let current: OAuthToken =
            decrypt_struct(self.vault.as_ref(), &secret.encryption_metadata).await?;

        if current.access_token != snapshot {
            debug!("Token already refreshed by a concurrent actor");
            counter!("token_refresh_concurrent_update_total").increment(1);
            return Ok(BrokeredCredential {
                base: credential.base,
                secret: CredentialSecret::OAuth(current),
                scopes: secret.scopes,
            });
        }

        let adapter = self
            .registry
            .get(provider_identifier)
            .map_err(|e| BrokerError::OperationNotSupported(e.to_string()))?;

        let refreshed = adapter.refresh(&current).await.map_err(|e| match e {
            AdapterError::RefreshUnsupported => {
                BrokerError::RefreshNotSupported(provider_identifier.to_string())
            }
            AdapterError::Authentication { details } => BrokerError::BadCredential(details),
            other => BrokerError::provider(provider_identifier, "refresh", other.to_string()),
        })?;

        // Re-encrypt under the same region and type as the prior metadata to
        // keep locality.
        let prior = &secret.encryption_metadata;
        let metadata = encrypt_struct(
            self.vault.as_ref(),
            &refreshed,
            prior.region,
            prior.credential_type,
        )
        .await?;

        let new_secret = OAuthSecret {
            encryption_metadata: metadata,
            scopes: secret.scopes.clone(),
        };
        self.oauth_credentials
            .update(&*self.db, credential.base.id, &new_secret, refreshed.expiry)
            .await?;

        info!("Refreshed access token");
        counter!("token_refresh_success_total", "provider" => provider_identifier.to_string())
            .increment(1);

        Ok(BrokeredCredential {
            base: credential.base,
            secret: CredentialSecret::OAuth(refreshed),
            scopes: secret.scopes,
        })
    }

    /// One sweep over the fleet: collect expiring credentials, drop dormant
    /// ones, and refresh per provider with bounded concurrency.
    #[instrument(skip_all)]
    pub async fn refresh_all(self: &Arc<Self>, cancel: CancellationToken) -> Result<(), BrokerError> {
        let sweep_started = std::time::Instant::now();
        let now = Utc::now();
        let mut stats = SweepStats::default();

        let cutoff = now + Duration::seconds(self.config.window_seconds);
        let expiring = self.oauth_credentials.list_by_expiry_within(cutoff).await?;
        stats.candidates = expiring.len() as u64;

        // Join with base rows and apply the dormancy filter.
        let ids: Vec<_> = expiring.iter().map(|c| c.credential_id).collect();
        let bases: HashMap<_, _> = self
            .credentials
            .list_by_id(&ids)
            .await?
            .into_iter()
            .map(|b| (b.id, b))
            .collect();

        let dormancy_cutoff = now - Duration::hours(self.config.dormancy_hours);
        let mut groups: HashMap<String, Vec<BrokeredCredential>> = HashMap::new();

        for child in expiring {
            let Some(base) = bases.get(&child.credential_id) else {
                continue;
            };
            if base.is_deleted() || !base.is_valid {
                continue;
            }
            let recently_used = base
                .last_used_at
                .is_some_and(|used| used >= dormancy_cutoff);
            if !recently_used {
                stats.dormant_skipped += 1;
                continue;
            }

            let secret = match child.secret() {
                Ok(secret) => secret,
                Err(err) => {
                    error!(credential_id = %child.credential_id, error = %err, "Unreadable secret column, skipping");
                    stats.failed += 1;
                    continue;
                }
            };
            let token: OAuthToken =
                match decrypt_struct(self.vault.as_ref(), &secret.encryption_metadata).await {
                    Ok(token) => token,
                    Err(err) => {
                        error!(credential_id = %child.credential_id, error = %err, "Token decryption failed, skipping");
                        stats.failed += 1;
                        continue;
                    }
                };

            // Annotated in-memory with user and provider from the base row.
            groups
                .entry(base.provider_identifier.clone())
                .or_default()
                .push(BrokeredCredential {
                    base: base.clone(),
                    secret: CredentialSecret::OAuth(token),
                    scopes: secret.scopes,
                });
        }

        info!(
            candidates = stats.candidates,
            dormant_skipped = stats.dormant_skipped,
            providers = groups.len(),
            "Sweep collected credentials due for refresh"
        );

        let mut handles = Vec::new();
        for (provider_identifier, group) in groups {
            let engine = Arc::clone(self);
            let cancel = cancel.clone();

            handles.push(tokio::spawn(async move {
                engine
                    .refresh_provider_group(&provider_identifier, group, cancel)
                    .await
            }));
        }

        for handle in handles {
            match handle.await {
                Ok((succeeded, failed)) => {
                    stats.refreshed += succeeded;
                    stats.failed += failed;
                }
                Err(err) => {
                    // Contained: a panicking worker only loses its own group.
                    error!(error = ?err, "Sweep worker panicked or was cancelled");
                    stats.failed += 1;
                }
            }
        }

        counter!("token_refresh_sweep_success_total").increment(stats.refreshed);
        counter!("token_refresh_sweep_failure_total").increment(stats.failed);

        info!(
            candidates = stats.candidates,
            dormant_skipped = stats.dormant_skipped,
            refreshed = stats.refreshed,
            failed = stats.failed,
            duration_ms = sweep_started.elapsed().as_millis() as u64,
            "Token refresh sweep completed"
        );

        Ok(())
    }

    /// Refresh one provider's group sequentially, paced to be polite to the
    /// provider, under a process-wide concurrency permit.
    async fn refresh_provider_group(
        self: &Arc<Self>,
        provider_identifier: &str,
        group: Vec<BrokeredCredential>,
        cancel: CancellationToken,
    ) -> (u64, u64) {
        let group_started = std::time::Instant::now();
        let group_size = group.len();

        let permit = tokio::select! {
            _ = cancel.cancelled() => {
                info!(provider_identifier, "Sweep cancelled before permit acquisition");
                return (0, 0);
            }
            permit = tokio::time::timeout(
                SEMAPHORE_ACQUIRE_TIMEOUT,
                self.semaphore.clone().acquire_owned(),
            ) => match permit {
                Ok(Ok(permit)) => permit,
                Ok(Err(_)) => {
                    error!(provider_identifier, "Sweep semaphore closed");
                    return (0, group_size as u64);
                }
                Err(_) => {
                    // Known behavior: these credentials are not retried this
                    // cycle; the next tick picks them up again.
                    warn!(provider_identifier, "Sweep semaphore acquisition timed out");
                    return (0, 0);
                }
            }
        };
        let _permit = permit;

        let mut succeeded = 0u64;
        let mut failed = 0u64;

        for (index, credential) in group.into_iter().enumerate() {
            if cancel.is_cancelled() {
                info!(provider_identifier, "Sweep cancelled mid-group");
                break;
            }
            if index > 0 {
                // Best-effort rate-limit friendliness to the provider.
                sleep(StdDuration::from_millis(self.config.pacer_ms)).await;
            }

            let credential_id = credential.base.id;
            match self.refresh_core(provider_identifier, credential, false).await {
                Ok(_) => succeeded += 1,
                Err(err) => {
                    warn!(
                        provider_identifier,
                        credential_id = %credential_id,
                        error = %err,
                        "Sweep refresh failed"
                    );
                    failed += 1;
                }
            }
        }

        info!(
            provider_identifier,
            group_size,
            succeeded,
            failed,
            duration_ms = group_started.elapsed().as_millis() as u64,
            "Provider group sweep finished"
        );

        (succeeded, failed)
    }
}
