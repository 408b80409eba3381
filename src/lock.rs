//! # Distributed Lock
//!
//! Named mutex with TTL over the `broker_locks` table. Acquisition is a
//! single atomic upsert: insert wins on a free key, and the conflict-update
//! arm reclaims rows whose TTL has lapsed. The database is the shared
//! substrate, so exclusion holds across every broker instance.
//!
//! Callers are expected to hold a lock for less than its TTL; past that the
//! lock is silently reclaimable and the system degrades to "another attempt
//! will retry".

use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::{Duration, Utc};
use sea_orm::sea_query::{Expr, OnConflict};
use sea_orm::{
    ColumnTrait, DatabaseConnection, DbErr, EntityTrait, QueryFilter, Set,
};
use tokio::time::sleep;
use uuid::Uuid;

use crate::models::broker_lock::{self, Entity as BrokerLock};

/// Per-(provider, user) token lock key.
pub fn access_token_lock_key(provider_identifier: &str, user_id: Uuid) -> String {
    format!("access_token_lock:{}:{}", provider_identifier, user_id)
}

/// Proof of acquisition; release removes only the matching row.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LockToken {
    holder: Uuid,
}

/// Database-backed named mutex with TTL
#[derive(Debug, Clone)]
pub struct DistributedLock {
    db: Arc<DatabaseConnection>,
}

impl DistributedLock {
    pub fn new(db: Arc<DatabaseConnection>) -> Self {
        Self { db }
    }

    /// Try to take the named lock. Returns a token on success, `None` when
    /// another actor holds a live lock on the key.
    pub async fn acquire(&self, key: &str, ttl: Duration) -> Result<Option<LockToken>, DbErr> {
        let holder = Uuid::new_v4();
        let now = Utc::now();

        let model = broker_lock::ActiveModel {
            lock_key: Set(key.to_string()),
            holder: Set(holder),
            expires_at: Set(now + ttl),
        };

        // Set-if-absent with expired-row reclaim in one statement. Zero rows
        // affected means a live holder kept the key.
        let on_conflict = OnConflict::column(broker_lock::Column::LockKey)
            .update_columns([broker_lock::Column::Holder, broker_lock::Column::ExpiresAt])
            .action_and_where(
                Expr::col((BrokerLock, broker_lock::Column::ExpiresAt)).lte(now),
            )
            .to_owned();

        let rows = BrokerLock::insert(model)
            .on_conflict(on_conflict)
            .exec_without_returning(&*self.db)
            .await?;

        Ok((rows > 0).then_some(LockToken { holder }))
    }

    /// Retry [`Self::acquire`] up to `attempts` times with a fixed backoff
    /// between tries.
    pub async fn acquire_with_retry(
        &self,
        key: &str,
        ttl: Duration,
        attempts: u32,
        backoff: StdDuration,
    ) -> Result<Option<LockToken>, DbErr> {
        for attempt in 1..=attempts {
            if let Some(token) = self.acquire(key, ttl).await? {
                return Ok(Some(token));
            }
            if attempt < attempts {
                sleep(backoff).await;
            }
        }
        Ok(None)
    }

    /// Release the lock. A no-op if the row already expired and was
    /// reclaimed; only the caller's own acquisition is removed.
    pub async fn release(&self, key: &str, token: LockToken) -> Result<(), DbErr> {
        BrokerLock::delete_many()
            .filter(broker_lock::Column::LockKey.eq(key))
            .filter(broker_lock::Column::Holder.eq(token.holder))
            .exec(&*self.db)
            .await?;
        Ok(())
    }
}
