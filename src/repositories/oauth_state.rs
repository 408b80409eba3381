//! # OAuth State Store
//!
//! Two-tier store for in-flight OAuth handshakes: a fast in-process LRU tier
//! keyed by both `state` (callback lookup) and `id` (client polling), backed
//! by the durable `oauth_states` table for recovery. Cache entries carry the
//! 15-minute TTL; reads fall back to the durable tier and back-fill the
//! cache.

use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex};

use chrono::{Duration, Utc};
use lru::LruCache;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, DatabaseConnection, DbErr, EntityTrait, QueryFilter, Set,
};
use serde_json::Value as JsonValue;
use uuid::Uuid;

use crate::models::oauth_state::{self, Entity as OAuthState, OAuthStateData};

const CACHE_CAPACITY: usize = 4096;

fn state_key(state: &str) -> String {
    format!("state:{}", state)
}

fn id_key(id: Uuid) -> String {
    format!("id:{}", id)
}

/// Two-tier OAuth state store
pub struct OAuthStateStore {
    db: Arc<DatabaseConnection>,
    cache: Mutex<LruCache<String, OAuthStateData>>,
}

impl OAuthStateStore {
    pub fn new(db: Arc<DatabaseConnection>) -> Self {
        Self {
            db,
            cache: Mutex::new(LruCache::new(
                NonZeroUsize::new(CACHE_CAPACITY).expect("capacity is non-zero"),
            )),
        }
    }

    /// Persist a new handshake: durable row plus both cache keys.
    pub async fn store(&self, data: &OAuthStateData, ttl: Duration) -> Result<(), DbErr> {
        let mut data = data.clone();
        data.expires_at = Utc::now() + ttl;

        let model = oauth_state::ActiveModel {
            id: Set(data.id),
            state: Set(data.state.clone()),
            code_verifier: Set(data.code_verifier.clone()),
            code_challenge: Set(data.code_challenge.clone()),
            status: Set(data.status.as_str().to_string()),
            user_id: Set(data.user_id),
            provider_identifier: Set(data.provider_identifier.clone()),
            redirect_url: Set(data.redirect_url.clone()),
            permissions: Set(Some(JsonValue::from(data.permissions.clone()))),
            user_data: Set(Some(JsonValue::Object(data.user_data.clone()))),
            callback_params: Set(Some(JsonValue::Object(data.callback_params.clone()))),
            expires_at: Set(data.expires_at),
            created_at: Set(data.created_at),
            updated_at: Set(data.updated_at),
            deleted_at: Set(None),
        };
        model.insert(&*self.db).await?;

        self.cache_put(&data);
        Ok(())
    }

    /// Callback-path lookup by CSRF nonce.
    pub async fn get_by_state(&self, state: &str) -> Result<Option<OAuthStateData>, DbErr> {
        if let Some(data) = self.cache_get(&state_key(state)) {
            return Ok(Some(data));
        }

        let found = OAuthState::find()
            .filter(oauth_state::Column::State.eq(state))
            .filter(oauth_state::Column::DeletedAt.is_null())
            .filter(oauth_state::Column::ExpiresAt.gt(Utc::now()))
            .one(&*self.db)
            .await?;

        Ok(found.map(|model| self.backfill(model)))
    }

    /// Poll-path lookup by state id.
    pub async fn get_by_id(&self, id: Uuid) -> Result<Option<OAuthStateData>, DbErr> {
        if let Some(data) = self.cache_get(&id_key(id)) {
            return Ok(Some(data));
        }

        let found = OAuthState::find_by_id(id)
            .filter(oauth_state::Column::DeletedAt.is_null())
            .filter(oauth_state::Column::ExpiresAt.gt(Utc::now()))
            .one(&*self.db)
            .await?;

        Ok(found.map(|model| self.backfill(model)))
    }

    /// Patch the mutable fields of a handshake. Verifies the durable row
    /// still exists first so an expired state cannot be resurrected through
    /// the cache.
    pub async fn update(&self, data: &OAuthStateData) -> Result<(), DbErr> {
        let existing = OAuthState::find_by_id(data.id)
            .filter(oauth_state::Column::DeletedAt.is_null())
            .filter(oauth_state::Column::ExpiresAt.gt(Utc::now()))
            .one(&*self.db)
            .await?;
        if existing.is_none() {
            return Err(DbErr::RecordNotFound(format!(
                "oauth state '{}' expired or missing",
                data.id
            )));
        }

        let mut data = data.clone();
        data.updated_at = Utc::now();

        let model = oauth_state::ActiveModel {
            id: Set(data.id),
            status: Set(data.status.as_str().to_string()),
            user_data: Set(Some(JsonValue::Object(data.user_data.clone()))),
            callback_params: Set(Some(JsonValue::Object(data.callback_params.clone()))),
            updated_at: Set(data.updated_at),
            ..Default::default()
        };
        model.update(&*self.db).await?;

        self.cache_put(&data);
        Ok(())
    }

    /// Drop expired durable rows; the cache evicts on read.
    pub async fn cleanup_expired(&self) -> Result<u64, DbErr> {
        let result = OAuthState::delete_many()
            .filter(oauth_state::Column::ExpiresAt.lt(Utc::now()))
            .exec(&*self.db)
            .await?;
        Ok(result.rows_affected)
    }

    fn cache_get(&self, key: &str) -> Option<OAuthStateData> {
        let mut cache = self.cache.lock().expect("state cache lock poisoned");
        match cache.get(key) {
            Some(data) if !data.is_expired(Utc::now()) => Some(data.clone()),
            Some(_) => {
                cache.pop(key);
                None
            }
            None => None,
        }
    }

    fn cache_put(&self, data: &OAuthStateData) {
        let mut cache = self.cache.lock().expect("state cache lock poisoned");
        cache.put(state_key(&data.state), data.clone());
        cache.put(id_key(data.id), data.clone());
    }

    fn backfill(&self, model: oauth_state::Model) -> OAuthStateData {
        let data: OAuthStateData = model.into();
        self.cache_put(&data);
        data
    }
}
