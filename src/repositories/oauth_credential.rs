//! OAuth credential repository
//!
//! Child-row store for OAuth credentials. `list_by_expiry_within` is the
//! primary driver of the refresh sweep.

use std::sync::Arc;

use chrono::{DateTime, TimeZone, Utc};
use sea_orm::{
    ActiveModelTrait, ColumnTrait, ConnectionTrait, DatabaseConnection, DbErr, EntityTrait,
    QueryFilter, QueryOrder, Set,
};
use sea_orm::prelude::DateTimeWithTimeZone;
use serde_json::Value as JsonValue;
use uuid::Uuid;

use crate::models::oauth_credential::{self, Entity as OAuthCredential, OAuthSecret};

/// Repository for OAuth child-row database operations
#[derive(Debug, Clone)]
pub struct OAuthCredentialRepository {
    db: Arc<DatabaseConnection>,
}

impl OAuthCredentialRepository {
    pub fn new(db: Arc<DatabaseConnection>) -> Self {
        Self { db }
    }

    pub async fn get_by_credential_id(
        &self,
        credential_id: Uuid,
    ) -> Result<Option<oauth_credential::Model>, DbErr> {
        OAuthCredential::find_by_id(credential_id).one(&*self.db).await
    }

    pub async fn create<C: ConnectionTrait>(
        &self,
        conn: &C,
        credential_id: Uuid,
        secret: &OAuthSecret,
        expiry: Option<DateTime<Utc>>,
    ) -> Result<oauth_credential::Model, DbErr> {
        let now = Utc::now();
        let model = oauth_credential::ActiveModel {
            credential_id: Set(credential_id),
            expiry: Set(expiry.map(Into::into)),
            secret: Set(encode_secret(secret)?),
            created_at: Set(now.into()),
            updated_at: Set(now.into()),
        };

        model.insert(conn).await?;

        OAuthCredential::find_by_id(credential_id)
            .one(conn)
            .await?
            .ok_or_else(|| DbErr::Custom("oauth credential not persisted".to_string()))
    }

    /// Replace the secret column and expiry mirror after a refresh.
    pub async fn update<C: ConnectionTrait>(
        &self,
        conn: &C,
        credential_id: Uuid,
        secret: &OAuthSecret,
        expiry: Option<DateTime<Utc>>,
    ) -> Result<oauth_credential::Model, DbErr> {
        let model = oauth_credential::ActiveModel {
            credential_id: Set(credential_id),
            expiry: Set(expiry.map(Into::into)),
            secret: Set(encode_secret(secret)?),
            updated_at: Set(Utc::now().into()),
            ..Default::default()
        };

        model.update(conn).await
    }

    /// Rows whose mirrored expiry falls inside the refresh window. Unset and
    /// zero-sentinel expiries are excluded; they carry tokens that never
    /// expire or were stored without one.
    pub async fn list_by_expiry_within(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<oauth_credential::Model>, DbErr> {
        let epoch: DateTimeWithTimeZone = Utc.timestamp_opt(0, 0).unwrap().into();
        let cutoff_db: DateTimeWithTimeZone = cutoff.into();

        OAuthCredential::find()
            .filter(oauth_credential::Column::Expiry.is_not_null())
            .filter(oauth_credential::Column::Expiry.gt(epoch))
            .filter(oauth_credential::Column::Expiry.lte(cutoff_db))
            .order_by_asc(oauth_credential::Column::Expiry)
            .all(&*self.db)
            .await
    }
}

fn encode_secret(secret: &OAuthSecret) -> Result<JsonValue, DbErr> {
    serde_json::to_value(secret)
        .map_err(|e| DbErr::Custom(format!("oauth secret column encoding failed: {}", e)))
}
