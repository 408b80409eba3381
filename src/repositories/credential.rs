//! Base credential repository
//!
//! Encapsulates SeaORM operations for the `credentials` table. Reads filter
//! soft-deleted rows; the transactional delete removes the typed child row
//! (selected by the type tag) before the base row and verifies both
//! actually removed something.

use std::sync::Arc;

use chrono::Utc;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, ConnectionTrait, DatabaseConnection, DbErr, EntityTrait,
    QueryFilter, QueryOrder, Set,
};
use uuid::Uuid;

use crate::models::apikey_credential::Entity as ApiKeyCredential;
use crate::models::credential::{self, CredentialType, Entity as Credential};
use crate::models::oauth_credential::Entity as OAuthCredential;

/// Repository for base credential database operations
#[derive(Debug, Clone)]
pub struct CredentialRepository {
    db: Arc<DatabaseConnection>,
}

impl CredentialRepository {
    pub fn new(db: Arc<DatabaseConnection>) -> Self {
        Self { db }
    }

    /// Fetch by primary key, including soft-deleted rows (needed by delete
    /// and by the sweep's base-row join).
    pub async fn get_by_id(&self, id: Uuid) -> Result<Option<credential::Model>, DbErr> {
        Credential::find_by_id(id).one(&*self.db).await
    }

    /// The active credential for a `(user, provider)` pair; at most one
    /// non-deleted row exists.
    pub async fn get_by_user_and_provider(
        &self,
        user_id: Uuid,
        provider_identifier: &str,
    ) -> Result<Option<credential::Model>, DbErr> {
        Credential::find()
            .filter(credential::Column::UserId.eq(user_id))
            .filter(credential::Column::ProviderIdentifier.eq(provider_identifier))
            .filter(credential::Column::DeletedAt.is_null())
            .filter(credential::Column::IsValid.eq(true))
            .one(&*self.db)
            .await
    }

    /// All active credentials for a user, ordered by creation time.
    pub async fn list_by_user(&self, user_id: Uuid) -> Result<Vec<credential::Model>, DbErr> {
        Credential::find()
            .filter(credential::Column::UserId.eq(user_id))
            .filter(credential::Column::DeletedAt.is_null())
            .filter(credential::Column::IsValid.eq(true))
            .order_by_asc(credential::Column::CreatedAt)
            .order_by_asc(credential::Column::Id)
            .all(&*self.db)
            .await
    }

    /// Batch fetch by id (sweep's base-row join).
    pub async fn list_by_id(&self, ids: &[Uuid]) -> Result<Vec<credential::Model>, DbErr> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        Credential::find()
            .filter(credential::Column::Id.is_in(ids.iter().copied()))
            .all(&*self.db)
            .await
    }

    /// Insert the base row only; typed child rows are the caller's business.
    pub async fn create<C: ConnectionTrait>(
        &self,
        conn: &C,
        model: credential::ActiveModel,
    ) -> Result<credential::Model, DbErr> {
        let id = model
            .id
            .clone()
            .take()
            .ok_or_else(|| DbErr::Custom("credential id must be set".to_string()))?;

        model.insert(conn).await?;

        // Query back directly; SQLite does not return the inserted row.
        Credential::find_by_id(id)
            .one(conn)
            .await?
            .ok_or_else(|| DbErr::Custom("credential not persisted".to_string()))
    }

    /// Hard-delete the typed child row then the base row. Errors if either
    /// removed nothing, so a half-deleted credential cannot go unnoticed.
    pub async fn delete<C: ConnectionTrait>(
        &self,
        conn: &C,
        credential: &credential::Model,
    ) -> Result<(), DbErr> {
        let credential_type: CredentialType = credential
            .credential_type()
            .map_err(DbErr::Custom)?;

        let child_rows = match credential_type {
            CredentialType::OAuth => {
                OAuthCredential::delete_by_id(credential.id)
                    .exec(conn)
                    .await?
                    .rows_affected
            }
            CredentialType::ApiKey => {
                ApiKeyCredential::delete_by_id(credential.id)
                    .exec(conn)
                    .await?
                    .rows_affected
            }
            // "none" and "basicauth" credentials carry no child row.
            CredentialType::BasicAuth | CredentialType::None => 1,
        };

        if child_rows == 0 {
            return Err(DbErr::Custom(format!(
                "no {} child row removed for credential '{}'",
                credential_type, credential.id
            )));
        }

        let base_rows = Credential::delete_by_id(credential.id)
            .exec(conn)
            .await?
            .rows_affected;
        if base_rows == 0 {
            return Err(DbErr::Custom(format!(
                "no base row removed for credential '{}'",
                credential.id
            )));
        }

        Ok(())
    }

    /// Touch `last_used_at`; called on every brokered invocation.
    pub async fn update_last_used_at(&self, id: Uuid) -> Result<(), DbErr> {
        let model = credential::ActiveModel {
            id: Set(id),
            last_used_at: Set(Some(Utc::now().into())),
            ..Default::default()
        };
        model.update(&*self.db).await?;
        Ok(())
    }
}
