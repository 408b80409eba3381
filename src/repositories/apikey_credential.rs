//! API-key credential repository

use std::sync::Arc;

use chrono::Utc;
use sea_orm::{
    ActiveModelTrait, ConnectionTrait, DatabaseConnection, DbErr, EntityTrait, Set,
};
use serde_json::Value as JsonValue;
use uuid::Uuid;

use crate::models::apikey_credential::{self, ApiKeySecret, Entity as ApiKeyCredential};

/// Repository for API-key child-row database operations
#[derive(Debug, Clone)]
pub struct ApiKeyCredentialRepository {
    db: Arc<DatabaseConnection>,
}

impl ApiKeyCredentialRepository {
    pub fn new(db: Arc<DatabaseConnection>) -> Self {
        Self { db }
    }

    pub async fn get_by_credential_id(
        &self,
        credential_id: Uuid,
    ) -> Result<Option<apikey_credential::Model>, DbErr> {
        ApiKeyCredential::find_by_id(credential_id).one(&*self.db).await
    }

    pub async fn create<C: ConnectionTrait>(
        &self,
        conn: &C,
        credential_id: Uuid,
        secret: &ApiKeySecret,
    ) -> Result<apikey_credential::Model, DbErr> {
        let now = Utc::now();
        let model = apikey_credential::ActiveModel {
            credential_id: Set(credential_id),
            secret: Set(encode_secret(secret)?),
            created_at: Set(now.into()),
            updated_at: Set(now.into()),
        };

        model.insert(conn).await?;

        ApiKeyCredential::find_by_id(credential_id)
            .one(conn)
            .await?
            .ok_or_else(|| DbErr::Custom("apikey credential not persisted".to_string()))
    }
}

fn encode_secret(secret: &ApiKeySecret) -> Result<JsonValue, DbErr> {
    serde_json::to_value(secret)
        .map_err(|e| DbErr::Custom(format!("apikey secret column encoding failed: {}", e)))
}
