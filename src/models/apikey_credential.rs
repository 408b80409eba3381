//! API-key credential child entity
//!
//! Mirrors the OAuth child minus expiry/refresh: ciphertext-only storage of
//! the key string.

use sea_orm::ActiveModelBehavior;
use sea_orm::entity::prelude::*;
use sea_orm::prelude::DateTimeWithTimeZone;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use uuid::Uuid;

use crate::vault::EncryptionMetadata;

#[derive(Clone, Debug, PartialEq, DeriveEntityModel)]
#[sea_orm(table_name = "apikey_credentials")]
pub struct Model {
    /// Base credential this row belongs to
    #[sea_orm(primary_key, auto_increment = false)]
    pub credential_id: Uuid,

    /// `{encryption_metadata}` in one JSON column
    #[sea_orm(column_type = "JsonBinary")]
    pub secret: JsonValue,

    pub created_at: DateTimeWithTimeZone,

    pub updated_at: DateTimeWithTimeZone,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}

/// Decoded form of the `secret` column.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApiKeySecret {
    pub encryption_metadata: EncryptionMetadata,
}

impl Model {
    pub fn secret(&self) -> Result<ApiKeySecret, serde_json::Error> {
        serde_json::from_value(self.secret.clone())
    }
}
