//! OAuth credential child entity
//!
//! 1:1 child of a base credential when the type is `oauth`. The persisted row
//! never contains plaintext tokens; the `secret` JSON column co-locates the
//! encryption metadata with the granted scopes, and the `expiry` column
//! mirrors the encrypted token's expiry so the refresh sweep can range-scan
//! it through the index.

use chrono::{DateTime, Utc};
use sea_orm::ActiveModelBehavior;
use sea_orm::entity::prelude::*;
use sea_orm::prelude::DateTimeWithTimeZone;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use uuid::Uuid;

use crate::vault::EncryptionMetadata;

#[derive(Clone, Debug, PartialEq, DeriveEntityModel)]
#[sea_orm(table_name = "oauth_credentials")]
pub struct Model {
    /// Base credential this row belongs to
    #[sea_orm(primary_key, auto_increment = false)]
    pub credential_id: Uuid,

    /// Mirror of the encrypted token's expiry (indexed; drives the sweep)
    pub expiry: Option<DateTimeWithTimeZone>,

    /// `{encryption_metadata, scopes}` in one JSON column
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
pub struct OAuthSecret {
    pub encryption_metadata: EncryptionMetadata,
    #[serde(default)]
    pub scopes: Vec<String>,
}

impl Model {
    pub fn secret(&self) -> Result<OAuthSecret, serde_json::Error> {
        serde_json::from_value(self.secret.clone())
    }
}

/// Plaintext OAuth token. Exists only in process memory after a vault
/// decrypt; never logged, never persisted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OAuthToken {
    pub access_token: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refresh_token: Option<String>,
    #[serde(default = "default_token_type")]
    pub token_type: String,
    pub expiry: Option<DateTime<Utc>>,
}

fn default_token_type() -> String {
    "Bearer".to_string()
}

impl OAuthToken {
    /// True when the expiry column should treat this token as unset
    /// (zero-sentinel) rather than expiring.
    pub fn has_expiry(&self) -> bool {
        self.expiry.is_some()
    }
}
