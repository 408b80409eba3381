//! Base credential entity model
//!
//! One row per user authorization against a provider. Typed child rows
//! (`oauth_credentials`, `apikey_credentials`) hang off this table by
//! `credential_id`; the `credential_type` column is the dispatch tag.

use std::fmt;
use std::str::FromStr;

use sea_orm::ActiveModelBehavior;
use sea_orm::entity::prelude::*;
use sea_orm::prelude::DateTimeWithTimeZone;
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;
use uuid::Uuid;

/// Auth mode of a credential. Tags the base row and selects the child table.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, ToSchema,
)]
#[serde(rename_all = "lowercase")]
pub enum CredentialType {
    OAuth,
    ApiKey,
    BasicAuth,
    None,
}

impl CredentialType {
    pub const ALL: [CredentialType; 4] = [
        CredentialType::OAuth,
        CredentialType::ApiKey,
        CredentialType::BasicAuth,
        CredentialType::None,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            CredentialType::OAuth => "oauth",
            CredentialType::ApiKey => "apikey",
            CredentialType::BasicAuth => "basicauth",
            CredentialType::None => "none",
        }
    }
}

impl fmt::Display for CredentialType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CredentialType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "oauth" => Ok(CredentialType::OAuth),
            "apikey" => Ok(CredentialType::ApiKey),
            "basicauth" => Ok(CredentialType::BasicAuth),
            "none" => Ok(CredentialType::None),
            other => Err(format!("unknown credential type '{}'", other)),
        }
    }
}

/// Credential entity representing a user's authorization against one provider
#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel)]
#[sea_orm(table_name = "credentials")]
pub struct Model {
    /// Unique identifier for the credential (primary key)
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: Uuid,

    /// Owning user
    pub user_id: Uuid,

    /// Provider this credential authorizes against
    pub provider_identifier: String,

    /// Dispatch tag: oauth | apikey | basicauth | none
    pub credential_type: String,

    /// False once the credential is known-bad (revoked grant etc.)
    pub is_valid: bool,

    /// Timestamp when the credential was created
    pub created_at: DateTimeWithTimeZone,

    /// Timestamp when the credential was last updated
    pub updated_at: DateTimeWithTimeZone,

    /// Last time the credential was used to invoke a provider API; drives
    /// the refresh sweep's dormancy filter
    pub last_used_at: Option<DateTimeWithTimeZone>,

    /// Soft-delete marker
    pub deleted_at: Option<DateTimeWithTimeZone>,
}

impl Model {
    pub fn credential_type(&self) -> Result<CredentialType, String> {
        self.credential_type.parse()
    }

    pub fn is_deleted(&self) -> bool {
        self.deleted_at.is_some()
    }
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}
