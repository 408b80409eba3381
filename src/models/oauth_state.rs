//! # OAuth State Model
//!
//! Durable row for an in-flight OAuth handshake plus the domain-level state
//! machine type shared with the fast cache tier.

use chrono::{DateTime, Utc};
use sea_orm::ActiveModelBehavior;
use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};
use serde_json::{Map as JsonMap, Value as JsonValue};
use utoipa::ToSchema;
use uuid::Uuid;

/// Handshake status. Transitions only pending-to-success or pending-to-failed;
/// terminal statuses are sticky.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum OAuthStateStatus {
    Pending,
    Success,
    Failed,
}

impl OAuthStateStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            OAuthStateStatus::Pending => "pending",
            OAuthStateStatus::Success => "success",
            OAuthStateStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(OAuthStateStatus::Pending),
            "success" => Some(OAuthStateStatus::Success),
            "failed" => Some(OAuthStateStatus::Failed),
            _ => None,
        }
    }

    pub fn is_terminal(self) -> bool {
        !matches!(self, OAuthStateStatus::Pending)
    }

    /// Legal transition check for the state machine.
    pub fn can_transition_to(self, next: OAuthStateStatus) -> bool {
        self == OAuthStateStatus::Pending && next.is_terminal()
    }
}

/// OAuth State entity, the durable tier of the two-tier state store
#[derive(Clone, Debug, PartialEq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "oauth_states")]
pub struct Model {
    /// Primary key UUID; the `oauth_state_id` clients poll on
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: Uuid,

    /// CSRF nonce carried in the authorize URL (unique)
    pub state: String,

    /// PKCE code verifier, base64url no pad
    pub code_verifier: String,

    /// base64url_no_pad(SHA256(code_verifier))
    pub code_challenge: String,

    /// pending | success | failed
    pub status: String,

    /// User that started the handshake
    pub user_id: Uuid,

    /// Provider being authorized
    pub provider_identifier: String,

    /// Client-chosen redirect target (validated before storage)
    pub redirect_url: String,

    /// Requested permission set
    #[sea_orm(column_type = "JsonBinary")]
    pub permissions: Option<JsonValue>,

    /// Opaque client context (IP, UA, ...)
    #[sea_orm(column_type = "JsonBinary")]
    pub user_data: Option<JsonValue>,

    /// Raw non-reserved query args seen at the callback
    #[sea_orm(column_type = "JsonBinary")]
    pub callback_params: Option<JsonValue>,

    /// Cache TTL mirror; lookups past this point treat the row as gone
    pub expires_at: DateTime<Utc>,

    pub created_at: DateTime<Utc>,

    pub updated_at: DateTime<Utc>,

    pub deleted_at: Option<DateTime<Utc>>,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}

/// In-flight handshake, as held by both store tiers and the service layer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OAuthStateData {
    pub id: Uuid,
    pub state: String,
    pub code_verifier: String,
    pub code_challenge: String,
    pub status: OAuthStateStatus,
    pub user_id: Uuid,
    pub provider_identifier: String,
    pub redirect_url: String,
    pub permissions: Vec<String>,
    pub user_data: JsonMap<String, JsonValue>,
    pub callback_params: JsonMap<String, JsonValue>,
    pub expires_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl OAuthStateData {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }
}

impl From<Model> for OAuthStateData {
    fn from(model: Model) -> Self {
        let permissions = model
            .permissions
            .and_then(|v| serde_json::from_value(v).ok())
            .unwrap_or_default();
        let user_data = model
            .user_data
            .and_then(|v| v.as_object().cloned())
            .unwrap_or_default();
        let callback_params = model
            .callback_params
            .and_then(|v| v.as_object().cloned())
            .unwrap_or_default();

        Self {
            id: model.id,
            state: model.state,
            code_verifier: model.code_verifier,
            code_challenge: model.code_challenge,
            status: OAuthStateStatus::parse(&model.status).unwrap_or(OAuthStateStatus::Failed),
            user_id: model.user_id,
            provider_identifier: model.provider_identifier,
            redirect_url: model.redirect_url,
            permissions,
            user_data,
            callback_params,
            expires_at: model.expires_at,
            created_at: model.created_at,
            updated_at: model.updated_at,
        }
    }
}

/// Public projection returned to polling clients.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct OAuthStateProjection {
    pub id: Uuid,
    pub status: OAuthStateStatus,
    pub user_id: Uuid,
    pub provider_identifier: String,
    pub permissions: Vec<String>,
    pub created_at: String,
    pub updated_at: String,
}

impl From<&OAuthStateData> for OAuthStateProjection {
    fn from(data: &OAuthStateData) -> Self {
        Self {
            id: data.id,
            status: data.status,
            user_id: data.user_id,
            provider_identifier: data.provider_identifier.clone(),
            permissions: data.permissions.clone(),
            created_at: data.created_at.to_rfc3339(),
            updated_at: data.updated_at.to_rfc3339(),
        }
    }
}
