//! # Data Models
//!
//! This module contains all the data models used throughout the credential broker.

use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

pub mod apikey_credential;
pub mod broker_lock;
pub mod credential;
pub mod oauth_credential;
pub mod oauth_state;

pub use apikey_credential::Entity as ApiKeyCredential;
pub use broker_lock::Entity as BrokerLock;
pub use credential::Entity as Credential;
pub use oauth_credential::Entity as OAuthCredential;
pub use oauth_state::Entity as OAuthState;

/// Basic service information response
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct ServiceInfo {
    /// The name of the service
    pub service: String,
    /// The version of the service
    pub version: String,
}

impl Default for ServiceInfo {
    fn default() -> Self {
        Self {
            service: "credbroker".to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }
}
