//! # Services
//!
//! Orchestration layer between the HTTP surface and the stores: the
//! transactional credential façade and the OAuth handshake state machine.

pub mod credential;
pub mod oauth_state;

pub use credential::{BrokeredCredential, CredentialSecret, CredentialService};
pub use oauth_state::{OAuthStateService, StartedOAuthFlow};
