//! # Repositories
//!
//! Database access layers for the credential broker. Non-transactional reads
//! go through the repository instances; multi-row writes run against a
//! caller-provided connection so services can scope them to a unit-of-work.

pub mod apikey_credential;
pub mod credential;
pub mod oauth_credential;
pub mod oauth_state;

pub use apikey_credential::ApiKeyCredentialRepository;
pub use credential::CredentialRepository;
pub use oauth_credential::OAuthCredentialRepository;
pub use oauth_state::OAuthStateStore;
