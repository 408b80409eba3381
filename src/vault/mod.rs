//! Envelope encryption port.
//!
//! Credentials are never persisted in plaintext: the broker hands opaque
//! blobs to a regional vault and stores only the resulting
//! [`EncryptionMetadata`]. Ciphertext is self-describing
//! (`vault:v<N>:<opaque>`), so decryption needs only the metadata.

use std::fmt;
use std::str::FromStr;

use async_trait::async_trait;
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use thiserror::Error;

use crate::models::credential::CredentialType;

mod transit;

pub use transit::TransitVault;

/// Ciphertext prefix; the version segment after it carries the key version.
pub const CIPHERTEXT_PREFIX: &str = "vault:v";

/// Vault regions. `cn` is reserved for the SM4-GCM algorithm.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Region {
    Eu,
    Us,
    Cn,
}

impl Region {
    /// Default cipher for the region.
    pub fn algorithm(self) -> Algorithm {
        match self {
            Region::Eu | Region::Us => Algorithm::Aes256Gcm,
            Region::Cn => Algorithm::Sm4Gcm,
        }
    }
}

impl fmt::Display for Region {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Region::Eu => "eu",
            Region::Us => "us",
            Region::Cn => "cn",
        };
        f.write_str(s)
    }
}

impl FromStr for Region {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "eu" => Ok(Region::Eu),
            "us" => Ok(Region::Us),
            "cn" => Ok(Region::Cn),
            other => Err(format!("unknown vault region '{}'", other)),
        }
    }
}

/// Supported cipher suites.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Algorithm {
    #[serde(rename = "aes256-gcm")]
    Aes256Gcm,
    #[serde(rename = "sm4-gcm")]
    Sm4Gcm,
}

impl fmt::Display for Algorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Algorithm::Aes256Gcm => "aes256-gcm",
            Algorithm::Sm4Gcm => "sm4-gcm",
        };
        f.write_str(s)
    }
}

/// Everything needed to decrypt a stored secret. Persisted alongside the
/// credential child row; carries no key material.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EncryptionMetadata {
    pub region: Region,
    pub key_version: u32,
    pub credential_type: CredentialType,
    pub algorithm: Algorithm,
    pub ciphertext: String,
}

impl EncryptionMetadata {
    /// Parse the key version out of a self-describing ciphertext.
    pub fn parse_key_version(ciphertext: &str) -> Result<u32, VaultError> {
        let rest = ciphertext
            .strip_prefix(CIPHERTEXT_PREFIX)
            .ok_or(VaultError::InvalidCiphertextFormat)?;
        let (version, _) = rest
            .split_once(':')
            .ok_or(VaultError::InvalidCiphertextFormat)?;
        version
            .parse::<u32>()
            .map_err(|_| VaultError::InvalidCiphertextFormat)
    }
}

/// Vault error kinds. Messages deliberately carry no plaintext or key
/// material; decryption failures are opaque.
#[derive(Debug, Error)]
pub enum VaultError {
    #[error("encryption failed")]
    EncryptionFailed,
    #[error("decryption failed")]
    DecryptionFailed,
    #[error("invalid ciphertext format")]
    InvalidCiphertextFormat,
    #[error("unknown key version {0}")]
    UnknownKeyVersion(u32),
    #[error("region '{0}' is not configured")]
    RegionNotConfigured(Region),
    #[error("algorithm '{0}' is not supported by this vault")]
    UnsupportedAlgorithm(Algorithm),
    #[error("secret serialization failed")]
    Serialization,
}

/// Capability set of the regional vault.
#[async_trait]
pub trait Vault: Send + Sync {
    /// Envelope-encrypt an opaque byte string under the current key version
    /// for `(region, credential_type)`.
    async fn encrypt_bytes(
        &self,
        plaintext: &[u8],
        region: Region,
        credential_type: CredentialType,
    ) -> Result<EncryptionMetadata, VaultError>;

    /// Decrypt a previously produced ciphertext. The key version is read
    /// back out of the metadata.
    async fn decrypt_bytes(&self, metadata: &EncryptionMetadata) -> Result<Vec<u8>, VaultError>;

    /// Re-encrypt under the current key version, preserving region and type.
    async fn rewrap(&self, metadata: &EncryptionMetadata) -> Result<EncryptionMetadata, VaultError>;

    /// Admin: introduce a fresh key version. Older versions remain
    /// decryptable.
    async fn rotate_key(
        &self,
        region: Region,
        credential_type: CredentialType,
    ) -> Result<(), VaultError>;

    /// Verify the region has usable key material.
    async fn health(&self, region: Region) -> Result<(), VaultError>;
}

/// JSON-serialize a value and encrypt the bytes.
pub async fn encrypt_struct<T: Serialize + Sync>(
    vault: &dyn Vault,
    value: &T,
    region: Region,
    credential_type: CredentialType,
) -> Result<EncryptionMetadata, VaultError> {
    let bytes = serde_json::to_vec(value).map_err(|_| VaultError::Serialization)?;
    vault.encrypt_bytes(&bytes, region, credential_type).await
}

/// Decrypt and JSON-deserialize a value previously stored with
/// [`encrypt_struct`].
pub async fn decrypt_struct<T: DeserializeOwned>(
    vault: &dyn Vault,
    metadata: &EncryptionMetadata,
) -> Result<T, VaultError> {
    let bytes = vault.decrypt_bytes(metadata).await?;
    serde_json::from_slice(&bytes).map_err(|_| VaultError::Serialization)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_region_parse_roundtrip() {
        for region in [Region::Eu, Region::Us, Region::Cn] {
            let parsed: Region = region.to_string().parse().unwrap();
            assert_eq!(parsed, region);
        }
        assert!("mars".parse::<Region>().is_err());
    }

    #[test]
    fn test_region_default_algorithms() {
        assert_eq!(Region::Eu.algorithm(), Algorithm::Aes256Gcm);
        assert_eq!(Region::Us.algorithm(), Algorithm::Aes256Gcm);
        assert_eq!(Region::Cn.algorithm(), Algorithm::Sm4Gcm);
    }

    #[test]
    fn test_parse_key_version() {
        assert_eq!(
            EncryptionMetadata::parse_key_version("vault:v3:abcdef").unwrap(),
            3
        );
        assert!(matches!(
            EncryptionMetadata::parse_key_version("v3:abcdef"),
            Err(VaultError::InvalidCiphertextFormat)
        ));
        assert!(matches!(
            EncryptionMetadata::parse_key_version("vault:vX:abcdef"),
            Err(VaultError::InvalidCiphertextFormat)
        ));
        assert!(matches!(
            EncryptionMetadata::parse_key_version("vault:v3"),
            Err(VaultError::InvalidCiphertextFormat)
        ));
    }
}
