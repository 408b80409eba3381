//! Local transit-style vault engine using AES-256-GCM.
//!
//! Stands in for the managed KMS in single-node deployments and tests. Key
//! material is derived per `(region, credential_type)` from a regional root
//! key and held in a versioned keyring; rotation appends a new version
//! without invalidating old ciphertexts.

use std::collections::HashMap;
use std::sync::RwLock;

use aes_gcm::{
    Aes256Gcm, Key, Nonce,
    aead::{Aead, AeadCore, KeyInit, OsRng, Payload},
};
use base64::{Engine as _, engine::general_purpose::STANDARD as BASE64};
use rand::RngCore;
use sha2::{Digest, Sha256};
use zeroize::{Zeroize, ZeroizeOnDrop};

use super::{
    Algorithm, CIPHERTEXT_PREFIX, EncryptionMetadata, Region, Vault, VaultError,
};
use crate::models::credential::CredentialType;

const NONCE_LEN: usize = 12;

/// Secure wrapper for encryption keys with zeroization
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
struct ZeroizingKey(Vec<u8>);

impl ZeroizingKey {
    fn new(bytes: Vec<u8>) -> Result<Self, VaultError> {
        if bytes.len() != 32 {
            return Err(VaultError::EncryptionFailed);
        }
        Ok(ZeroizingKey(bytes))
    }

    fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

/// Local vault engine over per-(region, type) versioned keyrings.
pub struct TransitVault {
    transit_base: String,
    // Single-writer (rotation) / multi-reader (encrypt/decrypt) keyring.
    keyring: RwLock<HashMap<(Region, CredentialType), Vec<ZeroizingKey>>>,
}

impl TransitVault {
    /// Build a vault from per-region 32-byte root keys. A v1 key is derived
    /// for every credential type in each configured region.
    pub fn new(transit_base: &str, root_keys: &[(Region, Vec<u8>)]) -> Result<Self, VaultError> {
        let mut keyring = HashMap::new();
        for (region, root) in root_keys {
            if root.len() != 32 {
                return Err(VaultError::EncryptionFailed);
            }
            for credential_type in CredentialType::ALL {
                let derived = derive_key(root, &key_name(*region, credential_type));
                keyring.insert((*region, credential_type), vec![ZeroizingKey::new(derived)?]);
            }
        }
        Ok(Self {
            transit_base: transit_base.to_string(),
            keyring: RwLock::new(keyring),
        })
    }

    /// Transit mount path for a `(region, type)` pair, e.g. `transit-eu-oauth`.
    pub fn transit_path(&self, region: Region, credential_type: CredentialType) -> String {
        format!("{}-{}-{}", self.transit_base, region, credential_type)
    }

    fn current_version(
        &self,
        region: Region,
        credential_type: CredentialType,
    ) -> Result<u32, VaultError> {
        let keyring = self.keyring.read().expect("keyring lock poisoned");
        let keys = keyring
            .get(&(region, credential_type))
            .ok_or(VaultError::RegionNotConfigured(region))?;
        Ok(keys.len() as u32)
    }

    fn key_at(
        &self,
        region: Region,
        credential_type: CredentialType,
        version: u32,
    ) -> Result<ZeroizingKey, VaultError> {
        let keyring = self.keyring.read().expect("keyring lock poisoned");
        let keys = keyring
            .get(&(region, credential_type))
            .ok_or(VaultError::RegionNotConfigured(region))?;
        if version == 0 {
            return Err(VaultError::UnknownKeyVersion(version));
        }
        keys.get(version as usize - 1)
            .cloned()
            .ok_or(VaultError::UnknownKeyVersion(version))
    }
}

/// Key-name rule: `<type>-creds-<region>-key`, e.g. `oauth-creds-eu-key`.
pub fn key_name(region: Region, credential_type: CredentialType) -> String {
    format!("{}-creds-{}-key", credential_type, region)
}

fn derive_key(root: &[u8], key_name: &str) -> Vec<u8> {
    let mut hasher = Sha256::new();
    hasher.update(root);
    hasher.update(key_name.as_bytes());
    hasher.finalize().to_vec()
}

fn seal(
    key: &ZeroizingKey,
    aad: &[u8],
    plaintext: &[u8],
) -> Result<Vec<u8>, VaultError> {
    let cipher_key = Key::<Aes256Gcm>::from_slice(key.as_bytes());
    let cipher = Aes256Gcm::new(cipher_key);

    let mut nonce_bytes = [0u8; NONCE_LEN];
    OsRng.fill_bytes(&mut nonce_bytes);
    let nonce = Nonce::from_slice(&nonce_bytes);

    let mut ciphertext = cipher
        .encrypt(
            nonce,
            Payload {
                msg: plaintext,
                aad,
            },
        )
        .map_err(|_| VaultError::EncryptionFailed)?;

    let mut sealed = Vec::with_capacity(NONCE_LEN + ciphertext.len());
    sealed.extend_from_slice(&nonce_bytes);
    sealed.append(&mut ciphertext);
    Ok(sealed)
}

fn open(key: &ZeroizingKey, aad: &[u8], sealed: &[u8]) -> Result<Vec<u8>, VaultError> {
    if sealed.len() < NONCE_LEN {
        return Err(VaultError::InvalidCiphertextFormat);
    }
    let nonce = Nonce::from_slice(&sealed[..NONCE_LEN]);
    let cipher_key = Key::<Aes256Gcm>::from_slice(key.as_bytes());
    let cipher = Aes256Gcm::new(cipher_key);

    cipher
        .decrypt(
            nonce,
            Payload {
                msg: &sealed[NONCE_LEN..],
                aad,
            },
        )
        .map_err(|_| VaultError::DecryptionFailed)
}

#[async_trait::async_trait]
impl Vault for TransitVault {
    async fn encrypt_bytes(
        &self,
        plaintext: &[u8],
        region: Region,
        credential_type: CredentialType,
    ) -> Result<EncryptionMetadata, VaultError> {
        let algorithm = region.algorithm();
        if algorithm != Algorithm::Aes256Gcm {
            return Err(VaultError::UnsupportedAlgorithm(algorithm));
        }

        let version = self.current_version(region, credential_type)?;
        let key = self.key_at(region, credential_type, version)?;
        let aad = key_name(region, credential_type);

        let sealed = seal(&key, aad.as_bytes(), plaintext)?;
        let ciphertext = format!("{}{}:{}", CIPHERTEXT_PREFIX, version, BASE64.encode(sealed));

        Ok(EncryptionMetadata {
            region,
            key_version: version,
            credential_type,
            algorithm,
            ciphertext,
        })
    }

    async fn decrypt_bytes(&self, metadata: &EncryptionMetadata) -> Result<Vec<u8>, VaultError> {
        if metadata.algorithm != Algorithm::Aes256Gcm {
            return Err(VaultError::UnsupportedAlgorithm(metadata.algorithm));
        }

        // The ciphertext is authoritative for the key version.
        let version = EncryptionMetadata::parse_key_version(&metadata.ciphertext)?;
        let key = self.key_at(metadata.region, metadata.credential_type, version)?;
        let aad = key_name(metadata.region, metadata.credential_type);

        let encoded = metadata
            .ciphertext
            .rsplit_once(':')
            .map(|(_, encoded)| encoded)
            .ok_or(VaultError::InvalidCiphertextFormat)?;
        let sealed = BASE64
            .decode(encoded)
            .map_err(|_| VaultError::InvalidCiphertextFormat)?;

        open(&key, aad.as_bytes(), &sealed)
    }

    async fn rewrap(
        &self,
        metadata: &EncryptionMetadata,
    ) -> Result<EncryptionMetadata, VaultError> {
        let plaintext = self.decrypt_bytes(metadata).await?;
        self.encrypt_bytes(&plaintext, metadata.region, metadata.credential_type)
            .await
    }

    async fn rotate_key(
        &self,
        region: Region,
        credential_type: CredentialType,
    ) -> Result<(), VaultError> {
        let mut fresh = vec![0u8; 32];
        rand::thread_rng().fill_bytes(&mut fresh);
        let key = ZeroizingKey::new(fresh)?;

        let mut keyring = self.keyring.write().expect("keyring lock poisoned");
        let keys = keyring
            .get_mut(&(region, credential_type))
            .ok_or(VaultError::RegionNotConfigured(region))?;
        keys.push(key);
        Ok(())
    }

    async fn health(&self, region: Region) -> Result<(), VaultError> {
        let keyring = self.keyring.read().expect("keyring lock poisoned");
        let configured = keyring.keys().any(|(r, _)| *r == region);
        if configured {
            Ok(())
        } else {
            Err(VaultError::RegionNotConfigured(region))
        }
    }
}
