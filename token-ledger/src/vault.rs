//! BYOK credential vault
//!
//! Provider API keys are encrypted at rest with AES-256-GCM, one random
//! 96-bit nonce per secret, and decrypted only when a request resolves to
//! the BYOK source. Listing returns display metadata only.

use crate::{storage::Storage, Error, Result};
use aes_gcm::{
    aead::{Aead, AeadCore, KeyInit, OsRng},
    Aes256Gcm, Key, Nonce,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use uuid::Uuid;

/// Nonce length for AES-GCM
pub const IV_LEN: usize = 12;

/// Authenticated encryption used for credentials at rest
pub trait Cipher: Send + Sync {
    /// Encrypt, returning `(ciphertext, iv)`
    fn encrypt(&self, plaintext: &[u8]) -> Result<(Vec<u8>, Vec<u8>)>;

    /// Decrypt a ciphertext produced by `encrypt`
    fn decrypt(&self, ciphertext: &[u8], iv: &[u8]) -> Result<Vec<u8>>;
}

/// AES-256-GCM cipher keyed by the vault master key
pub struct AesGcmCipher {
    cipher: Aes256Gcm,
}

impl AesGcmCipher {
    /// Create from a 32-byte master key
    pub fn new(master_key: &[u8; 32]) -> Self {
        let key = Key::<Aes256Gcm>::from_slice(master_key);
        Self {
            cipher: Aes256Gcm::new(key),
        }
    }

    /// Cipher with a random key (tests, ephemeral deployments)
    pub fn generate() -> Self {
        Self::new(&rand::random::<[u8; 32]>())
    }
}

impl fmt::Debug for AesGcmCipher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AesGcmCipher").finish_non_exhaustive()
    }
}

impl Cipher for AesGcmCipher {
    fn encrypt(&self, plaintext: &[u8]) -> Result<(Vec<u8>, Vec<u8>)> {
        let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
        let ciphertext = self
            .cipher
            .encrypt(&nonce, plaintext)
            .map_err(|e| Error::Encryption(e.to_string()))?;
        Ok((ciphertext, nonce.to_vec()))
    }

    fn decrypt(&self, ciphertext: &[u8], iv: &[u8]) -> Result<Vec<u8>> {
        if iv.len() != IV_LEN {
            return Err(Error::Encryption(format!(
                "IV must be {} bytes, got {}",
                IV_LEN,
                iv.len()
            )));
        }
        self.cipher
            .decrypt(Nonce::from_slice(iv), ciphertext)
            .map_err(|e| Error::Encryption(e.to_string()))
    }
}

/// Stored BYOK credential, keyed by (user, provider)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ByokCredential {
    /// Owning user
    pub user_id: Uuid,
    /// Upstream provider (lowercase)
    pub provider: String,
    /// Encrypted API key
    pub ciphertext: Vec<u8>,
    /// Per-secret nonce
    pub iv: Vec<u8>,
    /// Label shown in listings
    pub display_name: String,
    /// Organization the key is billed under
    pub organization_id: Option<Uuid>,
    /// Use this key instead of platform capacity
    pub is_preferred: bool,
    /// Creation time
    pub created_at: DateTime<Utc>,
    /// Last rotation time
    pub updated_at: DateTime<Utc>,
}

/// Listing view of a credential (no secret material)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ByokKeySummary {
    /// Provider
    pub provider: String,
    /// Label
    pub display_name: String,
    /// Organization
    pub organization_id: Option<Uuid>,
    /// Preferred flag
    pub is_preferred: bool,
    /// Creation time
    pub created_at: DateTime<Utc>,
    /// Last rotation time
    pub updated_at: DateTime<Utc>,
}

impl From<&ByokCredential> for ByokKeySummary {
    fn from(credential: &ByokCredential) -> Self {
        Self {
            provider: credential.provider.clone(),
            display_name: credential.display_name.clone(),
            organization_id: credential.organization_id,
            is_preferred: credential.is_preferred,
            created_at: credential.created_at,
            updated_at: credential.updated_at,
        }
    }
}

/// Input for `add_user_api_key`
#[derive(Clone, Default)]
pub struct ApiKeyRequest {
    /// Provider name
    pub provider: String,
    /// Plaintext API key
    pub api_key: String,
    /// Optional label; defaults to "<provider> key"
    pub display_name: Option<String>,
    /// Organization
    pub organization_id: Option<Uuid>,
    /// Defaults to preferred when `None`
    pub is_preferred: Option<bool>,
}

impl fmt::Debug for ApiKeyRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ApiKeyRequest")
            .field("provider", &self.provider)
            .field("api_key", &"<redacted>")
            .field("display_name", &self.display_name)
            .field("organization_id", &self.organization_id)
            .field("is_preferred", &self.is_preferred)
            .finish()
    }
}

/// Decrypted credential handed to the caller at point of use
#[derive(Clone, PartialEq)]
pub struct ProviderCredential {
    /// Provider
    pub provider: String,
    /// Plaintext API key
    pub api_key: String,
    /// Label
    pub display_name: String,
    /// Organization
    pub organization_id: Option<Uuid>,
}

impl fmt::Debug for ProviderCredential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProviderCredential")
            .field("provider", &self.provider)
            .field("api_key", &"<redacted>")
            .field("display_name", &self.display_name)
            .field("organization_id", &self.organization_id)
            .finish()
    }
}

/// Encrypted credential store
pub struct ByokVault {
    storage: Arc<Storage>,
    cipher: Arc<dyn Cipher>,
}

impl fmt::Debug for ByokVault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ByokVault").finish_non_exhaustive()
    }
}

/// Normalized provider key
pub fn normalize_provider(provider: &str) -> String {
    provider.trim().to_lowercase()
}

impl ByokVault {
    /// Create vault over shared storage
    pub fn new(storage: Arc<Storage>, cipher: Arc<dyn Cipher>) -> Self {
        Self { storage, cipher }
    }

    /// Add or rotate a user's key for a provider
    pub fn add(&self, user_id: Uuid, request: ApiKeyRequest) -> Result<ByokKeySummary> {
        if user_id.is_nil() {
            return Err(Error::MissingRequired("user_id".to_string()));
        }
        let provider = normalize_provider(&request.provider);
        if provider.is_empty() {
            return Err(Error::MissingRequired("provider".to_string()));
        }
        if request.api_key.trim().is_empty() {
            return Err(Error::MissingRequired("api_key".to_string()));
        }

        let (ciphertext, iv) = self.cipher.encrypt(request.api_key.as_bytes())?;
        let now = Utc::now();
        let created_at = self
            .storage
            .get_credential(user_id, &provider)?
            .map(|existing| existing.created_at)
            .unwrap_or(now);

        let credential = ByokCredential {
            user_id,
            display_name: request
                .display_name
                .filter(|name| !name.trim().is_empty())
                .unwrap_or_else(|| format!("{} key", provider)),
            provider,
            ciphertext,
            iv,
            organization_id: request.organization_id,
            is_preferred: request.is_preferred.unwrap_or(true),
            created_at,
            updated_at: now,
        };

        self.storage.put_credential(&credential)?;

        tracing::info!(
            user_id = %user_id,
            provider = %credential.provider,
            "BYOK credential stored"
        );

        Ok(ByokKeySummary::from(&credential))
    }

    /// List a user's credentials without secret material
    pub fn list(&self, user_id: Uuid) -> Result<Vec<ByokKeySummary>> {
        Ok(self
            .storage
            .list_credentials(user_id)?
            .iter()
            .map(ByokKeySummary::from)
            .collect())
    }

    /// Hard-delete a credential; returns whether one existed
    pub fn delete(&self, user_id: Uuid, provider: &str) -> Result<bool> {
        let provider = normalize_provider(provider);
        let deleted = self.storage.delete_credential(user_id, &provider)?;
        if deleted {
            tracing::info!(user_id = %user_id, provider = %provider, "BYOK credential deleted");
        }
        Ok(deleted)
    }

    /// Decrypt the preferred credential for (user, provider), if any
    pub fn resolve(&self, user_id: Uuid, provider: &str) -> Result<Option<ProviderCredential>> {
        let provider = normalize_provider(provider);
        let credential = match self.storage.get_credential(user_id, &provider)? {
            Some(c) if c.is_preferred => c,
            _ => return Ok(None),
        };

        let plaintext = self.cipher.decrypt(&credential.ciphertext, &credential.iv)?;
        let api_key = String::from_utf8(plaintext)
            .map_err(|e| Error::Encryption(format!("Decrypted key is not UTF-8: {}", e)))?;

        Ok(Some(ProviderCredential {
            provider: credential.provider,
            api_key,
            display_name: credential.display_name,
            organization_id: credential.organization_id,
        }))
    }
}
