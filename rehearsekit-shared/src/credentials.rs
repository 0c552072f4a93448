//! Credential persistence for the access/refresh token pair

use crate::config::SessionConfig;
use crate::token_claims::effective_expiry;
use crate::{CredentialPair, RehearseError, Result};
use aes_gcm::{AeadInPlace, Aes256Gcm, KeyInit, Nonce};
use base64::{engine::general_purpose, Engine as _};
use chrono::{DateTime, Duration, Utc};
use keyring::Entry;
use rand::{rngs::OsRng, RngCore};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::RwLock;

/// The two named entries a store holds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CredentialKind {
    Access,
    Refresh,
}

impl CredentialKind {
    pub fn entry_name(self) -> &'static str {
        match self {
            CredentialKind::Access => "access_token",
            CredentialKind::Refresh => "refresh_token",
        }
    }
}

/// A persisted token with its own expiry
#[derive(Clone, Serialize, Deserialize)]
pub struct StoredCredential {
    pub value: String,
    pub expires_at: DateTime<Utc>,
}

impl StoredCredential {
    pub fn is_expired(&self) -> bool {
        Utc::now() >= self.expires_at
    }
}

/// How long each half of a pair stays in the store
#[derive(Debug, Clone, Copy)]
pub struct CredentialLifetimes {
    pub access: Duration,
    pub refresh: Duration,
}

impl Default for CredentialLifetimes {
    fn default() -> Self {
        Self {
            access: Duration::days(1),
            refresh: Duration::days(7),
        }
    }
}

impl From<&SessionConfig> for CredentialLifetimes {
    fn from(config: &SessionConfig) -> Self {
        Self {
            access: config.access_ttl(),
            refresh: config.refresh_ttl(),
        }
    }
}

/// Storage for the credential pair. Expired entries read as absent.
pub trait CredentialStore: Send + Sync {
    fn get(&self, kind: CredentialKind) -> Result<Option<String>>;

    fn put(&self, kind: CredentialKind, credential: StoredCredential) -> Result<()>;

    fn remove(&self, kind: CredentialKind) -> Result<()>;

    fn access_token(&self) -> Result<Option<String>> {
        self.get(CredentialKind::Access)
    }

    fn refresh_token(&self) -> Result<Option<String>> {
        self.get(CredentialKind::Refresh)
    }

    /// Persist both halves of a freshly minted pair
    fn store_pair(&self, pair: &CredentialPair, lifetimes: CredentialLifetimes) -> Result<()> {
        self.put(
            CredentialKind::Access,
            StoredCredential {
                value: pair.access_token.clone(),
                expires_at: effective_expiry(&pair.access_token, lifetimes.access),
            },
        )?;
        self.put(
            CredentialKind::Refresh,
            StoredCredential {
                value: pair.refresh_token.clone(),
                expires_at: effective_expiry(&pair.refresh_token, lifetimes.refresh),
            },
        )
    }

    /// Remove both entries. Both removals are attempted even if the first fails.
    fn clear(&self) -> Result<()> {
        let access = self.remove(CredentialKind::Access);
        let refresh = self.remove(CredentialKind::Refresh);
        access.and(refresh)
    }
}

/// Process-local store, used for tests and ephemeral sessions
#[derive(Default)]
pub struct MemoryCredentialStore {
    entries: RwLock<HashMap<CredentialKind, StoredCredential>>,
}

impl MemoryCredentialStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_pair(pair: &CredentialPair) -> Self {
        let store = Self::new();
        // A fresh in-memory map cannot fail to accept entries
        let _ = store.store_pair(pair, CredentialLifetimes::default());
        store
    }

    fn poisoned() -> RehearseError {
        RehearseError::Storage("credential map lock poisoned".to_string())
    }
}

impl CredentialStore for MemoryCredentialStore {
    fn get(&self, kind: CredentialKind) -> Result<Option<String>> {
        let entries = self.entries.read().map_err(|_| Self::poisoned())?;
        Ok(entries
            .get(&kind)
            .filter(|credential| !credential.is_expired())
            .map(|credential| credential.value.clone()))
    }

    fn put(&self, kind: CredentialKind, credential: StoredCredential) -> Result<()> {
        let mut entries = self.entries.write().map_err(|_| Self::poisoned())?;
        entries.insert(kind, credential);
        Ok(())
    }

    fn remove(&self, kind: CredentialKind) -> Result<()> {
        let mut entries = self.entries.write().map_err(|_| Self::poisoned())?;
        entries.remove(&kind);
        Ok(())
    }
}

/// OS keyring store. Entries are scoped to one API origin and encrypted with AES-256-GCM.
pub struct KeyringCredentialStore {
    /// Service name for keyring entries
    service_name: String,
    /// Short hash of the API origin these credentials belong to
    site_id: String,
    /// Encryption key for additional security
    encryption_key: [u8; 32],
}

impl KeyringCredentialStore {
    /// Open the store for an API origin, creating the encryption key on first use
    pub fn new(service_name: impl Into<String>, api_url: &str) -> Result<Self> {
        let service_name = service_name.into();
        let encryption_key = Self::get_or_create_encryption_key(&service_name)?;
        Ok(Self::with_key(service_name, api_url, encryption_key))
    }

    pub fn with_key(service_name: impl Into<String>, api_url: &str, encryption_key: [u8; 32]) -> Self {
        Self {
            service_name: service_name.into(),
            site_id: site_id(api_url),
            encryption_key,
        }
    }

    fn entry(&self, kind: CredentialKind) -> Result<Entry> {
        let user = format!("{}:{}", self.site_id, kind.entry_name());
        Entry::new(&self.service_name, &user)
            .map_err(|e| RehearseError::Storage(format!("Failed to create keyring entry: {e}")))
    }

    /// Get or create encryption key
    fn get_or_create_encryption_key(service_name: &str) -> Result<[u8; 32]> {
        let key_entry = Entry::new(service_name, "encryption-key")
            .map_err(|e| RehearseError::Storage(format!("Failed to create key entry: {e}")))?;

        match key_entry.get_password() {
            Ok(encoded_key) => {
                let key_bytes = general_purpose::STANDARD.decode(encoded_key).map_err(|e| {
                    RehearseError::Storage(format!("Failed to decode encryption key: {e}"))
                })?;

                let key: [u8; 32] = key_bytes.try_into().map_err(|_| {
                    RehearseError::Storage("Invalid encryption key length".to_string())
                })?;
                Ok(key)
            }
            Err(keyring::Error::NoEntry) => {
                let mut key = [0u8; 32];
                OsRng.fill_bytes(&mut key);

                let encoded_key = general_purpose::STANDARD.encode(key);
                key_entry.set_password(&encoded_key).map_err(|e| {
                    RehearseError::Storage(format!("Failed to store encryption key: {e}"))
                })?;

                tracing::info!("Created credential encryption key for {}", service_name);
                Ok(key)
            }
            Err(e) => Err(RehearseError::Storage(format!(
                "Failed to read encryption key: {e}"
            ))),
        }
    }
}

impl CredentialStore for KeyringCredentialStore {
    fn get(&self, kind: CredentialKind) -> Result<Option<String>> {
        let entry = self.entry(kind)?;

        let encoded = match entry.get_password() {
            Ok(encoded) => encoded,
            Err(keyring::Error::NoEntry) => return Ok(None),
            Err(e) => {
                return Err(RehearseError::Storage(format!(
                    "Failed to retrieve {}: {e}",
                    kind.entry_name()
                )))
            }
        };

        let encrypted = general_purpose::STANDARD
            .decode(encoded)
            .map_err(|e| RehearseError::Storage(format!("Failed to decode credential: {e}")))?;
        let decrypted = decrypt_data(&self.encryption_key, &encrypted)?;
        let credential: StoredCredential = serde_json::from_slice(&decrypted)?;

        if credential.is_expired() {
            tracing::debug!("Stored {} expired, removing", kind.entry_name());
            self.remove(kind)?;
            return Ok(None);
        }

        Ok(Some(credential.value))
    }

    fn put(&self, kind: CredentialKind, credential: StoredCredential) -> Result<()> {
        let serialized = serde_json::to_vec(&credential)?;
        let encrypted = encrypt_data(&self.encryption_key, &serialized)?;
        let encoded = general_purpose::STANDARD.encode(&encrypted);

        self.entry(kind)?
            .set_password(&encoded)
            .map_err(|e| RehearseError::Storage(format!("Failed to store credential: {e}")))
    }

    fn remove(&self, kind: CredentialKind) -> Result<()> {
        match self.entry(kind)?.delete_credential() {
            Ok(()) | Err(keyring::Error::NoEntry) => Ok(()),
            Err(e) => Err(RehearseError::Storage(format!(
                "Failed to remove credential: {e}"
            ))),
        }
    }
}

/// Stable short identifier for an API origin
fn site_id(api_url: &str) -> String {
    use sha1::{Digest, Sha1};

    let mut hasher = Sha1::new();
    hasher.update(api_url.trim_end_matches('/').as_bytes());
    let result = hasher.finalize();

    hex::encode(&result[..8])
}

/// Encrypt data using AES-256-GCM, nonce prepended
fn encrypt_data(key: &[u8; 32], data: &[u8]) -> Result<Vec<u8>> {
    let cipher = Aes256Gcm::new(&(*key).into());

    let mut nonce_bytes = [0u8; 12];
    OsRng.fill_bytes(&mut nonce_bytes);
    let nonce = Nonce::from_slice(&nonce_bytes);

    let mut buffer = data.to_vec();
    cipher
        .encrypt_in_place(nonce, b"", &mut buffer)
        .map_err(|e| RehearseError::Storage(format!("Encryption failed: {e}")))?;

    let mut result = nonce_bytes.to_vec();
    result.extend_from_slice(&buffer);
    Ok(result)
}

fn decrypt_data(key: &[u8; 32], encrypted_data: &[u8]) -> Result<Vec<u8>> {
    if encrypted_data.len() < 12 {
        return Err(RehearseError::Storage("Invalid encrypted data".to_string()));
    }

    let (nonce_bytes, ciphertext) = encrypted_data.split_at(12);
    let nonce = Nonce::from_slice(nonce_bytes);
    let cipher = Aes256Gcm::new(&(*key).into());

    let mut buffer = ciphertext.to_vec();
    cipher
        .decrypt_in_place(nonce, b"", &mut buffer)
        .map_err(|e| RehearseError::Storage(format!("Decryption failed: {e}")))?;

    Ok(buffer)
}
