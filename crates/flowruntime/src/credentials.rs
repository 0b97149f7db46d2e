//! Credential vault
//!
//! Node secrets never live in the flow configuration. On deploy they are
//! pulled out of the submitted nodes into an in-memory cache; on save the
//! cache is exported, encrypted as a single blob when a key is available.
//!
//! Blob format: `{"$": hex(iv) + base64(ciphertext || tag)}` with a 16 byte
//! random IV and AES-256-GCM keyed by the sha256 digest of the secret.

use crate::registry::{CredentialDefinition, CredentialKind, NodeCategory};
use crate::storage::Settings;
use aes_gcm::aead::consts::U16;
use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::aes::Aes256;
use aes_gcm::{AesGcm, Nonce};
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use flowcore::{FlowConfig, FlowError, NodeConfig, NodeId, Result};
use rand::RngCore;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::sync::Arc;

type VaultCipher = AesGcm<Aes256, U16>;

/// Submitted password value meaning "keep what is stored"
pub const PASSWORD_SENTINEL: &str = "__PWRD__";

/// Settings key holding the auto-generated secret
pub const SYSTEM_SECRET_KEY: &str = "_credentialSecret";

const IV_HEX_LEN: usize = 32;

/// Secret fields of one node
pub type CredentialMap = Map<String, Value>;

/// All credentials, by node id
pub type CredentialCache = BTreeMap<NodeId, CredentialMap>;

pub type EncryptionKey = [u8; 32];

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EncryptedCredentials {
    #[serde(rename = "$")]
    pub payload: String,
}

/// Credentials as persisted: encrypted blob or plaintext map
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum CredentialBlob {
    Encrypted(EncryptedCredentials),
    Plain(CredentialCache),
}

impl Default for CredentialBlob {
    fn default() -> Self {
        CredentialBlob::Plain(CredentialCache::new())
    }
}

/// Where the active encryption key came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum KeyType {
    Disabled,
    System,
    User,
    Project,
}

/// Operator-supplied `credential_secret` setting
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum SecretSetting {
    #[default]
    Unset,
    /// Explicitly set to `false`
    Disabled,
    Secret(String),
}

impl<'de> Deserialize<'de> for SecretSetting {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        match Value::deserialize(deserializer)? {
            Value::Null => Ok(SecretSetting::Unset),
            Value::Bool(false) => Ok(SecretSetting::Disabled),
            Value::String(s) => Ok(SecretSetting::Secret(s)),
            other => Err(serde::de::Error::custom(format!(
                "credential_secret must be a string or false, got {}",
                other
            ))),
        }
    }
}

/// Active deployment unit that brings its own secret
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct ProjectSecret {
    pub name: String,
    #[serde(default)]
    pub credential_secret: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct VaultOptions {
    #[serde(default)]
    pub credential_secret: SecretSetting,
    #[serde(default)]
    pub project: Option<ProjectSecret>,
}

pub fn derive_key(secret: &str) -> EncryptionKey {
    Sha256::digest(secret.as_bytes()).into()
}

fn load_failed(msg: impl Into<String>) -> FlowError {
    FlowError::CredentialsLoadFailed(msg.into())
}

pub fn encrypt(key: &EncryptionKey, credentials: &CredentialCache) -> Result<EncryptedCredentials> {
    let mut iv = [0u8; 16];
    rand::rng().fill_bytes(&mut iv);

    let cipher = VaultCipher::new_from_slice(key)
        .map_err(|e| FlowError::Storage(format!("invalid key: {}", e)))?;
    let plaintext = serde_json::to_vec(credentials)?;
    let ciphertext = cipher
        .encrypt(Nonce::<U16>::from_slice(&iv), plaintext.as_ref())
        .map_err(|_| FlowError::Storage("credential encryption failed".to_string()))?;

    Ok(EncryptedCredentials {
        payload: format!("{}{}", hex::encode(iv), STANDARD.encode(ciphertext)),
    })
}

pub fn decrypt(key: &EncryptionKey, blob: &EncryptedCredentials) -> Result<CredentialCache> {
    let iv_hex = blob
        .payload
        .get(..IV_HEX_LEN)
        .ok_or_else(|| load_failed("encrypted credentials are truncated"))?;
    let iv = hex::decode(iv_hex).map_err(|e| load_failed(format!("bad iv: {}", e)))?;
    let ciphertext = STANDARD
        .decode(&blob.payload[IV_HEX_LEN..])
        .map_err(|e| load_failed(format!("bad ciphertext: {}", e)))?;

    let cipher = VaultCipher::new_from_slice(key).map_err(|e| load_failed(e.to_string()))?;
    let plaintext = cipher
        .decrypt(Nonce::<U16>::from_slice(&iv), ciphertext.as_ref())
        .map_err(|_| load_failed("credentials could not be decrypted with the configured key"))?;

    serde_json::from_slice(&plaintext).map_err(|e| load_failed(e.to_string()))
}

fn is_blank(value: &Value) -> bool {
    match value {
        Value::String(s) => s.trim().is_empty(),
        _ => false,
    }
}

fn is_sentinel(value: &Value) -> bool {
    value.as_str() == Some(PASSWORD_SENTINEL)
}

/// Merge one submitted field into `saved`. Returns whether anything changed.
fn merge_field(saved: &mut CredentialMap, field: &str, value: &Value) -> bool {
    if is_blank(value) {
        return saved.remove(field).is_some();
    }
    if saved.get(field) == Some(value) {
        return false;
    }
    saved.insert(field.to_string(), value.clone());
    true
}

pub struct CredentialVault {
    settings: Arc<dyn Settings>,
    key_type: KeyType,
    key: Option<EncryptionKey>,
    cache: CredentialCache,
    dirty: bool,
    /// Blob last loaded or exported; reused while nothing changed
    encrypted: Option<EncryptedCredentials>,
    remove_system_secret: bool,
    project_secret_invalid: bool,
}

impl CredentialVault {
    pub fn new(settings: Arc<dyn Settings>) -> Self {
        Self {
            settings,
            key_type: KeyType::Disabled,
            key: None,
            cache: CredentialCache::new(),
            dirty: false,
            encrypted: None,
            remove_system_secret: false,
            project_secret_invalid: false,
        }
    }

    pub fn key_type(&self) -> KeyType {
        self.key_type
    }

    pub fn encryption_enabled(&self) -> bool {
        self.key.is_some()
    }

    pub fn dirty(&self) -> bool {
        self.dirty
    }

    /// Set when a project's secret failed to decrypt its credentials
    pub fn project_secret_invalid(&self) -> bool {
        self.project_secret_invalid
    }

    /// Resolve the encryption key and load a persisted blob into the cache.
    pub async fn load(&mut self, blob: CredentialBlob, options: &VaultOptions) -> Result<()> {
        let prior_key = self.key;
        self.dirty = false;
        self.encrypted = None;
        self.remove_system_secret = false;
        self.project_secret_invalid = false;

        let system_key = self
            .settings
            .get(SYSTEM_SECRET_KEY)
            .await
            .and_then(|v| v.as_str().map(derive_key));

        let (key_type, key) = match &options.project {
            Some(project) => match project.credential_secret.as_deref() {
                Some(secret) if !secret.is_empty() => (KeyType::Project, Some(derive_key(secret))),
                _ => {
                    tracing::info!(project = %project.name, "Credential encryption disabled by project");
                    (KeyType::Disabled, None)
                }
            },
            None => match &options.credential_secret {
                SecretSetting::Secret(secret) => (KeyType::User, Some(derive_key(secret))),
                SecretSetting::Disabled => (KeyType::Disabled, None),
                SecretSetting::Unset => match system_key {
                    Some(key) => (KeyType::System, Some(key)),
                    None => (KeyType::System, Some(self.generate_system_secret().await?)),
                },
            },
        };

        // Keys that may have encrypted the blob on disk
        let mut previous: Vec<EncryptionKey> = Vec::new();
        if key_type != KeyType::System && options.project.is_none() {
            if let Some(k) = system_key {
                previous.push(k);
            }
        }
        if let Some(k) = prior_key {
            if Some(k) != key && !previous.contains(&k) {
                previous.push(k);
            }
        }
        if key_type == KeyType::User && system_key.is_some() {
            self.remove_system_secret = true;
        }
        if key_type == KeyType::Disabled && options.project.is_none() && system_key.is_some() {
            self.remove_system_secret = true;
        }

        self.key_type = key_type;
        self.key = key;
        tracing::info!(key_type = ?key_type, "Credential encryption key resolved");

        match blob {
            CredentialBlob::Plain(cache) => {
                // Plaintext on disk while a key is active: encrypt on next save
                self.dirty = self.key.is_some() && !cache.is_empty();
                self.cache = cache;
                Ok(())
            }
            CredentialBlob::Encrypted(enc) => {
                for prev in &previous {
                    if let Ok(cache) = decrypt(prev, &enc) {
                        tracing::info!("Credentials were encrypted with a previous key, re-encrypting");
                        self.cache = cache;
                        self.dirty = true;
                        return Ok(());
                    }
                }
                let Some(key) = self.key else {
                    return Err(load_failed(
                        "credentials are encrypted but encryption is disabled",
                    ));
                };
                match decrypt(&key, &enc) {
                    Ok(cache) => {
                        self.cache = cache;
                        self.encrypted = Some(enc);
                        Ok(())
                    }
                    Err(e) if self.key_type == KeyType::Project => {
                        tracing::warn!(error = %e, "Project credential secret is invalid");
                        self.project_secret_invalid = true;
                        self.cache = CredentialCache::new();
                        Ok(())
                    }
                    Err(e) => Err(e),
                }
            }
        }
    }

    async fn generate_system_secret(&self) -> Result<EncryptionKey> {
        let mut bytes = [0u8; 32];
        rand::rng().fill_bytes(&mut bytes);
        let secret = hex::encode(bytes);
        self.settings
            .set(SYSTEM_SECRET_KEY, Value::String(secret.clone()))
            .await?;
        tracing::info!("Generated a new credential secret");
        Ok(derive_key(&secret))
    }

    /// Pull a node's submitted `credentials` into the cache and strip them
    /// from the config. Returns whether the stored credentials changed.
    pub fn extract(&mut self, node: &mut NodeConfig, category: &NodeCategory) -> bool {
        let Some(submitted) = node.credentials.take() else {
            return false;
        };
        let saved = self.cache.entry(node.id.clone()).or_default();
        let mut changed = false;

        match category {
            NodeCategory::Regular(definition) => {
                for (field, kind) in definition {
                    let Some(value) = submitted.get(field) else {
                        continue;
                    };
                    if *kind == CredentialKind::Password && is_sentinel(value) {
                        continue;
                    }
                    changed |= merge_field(saved, field, value);
                }
            }
            NodeCategory::DynamicDefinition => {
                for (field, value) in &submitted {
                    if is_sentinel(value) {
                        continue;
                    }
                    changed |= merge_field(saved, field, value);
                }
                let before = saved.len();
                saved.retain(|field, _| submitted.contains_key(field));
                changed |= saved.len() != before;
            }
        }

        if saved.is_empty() {
            self.cache.remove(&node.id);
        }
        if changed {
            self.dirty = true;
        }
        changed
    }

    pub fn get(&self, id: &str) -> Option<&CredentialMap> {
        self.cache.get(id)
    }

    pub fn add(&mut self, id: &str, credentials: CredentialMap) {
        self.cache.insert(id.to_string(), credentials);
        self.dirty = true;
    }

    pub fn delete(&mut self, id: &str) {
        if self.cache.remove(id).is_some() {
            self.dirty = true;
        }
    }

    /// Drop records for node ids that are no longer part of `config`
    pub fn clean(&mut self, config: &FlowConfig) {
        let before = self.cache.len();
        self.cache.retain(|id, _| config.contains(id));
        let purged = before - self.cache.len();
        if purged > 0 {
            tracing::debug!(purged, "Purged credentials of removed nodes");
            self.dirty = true;
        }
    }

    /// Force the next export to re-encrypt, e.g. after a failed save
    pub fn mark_dirty(&mut self) {
        self.dirty = true;
    }

    pub fn clear(&mut self) {
        self.cache.clear();
        self.dirty = true;
    }

    /// Produce the blob to persist. Re-encrypts only when something changed.
    pub fn export(&mut self) -> Result<CredentialBlob> {
        let Some(key) = self.key else {
            self.dirty = false;
            return Ok(CredentialBlob::Plain(self.cache.clone()));
        };
        if let (false, Some(enc)) = (self.dirty, &self.encrypted) {
            return Ok(CredentialBlob::Encrypted(enc.clone()));
        }
        let enc = encrypt(&key, &self.cache)?;
        self.encrypted = Some(enc.clone());
        self.dirty = false;
        Ok(CredentialBlob::Encrypted(enc))
    }

    /// Called once an exported blob is safely stored. Drops the generated
    /// system secret if a different key has taken over.
    pub async fn export_saved(&mut self) -> Result<()> {
        if self.remove_system_secret {
            self.settings.delete(SYSTEM_SECRET_KEY).await?;
            self.remove_system_secret = false;
            tracing::info!("Removed unused generated credential secret");
        }
        Ok(())
    }

    /// Editor-safe view of a node's credentials: password fields are
    /// reported as `has_<field>` flags, never as values.
    pub fn safe_view(&self, id: &str, definition: Option<&CredentialDefinition>) -> CredentialMap {
        let empty = CredentialMap::new();
        let stored = self.cache.get(id).unwrap_or(&empty);
        let mut view = CredentialMap::new();

        let has = |field: &str| {
            stored
                .get(field)
                .map(|v| !v.is_null() && v.as_str() != Some(""))
                .unwrap_or(false)
        };

        match definition {
            Some(definition) => {
                for (field, kind) in definition {
                    match kind {
                        CredentialKind::Password => {
                            view.insert(format!("has_{}", field), Value::Bool(has(field)));
                        }
                        CredentialKind::Text => {
                            if let Some(value) = stored.get(field) {
                                view.insert(field.clone(), value.clone());
                            }
                        }
                    }
                }
            }
            None => {
                for field in stored.keys() {
                    view.insert(format!("has_{}", field), Value::Bool(has(field)));
                }
            }
        }
        view
    }
}
