//! Storage and settings collaborators
//!
//! The flow manager persists configuration and credentials through
//! [`Storage`]; the credential vault persists its generated secret through
//! [`Settings`]. `LocalStorage` keeps everything as JSON files under a user
//! directory, `MemoryStorage` keeps it in process.

use crate::credentials::CredentialBlob;
use async_trait::async_trait;
use chrono::Utc;
use flowcore::{FlowError, NodeConfig, Result};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tokio::sync::RwLock;

/// What storage hands back on load
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StoredFlows {
    pub flows: Vec<NodeConfig>,
    pub credentials: CredentialBlob,
    pub rev: String,
}

#[async_trait]
pub trait Storage: Send + Sync {
    async fn get_flows(&self) -> Result<StoredFlows>;

    /// Persist a configuration; returns its revision hash
    async fn save_flows(&self, flows: &[NodeConfig], user: Option<&str>) -> Result<String>;

    async fn save_credentials(&self, credentials: &CredentialBlob) -> Result<()>;

    async fn get_settings(&self) -> Result<Map<String, Value>>;

    async fn save_settings(&self, settings: &Map<String, Value>) -> Result<()>;
}

/// Runtime-managed settings (distinct from the operator's config file)
#[async_trait]
pub trait Settings: Send + Sync {
    async fn get(&self, key: &str) -> Option<Value>;
    async fn set(&self, key: &str, value: Value) -> Result<()>;
    async fn delete(&self, key: &str) -> Result<()>;
}

/// Revision hash of a configuration: sha256 over its JSON form
pub fn revision(flows: &[NodeConfig]) -> Result<String> {
    let bytes = serde_json::to_vec(flows)?;
    Ok(hex::encode(Sha256::digest(&bytes)))
}

/// Write `contents` next to `path` under a temporary name, then rename it
/// into place. Readers never observe a partially written file.
pub(crate) async fn write_atomic(path: &Path, contents: &[u8]) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let tmp = PathBuf::from(format!(
        "{}.{}.tmp",
        path.display(),
        Utc::now().timestamp_millis()
    ));
    tokio::fs::write(&tmp, contents).await?;
    if let Err(e) = tokio::fs::rename(&tmp, path).await {
        let _ = tokio::fs::remove_file(&tmp).await;
        return Err(e);
    }
    Ok(())
}

async fn read_json_or_default<T: serde::de::DeserializeOwned + Default>(path: &Path) -> Result<T> {
    match tokio::fs::read(path).await {
        Ok(bytes) if bytes.iter().all(u8::is_ascii_whitespace) => Ok(T::default()),
        Ok(bytes) => serde_json::from_slice(&bytes).map_err(|e| {
            FlowError::Storage(format!("{} is not valid JSON: {}", path.display(), e))
        }),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(T::default()),
        Err(e) => Err(e.into()),
    }
}

/// File-backed storage rooted at a user directory
pub struct LocalStorage {
    flows_path: PathBuf,
    credentials_path: PathBuf,
    settings_path: PathBuf,
}

impl LocalStorage {
    pub fn new(user_dir: impl Into<PathBuf>, flow_file: &str) -> Self {
        let user_dir = user_dir.into();
        let flows_path = user_dir.join(flow_file);
        let stem = flows_path
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or("flows")
            .to_string();
        Self {
            credentials_path: user_dir.join(format!("{}_cred.json", stem)),
            settings_path: user_dir.join(".config.runtime.json"),
            flows_path,
        }
    }

    pub fn flows_path(&self) -> &Path {
        &self.flows_path
    }

    pub fn credentials_path(&self) -> &Path {
        &self.credentials_path
    }

    fn backup_path(path: &Path) -> PathBuf {
        let name = path
            .file_name()
            .and_then(|s| s.to_str())
            .unwrap_or("flows.json");
        path.with_file_name(format!(".{}.backup", name))
    }
}

#[async_trait]
impl Storage for LocalStorage {
    async fn get_flows(&self) -> Result<StoredFlows> {
        let flows: Vec<NodeConfig> = read_json_or_default(&self.flows_path).await?;
        let credentials: CredentialBlob = read_json_or_default(&self.credentials_path).await?;
        let rev = revision(&flows)?;
        tracing::info!(
            path = %self.flows_path.display(),
            nodes = flows.len(),
            "Loaded flows"
        );
        Ok(StoredFlows {
            flows,
            credentials,
            rev,
        })
    }

    async fn save_flows(&self, flows: &[NodeConfig], user: Option<&str>) -> Result<String> {
        if tokio::fs::try_exists(&self.flows_path).await? {
            tokio::fs::copy(&self.flows_path, Self::backup_path(&self.flows_path)).await?;
        }
        let json = serde_json::to_vec_pretty(flows)?;
        write_atomic(&self.flows_path, &json).await?;
        tracing::info!(
            path = %self.flows_path.display(),
            user = user.unwrap_or("-"),
            "Saved flows"
        );
        revision(flows)
    }

    async fn save_credentials(&self, credentials: &CredentialBlob) -> Result<()> {
        let json = serde_json::to_vec_pretty(credentials)?;
        write_atomic(&self.credentials_path, &json).await?;
        Ok(())
    }

    async fn get_settings(&self) -> Result<Map<String, Value>> {
        read_json_or_default(&self.settings_path).await
    }

    async fn save_settings(&self, settings: &Map<String, Value>) -> Result<()> {
        let json = serde_json::to_vec_pretty(settings)?;
        write_atomic(&self.settings_path, &json).await?;
        Ok(())
    }
}

/// In-process storage, for embedding and tests
#[derive(Default)]
pub struct MemoryStorage {
    flows: Mutex<Vec<NodeConfig>>,
    credentials: Mutex<CredentialBlob>,
    settings: Mutex<Map<String, Value>>,
    flow_saves: Mutex<usize>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_flows(flows: Vec<NodeConfig>, credentials: CredentialBlob) -> Self {
        Self {
            flows: Mutex::new(flows),
            credentials: Mutex::new(credentials),
            ..Default::default()
        }
    }

    pub fn flows(&self) -> Vec<NodeConfig> {
        self.flows.lock().clone()
    }

    pub fn credentials(&self) -> CredentialBlob {
        self.credentials.lock().clone()
    }

    pub fn settings(&self) -> Map<String, Value> {
        self.settings.lock().clone()
    }

    /// Number of times `save_flows` was called
    pub fn flow_saves(&self) -> usize {
        *self.flow_saves.lock()
    }
}

#[async_trait]
impl Storage for MemoryStorage {
    async fn get_flows(&self) -> Result<StoredFlows> {
        let flows = self.flows();
        Ok(StoredFlows {
            rev: revision(&flows)?,
            flows,
            credentials: self.credentials(),
        })
    }

    async fn save_flows(&self, flows: &[NodeConfig], _user: Option<&str>) -> Result<String> {
        *self.flows.lock() = flows.to_vec();
        *self.flow_saves.lock() += 1;
        revision(flows)
    }

    async fn save_credentials(&self, credentials: &CredentialBlob) -> Result<()> {
        *self.credentials.lock() = credentials.clone();
        Ok(())
    }

    async fn get_settings(&self) -> Result<Map<String, Value>> {
        Ok(self.settings())
    }

    async fn save_settings(&self, settings: &Map<String, Value>) -> Result<()> {
        *self.settings.lock() = settings.clone();
        Ok(())
    }
}

/// Settings collaborator persisted through storage
pub struct RuntimeSettings {
    storage: std::sync::Arc<dyn Storage>,
    values: RwLock<Map<String, Value>>,
}

impl RuntimeSettings {
    pub async fn load(storage: std::sync::Arc<dyn Storage>) -> Result<Self> {
        let values = storage.get_settings().await?;
        Ok(Self {
            storage,
            values: RwLock::new(values),
        })
    }
}

#[async_trait]
impl Settings for RuntimeSettings {
    async fn get(&self, key: &str) -> Option<Value> {
        self.values.read().await.get(key).cloned()
    }

    async fn set(&self, key: &str, value: Value) -> Result<()> {
        let mut values = self.values.write().await;
        if values.get(key) == Some(&value) {
            return Ok(());
        }
        values.insert(key.to_string(), value);
        self.storage.save_settings(&values).await
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let mut values = self.values.write().await;
        if values.remove(key).is_some() {
            self.storage.save_settings(&values).await?;
        }
        Ok(())
    }
}
