//! File-per-scope context backend
//!
//! Layout under the store root:
//!
//! ```text
//! global/global.json
//! <flowId>/flow.json
//! <flowId>/<nodeId>.json
//! ```
//!
//! With the cache enabled (the default) a scope is read once, served from
//! memory afterwards, and written back by a debounced flush. All file writes
//! go through one write queue and are atomic (tmp file then rename).

use super::{get_path, parse_scope, scope_is_active, set_path, ContextBackend, Scope, ScopeData, GLOBAL_SCOPE};
use crate::storage::write_atomic;
use async_trait::async_trait;
use flowcore::{FlowError, Result};
use parking_lot::Mutex;
use serde::Deserialize;
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

fn default_base() -> String {
    "context".to_string()
}

fn default_cache() -> bool {
    true
}

fn default_flush_interval() -> u64 {
    30
}

#[derive(Debug, Clone, Deserialize)]
pub struct LocalFileSystemConfig {
    /// Parent directory; defaults to the runtime user directory
    #[serde(default)]
    pub dir: Option<PathBuf>,

    #[serde(default = "default_base")]
    pub base: String,

    #[serde(default = "default_cache")]
    pub cache: bool,

    #[serde(default = "default_flush_interval")]
    pub flush_interval_secs: u64,
}

impl Default for LocalFileSystemConfig {
    fn default() -> Self {
        Self {
            dir: None,
            base: default_base(),
            cache: default_cache(),
            flush_interval_secs: default_flush_interval(),
        }
    }
}

impl LocalFileSystemConfig {
    pub fn root(&self, user_dir: &Path) -> PathBuf {
        self.dir
            .clone()
            .unwrap_or_else(|| user_dir.to_path_buf())
            .join(&self.base)
    }
}

/// Ids as they appear in file and directory names
fn file_id(id: &str) -> String {
    id.replace(':', "_")
}

struct Inner {
    root: PathBuf,
    cache_enabled: bool,
    flush_interval: Duration,
    cache: Mutex<HashMap<String, ScopeData>>,
    dirty: Mutex<HashSet<String>>,
    flush_task: Mutex<Option<JoinHandle<()>>>,
    shutdown: CancellationToken,
    write_queue: tokio::sync::Mutex<()>,
    serialize_warned: Mutex<HashSet<String>>,
}

impl Inner {
    fn scope_path(&self, scope: &str) -> PathBuf {
        match parse_scope(scope) {
            Scope::Global => self.root.join(GLOBAL_SCOPE).join("global.json"),
            Scope::Flow(flow) => self.root.join(file_id(flow)).join("flow.json"),
            Scope::Node { node, flow } => self
                .root
                .join(file_id(flow))
                .join(format!("{}.json", file_id(node))),
        }
    }

    async fn read_scope(&self, scope: &str) -> Result<ScopeData> {
        let path = self.scope_path(scope);
        match tokio::fs::read(&path).await {
            Ok(bytes) if bytes.iter().all(u8::is_ascii_whitespace) => Ok(ScopeData::new()),
            Ok(bytes) => serde_json::from_slice(&bytes).map_err(|e| {
                tracing::error!(scope, path = %path.display(), error = %e, "Corrupt context file");
                FlowError::Storage(format!("context file {} is corrupt: {}", path.display(), e))
            }),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(ScopeData::new()),
            Err(e) => Err(e.into()),
        }
    }

    /// Serialize a scope. A value that refuses to serialize is written as
    /// `null`, with one warning per scope.
    fn serialize(&self, scope: &str, data: &ScopeData) -> Vec<u8> {
        match serde_json::to_vec_pretty(data) {
            Ok(bytes) => bytes,
            Err(e) => {
                if self.serialize_warned.lock().insert(scope.to_string()) {
                    tracing::warn!(scope, error = %e, "Context value could not be serialized, writing null");
                }
                let safe: ScopeData = data
                    .iter()
                    .map(|(k, v)| match serde_json::to_vec(v) {
                        Ok(_) => (k.clone(), v.clone()),
                        Err(_) => (k.clone(), Value::Null),
                    })
                    .collect();
                serde_json::to_vec_pretty(&safe).unwrap_or_else(|_| b"{}".to_vec())
            }
        }
    }

    async fn write_scope(&self, scope: &str, data: &ScopeData) -> Result<()> {
        let bytes = self.serialize(scope, data);
        write_atomic(&self.scope_path(scope), &bytes).await?;
        Ok(())
    }

    /// Write one dirty scope. Caller holds the write queue.
    async fn flush_scope_locked(&self, scope: &str) -> Result<()> {
        let snapshot = {
            self.dirty.lock().remove(scope);
            self.cache.lock().get(scope).cloned()
        };
        let Some(data) = snapshot else {
            return Ok(());
        };
        if let Err(e) = self.write_scope(scope, &data).await {
            self.dirty.lock().insert(scope.to_string());
            return Err(e);
        }
        Ok(())
    }

    async fn flush(&self) -> Result<()> {
        let _queue = self.write_queue.lock().await;
        let scopes: Vec<String> = self.dirty.lock().iter().cloned().collect();
        let mut first_error = None;
        for scope in scopes {
            if let Err(e) = self.flush_scope_locked(&scope).await {
                tracing::error!(scope = %scope, error = %e, "Failed to write context");
                first_error.get_or_insert(e);
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Arrange a delayed flush unless one is pending. Returns false once the
    /// backend is closed.
    fn schedule_flush(self: &Arc<Self>) -> bool {
        if self.shutdown.is_cancelled() {
            return false;
        }
        let mut task = self.flush_task.lock();
        if task.is_some() {
            return true;
        }
        let inner = Arc::clone(self);
        *task = Some(tokio::spawn(async move {
            tokio::select! {
                _ = tokio::time::sleep(inner.flush_interval) => {}
                _ = inner.shutdown.cancelled() => return,
            }
            inner.flush_task.lock().take();
            if let Err(e) = inner.flush().await {
                tracing::warn!(error = %e, "Scheduled context flush failed");
            }
        }));
        true
    }

    async fn ensure_loaded(&self, scope: &str) -> Result<()> {
        if self.cache.lock().contains_key(scope) {
            return Ok(());
        }
        let data = self.read_scope(scope).await?;
        self.cache.lock().entry(scope.to_string()).or_insert(data);
        Ok(())
    }
}

pub struct LocalFileSystemBackend {
    inner: Arc<Inner>,
}

impl LocalFileSystemBackend {
    pub fn new(root: impl Into<PathBuf>, config: &LocalFileSystemConfig) -> Self {
        Self {
            inner: Arc::new(Inner {
                root: root.into(),
                cache_enabled: config.cache,
                flush_interval: Duration::from_secs(config.flush_interval_secs),
                cache: Mutex::new(HashMap::new()),
                dirty: Mutex::new(HashSet::new()),
                flush_task: Mutex::new(None),
                shutdown: CancellationToken::new(),
                write_queue: tokio::sync::Mutex::new(()),
                serialize_warned: Mutex::new(HashSet::new()),
            }),
        }
    }

    pub fn root(&self) -> &Path {
        &self.inner.root
    }

    /// File holding a scope's data
    pub fn scope_path(&self, scope: &str) -> PathBuf {
        self.inner.scope_path(scope)
    }

    /// Write every dirty scope now
    pub async fn flush(&self) -> Result<()> {
        self.inner.flush().await
    }
}

#[async_trait]
impl ContextBackend for LocalFileSystemBackend {
    async fn open(&self) -> Result<()> {
        tokio::fs::create_dir_all(&self.inner.root).await?;
        tracing::info!(
            root = %self.inner.root.display(),
            cache = self.inner.cache_enabled,
            "Opened file context store"
        );
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.inner.shutdown.cancel();
        let pending = self.inner.flush_task.lock().take();
        if let Some(task) = pending {
            let _ = task.await;
        }
        self.inner.flush().await
    }

    async fn get(&self, scope: &str, key: &str) -> Result<Option<Value>> {
        if self.inner.cache_enabled {
            self.inner.ensure_loaded(scope).await?;
            return Ok(self
                .inner
                .cache
                .lock()
                .get(scope)
                .and_then(|data| get_path(data, key)));
        }
        let data = self.inner.read_scope(scope).await?;
        Ok(get_path(&data, key))
    }

    async fn set(&self, scope: &str, key: &str, value: Option<Value>) -> Result<()> {
        if !self.inner.cache_enabled {
            let _queue = self.inner.write_queue.lock().await;
            let mut data = self.inner.read_scope(scope).await?;
            if set_path(&mut data, key, value) {
                self.inner.write_scope(scope, &data).await?;
            }
            return Ok(());
        }

        self.inner.ensure_loaded(scope).await?;
        let changed = {
            let mut cache = self.inner.cache.lock();
            let data = cache.entry(scope.to_string()).or_default();
            set_path(data, key, value)
        };
        if !changed {
            return Ok(());
        }
        self.inner.dirty.lock().insert(scope.to_string());
        if !self.inner.schedule_flush() {
            // Closed: no more debouncing, write through
            let _queue = self.inner.write_queue.lock().await;
            self.inner.flush_scope_locked(scope).await?;
        }
        Ok(())
    }

    async fn keys(&self, scope: &str) -> Result<Vec<String>> {
        if self.inner.cache_enabled {
            self.inner.ensure_loaded(scope).await?;
            return Ok(self
                .inner
                .cache
                .lock()
                .get(scope)
                .map(|data| data.keys().cloned().collect())
                .unwrap_or_default());
        }
        let data = self.inner.read_scope(scope).await?;
        Ok(data.keys().cloned().collect())
    }

    async fn delete(&self, scope: &str) -> Result<()> {
        self.inner.cache.lock().remove(scope);
        self.inner.dirty.lock().remove(scope);
        let _queue = self.inner.write_queue.lock().await;
        match tokio::fs::remove_file(self.inner.scope_path(scope)).await {
            Err(e) if e.kind() != ErrorKind::NotFound => Err(e.into()),
            _ => Ok(()),
        }
    }

    async fn clean(&self, active_ids: &HashSet<String>) -> Result<()> {
        self.inner
            .cache
            .lock()
            .retain(|scope, _| scope_is_active(scope, active_ids));
        self.inner
            .dirty
            .lock()
            .retain(|scope| scope_is_active(scope, active_ids));

        let _queue = self.inner.write_queue.lock().await;
        let active: HashSet<String> = active_ids.iter().map(|id| file_id(id)).collect();
        let mut dirs = match tokio::fs::read_dir(&self.inner.root).await {
            Ok(dirs) => dirs,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(e.into()),
        };

        while let Some(entry) = dirs.next_entry().await? {
            if !entry.file_type().await?.is_dir() {
                continue;
            }
            let name = entry.file_name().to_string_lossy().into_owned();
            let (keep_file, flow_active) = if name == GLOBAL_SCOPE {
                ("global.json", true)
            } else {
                ("flow.json", active.contains(&name))
            };

            if !flow_active {
                tokio::fs::remove_dir_all(entry.path()).await?;
                tracing::debug!(flow = %name, "Removed context of deleted flow");
                continue;
            }

            let mut files = tokio::fs::read_dir(entry.path()).await?;
            while let Some(file) = files.next_entry().await? {
                let file_name = file.file_name().to_string_lossy().into_owned();
                if file_name == keep_file {
                    continue;
                }
                let Some(node) = file_name.strip_suffix(".json") else {
                    continue;
                };
                if !active.contains(node) {
                    tokio::fs::remove_file(file.path()).await?;
                    tracing::debug!(flow = %name, node, "Removed context of deleted node");
                }
            }
        }
        Ok(())
    }
}
