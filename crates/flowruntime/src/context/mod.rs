//! Scoped key/value context
//!
//! Every node, flow and the runtime as a whole get a context bucket
//! identified by a scope string:
//!
//! * `global`
//! * `<flowId>:flow`
//! * `<nodeId>:<flowId>`
//!
//! Buckets live in one or more named backends. Keys may select a backend
//! with a `key#store` suffix and walk up to the enclosing scope with a
//! `$parent.` prefix.

mod localfs;
mod memory;

pub use localfs::{LocalFileSystemBackend, LocalFileSystemConfig};
pub use memory::MemoryBackend;

use async_trait::async_trait;
use flowcore::{ContextAccess, FlowError, Result, GLOBAL_FLOW_ID};
use parking_lot::Mutex;
use serde::Deserialize;
use serde_json::{Map, Value};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::Path;
use std::sync::Arc;

/// Internal alias of the default store
pub const DEFAULT_STORE: &str = "_";

pub const GLOBAL_SCOPE: &str = "global";

const PARENT_PREFIX: &str = "$parent.";

/// Scope bucket contents: top-level key to value
pub type ScopeData = Map<String, Value>;

pub fn flow_scope(flow_id: &str) -> String {
    format!("{}:flow", flow_id)
}

pub fn node_scope(node_id: &str, flow_id: &str) -> String {
    format!("{}:{}", node_id, flow_id)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Scope<'a> {
    Global,
    Flow(&'a str),
    Node { node: &'a str, flow: &'a str },
}

pub(crate) fn parse_scope(scope: &str) -> Scope<'_> {
    if scope == GLOBAL_SCOPE {
        return Scope::Global;
    }
    if let Some(flow) = scope.strip_suffix(":flow") {
        return Scope::Flow(flow);
    }
    // Nodes cloned into a subflow instance are `<id>:<instance>` and live in
    // flow `<instance>`, so their scope ends in `:<flow>:<flow>`. Instance
    // ids may themselves contain ':' when subflows nest.
    for (i, _) in scope.match_indices(':') {
        let (node, flow) = (&scope[..i], &scope[i + 1..]);
        if node
            .strip_suffix(flow)
            .is_some_and(|rest| rest.ends_with(':'))
        {
            return Scope::Node { node, flow };
        }
    }
    match scope.rsplit_once(':') {
        Some((node, flow)) => Scope::Node { node, flow },
        None => Scope::Flow(scope),
    }
}

/// Whether a scope belongs to something still deployed. Global, and
/// anything owned by the global flow, always is. Node scopes count as
/// active when any split into a node and a flow id names both.
pub(crate) fn scope_is_active(scope: &str, active: &HashSet<String>) -> bool {
    let flow_active = |flow: &str| flow == GLOBAL_FLOW_ID || active.contains(flow);
    match parse_scope(scope) {
        Scope::Global => true,
        Scope::Flow(flow) => flow_active(flow),
        Scope::Node { .. } => scope.match_indices(':').any(|(i, _)| {
            flow_active(&scope[i + 1..]) && active.contains(&scope[..i])
        }),
    }
}

/// Resolve a dotted key path (`a.b.c`) inside a bucket
pub(crate) fn get_path(data: &ScopeData, key: &str) -> Option<Value> {
    let mut parts = key.split('.');
    let mut current = data.get(parts.next()?)?;
    for part in parts {
        current = match current {
            Value::Object(map) => map.get(part)?,
            Value::Array(items) => items.get(part.parse::<usize>().ok()?)?,
            _ => return None,
        };
    }
    Some(current.clone())
}

/// Set (or with `None`, delete) a dotted key path, creating intermediate
/// objects as needed. Returns whether the bucket changed.
pub(crate) fn set_path(data: &mut ScopeData, key: &str, value: Option<Value>) -> bool {
    match key.split_once('.') {
        None => match value {
            Some(v) => {
                if data.get(key) == Some(&v) {
                    return false;
                }
                data.insert(key.to_string(), v);
                true
            }
            None => data.remove(key).is_some(),
        },
        Some((head, rest)) => {
            if value.is_none() && !data.contains_key(head) {
                return false;
            }
            let entry = data
                .entry(head.to_string())
                .or_insert_with(|| Value::Object(Map::new()));
            if !entry.is_object() {
                if value.is_none() {
                    return false;
                }
                *entry = Value::Object(Map::new());
            }
            match entry.as_object_mut() {
                Some(child) => set_path(child, rest, value),
                None => false,
            }
        }
    }
}

/// Split `key#store` into its parts
pub fn split_store(key: &str) -> (&str, Option<&str>) {
    match key.rsplit_once('#') {
        Some((key, store)) if !key.is_empty() && !store.is_empty() => (key, Some(store)),
        _ => (key, None),
    }
}

/// Backend plug-in contract. Scope strings are opaque to callers but
/// backends may interpret them to lay out storage.
#[async_trait]
pub trait ContextBackend: Send + Sync {
    async fn open(&self) -> Result<()>;

    async fn close(&self) -> Result<()>;

    async fn get(&self, scope: &str, key: &str) -> Result<Option<Value>>;

    /// `None` deletes the key
    async fn set(&self, scope: &str, key: &str, value: Option<Value>) -> Result<()>;

    async fn keys(&self, scope: &str) -> Result<Vec<String>>;

    /// Drop a whole scope
    async fn delete(&self, scope: &str) -> Result<()>;

    /// Drop every scope whose node or flow id is not in `active_ids`
    async fn clean(&self, active_ids: &HashSet<String>) -> Result<()>;
}

/// One configured store
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "module", rename_all = "lowercase")]
pub enum StoreConfig {
    Memory,
    #[serde(rename = "localfilesystem")]
    LocalFileSystem(LocalFileSystemConfig),
}

/// `context_storage` runtime setting
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ContextStorageConfig {
    /// Store used for keys without a `#store` suffix
    #[serde(default)]
    pub default: Option<String>,

    #[serde(flatten)]
    pub stores: BTreeMap<String, StoreConfig>,
}

/// All context backends plus the global seed
pub struct ContextStore {
    stores: HashMap<String, Arc<dyn ContextBackend>>,
    default_store: String,
    seed: ScopeData,
    warned: Mutex<HashSet<String>>,
}

impl ContextStore {
    /// Single in-memory default store
    pub fn memory(seed: ScopeData) -> Self {
        let mut stores: HashMap<String, Arc<dyn ContextBackend>> = HashMap::new();
        stores.insert("memory".to_string(), Arc::new(MemoryBackend::new()));
        Self::with_stores(stores, "memory", seed)
    }

    pub fn with_stores(
        stores: HashMap<String, Arc<dyn ContextBackend>>,
        default_store: &str,
        seed: ScopeData,
    ) -> Self {
        Self {
            stores,
            default_store: default_store.to_string(),
            seed,
            warned: Mutex::new(HashSet::new()),
        }
    }

    /// Build the configured stores. Without configuration a single memory
    /// store is used; without an explicit default the first store by name is.
    pub fn from_config(config: &ContextStorageConfig, user_dir: &Path, seed: ScopeData) -> Result<Self> {
        if config.stores.is_empty() {
            return Ok(Self::memory(seed));
        }

        let mut stores: HashMap<String, Arc<dyn ContextBackend>> = HashMap::new();
        for (name, store) in &config.stores {
            let backend: Arc<dyn ContextBackend> = match store {
                StoreConfig::Memory => Arc::new(MemoryBackend::new()),
                StoreConfig::LocalFileSystem(fs) => {
                    Arc::new(LocalFileSystemBackend::new(fs.root(user_dir), fs))
                }
            };
            tracing::info!(store = %name, "Configured context store");
            stores.insert(name.clone(), backend);
        }

        let default_store = match &config.default {
            Some(name) if stores.contains_key(name) => name.clone(),
            Some(name) => {
                return Err(FlowError::InvalidRequest(format!(
                    "default context store '{}' is not configured",
                    name
                )))
            }
            None => match config.stores.keys().next() {
                Some(first) => first.clone(),
                None => return Ok(Self::memory(seed)),
            },
        };

        Ok(Self::with_stores(stores, &default_store, seed))
    }

    pub fn default_store(&self) -> &str {
        &self.default_store
    }

    /// Configured store names, sorted
    pub fn stores(&self) -> Vec<String> {
        let mut names: Vec<String> = self.stores.keys().cloned().collect();
        names.sort();
        names
    }

    /// Pick a backend by name. Unknown names fall back to the default store
    /// with a single warning per name.
    fn resolve(&self, store: Option<&str>) -> Result<(&str, &Arc<dyn ContextBackend>)> {
        let name = match store {
            None | Some(DEFAULT_STORE) | Some("default") => self.default_store.as_str(),
            Some(name) => {
                if let Some((known, backend)) = self.stores.get_key_value(name) {
                    return Ok((known.as_str(), backend));
                }
                if self.warned.lock().insert(name.to_string()) {
                    tracing::warn!(
                        store = %name,
                        default = %self.default_store,
                        "Unknown context store, using default"
                    );
                }
                self.default_store.as_str()
            }
        };
        let backend = self
            .stores
            .get(name)
            .ok_or_else(|| FlowError::Storage(format!("context store '{}' missing", name)))?;
        Ok((name, backend))
    }

    pub async fn open(&self) -> Result<()> {
        for (name, backend) in &self.stores {
            backend.open().await?;
            tracing::debug!(store = %name, "Opened context store");
        }
        Ok(())
    }

    pub async fn close(&self) -> Result<()> {
        for (name, backend) in &self.stores {
            if let Err(e) = backend.close().await {
                tracing::error!(store = %name, error = %e, "Failed to close context store");
            }
        }
        Ok(())
    }

    /// Look up `key` (optionally `key#store`) in a scope
    pub async fn get(&self, scope: &str, key: &str) -> Result<Option<Value>> {
        let (key, store) = split_store(key);
        let (name, backend) = self.resolve(store)?;
        let value = backend.get(scope, key).await?;
        if value.is_none() && scope == GLOBAL_SCOPE && name == self.default_store {
            return Ok(get_path(&self.seed, key));
        }
        Ok(value)
    }

    pub async fn get_many(&self, scope: &str, keys: &[&str]) -> Result<Vec<Option<Value>>> {
        let mut values = Vec::with_capacity(keys.len());
        for key in keys {
            values.push(self.get(scope, key).await?);
        }
        Ok(values)
    }

    pub async fn set(&self, scope: &str, key: &str, value: Option<Value>) -> Result<()> {
        let (key, store) = split_store(key);
        if key.is_empty() {
            return Err(FlowError::InvalidRequest("context key is empty".to_string()));
        }
        let (_, backend) = self.resolve(store)?;
        backend.set(scope, key, value).await
    }

    pub async fn set_many(&self, scope: &str, entries: Vec<(String, Option<Value>)>) -> Result<()> {
        for (key, value) in entries {
            self.set(scope, &key, value).await?;
        }
        Ok(())
    }

    /// Keys of a scope in one store. Global keys of the default store
    /// include the seed.
    pub async fn keys(&self, scope: &str, store: Option<&str>) -> Result<Vec<String>> {
        let (name, backend) = self.resolve(store)?;
        let mut keys = backend.keys(scope).await?;
        if scope == GLOBAL_SCOPE && name == self.default_store {
            for key in self.seed.keys() {
                if !keys.contains(key) {
                    keys.push(key.clone());
                }
            }
        }
        Ok(keys)
    }

    /// Drop a scope from every store
    pub async fn delete(&self, scope: &str) -> Result<()> {
        for backend in self.stores.values() {
            backend.delete(scope).await?;
        }
        Ok(())
    }

    pub async fn clean(&self, active_ids: &HashSet<String>) -> Result<()> {
        for (name, backend) in &self.stores {
            backend.clean(active_ids).await?;
            tracing::debug!(store = %name, active = active_ids.len(), "Cleaned context store");
        }
        Ok(())
    }

    pub fn global(self: &Arc<Self>) -> Arc<ContextHandle> {
        Arc::new(ContextHandle {
            store: Arc::clone(self),
            scope: GLOBAL_SCOPE.to_string(),
            parent: None,
        })
    }

    /// Flow context whose `$parent` is `parent` (global, or the flow
    /// containing a subflow instance)
    pub fn flow(self: &Arc<Self>, flow_id: &str, parent: Arc<ContextHandle>) -> Arc<ContextHandle> {
        Arc::new(ContextHandle {
            store: Arc::clone(self),
            scope: flow_scope(flow_id),
            parent: Some(parent),
        })
    }

    pub fn node(
        self: &Arc<Self>,
        node_id: &str,
        flow_id: &str,
        flow: Arc<ContextHandle>,
    ) -> Arc<ContextHandle> {
        Arc::new(ContextHandle {
            store: Arc::clone(self),
            scope: node_scope(node_id, flow_id),
            parent: Some(flow),
        })
    }
}

/// A scope bound to the store, chained to its parent scope
pub struct ContextHandle {
    store: Arc<ContextStore>,
    scope: String,
    parent: Option<Arc<ContextHandle>>,
}

impl ContextHandle {
    pub fn parent(&self) -> Option<&Arc<ContextHandle>> {
        self.parent.as_ref()
    }
}

#[async_trait]
impl ContextAccess for ContextHandle {
    fn scope(&self) -> &str {
        &self.scope
    }

    async fn get(&self, key: &str) -> Result<Option<Value>> {
        if let Some(rest) = key.strip_prefix(PARENT_PREFIX) {
            return match &self.parent {
                Some(parent) => parent.get(rest).await,
                None => Ok(None),
            };
        }
        if split_store(key).0 == "$parent" {
            return Ok(None);
        }
        self.store.get(&self.scope, key).await
    }

    async fn set(&self, key: &str, value: Option<Value>) -> Result<()> {
        if let Some(rest) = key.strip_prefix(PARENT_PREFIX) {
            return match &self.parent {
                Some(parent) => parent.set(rest, value).await,
                None => Err(FlowError::InvalidRequest(format!(
                    "scope {} has no parent context",
                    self.scope
                ))),
            };
        }
        if split_store(key).0 == "$parent" {
            return Err(FlowError::InvalidRequest("$parent is not a key".to_string()));
        }
        self.store.set(&self.scope, key, value).await
    }

    async fn keys(&self, store: Option<&str>) -> Result<Vec<String>> {
        self.store.keys(&self.scope, store).await
    }
}
