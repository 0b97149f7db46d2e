use super::{get_path, scope_is_active, set_path, ContextBackend, ScopeData};
use async_trait::async_trait;
use flowcore::Result;
use parking_lot::RwLock;
use serde_json::Value;
use std::collections::{HashMap, HashSet};

/// Process-local context store. Contents are lost on restart.
#[derive(Default)]
pub struct MemoryBackend {
    scopes: RwLock<HashMap<String, ScopeData>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Scopes currently holding data
    pub fn scopes(&self) -> Vec<String> {
        let mut scopes: Vec<String> = self.scopes.read().keys().cloned().collect();
        scopes.sort();
        scopes
    }
}

#[async_trait]
impl ContextBackend for MemoryBackend {
    async fn open(&self) -> Result<()> {
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        Ok(())
    }

    async fn get(&self, scope: &str, key: &str) -> Result<Option<Value>> {
        Ok(self
            .scopes
            .read()
            .get(scope)
            .and_then(|data| get_path(data, key)))
    }

    async fn set(&self, scope: &str, key: &str, value: Option<Value>) -> Result<()> {
        let mut scopes = self.scopes.write();
        if value.is_none() && !scopes.contains_key(scope) {
            return Ok(());
        }
        let data = scopes.entry(scope.to_string()).or_default();
        set_path(data, key, value);
        Ok(())
    }

    async fn keys(&self, scope: &str) -> Result<Vec<String>> {
        Ok(self
            .scopes
            .read()
            .get(scope)
            .map(|data| data.keys().cloned().collect())
            .unwrap_or_default())
    }

    async fn delete(&self, scope: &str) -> Result<()> {
        self.scopes.write().remove(scope);
        Ok(())
    }

    async fn clean(&self, active_ids: &HashSet<String>) -> Result<()> {
        self.scopes
            .write()
            .retain(|scope, _| scope_is_active(scope, active_ids));
        Ok(())
    }
}
