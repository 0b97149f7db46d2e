use flowcore::ContextAccess;
use flowruntime::context::{
    ContextBackend, ContextStorageConfig, ContextStore, LocalFileSystemBackend,
    LocalFileSystemConfig, MemoryBackend, ScopeData,
};
use serde_json::{json, Value};
use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::Arc;
use tempfile::TempDir;

fn fs_config(cache: bool) -> LocalFileSystemConfig {
    LocalFileSystemConfig {
        cache,
        flush_interval_secs: 3600,
        ..Default::default()
    }
}

fn active(ids: &[&str]) -> HashSet<String> {
    ids.iter().map(|s| s.to_string()).collect()
}

fn seed(value: Value) -> ScopeData {
    match value {
        Value::Object(map) => map,
        _ => ScopeData::new(),
    }
}

fn tmp_files(dir: &Path) -> Vec<String> {
    let mut found = Vec::new();
    for entry in std::fs::read_dir(dir).unwrap() {
        let entry = entry.unwrap();
        let path = entry.path();
        if path.is_dir() {
            found.extend(tmp_files(&path));
        } else if path.to_string_lossy().ends_with(".tmp") {
            found.push(path.display().to_string());
        }
    }
    found
}

#[tokio::test]
async fn test_file_store_round_trip() {
    let dir = TempDir::new().unwrap();
    let backend = LocalFileSystemBackend::new(dir.path(), &fs_config(true));
    backend.open().await.unwrap();
    backend.set("n1:f1", "count", Some(json!(3))).await.unwrap();
    backend.set("n1:f1", "nested.deep", Some(json!("x"))).await.unwrap();
    backend.set("global", "g", Some(json!(true))).await.unwrap();

    // Nothing written before the debounced flush
    assert!(!backend.scope_path("n1:f1").exists());
    backend.close().await.unwrap();

    assert!(dir.path().join("f1").join("n1.json").exists());
    assert!(dir.path().join("global").join("global.json").exists());
    assert!(tmp_files(dir.path()).is_empty());

    let reopened = LocalFileSystemBackend::new(dir.path(), &fs_config(true));
    reopened.open().await.unwrap();
    assert_eq!(reopened.get("n1:f1", "count").await.unwrap(), Some(json!(3)));
    assert_eq!(reopened.get("n1:f1", "nested.deep").await.unwrap(), Some(json!("x")));
    assert_eq!(reopened.get("global", "g").await.unwrap(), Some(json!(true)));
    assert_eq!(reopened.get("n1:f1", "missing").await.unwrap(), None);
}

#[tokio::test]
async fn test_uncached_store_writes_through() {
    let dir = TempDir::new().unwrap();
    let backend = LocalFileSystemBackend::new(dir.path(), &fs_config(false));
    backend.open().await.unwrap();
    backend.set("f1:flow", "k", Some(json!(1))).await.unwrap();

    let path = backend.scope_path("f1:flow");
    assert_eq!(path, dir.path().join("f1").join("flow.json"));
    let written: Value = serde_json::from_slice(&std::fs::read(&path).unwrap()).unwrap();
    assert_eq!(written, json!({"k": 1}));
    assert!(tmp_files(dir.path()).is_empty());
}

#[tokio::test]
async fn test_set_after_close_writes_through() {
    let dir = TempDir::new().unwrap();
    let backend = LocalFileSystemBackend::new(dir.path(), &fs_config(true));
    backend.open().await.unwrap();
    backend.close().await.unwrap();

    backend.set("n1:f1", "late", Some(json!("v"))).await.unwrap();
    assert!(backend.scope_path("n1:f1").exists());
}

#[tokio::test]
async fn test_subflow_ids_map_to_file_names() {
    let dir = TempDir::new().unwrap();
    let backend = LocalFileSystemBackend::new(dir.path(), &fs_config(true));
    assert_eq!(
        backend.scope_path("a:i1:i1"),
        dir.path().join("i1").join("a_i1.json")
    );
}

#[tokio::test]
async fn test_corrupt_file_is_a_storage_error() {
    let dir = TempDir::new().unwrap();
    std::fs::create_dir_all(dir.path().join("f1")).unwrap();
    std::fs::write(dir.path().join("f1").join("flow.json"), b"{not json").unwrap();

    let backend = LocalFileSystemBackend::new(dir.path(), &fs_config(true));
    let err = backend.get("f1:flow", "k").await.unwrap_err();
    assert_eq!(err.code(), "storage_error");
}

#[tokio::test]
async fn test_file_store_clean() {
    let dir = TempDir::new().unwrap();
    let backend = LocalFileSystemBackend::new(dir.path(), &fs_config(true));
    backend.open().await.unwrap();
    for scope in ["n1:f1", "n2:f1", "f1:flow", "n3:f2", "f2:flow", "global"] {
        backend.set(scope, "k", Some(json!(scope))).await.unwrap();
    }
    backend.flush().await.unwrap();

    let keep = active(&["f1", "n1"]);
    backend.clean(&keep).await.unwrap();
    assert!(dir.path().join("f1").join("n1.json").exists());
    assert!(dir.path().join("f1").join("flow.json").exists());
    assert!(!dir.path().join("f1").join("n2.json").exists());
    assert!(!dir.path().join("f2").exists());
    assert!(dir.path().join("global").join("global.json").exists());
    assert_eq!(backend.get("n2:f1", "k").await.unwrap(), None);

    // Cleaning twice changes nothing
    backend.clean(&keep).await.unwrap();
    assert_eq!(backend.get("n1:f1", "k").await.unwrap(), Some(json!("n1:f1")));
    assert_eq!(backend.get("global", "k").await.unwrap(), Some(json!("global")));
}

#[tokio::test]
async fn test_memory_store_clean() {
    let backend = MemoryBackend::new();
    for scope in ["n1:f1", "n2:f1", "f1:flow", "f2:flow", "global", "cfg:global"] {
        backend.set(scope, "k", Some(json!(1))).await.unwrap();
    }
    let keep = active(&["f1", "n1", "cfg"]);
    backend.clean(&keep).await.unwrap();
    backend.clean(&keep).await.unwrap();

    let mut scopes = backend.scopes();
    scopes.sort();
    assert_eq!(scopes, vec!["cfg:global", "f1:flow", "global", "n1:f1"]);
}

#[tokio::test]
async fn test_global_seed_is_a_fallback() {
    let store = ContextStore::memory(seed(json!({"answer": 42, "cfg": {"mode": "fast"}})));
    assert_eq!(store.get("global", "answer").await.unwrap(), Some(json!(42)));
    assert_eq!(store.get("global", "cfg.mode").await.unwrap(), Some(json!("fast")));
    assert_eq!(store.get("f1:flow", "answer").await.unwrap(), None);

    store.set("global", "answer", Some(json!(7))).await.unwrap();
    assert_eq!(store.get("global", "answer").await.unwrap(), Some(json!(7)));

    store.set("global", "answer", None).await.unwrap();
    assert_eq!(store.get("global", "answer").await.unwrap(), Some(json!(42)));

    let mut keys = store.keys("global", None).await.unwrap();
    keys.sort();
    assert_eq!(keys, vec!["answer", "cfg"]);
}

#[tokio::test]
async fn test_unknown_store_falls_back_to_default() {
    let mut stores: HashMap<String, Arc<dyn ContextBackend>> = HashMap::new();
    stores.insert("memory".to_string(), Arc::new(MemoryBackend::new()));
    stores.insert("other".to_string(), Arc::new(MemoryBackend::new()));
    let store = ContextStore::with_stores(stores, "memory", ScopeData::new());

    store.set("f1:flow", "k#nowhere", Some(json!(1))).await.unwrap();
    assert_eq!(store.get("f1:flow", "k").await.unwrap(), Some(json!(1)));
    assert_eq!(store.get("f1:flow", "k#other").await.unwrap(), None);

    store.set("f1:flow", "k#other", Some(json!(2))).await.unwrap();
    assert_eq!(store.get("f1:flow", "k#other").await.unwrap(), Some(json!(2)));
    assert_eq!(store.get("f1:flow", "k").await.unwrap(), Some(json!(1)));
}

#[tokio::test]
async fn test_empty_key_rejected() {
    let store = ContextStore::memory(ScopeData::new());
    let err = store.set("global", "", Some(json!(1))).await.unwrap_err();
    assert_eq!(err.code(), "invalid_request");
}

#[tokio::test]
async fn test_parent_chain() {
    let store = Arc::new(ContextStore::memory(ScopeData::new()));
    let global = store.global();
    let flow = store.flow("f1", Arc::clone(&global));
    let node = store.node("n1", "f1", Arc::clone(&flow));
    assert_eq!(node.scope(), "n1:f1");
    assert_eq!(flow.scope(), "f1:flow");

    node.set("$parent.shared", Some(json!("from node"))).await.unwrap();
    assert_eq!(flow.get("shared").await.unwrap(), Some(json!("from node")));
    assert_eq!(node.get("shared").await.unwrap(), None);

    global.set("top", Some(json!(1))).await.unwrap();
    assert_eq!(node.get("$parent.$parent.top").await.unwrap(), Some(json!(1)));

    assert_eq!(global.get("$parent.top").await.unwrap(), None);
    assert!(global.set("$parent.top", Some(json!(2))).await.is_err());
    assert_eq!(node.get("$parent").await.unwrap(), None);
}

#[tokio::test]
async fn test_store_from_config() {
    let dir = TempDir::new().unwrap();
    let config: ContextStorageConfig = serde_json::from_value(json!({
        "default": "file",
        "file": {"module": "localfilesystem", "cache": false},
        "memory": {"module": "memory"}
    }))
    .unwrap();
    let store = ContextStore::from_config(&config, dir.path(), ScopeData::new()).unwrap();
    assert_eq!(store.default_store(), "file");
    assert_eq!(store.stores(), vec!["file", "memory"]);

    store.open().await.unwrap();
    store.set("n1:f1", "k", Some(json!(1))).await.unwrap();
    store.set("n1:f1", "m#memory", Some(json!(2))).await.unwrap();
    assert!(dir.path().join("context").join("f1").join("n1.json").exists());
    assert_eq!(store.keys("n1:f1", Some("memory")).await.unwrap(), vec!["m"]);

    store.delete("n1:f1").await.unwrap();
    assert!(!dir.path().join("context").join("f1").join("n1.json").exists());
    assert_eq!(store.get("n1:f1", "m#memory").await.unwrap(), None);
    store.close().await.unwrap();
}

#[test]
fn test_unknown_default_store_rejected() {
    let config: ContextStorageConfig = serde_json::from_value(json!({
        "default": "missing",
        "memory": {"module": "memory"}
    }))
    .unwrap();
    let err = ContextStore::from_config(&config, Path::new("."), ScopeData::new())
        .err()
        .unwrap();
    assert_eq!(err.code(), "invalid_request");
}
