use async_trait::async_trait;
use flowcore::{
    EventBus, Message, Node, NodeConfig, NodeContext, NodeError, NodeId, NodeStatus, RuntimeEvent,
};
use flowruntime::credentials::{CredentialBlob, SecretSetting, VaultOptions};
use flowruntime::flows::{FLOW_STATE_KEY, FlowState, StateAction};
use flowruntime::storage::{MemoryStorage, RuntimeSettings, Storage};
use flowruntime::{
    ContextStore, CredentialDefinition, CredentialKind, DeploymentType, FlowManager, FlowRequest,
    NodeFactory, NodeMetadata, NodeRegistry,
};
use parking_lot::Mutex;
use serde_json::{json, Map, Value};
use std::sync::Arc;

#[derive(Clone, Default)]
struct Journal(Arc<Mutex<Vec<String>>>);

impl Journal {
    fn push(&self, entry: String) {
        self.0.lock().push(entry);
    }

    /// Entries so far, sorted, and clear
    fn take(&self) -> Vec<String> {
        let mut entries = std::mem::take(&mut *self.0.lock());
        entries.sort();
        entries
    }
}

struct RecordingNode {
    id: NodeId,
    node_type: String,
    journal: Journal,
}

#[async_trait]
impl Node for RecordingNode {
    fn node_type(&self) -> &str {
        &self.node_type
    }

    async fn start(&mut self, ctx: NodeContext) -> Result<(), NodeError> {
        if let Some(key) = ctx.credential("apiKey").and_then(Value::as_str) {
            self.journal.push(format!("cred:{}:{}", self.id, key));
        }
        self.journal.push(format!("start:{}", self.id));
        Ok(())
    }

    async fn close(&mut self, removed: bool) -> Result<(), NodeError> {
        let verb = if removed { "remove" } else { "close" };
        self.journal.push(format!("{}:{}", verb, self.id));
        Ok(())
    }

    async fn receive(&self, msg: Message) -> Result<(), NodeError> {
        self.journal.push(format!("recv:{}:{}", self.id, msg));
        Ok(())
    }

    fn rewire(&mut self, _wires: &[Vec<NodeId>]) {
        self.journal.push(format!("rewire:{}", self.id));
    }
}

struct RecordingFactory {
    node_type: String,
    journal: Journal,
    credentials: CredentialDefinition,
}

impl NodeFactory for RecordingFactory {
    fn create(&self, config: &NodeConfig) -> Result<Box<dyn Node>, NodeError> {
        Ok(Box::new(RecordingNode {
            id: config.id.clone(),
            node_type: self.node_type.clone(),
            journal: self.journal.clone(),
        }))
    }

    fn node_type(&self) -> &str {
        &self.node_type
    }

    fn metadata(&self) -> NodeMetadata {
        NodeMetadata {
            credentials: self.credentials.clone(),
            ..Default::default()
        }
    }
}

struct Harness {
    manager: Arc<FlowManager>,
    storage: Arc<MemoryStorage>,
    context: Arc<ContextStore>,
    events: Arc<EventBus>,
    journal: Journal,
}

fn registry(journal: &Journal) -> NodeRegistry {
    let mut api = CredentialDefinition::new();
    api.insert("apiKey".to_string(), CredentialKind::Password);

    let mut registry = NodeRegistry::new();
    for (node_type, credentials) in [
        ("test", api),
        ("catch", CredentialDefinition::new()),
        ("status", CredentialDefinition::new()),
    ] {
        registry.register(Arc::new(RecordingFactory {
            node_type: node_type.to_string(),
            journal: journal.clone(),
            credentials,
        }));
    }
    registry
}

async fn harness_with(storage: Arc<MemoryStorage>) -> Harness {
    let journal = Journal::default();
    let settings = Arc::new(
        RuntimeSettings::load(storage.clone() as Arc<dyn Storage>)
            .await
            .unwrap(),
    );
    let context = Arc::new(ContextStore::memory(Map::new()));
    let events = Arc::new(EventBus::new(64));
    let manager = Arc::new(FlowManager::new(
        Arc::new(registry(&journal)),
        storage.clone(),
        settings,
        Arc::clone(&context),
        Arc::clone(&events),
        VaultOptions {
            credential_secret: SecretSetting::Secret("test-secret".to_string()),
            project: None,
        },
    ));
    manager.load().await.unwrap();
    Harness {
        manager,
        storage,
        context,
        events,
        journal,
    }
}

async fn harness() -> Harness {
    harness_with(Arc::new(MemoryStorage::new())).await
}

fn node(id: &str, z: &str) -> NodeConfig {
    NodeConfig::new(id, "test").in_flow(z)
}

fn base_flows() -> Vec<NodeConfig> {
    vec![
        NodeConfig::tab("t1", "Main"),
        node("a", "t1").with_wires(vec![vec!["b"]]),
        node("b", "t1"),
        node("c", "t1").with_prop("x", 1),
        NodeConfig::tab("t2", "Other"),
        node("d", "t2"),
    ]
}

#[tokio::test]
async fn test_full_deploy_starts_everything() {
    let h = harness().await;
    let rev = h
        .manager
        .set_flows(base_flows(), DeploymentType::Full, None, Some("alice"))
        .await
        .unwrap();

    assert_eq!(rev, h.manager.revision());
    assert_eq!(h.manager.state(), FlowState::Started);
    assert_eq!(h.manager.running_nodes().await, vec!["a", "b", "c", "d"]);
    assert_eq!(h.journal.take(), vec!["start:a", "start:b", "start:c", "start:d"]);
    assert_eq!(h.storage.flows().len(), 6);

    // Full redeploy of the same config restarts every node
    h.manager
        .set_flows(base_flows(), DeploymentType::Full, None, None)
        .await
        .unwrap();
    assert_eq!(
        h.journal.take(),
        vec!["close:a", "close:b", "close:c", "close:d", "start:a", "start:b", "start:c", "start:d"]
    );
}

#[tokio::test]
async fn test_nodes_deploy_restarts_only_changed() {
    let h = harness().await;
    h.manager
        .set_flows(base_flows(), DeploymentType::Full, None, None)
        .await
        .unwrap();
    h.journal.take();

    let mut flows = base_flows();
    flows[3] = node("c", "t1").with_prop("x", 2);
    h.manager
        .set_flows(flows, DeploymentType::Nodes, None, None)
        .await
        .unwrap();
    assert_eq!(h.journal.take(), vec!["close:c", "start:c"]);
}

#[tokio::test]
async fn test_removed_node_is_closed_and_neighbour_rewired() {
    let h = harness().await;
    let flows = vec![
        NodeConfig::tab("t1", "Main"),
        node("n1", "t1").with_wires(vec![vec!["n2"]]),
        node("n2", "t1"),
    ];
    h.manager
        .set_flows(flows, DeploymentType::Full, None, None)
        .await
        .unwrap();
    h.journal.take();

    let flows = vec![
        NodeConfig::tab("t1", "Main"),
        node("n1", "t1").with_wires(vec![vec![]]),
    ];
    h.manager
        .set_flows(flows, DeploymentType::Nodes, None, None)
        .await
        .unwrap();
    assert_eq!(h.journal.take(), vec!["remove:n2", "rewire:n1"]);
    assert_eq!(h.manager.running_nodes().await, vec!["n1"]);
}

#[tokio::test]
async fn test_flows_deploy_restarts_touched_flow_only() {
    let h = harness().await;
    h.manager
        .set_flows(base_flows(), DeploymentType::Full, None, None)
        .await
        .unwrap();
    h.journal.take();

    let mut flows = base_flows();
    flows[3] = node("c", "t1").with_prop("x", 2);
    h.manager
        .set_flows(flows, DeploymentType::Flows, None, None)
        .await
        .unwrap();
    assert_eq!(
        h.journal.take(),
        vec!["close:a", "close:b", "close:c", "start:a", "start:b", "start:c"]
    );
}

#[tokio::test]
async fn test_stale_revision_is_a_conflict() {
    let h = harness().await;
    let rev = h
        .manager
        .set_flows(base_flows(), DeploymentType::Full, None, None)
        .await
        .unwrap();

    let err = h
        .manager
        .set_flows(vec![], DeploymentType::Full, Some("not-the-rev"), None)
        .await
        .unwrap_err();
    assert_eq!(err.code(), "conflict");
    assert_eq!(h.manager.revision(), rev);
    assert_eq!(h.manager.running_nodes().await.len(), 4);

    h.manager
        .set_flows(vec![], DeploymentType::Full, Some(&rev), None)
        .await
        .unwrap();
    assert!(h.manager.running_nodes().await.is_empty());
}

#[tokio::test]
async fn test_malformed_config_rejected_before_changes() {
    let h = harness().await;
    h.manager
        .set_flows(base_flows(), DeploymentType::Full, None, None)
        .await
        .unwrap();
    h.journal.take();

    let flows = vec![node("a", "t1"), node("a", "t1")];
    let err = h
        .manager
        .set_flows(flows, DeploymentType::Full, None, None)
        .await
        .unwrap_err();
    assert_eq!(err.code(), "invalid_request");
    assert!(h.journal.take().is_empty());
    assert_eq!(h.storage.flow_saves(), 1);
}

#[tokio::test]
async fn test_concurrent_flow_additions_both_land() {
    let h = harness().await;
    let flow_x = FlowRequest {
        id: Some("fx".to_string()),
        label: "X".to_string(),
        nodes: vec![NodeConfig::new("x", "test").with_credentials(json!({"apiKey": "kx"}))],
        ..Default::default()
    };
    let flow_y = FlowRequest {
        id: Some("fy".to_string()),
        label: "Y".to_string(),
        nodes: vec![NodeConfig::new("y", "test").with_credentials(json!({"apiKey": "ky"}))],
        ..Default::default()
    };

    let (rx, ry) = tokio::join!(
        h.manager.add_flow(flow_x, None),
        h.manager.add_flow(flow_y, None)
    );
    assert_eq!(rx.unwrap(), "fx");
    assert_eq!(ry.unwrap(), "fy");

    let ids: Vec<String> = h.manager.get_flows().flows.into_iter().map(|n| n.id).collect();
    for id in ["fx", "x", "fy", "y"] {
        assert!(ids.contains(&id.to_string()), "{} missing", id);
    }
    assert_eq!(h.manager.running_nodes().await, vec!["x", "y"]);
    for id in ["x", "y"] {
        let view = h.manager.get_node_credentials("test", id).await;
        assert_eq!(Value::Object(view), json!({"has_apiKey": true}));
    }
}

#[tokio::test]
async fn test_credentials_are_stripped_and_encrypted() {
    let h = harness().await;
    let flows = vec![
        NodeConfig::tab("t1", "Main"),
        node("a", "t1").with_credentials(json!({"apiKey": "secret123"})),
    ];
    h.manager
        .set_flows(flows, DeploymentType::Full, None, None)
        .await
        .unwrap();

    assert!(h.journal.take().contains(&"cred:a:secret123".to_string()));
    assert!(h.storage.flows().iter().all(|n| n.credentials.is_none()));
    assert!(h.manager.get_flows().flows.iter().all(|n| n.credentials.is_none()));
    assert!(matches!(h.storage.credentials(), CredentialBlob::Encrypted(_)));

    let view = h.manager.get_node_credentials("test", "a").await;
    assert_eq!(Value::Object(view), json!({"has_apiKey": true}));

    // Changing only the credential restarts the node
    let flows = vec![
        NodeConfig::tab("t1", "Main"),
        node("a", "t1").with_credentials(json!({"apiKey": "rotated"})),
    ];
    h.manager
        .set_flows(flows, DeploymentType::Nodes, None, None)
        .await
        .unwrap();
    assert_eq!(h.journal.take(), vec!["close:a", "cred:a:rotated", "start:a"]);
}

#[tokio::test]
async fn test_reload_restores_from_storage() {
    let storage = Arc::new(MemoryStorage::new());
    let h = harness_with(Arc::clone(&storage)).await;
    h.manager
        .set_flows(base_flows(), DeploymentType::Full, None, None)
        .await
        .unwrap();

    let second = harness_with(Arc::clone(&storage)).await;
    assert_eq!(second.manager.revision(), h.manager.revision());
    assert_eq!(second.manager.running_nodes().await, vec!["a", "b", "c", "d"]);

    storage
        .save_flows(&[NodeConfig::tab("t9", "Only")], None)
        .await
        .unwrap();
    second
        .manager
        .set_flows(vec![], DeploymentType::Reload, None, None)
        .await
        .unwrap();
    assert!(second.manager.running_nodes().await.is_empty());
    assert_eq!(second.manager.flow_ids().await, vec!["global", "t9"]);
}

#[tokio::test]
async fn test_flow_crud() {
    let h = harness().await;
    h.manager
        .set_flows(base_flows(), DeploymentType::Full, None, None)
        .await
        .unwrap();

    let flow = h.manager.get_flow("t2").unwrap();
    assert_eq!(flow.label, "Other");
    assert_eq!(flow.nodes.len(), 1);

    assert_eq!(h.manager.get_flow("nope").unwrap_err().code(), "not_found");
    assert_eq!(
        h.manager.delete_flow("nope", None).await.unwrap_err().code(),
        "not_found"
    );
    assert_eq!(
        h.manager
            .update_flow("nope", FlowRequest::default(), None)
            .await
            .unwrap_err()
            .code(),
        "not_found"
    );
    assert_eq!(
        h.manager.delete_flow("global", None).await.unwrap_err().code(),
        "invalid_request"
    );

    let mismatched = FlowRequest {
        id: Some("t1".to_string()),
        ..Default::default()
    };
    assert_eq!(
        h.manager
            .update_flow("t2", mismatched, None)
            .await
            .unwrap_err()
            .code(),
        "invalid_request"
    );

    h.journal.take();
    let update = FlowRequest {
        label: "Renamed".to_string(),
        nodes: vec![NodeConfig::new("d", "test"), NodeConfig::new("e", "test")],
        ..Default::default()
    };
    h.manager.update_flow("t2", update, None).await.unwrap();
    assert_eq!(h.manager.get_flow("t2").unwrap().label, "Renamed");
    assert_eq!(h.journal.take(), vec!["close:d", "start:d", "start:e"]);

    h.manager.delete_flow("t2", None).await.unwrap();
    assert_eq!(h.journal.take(), vec!["remove:d", "remove:e"]);
    assert_eq!(h.manager.get_flow("t2").unwrap_err().code(), "not_found");
    assert_eq!(h.manager.running_nodes().await, vec!["a", "b", "c"]);
}

#[tokio::test]
async fn test_global_flow_holds_config_nodes() {
    let h = harness().await;
    let mut flows = base_flows();
    flows.push(NodeConfig::new("cfg", "test"));
    h.manager
        .set_flows(flows, DeploymentType::Full, None, None)
        .await
        .unwrap();

    let global = h.manager.get_flow("global").unwrap();
    assert_eq!(global.configs.len(), 1);
    assert_eq!(global.configs[0].id, "cfg");
    assert_eq!(h.manager.flow_of("cfg").await.as_deref(), Some("global"));
    assert_eq!(h.manager.flow_of("a").await.as_deref(), Some("t1"));
}

#[tokio::test]
async fn test_stop_is_remembered() {
    let storage = Arc::new(MemoryStorage::new());
    let h = harness_with(Arc::clone(&storage)).await;
    h.manager
        .set_flows(base_flows(), DeploymentType::Full, None, None)
        .await
        .unwrap();
    h.journal.take();

    let report = h.manager.set_state(StateAction::Stop).await.unwrap();
    assert_eq!(report.state, FlowState::Stopped);
    assert!(h.manager.running_nodes().await.is_empty());
    assert_eq!(storage.settings().get(FLOW_STATE_KEY), Some(&json!("stop")));

    // Deploys while stopped do not start anything
    h.manager
        .set_flows(base_flows(), DeploymentType::Full, None, None)
        .await
        .unwrap();
    assert!(h.manager.running_nodes().await.is_empty());

    let restarted = harness_with(Arc::clone(&storage)).await;
    assert_eq!(restarted.manager.state(), FlowState::Stopped);
    assert!(restarted.manager.running_nodes().await.is_empty());

    let report = restarted.manager.set_state(StateAction::Start).await.unwrap();
    assert_eq!(report.state, FlowState::Started);
    assert_eq!(restarted.manager.running_nodes().await.len(), 4);
    assert_eq!(storage.settings().get(FLOW_STATE_KEY), Some(&json!("start")));
}

#[tokio::test]
async fn test_missing_types_hold_start() {
    let h = harness().await;
    let mut flows = base_flows();
    flows.push(NodeConfig::new("m", "mystery").in_flow("t1"));
    h.manager
        .set_flows(flows, DeploymentType::Full, None, None)
        .await
        .unwrap();

    let report = h.manager.get_state();
    assert_eq!(report.state, FlowState::Stopped);
    assert_eq!(report.missing_types, vec!["mystery"]);
    assert!(h.manager.running_nodes().await.is_empty());

    let err = h.manager.set_state(StateAction::Start).await.unwrap_err();
    assert_eq!(err.code(), "invalid_request");
}

#[tokio::test]
async fn test_removed_node_context_is_cleaned() {
    let h = harness().await;
    h.manager
        .set_flows(base_flows(), DeploymentType::Full, None, None)
        .await
        .unwrap();
    h.context.set("b:t1", "k", Some(json!(1))).await.unwrap();
    h.context.set("t2:flow", "k", Some(json!(2))).await.unwrap();
    h.context.set("global", "k", Some(json!(3))).await.unwrap();

    let flows = vec![NodeConfig::tab("t1", "Main"), node("a", "t1")];
    h.manager
        .set_flows(flows, DeploymentType::Nodes, None, None)
        .await
        .unwrap();
    assert_eq!(h.context.get("b:t1", "k").await.unwrap(), None);
    assert_eq!(h.context.get("t2:flow", "k").await.unwrap(), None);
    assert_eq!(h.context.get("global", "k").await.unwrap(), Some(json!(3)));
}

#[tokio::test]
async fn test_nested_subflow_context_survives_redeploy() {
    let h = harness().await;
    let flows = |x: i64| {
        vec![
            NodeConfig::tab("t1", "Main"),
            NodeConfig::new("sfa", "subflow"),
            NodeConfig::new("nb", "subflow:sfb").in_flow("sfa"),
            NodeConfig::new("sfb", "subflow"),
            NodeConfig::new("inner", "test").in_flow("sfb"),
            NodeConfig::new("i1", "subflow:sfa").in_flow("t1"),
            node("x", "t1").with_prop("x", x),
        ]
    };
    h.manager
        .set_flows(flows(1), DeploymentType::Full, None, None)
        .await
        .unwrap();
    assert!(h
        .manager
        .running_nodes()
        .await
        .contains(&"inner:nb:i1".to_string()));

    h.context
        .set("inner:nb:i1:nb:i1", "k", Some(json!(42)))
        .await
        .unwrap();
    h.context.set("nb:i1:flow", "k", Some(json!(7))).await.unwrap();

    h.manager
        .set_flows(flows(2), DeploymentType::Nodes, None, None)
        .await
        .unwrap();
    assert_eq!(
        h.context.get("inner:nb:i1:nb:i1", "k").await.unwrap(),
        Some(json!(42))
    );
    assert_eq!(h.context.get("nb:i1:flow", "k").await.unwrap(), Some(json!(7)));
}

#[tokio::test]
async fn test_errors_reach_catch_nodes() {
    let h = harness().await;
    let flows = vec![
        NodeConfig::tab("t1", "Main"),
        node("a", "t1").with_prop("name", "worker"),
        NodeConfig::new("scoped", "catch").in_flow("t1").with_prop("scope", json!(["b"])),
        NodeConfig::new("all", "catch").in_flow("t1"),
    ];
    h.manager
        .set_flows(flows, DeploymentType::Full, None, None)
        .await
        .unwrap();
    h.journal.take();

    h.manager
        .handle_event(&RuntimeEvent::NodeError {
            flow_id: "t1".to_string(),
            node_id: "a".to_string(),
            error: "boom".to_string(),
            timestamp: chrono::Utc::now(),
        })
        .await;

    let entries = h.journal.take();
    assert_eq!(entries.len(), 1);
    let msg: Value = serde_json::from_str(entries[0].trim_start_matches("recv:all:")).unwrap();
    assert_eq!(msg["error"]["message"], json!("boom"));
    assert_eq!(msg["error"]["source"]["id"], json!("a"));
    assert_eq!(msg["error"]["source"]["name"], json!("worker"));

    // Errors raised by catch nodes are not fed back to them
    h.manager
        .handle_event(&RuntimeEvent::NodeError {
            flow_id: "t1".to_string(),
            node_id: "all".to_string(),
            error: "loop".to_string(),
            timestamp: chrono::Utc::now(),
        })
        .await;
    assert!(h.journal.take().is_empty());
}

#[tokio::test]
async fn test_subflow_status_surfaces_on_instance() {
    let h = harness().await;
    let flows = vec![
        NodeConfig::tab("t1", "Main"),
        NodeConfig::new("sf", "subflow"),
        NodeConfig::new("inner", "test").in_flow("sf"),
        NodeConfig::new("i1", "subflow:sf").in_flow("t1"),
        NodeConfig::new("s", "status").in_flow("t1"),
    ];
    h.manager
        .set_flows(flows, DeploymentType::Full, None, None)
        .await
        .unwrap();
    assert_eq!(h.manager.running_nodes().await, vec!["i1", "inner:i1", "s"]);
    h.journal.take();

    let mut events = h.events.subscribe();
    h.manager
        .handle_event(&RuntimeEvent::NodeStatus {
            flow_id: "i1".to_string(),
            node_id: "inner:i1".to_string(),
            status: NodeStatus::text("busy").with_fill("blue"),
            timestamp: chrono::Utc::now(),
        })
        .await;

    // The instance node re-reports the status as its own
    let reported = loop {
        match events.recv().await.unwrap() {
            event @ RuntimeEvent::NodeStatus { .. } => break event,
            _ => continue,
        }
    };
    match &reported {
        RuntimeEvent::NodeStatus {
            flow_id,
            node_id,
            status,
            ..
        } => {
            assert_eq!(flow_id, "t1");
            assert_eq!(node_id, "i1");
            assert_eq!(status.text.as_deref(), Some("busy"));
        }
        _ => unreachable!(),
    }
    assert!(h.journal.take().is_empty());

    h.manager.handle_event(&reported).await;
    let entries = h.journal.take();
    assert_eq!(entries.len(), 1);
    let msg: Value = serde_json::from_str(entries[0].trim_start_matches("recv:s:")).unwrap();
    assert_eq!(msg["status"]["text"], json!("busy"));
    assert_eq!(msg["status"]["source"]["id"], json!("i1"));
}
