//! Flow lifecycle manager
//!
//! Owns the deployed configuration and the running flow arena. Every
//! mutating operation goes through one deploy lock, so deploys apply in
//! submission order and never interleave. Readers of the configuration
//! see a snapshot that is swapped wholesale.

use super::flow::{
    plan_flows, planned_ids, Flow, FlowPlan, NodeInstance, PlannedNode, SubflowInstanceNode,
    CATCH_TYPE, STATUS_TYPE,
};
use crate::context::{ContextHandle, ContextStore};
use crate::credentials::{CredentialMap, CredentialVault, KeyType, VaultOptions};
use crate::registry::NodeRegistry;
use crate::storage::{revision, Settings, Storage};
use flowcore::{
    diff_config, ContextAccess, DeployId, DiffResult, EventBus, FlowConfig, FlowError, FlowId,
    Node, NodeConfig, NodeContext, NodeError, NodeId, NodeStatus, Result, RuntimeEvent,
    GLOBAL_FLOW_ID,
};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::{BTreeSet, HashMap, HashSet};
use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Runtime setting recording a requested stop across restarts
pub const FLOW_STATE_KEY: &str = "flowState";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeploymentType {
    /// Stop everything, start everything
    #[default]
    Full,
    /// Restart only changed and removed nodes
    Nodes,
    /// Restart every flow that contains a touched node
    Flows,
    /// Reload configuration and credentials from storage
    Reload,
}

impl FromStr for DeploymentType {
    type Err = FlowError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "full" => Ok(DeploymentType::Full),
            "nodes" => Ok(DeploymentType::Nodes),
            "flows" => Ok(DeploymentType::Flows),
            "reload" => Ok(DeploymentType::Reload),
            other => Err(FlowError::InvalidRequest(format!(
                "unknown deployment type: {}",
                other
            ))),
        }
    }
}

impl fmt::Display for DeploymentType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            DeploymentType::Full => "full",
            DeploymentType::Nodes => "nodes",
            DeploymentType::Flows => "flows",
            DeploymentType::Reload => "reload",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FlowState {
    Stopped,
    Starting,
    Started,
    Stopping,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StateAction {
    Start,
    Stop,
}

impl FromStr for StateAction {
    type Err = FlowError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "start" => Ok(StateAction::Start),
            "stop" => Ok(StateAction::Stop),
            other => Err(FlowError::InvalidRequest(format!("unknown state: {}", other))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StateReport {
    pub state: FlowState,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub missing_types: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct FlowsSnapshot {
    pub flows: Vec<NodeConfig>,
    pub rev: String,
}

fn is_false(b: &bool) -> bool {
    !*b
}

/// A single flow as exchanged with the API layer. For the global flow,
/// `configs` and `subflows` carry the config nodes and subflow templates.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FlowRequest {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<FlowId>,
    #[serde(default)]
    pub label: String,
    #[serde(default, skip_serializing_if = "is_false")]
    pub disabled: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub info: Option<String>,
    #[serde(default)]
    pub nodes: Vec<NodeConfig>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub configs: Vec<NodeConfig>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub subflows: Vec<NodeConfig>,
}

impl FlowRequest {
    fn tab(&self, id: &str) -> NodeConfig {
        let mut tab = NodeConfig::tab(id, self.label.clone());
        tab.disabled = self.disabled;
        if let Some(info) = &self.info {
            tab.props.insert("info".to_string(), Value::String(info.clone()));
        }
        tab
    }

    /// Nodes of this request, placed in flow `id`
    fn into_nodes(self, id: &str) -> Vec<NodeConfig> {
        let mut nodes = vec![self.tab(id)];
        for mut node in self.nodes.into_iter().chain(self.configs) {
            node.z = Some(id.to_string());
            nodes.push(node);
        }
        nodes
    }
}

/// Whether a node belongs to the global flow: config nodes, subflow
/// templates and the nodes inside templates
fn in_global_flow(config: &FlowConfig, node: &NodeConfig) -> bool {
    if node.is_subflow_template() {
        return true;
    }
    match node.z.as_deref() {
        None | Some("") => !node.is_tab(),
        Some(z) => config.subflows.contains_key(z),
    }
}

fn new_flow_id() -> FlowId {
    hex::encode(rand::random::<[u8; 8]>())
}

struct ActiveConfig {
    config: FlowConfig,
    rev: String,
    missing_types: BTreeSet<String>,
}

pub struct FlowManager {
    registry: Arc<NodeRegistry>,
    storage: Arc<dyn Storage>,
    settings: Arc<dyn Settings>,
    context: Arc<ContextStore>,
    events: Arc<EventBus>,
    vault: Mutex<CredentialVault>,
    vault_options: VaultOptions,
    deploy_lock: Mutex<()>,
    active: parking_lot::RwLock<Arc<ActiveConfig>>,
    flows: RwLock<HashMap<FlowId, Flow>>,
    state: parking_lot::RwLock<FlowState>,
    stop_requested: AtomicBool,
}

impl FlowManager {
    pub fn new(
        registry: Arc<NodeRegistry>,
        storage: Arc<dyn Storage>,
        settings: Arc<dyn Settings>,
        context: Arc<ContextStore>,
        events: Arc<EventBus>,
        vault_options: VaultOptions,
    ) -> Self {
        let empty = ActiveConfig {
            config: FlowConfig::default(),
            rev: String::new(),
            missing_types: BTreeSet::new(),
        };
        Self {
            registry,
            storage,
            vault: Mutex::new(CredentialVault::new(Arc::clone(&settings))),
            settings,
            context,
            events,
            vault_options,
            deploy_lock: Mutex::new(()),
            active: parking_lot::RwLock::new(Arc::new(empty)),
            flows: RwLock::new(HashMap::new()),
            state: parking_lot::RwLock::new(FlowState::Stopped),
            stop_requested: AtomicBool::new(false),
        }
    }

    pub fn state(&self) -> FlowState {
        *self.state.read()
    }

    fn set_flow_state(&self, state: FlowState) {
        *self.state.write() = state;
    }

    pub fn get_state(&self) -> StateReport {
        StateReport {
            state: self.state(),
            missing_types: self.active.read().missing_types.iter().cloned().collect(),
        }
    }

    pub fn get_flows(&self) -> FlowsSnapshot {
        let active = Arc::clone(&self.active.read());
        FlowsSnapshot {
            flows: active.config.nodes().to_vec(),
            rev: active.rev.clone(),
        }
    }

    pub fn revision(&self) -> String {
        self.active.read().rev.clone()
    }

    pub async fn credential_key_type(&self) -> KeyType {
        self.vault.lock().await.key_type()
    }

    /// Ids of all running node instances, sorted
    pub async fn running_nodes(&self) -> Vec<NodeId> {
        let arena = self.flows.read().await;
        let mut ids: Vec<NodeId> = arena
            .values()
            .flat_map(|f| f.running_nodes().cloned())
            .collect();
        ids.sort();
        ids
    }

    /// Ids of the flows in the arena, sorted
    pub async fn flow_ids(&self) -> Vec<FlowId> {
        let mut ids: Vec<FlowId> = self.flows.read().await.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Flow a running-generation node belongs to
    pub async fn flow_of(&self, node_id: &str) -> Option<FlowId> {
        self.flows
            .read()
            .await
            .values()
            .find(|f| f.configs.contains_key(node_id))
            .map(|f| f.id.clone())
    }

    /// Drop context of everything that is not part of the active
    /// configuration
    pub async fn clean_context(&self) -> Result<()> {
        let active = Arc::clone(&self.active.read());
        let plans = plan_flows(&active.config);
        self.context.clean(&context_ids(&active.config, &plans)).await
    }

    /// Load configuration and credentials from storage and start. A stop
    /// requested before the last shutdown is honoured.
    pub async fn load(&self) -> Result<String> {
        let _deploy = self.deploy_lock.lock().await;
        let stopped = self
            .settings
            .get(FLOW_STATE_KEY)
            .await
            .is_some_and(|v| v.as_str() == Some("stop"));
        self.stop_requested.store(stopped, Ordering::SeqCst);
        if stopped {
            tracing::info!("Flows were stopped by request, not starting them");
        }
        self.reload_locked(Uuid::new_v4()).await
    }

    /// Replace the active configuration.
    ///
    /// With `expected_rev` set the deploy is rejected unless it matches the
    /// current revision. Returns the new revision.
    pub async fn set_flows(
        &self,
        nodes: Vec<NodeConfig>,
        deployment: DeploymentType,
        expected_rev: Option<&str>,
        user: Option<&str>,
    ) -> Result<String> {
        let _deploy = self.deploy_lock.lock().await;
        if let Some(expected) = expected_rev {
            let actual = self.revision();
            if expected != actual {
                return Err(FlowError::Conflict {
                    expected: expected.to_string(),
                    actual,
                });
            }
        }

        let deploy_id = Uuid::new_v4();
        if deployment == DeploymentType::Reload {
            return self.reload_locked(deploy_id).await;
        }
        self.apply_locked(deploy_id, nodes, deployment, user).await
    }

    pub fn get_flow(&self, id: &str) -> Result<FlowRequest> {
        let active = Arc::clone(&self.active.read());
        let config = &active.config;

        if id == GLOBAL_FLOW_ID {
            let subflows = config
                .nodes()
                .iter()
                .filter(|n| {
                    n.is_subflow_template()
                        || n.z.as_deref().is_some_and(|z| config.subflows.contains_key(z))
                })
                .cloned()
                .collect();
            return Ok(FlowRequest {
                id: Some(GLOBAL_FLOW_ID.to_string()),
                configs: config.configs.clone(),
                subflows,
                ..Default::default()
            });
        }

        let flow = config
            .flows
            .get(id)
            .ok_or_else(|| FlowError::NotFound(format!("flow {}", id)))?;
        Ok(FlowRequest {
            id: Some(flow.id.clone()),
            label: flow.label.clone(),
            disabled: flow.disabled,
            info: flow
                .config
                .props
                .get("info")
                .and_then(Value::as_str)
                .map(str::to_string),
            nodes: flow.nodes.clone(),
            ..Default::default()
        })
    }

    /// Add a tab. Returns its id, generated when the request has none.
    pub async fn add_flow(&self, flow: FlowRequest, user: Option<&str>) -> Result<FlowId> {
        let _deploy = self.deploy_lock.lock().await;
        let active = Arc::clone(&self.active.read());

        let id = match flow.id.clone() {
            Some(id) if !id.is_empty() => {
                if active.config.contains(&id) || id == GLOBAL_FLOW_ID {
                    return Err(FlowError::InvalidRequest(format!("id {} already in use", id)));
                }
                id
            }
            _ => new_flow_id(),
        };

        let mut nodes = active.config.nodes().to_vec();
        nodes.extend(flow.into_nodes(&id));
        self.apply_locked(Uuid::new_v4(), nodes, DeploymentType::Flows, user)
            .await?;
        tracing::info!(flow_id = %id, "Added flow");
        Ok(id)
    }

    /// Replace a tab, or with `global`, the config nodes and subflows
    pub async fn update_flow(&self, id: &str, flow: FlowRequest, user: Option<&str>) -> Result<FlowId> {
        let _deploy = self.deploy_lock.lock().await;
        let active = Arc::clone(&self.active.read());
        let config = &active.config;

        if let Some(body_id) = flow.id.as_deref() {
            if body_id != id {
                return Err(FlowError::InvalidRequest(format!(
                    "flow id {} does not match {}",
                    body_id, id
                )));
            }
        }

        let nodes: Vec<NodeConfig> = if id == GLOBAL_FLOW_ID {
            let mut nodes: Vec<NodeConfig> = config
                .nodes()
                .iter()
                .filter(|n| !in_global_flow(config, n))
                .cloned()
                .collect();
            nodes.extend(flow.configs);
            nodes.extend(flow.subflows);
            nodes
        } else {
            if !config.flows.contains_key(id) {
                return Err(FlowError::NotFound(format!("flow {}", id)));
            }
            let mut nodes: Vec<NodeConfig> = config
                .nodes()
                .iter()
                .filter(|n| n.id != id && n.z.as_deref() != Some(id))
                .cloned()
                .collect();
            nodes.extend(flow.into_nodes(id));
            nodes
        };

        self.apply_locked(Uuid::new_v4(), nodes, DeploymentType::Flows, user)
            .await?;
        tracing::info!(flow_id = %id, "Updated flow");
        Ok(id.to_string())
    }

    pub async fn delete_flow(&self, id: &str, user: Option<&str>) -> Result<()> {
        let _deploy = self.deploy_lock.lock().await;
        let active = Arc::clone(&self.active.read());
        if id == GLOBAL_FLOW_ID {
            return Err(FlowError::InvalidRequest(
                "the global flow cannot be deleted".to_string(),
            ));
        }
        if !active.config.flows.contains_key(id) {
            return Err(FlowError::NotFound(format!("flow {}", id)));
        }

        let nodes: Vec<NodeConfig> = active
            .config
            .nodes()
            .iter()
            .filter(|n| n.id != id && n.z.as_deref() != Some(id))
            .cloned()
            .collect();
        self.apply_locked(Uuid::new_v4(), nodes, DeploymentType::Flows, user)
            .await?;
        tracing::info!(flow_id = %id, "Deleted flow");
        Ok(())
    }

    /// Start or stop all flows. The request is recorded in settings so that
    /// a restart keeps stopped flows stopped.
    pub async fn set_state(&self, action: StateAction) -> Result<StateReport> {
        let _deploy = self.deploy_lock.lock().await;
        let deploy_id = Uuid::new_v4();

        match action {
            StateAction::Stop => {
                self.stop_requested.store(true, Ordering::SeqCst);
                self.settings
                    .set(FLOW_STATE_KEY, Value::String("stop".to_string()))
                    .await?;
                if self.state() != FlowState::Stopped {
                    self.stop_all_locked(deploy_id).await;
                }
            }
            StateAction::Start => {
                let active = Arc::clone(&self.active.read());
                if !active.missing_types.is_empty() {
                    return Err(FlowError::InvalidRequest(format!(
                        "cannot start flows, missing node types: {}",
                        active.missing_types.iter().cloned().collect::<Vec<_>>().join(", ")
                    )));
                }
                self.stop_requested.store(false, Ordering::SeqCst);
                self.settings
                    .set(FLOW_STATE_KEY, Value::String("start".to_string()))
                    .await?;
                if self.state() != FlowState::Started {
                    let plans = plan_flows(&active.config);
                    let ids = context_ids(&active.config, &plans);
                    self.redeploy(deploy_id, DeploymentType::Full, &DiffResult::default(), &plans, &ids, true)
                        .await;
                    self.events.emit(RuntimeEvent::FlowsStarted {
                        deploy_id,
                        deployment_type: DeploymentType::Full.to_string(),
                        revision: Some(active.rev.clone()),
                        timestamp: chrono::Utc::now(),
                    });
                }
            }
        }
        Ok(self.get_state())
    }

    /// Close every running node. Used on runtime shutdown; the configuration
    /// and the recorded flow state are left alone.
    pub async fn stop(&self) {
        let _deploy = self.deploy_lock.lock().await;
        self.stop_all_locked(Uuid::new_v4()).await;
    }

    /// Editor-safe view of a node's stored credentials
    pub async fn get_node_credentials(&self, node_type: &str, id: &str) -> CredentialMap {
        let definition = self.registry.credential_definition(node_type);
        self.vault.lock().await.safe_view(id, definition.as_ref())
    }

    fn missing_types(&self, config: &FlowConfig) -> BTreeSet<String> {
        config.missing_types(|t| self.registry.is_known(t))
    }

    async fn reload_locked(&self, deploy_id: DeployId) -> Result<String> {
        let stored = self.storage.get_flows().await?;
        self.vault
            .lock()
            .await
            .load(stored.credentials, &self.vault_options)
            .await?;
        let config = FlowConfig::parse(stored.flows)?;
        let missing = self.missing_types(&config);
        if !missing.is_empty() {
            tracing::warn!(missing = ?missing, "Waiting for missing node types");
        }

        let plans = plan_flows(&config);
        let ids = context_ids(&config, &plans);
        let start_nodes = missing.is_empty() && !self.stop_requested.load(Ordering::SeqCst);
        tracing::info!(deploy_id = %deploy_id, rev = %stored.rev, "Loading flows");

        *self.active.write() = Arc::new(ActiveConfig {
            config,
            rev: stored.rev.clone(),
            missing_types: missing,
        });
        self.redeploy(deploy_id, DeploymentType::Full, &DiffResult::default(), &plans, &ids, start_nodes)
            .await;

        // Plaintext found with a key configured, or a key migration
        self.save_credentials().await?;

        if start_nodes {
            self.events.emit(RuntimeEvent::FlowsStarted {
                deploy_id,
                deployment_type: DeploymentType::Reload.to_string(),
                revision: Some(stored.rev.clone()),
                timestamp: chrono::Utc::now(),
            });
        }
        Ok(stored.rev)
    }

    async fn apply_locked(
        &self,
        deploy_id: DeployId,
        mut nodes: Vec<NodeConfig>,
        deployment: DeploymentType,
        user: Option<&str>,
    ) -> Result<String> {
        // Reject malformed input before any state changes
        FlowConfig::parse(nodes.clone())?;

        let (config, credentials_changed) = {
            let mut vault = self.vault.lock().await;
            let mut changed = BTreeSet::new();
            for node in nodes.iter_mut() {
                let category = self.registry.category(&node.node_type);
                if vault.extract(node, &category) {
                    changed.insert(node.id.clone());
                }
            }
            let config = FlowConfig::parse(nodes)?;
            vault.clean(&config);
            (config, changed)
        };

        let previous = Arc::clone(&self.active.read());
        let mut diff = diff_config(&previous.config, &config);
        let users: Vec<NodeId> = config
            .nodes()
            .iter()
            .filter(|n| credentials_changed.iter().any(|c| *c != n.id && n.references(c)))
            .map(|n| n.id.clone())
            .collect();
        diff.promote_changed(credentials_changed.iter().chain(users.iter()));
        tracing::info!(deploy_id = %deploy_id, deployment = %deployment, %diff, "Deploying flows");

        let missing = self.missing_types(&config);
        if !missing.is_empty() {
            tracing::warn!(missing = ?missing, "Waiting for missing node types, flows not started");
        }
        let start_nodes = missing.is_empty() && !self.stop_requested.load(Ordering::SeqCst);
        let plans = plan_flows(&config);
        let ids = context_ids(&config, &plans);

        let computed_rev = revision(config.nodes())?;
        let nodes_to_save = config.nodes().to_vec();
        *self.active.write() = Arc::new(ActiveConfig {
            config,
            rev: computed_rev.clone(),
            missing_types: missing,
        });

        let effective = if start_nodes { deployment } else { DeploymentType::Full };
        self.redeploy(deploy_id, effective, &diff, &plans, &ids, start_nodes)
            .await;
        if start_nodes {
            self.events.emit(RuntimeEvent::FlowsStarted {
                deploy_id,
                deployment_type: deployment.to_string(),
                revision: Some(computed_rev.clone()),
                timestamp: chrono::Utc::now(),
            });
        }

        let rev = match self.storage.save_flows(&nodes_to_save, user).await {
            Ok(rev) => rev,
            Err(e) => {
                tracing::error!(deploy_id = %deploy_id, error = %e, "Failed to save flows");
                return Err(e);
            }
        };
        if rev != computed_rev {
            let current = Arc::clone(&self.active.read());
            *self.active.write() = Arc::new(ActiveConfig {
                config: current.config.clone(),
                rev: rev.clone(),
                missing_types: current.missing_types.clone(),
            });
        }
        self.save_credentials().await?;

        self.events.emit(RuntimeEvent::deployed(deploy_id, rev.clone(), &diff));
        tracing::info!(deploy_id = %deploy_id, rev = %rev, "Deploy complete");
        Ok(rev)
    }

    async fn save_credentials(&self) -> Result<()> {
        let mut vault = self.vault.lock().await;
        if !vault.dirty() {
            return Ok(());
        }
        let blob = vault.export()?;
        if let Err(e) = self.storage.save_credentials(&blob).await {
            vault.mark_dirty();
            tracing::error!(error = %e, "Failed to save credentials");
            return Err(e);
        }
        vault.export_saved().await
    }

    async fn stop_all_locked(&self, deploy_id: DeployId) {
        let mut arena = self.flows.write().await;
        self.set_flow_state(FlowState::Stopping);
        let closing: Vec<(FlowId, NodeId, NodeInstance)> = arena
            .values_mut()
            .flat_map(|flow| {
                let flow_id = flow.id.clone();
                flow.active
                    .drain()
                    .map(move |(id, instance)| (flow_id.clone(), id, instance))
            })
            .collect();
        tracing::info!(deploy_id = %deploy_id, nodes = closing.len(), "Stopping flows");
        self.close_nodes(closing, &HashSet::new()).await;
        self.set_flow_state(FlowState::Stopped);
        self.events.emit(RuntimeEvent::FlowsStopped {
            deploy_id,
            timestamp: chrono::Utc::now(),
        });
    }

    /// Stop what the deploy requires, clean context, then rebuild the arena
    /// for `plans`, starting whatever is not already running.
    async fn redeploy(
        &self,
        deploy_id: DeployId,
        deployment: DeploymentType,
        diff: &DiffResult,
        plans: &[FlowPlan],
        active_ids: &HashSet<String>,
        start_nodes: bool,
    ) {
        let mut arena = self.flows.write().await;
        let planned: HashMap<&str, &PlannedNode> = plans
            .iter()
            .flat_map(|p| p.nodes.iter().map(|n| (n.config.id.as_str(), n)))
            .collect();

        let stopping = match (deployment, start_nodes) {
            (DeploymentType::Nodes, true) | (DeploymentType::Flows, true) => {
                stop_set(&arena, deployment, diff, plans, &planned)
            }
            _ => arena
                .values()
                .flat_map(|f| f.running_nodes().cloned())
                .collect(),
        };

        if !stopping.is_empty() {
            self.set_flow_state(FlowState::Stopping);
            let mut closing = Vec::new();
            for flow in arena.values_mut() {
                let ids: Vec<NodeId> = flow
                    .active
                    .keys()
                    .filter(|id| stopping.contains(*id))
                    .cloned()
                    .collect();
                for id in ids {
                    if let Some(instance) = flow.active.remove(&id) {
                        closing.push((flow.id.clone(), id, instance));
                    }
                }
            }
            tracing::info!(deploy_id = %deploy_id, nodes = closing.len(), "Stopping nodes");
            let keep: HashSet<&str> = planned.keys().copied().collect();
            self.close_nodes(closing, &keep).await;
            if matches!(deployment, DeploymentType::Full | DeploymentType::Reload) {
                self.events.emit(RuntimeEvent::FlowsStopped {
                    deploy_id,
                    timestamp: chrono::Utc::now(),
                });
            }
        }

        if let Err(e) = self.context.clean(active_ids).await {
            tracing::error!(deploy_id = %deploy_id, error = %e, "Failed to clean context");
        }

        if start_nodes {
            self.set_flow_state(FlowState::Starting);
        }
        let started = self.build_arena(&mut arena, plans, diff, start_nodes).await;
        self.set_flow_state(if start_nodes {
            FlowState::Started
        } else {
            FlowState::Stopped
        });
        tracing::info!(deploy_id = %deploy_id, started, flows = arena.len(), "Flows applied");
    }

    /// Close nodes concurrently. Failures are logged and reported, never
    /// propagated. Nodes absent from `keep` are told they were removed.
    async fn close_nodes(&self, closing: Vec<(FlowId, NodeId, NodeInstance)>, keep: &HashSet<&str>) {
        let closes = closing.into_iter().map(|(flow_id, id, instance)| {
            let removed = !keep.contains(id.as_str());
            let events = self.events.create_emitter(&flow_id, &id);
            async move {
                instance.cancellation.cancel();
                let result = instance.node.write().await.close(removed).await;
                match result {
                    Ok(()) => tracing::debug!(node_id = %id, flow_id = %flow_id, removed, "Node stopped"),
                    Err(e) => {
                        tracing::error!(node_id = %id, flow_id = %flow_id, error = %e, "Node close failed");
                        events.error(e.to_string());
                    }
                }
            }
        });
        futures::future::join_all(closes).await;
    }

    /// Replace the arena with the flows of `plans`. Running instances are
    /// carried over, rewired when their wiring or neighbours moved; the rest
    /// are created and started. Returns the number of nodes started.
    async fn build_arena(
        &self,
        arena: &mut HashMap<FlowId, Flow>,
        plans: &[FlowPlan],
        diff: &DiffResult,
        start_nodes: bool,
    ) -> usize {
        let mut survivors: HashMap<NodeId, NodeInstance> = arena
            .drain()
            .flat_map(|(_, flow)| flow.active.into_iter())
            .collect();
        let global = self.context.global();
        let mut contexts: HashMap<FlowId, Arc<ContextHandle>> = HashMap::new();
        let mut started = 0;

        for plan in plans {
            let context = match &plan.parent {
                None => Arc::clone(&global),
                Some(parent) => {
                    let parent_context = match plan.subflow {
                        Some(_) => contexts.get(parent).cloned().unwrap_or_else(|| Arc::clone(&global)),
                        None => Arc::clone(&global),
                    };
                    self.context.flow(&plan.id, parent_context)
                }
            };
            contexts.insert(plan.id.clone(), Arc::clone(&context));
            let mut flow = Flow::new(plan.id.clone(), plan.parent.clone(), plan.subflow.clone(), context);

            for planned in &plan.nodes {
                let id = planned.config.id.clone();
                flow.configs.insert(id.clone(), planned.config.clone());

                if let Some(mut instance) = survivors.remove(&id) {
                    if diff.needs_rewire(&id) || instance.config.wires != planned.config.wires {
                        instance.node.write().await.rewire(&planned.config.wires);
                        tracing::debug!(node_id = %id, flow_id = %plan.id, "Node rewired");
                    }
                    instance.config = planned.config.clone();
                    flow.active.insert(id, instance);
                    continue;
                }
                if !start_nodes {
                    continue;
                }
                match self.start_node(&flow, planned).await {
                    Ok(instance) => {
                        started += 1;
                        flow.active.insert(id, instance);
                    }
                    Err(e) => {
                        tracing::error!(node_id = %id, flow_id = %plan.id, error = %e, "Node failed to start");
                        self.events.create_emitter(&plan.id, &id).error(e.to_string());
                    }
                }
            }
            arena.insert(plan.id.clone(), flow);
        }

        if !survivors.is_empty() {
            let leftovers = survivors
                .into_iter()
                .map(|(id, instance)| {
                    let flow_id = instance.config.z.clone().unwrap_or_else(|| GLOBAL_FLOW_ID.to_string());
                    (flow_id, id, instance)
                })
                .collect();
            self.close_nodes(leftovers, &HashSet::new()).await;
        }
        started
    }

    async fn start_node(&self, flow: &Flow, planned: &PlannedNode) -> std::result::Result<NodeInstance, NodeError> {
        let config = &planned.config;
        let mut node: Box<dyn Node> = if config.subflow_template().is_some() {
            Box::new(SubflowInstanceNode::new(config.node_type.clone()))
        } else {
            self.registry.create_node(config)?
        };

        let credentials = self
            .vault
            .lock()
            .await
            .get(&planned.credential_id)
            .cloned()
            .unwrap_or_default();
        let context: Arc<dyn ContextAccess> =
            self.context.node(&config.id, &flow.id, Arc::clone(&flow.context));
        let cancellation = CancellationToken::new();

        node.start(NodeContext {
            node_id: config.id.clone(),
            flow_id: flow.id.clone(),
            config: config.clone(),
            credentials,
            context,
            events: self.events.create_emitter(&flow.id, &config.id),
            cancellation: cancellation.clone(),
        })
        .await?;
        tracing::debug!(node_id = %config.id, flow_id = %flow.id, node_type = %config.node_type, "Node started");

        Ok(NodeInstance {
            config: config.clone(),
            node: Arc::new(RwLock::new(node)),
            cancellation,
        })
    }

    /// Route status and error events to status and catch nodes
    pub async fn handle_event(&self, event: &RuntimeEvent) {
        match event {
            RuntimeEvent::NodeStatus {
                flow_id,
                node_id,
                status,
                ..
            } => self.handle_status(flow_id, node_id, status).await,
            RuntimeEvent::NodeError {
                flow_id,
                node_id,
                error,
                ..
            } => self.handle_error(flow_id, node_id, error).await,
            _ => {}
        }
    }

    /// Offer a status change to status nodes of the reporting flow, then up
    /// the parent chain. Leaving a subflow, the status is handed to the
    /// instance node, which reports it as its own.
    async fn handle_status(&self, flow_id: &str, node_id: &str, status: &NodeStatus) {
        let delivery = {
            let arena = self.flows.read().await;
            let Some(mut current) = arena.get(flow_id) else {
                return;
            };
            if current.configs.get(node_id).is_some_and(|c| c.node_type == STATUS_TYPE) {
                return;
            }
            let mut reporter = node_id.to_string();
            loop {
                let targets = current.status_targets(&reporter);
                if !targets.is_empty() {
                    let mut body = serde_json::to_value(status).unwrap_or_else(|_| json!({}));
                    if let Value::Object(map) = &mut body {
                        map.insert("source".to_string(), current.source(&reporter));
                    }
                    break Some((targets, json!({ "status": body })));
                }
                let Some(parent) = current.parent.as_ref().and_then(|p| arena.get(p)) else {
                    break None;
                };
                if current.is_subflow() {
                    if let Some(instance) = parent.active.get(&current.id) {
                        let handoff = vec![(current.id.clone(), Arc::clone(&instance.node))];
                        break Some((handoff, json!({ "status": status })));
                    }
                    reporter = current.id.clone();
                }
                current = parent;
            }
        };

        let Some((targets, msg)) = delivery else {
            return;
        };
        for (id, node) in targets {
            if let Err(e) = node.read().await.receive(msg.clone()).await {
                tracing::warn!(node_id = %id, error = %e, "Status delivery failed");
            }
        }
    }

    /// Offer an error to catch nodes of the reporting flow, then up the
    /// parent chain. Errors leaving a subflow are reported as coming from
    /// its instance node.
    async fn handle_error(&self, flow_id: &str, node_id: &str, error: &str) {
        let delivery = {
            let arena = self.flows.read().await;
            let Some(mut current) = arena.get(flow_id) else {
                return;
            };
            if current.configs.get(node_id).is_some_and(|c| c.node_type == CATCH_TYPE) {
                return;
            }
            let mut reporter = node_id.to_string();
            loop {
                let targets = current.catch_targets(&reporter);
                if !targets.is_empty() {
                    let msg = json!({
                        "error": {
                            "message": error,
                            "source": current.source(&reporter),
                        }
                    });
                    break Some((targets, msg));
                }
                let Some(parent) = current.parent.as_ref().and_then(|p| arena.get(p)) else {
                    break None;
                };
                if current.is_subflow() {
                    reporter = current.id.clone();
                }
                current = parent;
            }
        };

        let Some((targets, msg)) = delivery else {
            tracing::debug!(node_id, flow_id, error, "Uncaught node error");
            return;
        };
        for (id, node) in targets {
            if let Err(e) = node.read().await.receive(msg.clone()).await {
                tracing::warn!(node_id = %id, error = %e, "Error delivery failed");
            }
        }
    }
}

/// Ids the context store keeps scopes for
fn context_ids(config: &FlowConfig, plans: &[FlowPlan]) -> HashSet<String> {
    let mut ids = config.active_ids();
    ids.extend(planned_ids(plans));
    ids
}

/// Running node ids a `nodes` or `flows` deploy has to close
fn stop_set(
    arena: &HashMap<FlowId, Flow>,
    deployment: DeploymentType,
    diff: &DiffResult,
    plans: &[FlowPlan],
    planned: &HashMap<&str, &PlannedNode>,
) -> HashSet<NodeId> {
    let planned_flows: HashSet<&str> = plans.iter().map(|p| p.id.as_str()).collect();
    let touched_flows: HashSet<&str> = plans
        .iter()
        .filter(|p| p.nodes.iter().any(|n| diff.touches(&n.config.id)))
        .map(|p| p.id.as_str())
        .collect();

    let mut restart: HashSet<&str> = arena
        .values()
        .filter(|f| {
            !planned_flows.contains(f.id.as_str())
                || diff.flows_changed.contains(&f.id)
                || diff.removed.contains(&f.id)
                || (f.is_subflow() && diff.needs_stop(&f.id))
                || (deployment == DeploymentType::Flows
                    && f.id != GLOBAL_FLOW_ID
                    && (touched_flows.contains(f.id.as_str())
                        || f.configs.keys().any(|id| diff.touches(id))))
        })
        .map(|f| f.id.as_str())
        .collect();

    // Subflow instances go down with the flow that contains them
    loop {
        let inherited: Vec<&str> = arena
            .values()
            .filter(|f| f.is_subflow() && !restart.contains(f.id.as_str()))
            .filter(|f| f.parent.as_deref().is_some_and(|p| restart.contains(p)))
            .map(|f| f.id.as_str())
            .collect();
        if inherited.is_empty() {
            break;
        }
        restart.extend(inherited);
    }

    let mut stopping = HashSet::new();
    for flow in arena.values() {
        for (id, instance) in &flow.active {
            let replaced = match planned.get(id.as_str()) {
                None => true,
                Some(next) => !same_except_wires(&instance.config, &next.config),
            };
            if restart.contains(flow.id.as_str()) || diff.needs_stop(id) || replaced {
                stopping.insert(id.clone());
            }
        }
    }
    stopping
}

fn same_except_wires(a: &NodeConfig, b: &NodeConfig) -> bool {
    a.node_type == b.node_type
        && a.z == b.z
        && a.disabled == b.disabled
        && a.env == b.env
        && a.props == b.props
}
