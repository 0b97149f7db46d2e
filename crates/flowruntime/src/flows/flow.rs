//! Runtime flow objects
//!
//! Flows are kept in an arena keyed by flow id. Parents are referenced by
//! id: tabs point at the global flow, subflow instances at the flow that
//! contains their instance node.

use crate::context::ContextHandle;
use async_trait::async_trait;
use flowcore::{
    subflow_node_id, EventEmitter, FlowConfig, FlowId, Message, Node, NodeConfig, NodeContext,
    NodeError, NodeId, NodeStatus, SubflowTemplate, GLOBAL_FLOW_ID,
};
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;

pub const CATCH_TYPE: &str = "catch";
pub const STATUS_TYPE: &str = "status";

/// Nested subflow instances deeper than this are not created
const MAX_SUBFLOW_DEPTH: usize = 16;

pub(crate) type SharedNode = Arc<RwLock<Box<dyn Node>>>;

/// A started node of the current generation
pub(crate) struct NodeInstance {
    pub config: NodeConfig,
    pub node: SharedNode,
    pub cancellation: CancellationToken,
}

/// Running flow: a tab, the global flow, or a subflow instance
pub struct Flow {
    pub id: FlowId,
    pub parent: Option<FlowId>,
    /// Template id when this flow is a subflow instance
    pub subflow: Option<FlowId>,
    pub context: Arc<ContextHandle>,
    /// Every enabled node of this generation, started or not
    pub configs: BTreeMap<NodeId, NodeConfig>,
    pub(crate) active: HashMap<NodeId, NodeInstance>,
}

impl Flow {
    pub(crate) fn new(
        id: FlowId,
        parent: Option<FlowId>,
        subflow: Option<FlowId>,
        context: Arc<ContextHandle>,
    ) -> Self {
        Self {
            id,
            parent,
            subflow,
            context,
            configs: BTreeMap::new(),
            active: HashMap::new(),
        }
    }

    pub fn is_subflow(&self) -> bool {
        self.subflow.is_some()
    }

    pub fn is_running(&self, node_id: &str) -> bool {
        self.active.contains_key(node_id)
    }

    pub fn running_nodes(&self) -> impl Iterator<Item = &NodeId> {
        self.active.keys()
    }

    /// Catch or status nodes of this flow whose scope admits `reporter`
    fn handlers(&self, node_type: &str, reporter: &str) -> Vec<(&NodeInstance, bool)> {
        self.active
            .values()
            .filter(|i| i.config.node_type == node_type)
            .filter(|i| in_scope(&i.config, reporter))
            .map(|i| (i, is_uncaught(&i.config)))
            .collect()
    }

    /// Status nodes that should see a status change of `reporter`
    pub(crate) fn status_targets(&self, reporter: &str) -> Vec<(NodeId, SharedNode)> {
        self.handlers(STATUS_TYPE, reporter)
            .into_iter()
            .map(|(i, _)| (i.config.id.clone(), Arc::clone(&i.node)))
            .collect()
    }

    /// Catch nodes that should see an error of `reporter`. `uncaught`
    /// catch nodes only apply when no other catch node does.
    pub(crate) fn catch_targets(&self, reporter: &str) -> Vec<(NodeId, SharedNode)> {
        let candidates = self.handlers(CATCH_TYPE, reporter);
        let (fallback, primary): (Vec<_>, Vec<_>) =
            candidates.into_iter().partition(|(_, uncaught)| *uncaught);
        let chosen = if primary.is_empty() { fallback } else { primary };
        chosen
            .into_iter()
            .map(|(i, _)| (i.config.id.clone(), Arc::clone(&i.node)))
            .collect()
    }

    /// `{id, type, name}` of a node in this flow
    pub(crate) fn source(&self, node_id: &str) -> Value {
        match self.configs.get(node_id) {
            Some(config) => json!({
                "id": config.id,
                "type": config.node_type,
                "name": config.name(),
            }),
            None => json!({ "id": node_id, "type": Value::Null, "name": Value::Null }),
        }
    }
}

fn in_scope(config: &NodeConfig, reporter: &str) -> bool {
    match config.props.get("scope") {
        Some(Value::Array(ids)) => ids.iter().any(|id| id.as_str() == Some(reporter)),
        _ => true,
    }
}

fn is_uncaught(config: &NodeConfig) -> bool {
    config
        .props
        .get("uncaught")
        .and_then(Value::as_bool)
        .unwrap_or(false)
}

/// A node scheduled for a flow, before it is started
#[derive(Debug, Clone)]
pub(crate) struct PlannedNode {
    pub config: NodeConfig,
    /// Id the credential vault stores this node's secrets under
    pub credential_id: NodeId,
}

/// Layout of one flow for a configuration. Plans come parent first.
#[derive(Debug, Clone)]
pub(crate) struct FlowPlan {
    pub id: FlowId,
    pub parent: Option<FlowId>,
    pub subflow: Option<FlowId>,
    pub nodes: Vec<PlannedNode>,
}

/// Work out every flow a configuration instantiates. Disabled tabs and
/// nodes are left out; subflow instances expand into child flows.
pub(crate) fn plan_flows(config: &FlowConfig) -> Vec<FlowPlan> {
    let mut plans = vec![FlowPlan {
        id: GLOBAL_FLOW_ID.to_string(),
        parent: None,
        subflow: None,
        nodes: config
            .configs
            .iter()
            .filter(|n| !n.disabled)
            .map(|n| PlannedNode {
                config: n.clone(),
                credential_id: n.id.clone(),
            })
            .collect(),
    }];

    for flow in config.flows.values().filter(|f| !f.disabled) {
        let nodes: Vec<PlannedNode> = flow
            .nodes
            .iter()
            .filter(|n| !n.disabled)
            .map(|n| PlannedNode {
                config: n.clone(),
                credential_id: n.id.clone(),
            })
            .collect();
        let instances: Vec<NodeConfig> = nodes
            .iter()
            .filter(|n| n.config.subflow_template().is_some())
            .map(|n| n.config.clone())
            .collect();
        plans.push(FlowPlan {
            id: flow.id.clone(),
            parent: Some(GLOBAL_FLOW_ID.to_string()),
            subflow: None,
            nodes,
        });
        for instance in instances {
            plan_subflow(config, &instance, &flow.id, &mut Vec::new(), &mut plans);
        }
    }
    plans
}

fn plan_subflow(
    config: &FlowConfig,
    instance: &NodeConfig,
    parent: &str,
    chain: &mut Vec<FlowId>,
    plans: &mut Vec<FlowPlan>,
) {
    let Some(template) = instance
        .subflow_template()
        .and_then(|t| config.subflows.get(t))
    else {
        return;
    };
    if chain.contains(&template.id) || chain.len() >= MAX_SUBFLOW_DEPTH {
        tracing::error!(
            node_id = %instance.id,
            subflow = %template.id,
            "Recursive subflow, instance not created"
        );
        return;
    }

    let nodes = instantiate(template, &instance.id);
    let nested: Vec<NodeConfig> = nodes
        .iter()
        .filter(|n| n.config.subflow_template().is_some())
        .map(|n| n.config.clone())
        .collect();
    plans.push(FlowPlan {
        id: instance.id.clone(),
        parent: Some(parent.to_string()),
        subflow: Some(template.id.clone()),
        nodes,
    });

    chain.push(template.id.clone());
    for inner in nested {
        plan_subflow(config, &inner, &instance.id, chain, plans);
    }
    chain.pop();
}

/// Clone a template's nodes for one instance, rewriting ids so that
/// several instances of a template never collide.
fn instantiate(template: &SubflowTemplate, instance_id: &str) -> Vec<PlannedNode> {
    let ids: HashMap<&str, NodeId> = template
        .nodes
        .iter()
        .map(|n| (n.id.as_str(), subflow_node_id(&n.id, instance_id)))
        .collect();
    let rewrite = |id: &str| ids.get(id).cloned().unwrap_or_else(|| id.to_string());

    template
        .nodes
        .iter()
        .filter(|n| !n.disabled)
        .map(|n| {
            let mut config = n.clone();
            config.id = rewrite(n.id.as_str());
            config.z = Some(instance_id.to_string());
            config.credentials = None;
            config.wires = n
                .wires
                .iter()
                .map(|port| port.iter().map(|t| rewrite(t.as_str())).collect())
                .collect();
            if let Some(Value::Array(scope)) = config.props.get_mut("scope") {
                for entry in scope.iter_mut() {
                    if let Some(id) = entry.as_str().map(&rewrite) {
                        *entry = Value::String(id);
                    }
                }
            }
            PlannedNode {
                config,
                credential_id: n.id.clone(),
            }
        })
        .collect()
}

/// Every id a plan set may own context or credentials for
pub(crate) fn planned_ids(plans: &[FlowPlan]) -> HashSet<String> {
    let mut ids = HashSet::new();
    for plan in plans {
        ids.insert(plan.id.clone());
        ids.extend(plan.nodes.iter().map(|n| n.config.id.clone()));
    }
    ids
}

/// Stand-in for a `subflow:<id>` node in its parent flow. Status reported
/// inside the subflow is re-emitted as this node's own status.
pub struct SubflowInstanceNode {
    node_type: String,
    events: Mutex<Option<EventEmitter>>,
    last_status: Mutex<Option<NodeStatus>>,
}

impl SubflowInstanceNode {
    pub fn new(node_type: impl Into<String>) -> Self {
        Self {
            node_type: node_type.into(),
            events: Mutex::new(None),
            last_status: Mutex::new(None),
        }
    }

    pub fn last_status(&self) -> Option<NodeStatus> {
        self.last_status.lock().clone()
    }
}

#[async_trait]
impl Node for SubflowInstanceNode {
    fn node_type(&self) -> &str {
        &self.node_type
    }

    async fn start(&mut self, ctx: NodeContext) -> Result<(), NodeError> {
        *self.events.lock() = Some(ctx.events);
        Ok(())
    }

    async fn close(&mut self, _removed: bool) -> Result<(), NodeError> {
        self.events.lock().take();
        Ok(())
    }

    async fn receive(&self, msg: Message) -> Result<(), NodeError> {
        let Some(status) = msg.get("status") else {
            return Ok(());
        };
        let status: NodeStatus = serde_json::from_value(status.clone())
            .map_err(|e| NodeError::ExecutionFailed(e.to_string()))?;
        *self.last_status.lock() = Some(status.clone());
        if let Some(events) = self.events.lock().as_ref() {
            events.status(status);
        }
        Ok(())
    }
}
