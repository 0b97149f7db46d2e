use crate::DiffError;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};

pub type NodeId = String;
pub type FlowId = String;

/// Container type for a flow tab
pub const TAB_TYPE: &str = "tab";
/// Container type for a subflow template
pub const SUBFLOW_TYPE: &str = "subflow";
/// Prefix of subflow instance node types (`subflow:<templateId>`)
pub const SUBFLOW_INSTANCE_PREFIX: &str = "subflow:";
/// Id of the implicit top-level flow holding config nodes
pub const GLOBAL_FLOW_ID: &str = "global";

/// A single node as it appears in a deployed configuration.
///
/// Anything that is not one of the well-known fields lands in `props`
/// unchanged, so that a config survives a load/save round trip.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NodeConfig {
    #[serde(default)]
    pub id: NodeId,

    #[serde(rename = "type", default)]
    pub node_type: String,

    /// Owning flow (tab or subflow template)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub z: Option<FlowId>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub wires: Vec<Vec<NodeId>>,

    #[serde(default, alias = "d", skip_serializing_if = "is_false")]
    pub disabled: bool,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credentials: Option<Map<String, Value>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub env: Option<Value>,

    #[serde(flatten)]
    pub props: Map<String, Value>,
}

fn is_false(b: &bool) -> bool {
    !*b
}

impl NodeConfig {
    pub fn new(id: impl Into<NodeId>, node_type: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            node_type: node_type.into(),
            z: None,
            wires: Vec::new(),
            disabled: false,
            credentials: None,
            env: None,
            props: Map::new(),
        }
    }

    pub fn tab(id: impl Into<FlowId>, label: impl Into<String>) -> Self {
        Self::new(id, TAB_TYPE).with_prop("label", label.into())
    }

    pub fn in_flow(mut self, z: impl Into<FlowId>) -> Self {
        self.z = Some(z.into());
        self
    }

    pub fn with_wires(mut self, wires: Vec<Vec<&str>>) -> Self {
        self.wires = wires
            .into_iter()
            .map(|port| port.into_iter().map(str::to_string).collect())
            .collect();
        self
    }

    pub fn with_prop(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.props.insert(key.into(), value.into());
        self
    }

    pub fn with_credentials(mut self, credentials: Value) -> Self {
        if let Value::Object(map) = credentials {
            self.credentials = Some(map);
        }
        self
    }

    pub fn disabled(mut self) -> Self {
        self.disabled = true;
        self
    }

    pub fn name(&self) -> Option<&str> {
        self.props.get("name").and_then(Value::as_str)
    }

    pub fn label(&self) -> Option<&str> {
        self.props.get("label").and_then(Value::as_str)
    }

    pub fn is_tab(&self) -> bool {
        self.node_type == TAB_TYPE
    }

    pub fn is_subflow_template(&self) -> bool {
        self.node_type == SUBFLOW_TYPE
    }

    /// Template id when this node is an instance of a subflow
    pub fn subflow_template(&self) -> Option<&str> {
        self.node_type.strip_prefix(SUBFLOW_INSTANCE_PREFIX)
    }

    /// Every node id this node sends messages to, over all output ports
    pub fn wired_to(&self) -> impl Iterator<Item = &NodeId> {
        self.wires.iter().flatten()
    }

    /// Whether any property (at any depth) holds `id` as a string value.
    /// This is how nodes point at the config nodes they use.
    pub fn references(&self, id: &str) -> bool {
        self.props.values().any(|v| value_references(v, id))
    }
}

fn value_references(value: &Value, id: &str) -> bool {
    match value {
        Value::String(s) => s == id,
        Value::Array(items) => items.iter().any(|v| value_references(v, id)),
        Value::Object(map) => map.values().any(|v| value_references(v, id)),
        _ => false,
    }
}

/// Id given to a template node once cloned into a subflow instance
pub fn subflow_node_id(template_node_id: &str, instance_id: &str) -> NodeId {
    format!("{}:{}", template_node_id, instance_id)
}

/// A flow tab and the nodes it owns
#[derive(Debug, Clone, PartialEq)]
pub struct FlowDefinition {
    pub id: FlowId,
    pub label: String,
    pub disabled: bool,
    pub config: NodeConfig,
    pub nodes: Vec<NodeConfig>,
}

/// A subflow template; instantiated once per `subflow:<id>` node
#[derive(Debug, Clone, PartialEq)]
pub struct SubflowTemplate {
    pub id: FlowId,
    pub config: NodeConfig,
    pub nodes: Vec<NodeConfig>,
}

/// A parsed deployment: the flat node array partitioned by container.
#[derive(Debug, Clone, Default)]
pub struct FlowConfig {
    nodes: Vec<NodeConfig>,
    index: HashMap<NodeId, usize>,
    pub flows: BTreeMap<FlowId, FlowDefinition>,
    pub subflows: BTreeMap<FlowId, SubflowTemplate>,
    /// Config nodes living in the global flow
    pub configs: Vec<NodeConfig>,
}

impl FlowConfig {
    pub fn parse(nodes: Vec<NodeConfig>) -> Result<Self, DiffError> {
        let mut index = HashMap::with_capacity(nodes.len());
        for (i, node) in nodes.iter().enumerate() {
            if node.id.is_empty() {
                return Err(DiffError::MissingId { index: i });
            }
            if index.insert(node.id.clone(), i).is_some() {
                return Err(DiffError::DuplicateId(node.id.clone()));
            }
        }

        let mut flows = BTreeMap::new();
        let mut subflows = BTreeMap::new();
        for node in nodes.iter() {
            if node.is_tab() {
                flows.insert(
                    node.id.clone(),
                    FlowDefinition {
                        id: node.id.clone(),
                        label: node.label().unwrap_or_default().to_string(),
                        disabled: node.disabled,
                        config: node.clone(),
                        nodes: Vec::new(),
                    },
                );
            } else if node.is_subflow_template() {
                subflows.insert(
                    node.id.clone(),
                    SubflowTemplate {
                        id: node.id.clone(),
                        config: node.clone(),
                        nodes: Vec::new(),
                    },
                );
            }
        }

        let mut configs = Vec::new();
        for node in nodes.iter() {
            if node.is_tab() || node.is_subflow_template() {
                continue;
            }
            match node.z.as_deref() {
                None | Some("") => configs.push(node.clone()),
                Some(z) => {
                    if let Some(flow) = flows.get_mut(z) {
                        flow.nodes.push(node.clone());
                    } else if let Some(subflow) = subflows.get_mut(z) {
                        subflow.nodes.push(node.clone());
                    } else {
                        return Err(DiffError::UnknownContainer {
                            node: node.id.clone(),
                            flow: z.to_string(),
                        });
                    }
                }
            }
        }

        Ok(Self {
            nodes,
            index,
            flows,
            subflows,
            configs,
        })
    }

    /// The flat node array, in submission order
    pub fn nodes(&self) -> &[NodeConfig] {
        &self.nodes
    }

    pub fn into_nodes(self) -> Vec<NodeConfig> {
        self.nodes
    }

    pub fn node(&self, id: &str) -> Option<&NodeConfig> {
        self.index.get(id).map(|&i| &self.nodes[i])
    }

    pub fn contains(&self, id: &str) -> bool {
        self.index.contains_key(id)
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Node types that `is_known` rejects. Containers and subflow instances
    /// whose template exists are never missing.
    pub fn missing_types(&self, is_known: impl Fn(&str) -> bool) -> BTreeSet<String> {
        let mut missing = BTreeSet::new();
        for node in &self.nodes {
            if node.is_tab() || node.is_subflow_template() {
                continue;
            }
            if let Some(template) = node.subflow_template() {
                if !self.subflows.contains_key(template) {
                    missing.insert(node.node_type.clone());
                }
                continue;
            }
            if !is_known(&node.node_type) {
                missing.insert(node.node_type.clone());
            }
        }
        missing
    }

    /// Every id that may own context in this configuration: flow ids, node
    /// ids, and the ids of nodes cloned into subflow instances.
    pub fn active_ids(&self) -> HashSet<String> {
        let mut ids: HashSet<String> = self.index.keys().cloned().collect();
        for node in &self.nodes {
            if let Some(template) = node.subflow_template().and_then(|t| self.subflows.get(t)) {
                for inner in &template.nodes {
                    ids.insert(subflow_node_id(&inner.id, &node.id));
                }
            }
        }
        ids
    }

    /// Copy of the configuration with every `credentials` block removed
    pub fn without_credentials(&self) -> Vec<NodeConfig> {
        self.nodes
            .iter()
            .cloned()
            .map(|mut n| {
                n.credentials = None;
                n
            })
            .collect()
    }
}
