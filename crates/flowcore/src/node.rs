use crate::{events::EventEmitter, FlowError, FlowId, NodeConfig, NodeError, NodeId};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::sync::Arc;

/// Messages delivered to nodes are plain JSON objects
pub type Message = Value;

/// Core trait that all deployable nodes implement.
///
/// A node is created by its factory, started once per generation and closed
/// when a deploy replaces or removes it. Nodes that survive a deploy
/// untouched are never restarted; they only see `rewire` when their
/// neighbourhood changed.
#[async_trait]
pub trait Node: Send + Sync {
    /// Unique type identifier (e.g., "inject", "debug")
    fn node_type(&self) -> &str;

    /// Acquire resources (timers, connections) for this generation
    async fn start(&mut self, _ctx: NodeContext) -> Result<(), NodeError> {
        Ok(())
    }

    /// Release resources. `removed` is true when the node is leaving the
    /// configuration rather than being restarted.
    async fn close(&mut self, _removed: bool) -> Result<(), NodeError> {
        Ok(())
    }

    /// Handle an incoming message (status/catch delivery, injected input)
    async fn receive(&self, _msg: Message) -> Result<(), NodeError> {
        Ok(())
    }

    /// Refresh routing after a deploy moved this node's connections
    fn rewire(&mut self, _wires: &[Vec<NodeId>]) {}
}

/// Scoped key/value access handed to nodes.
///
/// Keys may carry a `#store` suffix to select a context store and a
/// `$parent.` prefix to walk up to the enclosing scope.
#[async_trait]
pub trait ContextAccess: Send + Sync {
    /// Scope string this handle resolves to
    fn scope(&self) -> &str;

    async fn get(&self, key: &str) -> Result<Option<Value>, FlowError>;

    /// Setting `None` deletes the key
    async fn set(&self, key: &str, value: Option<Value>) -> Result<(), FlowError>;

    async fn keys(&self, store: Option<&str>) -> Result<Vec<String>, FlowError>;
}

/// Everything a node gets at start time
#[derive(Clone)]
pub struct NodeContext {
    pub node_id: NodeId,

    pub flow_id: FlowId,

    /// Configuration this instance was created from (credentials stripped)
    pub config: NodeConfig,

    /// Decrypted credential fields for this node
    pub credentials: Map<String, Value>,

    /// Node-scoped context, chained to flow and global
    pub context: Arc<dyn ContextAccess>,

    /// Status and error reporting
    pub events: EventEmitter,

    /// Cancelled when the node is closed
    pub cancellation: tokio_util::sync::CancellationToken,
}

impl NodeContext {
    /// Get config property or return error
    pub fn require_config(&self, name: &str) -> Result<&Value, NodeError> {
        self.config
            .props
            .get(name)
            .ok_or_else(|| NodeError::Configuration(format!("Missing config: {}", name)))
    }

    /// Get config property with default
    pub fn get_config_or(&self, name: &str, default: Value) -> Value {
        self.config.props.get(name).cloned().unwrap_or(default)
    }

    pub fn credential(&self, field: &str) -> Option<&Value> {
        self.credentials.get(field)
    }
}

/// Status indicator shown under a node in the editor
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NodeStatus {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fill: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub shape: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
}

impl NodeStatus {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: Some(text.into()),
            ..Default::default()
        }
    }

    pub fn with_fill(mut self, fill: impl Into<String>) -> Self {
        self.fill = Some(fill.into());
        self
    }

    pub fn with_shape(mut self, shape: impl Into<String>) -> Self {
        self.shape = Some(shape.into());
        self
    }
}
