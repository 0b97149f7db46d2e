use flowcore::{Node, NodeConfig, NodeError, SUBFLOW_INSTANCE_PREFIX, SUBFLOW_TYPE};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

/// Factory trait for creating node instances
pub trait NodeFactory: Send + Sync {
    /// Create a new instance of the node with given configuration
    fn create(&self, config: &NodeConfig) -> Result<Box<dyn Node>, NodeError>;

    /// Get node type identifier
    fn node_type(&self) -> &str;

    /// Optional: Get node metadata (description, credential fields, etc.)
    fn metadata(&self) -> NodeMetadata {
        NodeMetadata::default()
    }
}

/// How a credential field is presented back to the editor
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CredentialKind {
    Text,
    Password,
}

/// Credential fields a node type declares, by field name
pub type CredentialDefinition = BTreeMap<String, CredentialKind>;

/// Metadata about a node type
#[derive(Debug, Clone)]
pub struct NodeMetadata {
    pub description: String,
    pub category: String,
    pub credentials: CredentialDefinition,
    /// Credential fields are defined per instance rather than per type
    pub dynamic_credentials: bool,
}

impl Default for NodeMetadata {
    fn default() -> Self {
        Self {
            description: String::new(),
            category: "general".to_string(),
            credentials: CredentialDefinition::new(),
            dynamic_credentials: false,
        }
    }
}

/// Credential handling policy for a node, resolved once per extract
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NodeCategory {
    /// Statically typed node: only declared fields are considered
    Regular(CredentialDefinition),
    /// Subflow-like node: the submission replaces the stored fields
    DynamicDefinition,
}

/// Registry of available node types
pub struct NodeRegistry {
    factories: HashMap<String, Arc<dyn NodeFactory>>,
}

impl NodeRegistry {
    pub fn new() -> Self {
        Self {
            factories: HashMap::new(),
        }
    }

    /// Register a node factory
    pub fn register(&mut self, factory: Arc<dyn NodeFactory>) {
        let node_type = factory.node_type().to_string();
        tracing::info!("Registering node type: {}", node_type);
        self.factories.insert(node_type, factory);
    }

    /// Create a node instance from its configuration
    pub fn create_node(&self, config: &NodeConfig) -> Result<Box<dyn Node>, NodeError> {
        let factory = self
            .factories
            .get(&config.node_type)
            .ok_or_else(|| NodeError::UnknownNodeType(config.node_type.clone()))?;

        factory.create(config)
    }

    pub fn get_type(&self, node_type: &str) -> Option<Arc<dyn NodeFactory>> {
        self.factories.get(node_type).cloned()
    }

    pub fn is_known(&self, node_type: &str) -> bool {
        self.factories.contains_key(node_type)
    }

    /// Get all registered node types, sorted
    pub fn list_node_types(&self) -> Vec<String> {
        let mut types: Vec<String> = self.factories.keys().cloned().collect();
        types.sort();
        types
    }

    /// Get metadata for a node type
    pub fn get_metadata(&self, node_type: &str) -> Option<NodeMetadata> {
        self.factories.get(node_type).map(|f| f.metadata())
    }

    pub fn credential_definition(&self, node_type: &str) -> Option<CredentialDefinition> {
        self.get_metadata(node_type)
            .filter(|m| !m.dynamic_credentials)
            .map(|m| m.credentials)
    }

    /// Subflow types, and anything without a registered factory, carry their
    /// credential fields with the instance.
    pub fn category(&self, node_type: &str) -> NodeCategory {
        if node_type == SUBFLOW_TYPE || node_type.starts_with(SUBFLOW_INSTANCE_PREFIX) {
            return NodeCategory::DynamicDefinition;
        }
        match self.get_metadata(node_type) {
            Some(meta) if !meta.dynamic_credentials => NodeCategory::Regular(meta.credentials),
            _ => NodeCategory::DynamicDefinition,
        }
    }
}

impl Default for NodeRegistry {
    fn default() -> Self {
        Self::new()
    }
}
