use async_trait::async_trait;
use flowcore::{Node, NodeConfig, NodeContext, NodeError, NodeStatus};
use flowruntime::{CredentialDefinition, CredentialKind, NodeFactory, NodeMetadata};
use serde_json::Value;

pub const API_CREDENTIALS_TYPE: &str = "api-credentials";

/// Config node holding an API key and the user it belongs to. Other nodes
/// point at it by id. Starting fails while no key is stored.
pub struct ApiCredentialsNode;

#[async_trait]
impl Node for ApiCredentialsNode {
    fn node_type(&self) -> &str {
        API_CREDENTIALS_TYPE
    }

    async fn start(&mut self, ctx: NodeContext) -> Result<(), NodeError> {
        let has_key = ctx
            .credential("apiKey")
            .and_then(Value::as_str)
            .is_some_and(|k| !k.is_empty());
        if !has_key {
            ctx.events
                .status(NodeStatus::text("no api key").with_fill("red").with_shape("ring"));
            return Err(NodeError::Configuration(format!(
                "{} has no apiKey credential",
                ctx.node_id
            )));
        }

        let user = ctx
            .credential("user")
            .and_then(Value::as_str)
            .unwrap_or("anonymous");
        tracing::debug!(node_id = %ctx.node_id, user, "API credentials available");
        ctx.events
            .status(NodeStatus::text(format!("ready for {}", user)).with_fill("green"));
        Ok(())
    }
}

pub struct ApiCredentialsNodeFactory;

impl NodeFactory for ApiCredentialsNodeFactory {
    fn create(&self, _config: &NodeConfig) -> Result<Box<dyn Node>, NodeError> {
        Ok(Box::new(ApiCredentialsNode))
    }

    fn node_type(&self) -> &str {
        API_CREDENTIALS_TYPE
    }

    fn metadata(&self) -> NodeMetadata {
        let mut credentials = CredentialDefinition::new();
        credentials.insert("apiKey".to_string(), CredentialKind::Password);
        credentials.insert("user".to_string(), CredentialKind::Text);
        NodeMetadata {
            description: "API key shared by the nodes that reference it".to_string(),
            category: "config".to_string(),
            credentials,
            dynamic_credentials: false,
        }
    }
}
