//! Request mapping for an API layer
//!
//! Each call takes the loosely typed options an HTTP or RPC front end would
//! hand over, validates them, and forwards to the flow manager or context
//! store. Malformed options are rejected with `invalid_request` before any
//! state changes.

use crate::context::{flow_scope, node_scope, ContextStore, GLOBAL_SCOPE};
use crate::flows::{DeploymentType, FlowManager, FlowRequest, StateAction};
use flowcore::{FlowError, NodeConfig, Result};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Map, Value};
use std::sync::Arc;

fn parse_opts<T: DeserializeOwned>(opts: Value) -> Result<T> {
    serde_json::from_value(opts).map_err(|e| FlowError::InvalidRequest(e.to_string()))
}

fn to_json<T: serde::Serialize>(value: &T) -> Result<Value> {
    Ok(serde_json::to_value(value)?)
}

#[derive(Deserialize)]
#[serde(untagged)]
enum FlowsPayload {
    Versioned {
        flows: Vec<NodeConfig>,
        #[serde(default)]
        rev: Option<String>,
    },
    Plain(Vec<NodeConfig>),
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct SetFlowsOpts {
    #[serde(default)]
    flows: Option<FlowsPayload>,
    #[serde(default)]
    deployment_type: Option<String>,
    #[serde(default)]
    user: Option<String>,
}

#[derive(Deserialize)]
struct FlowOpts {
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    flow: Option<FlowRequest>,
    #[serde(default)]
    user: Option<String>,
}

impl FlowOpts {
    fn id(&self) -> Result<&str> {
        self.id
            .as_deref()
            .filter(|id| !id.is_empty())
            .ok_or_else(|| FlowError::InvalidRequest("missing flow id".to_string()))
    }

    fn flow(&mut self) -> Result<FlowRequest> {
        self.flow
            .take()
            .ok_or_else(|| FlowError::InvalidRequest("missing flow".to_string()))
    }
}

#[derive(Deserialize)]
struct StateOpts {
    state: String,
}

#[derive(Deserialize)]
struct CredentialsOpts {
    #[serde(rename = "type")]
    node_type: String,
    id: String,
}

#[derive(Deserialize)]
struct ContextOpts {
    scope: String,
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    key: Option<String>,
    #[serde(default)]
    store: Option<String>,
    #[serde(default, deserialize_with = "present")]
    value: Option<Value>,
}

/// Keeps an explicit `null` apart from an absent field
fn present<'de, D>(deserializer: D) -> std::result::Result<Option<Value>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    Value::deserialize(deserializer).map(Some)
}

impl ContextOpts {
    fn key(&self) -> Result<String> {
        let key = self
            .key
            .as_deref()
            .filter(|k| !k.is_empty())
            .ok_or_else(|| FlowError::InvalidRequest("missing context key".to_string()))?;
        Ok(match &self.store {
            Some(store) => format!("{}#{}", key, store),
            None => key.to_string(),
        })
    }
}

pub struct RuntimeApi {
    manager: Arc<FlowManager>,
    context: Arc<ContextStore>,
}

impl RuntimeApi {
    pub fn new(manager: Arc<FlowManager>, context: Arc<ContextStore>) -> Self {
        Self { manager, context }
    }

    /// `{flows, rev}`
    pub fn get_flows(&self) -> Result<Value> {
        to_json(&self.manager.get_flows())
    }

    /// `{flows: {flows, rev?} | [..], deploymentType?, user?}` → `{rev}`
    pub async fn set_flows(&self, opts: Value) -> Result<Value> {
        let opts: SetFlowsOpts = parse_opts(opts)?;
        let deployment = match opts.deployment_type.as_deref() {
            Some(t) => t.parse()?,
            None => DeploymentType::Full,
        };
        let (flows, rev) = match opts.flows {
            Some(FlowsPayload::Versioned { flows, rev }) => (flows, rev),
            Some(FlowsPayload::Plain(flows)) => (flows, None),
            None if deployment == DeploymentType::Reload => (Vec::new(), None),
            None => return Err(FlowError::InvalidRequest("missing flows".to_string())),
        };
        let rev = self
            .manager
            .set_flows(flows, deployment, rev.as_deref(), opts.user.as_deref())
            .await?;
        Ok(json!({ "rev": rev }))
    }

    /// `{flow, user?}` → `{id}`
    pub async fn add_flow(&self, opts: Value) -> Result<Value> {
        let mut opts: FlowOpts = parse_opts(opts)?;
        let flow = opts.flow()?;
        let id = self.manager.add_flow(flow, opts.user.as_deref()).await?;
        Ok(json!({ "id": id }))
    }

    /// `{id}` → flow
    pub fn get_flow(&self, opts: Value) -> Result<Value> {
        let opts: FlowOpts = parse_opts(opts)?;
        to_json(&self.manager.get_flow(opts.id()?)?)
    }

    /// `{id, flow, user?}` → `{id}`
    pub async fn update_flow(&self, opts: Value) -> Result<Value> {
        let mut opts: FlowOpts = parse_opts(opts)?;
        let flow = opts.flow()?;
        let id = self
            .manager
            .update_flow(opts.id()?, flow, opts.user.as_deref())
            .await?;
        Ok(json!({ "id": id }))
    }

    /// `{id, user?}`
    pub async fn delete_flow(&self, opts: Value) -> Result<()> {
        let opts: FlowOpts = parse_opts(opts)?;
        self.manager
            .delete_flow(opts.id()?, opts.user.as_deref())
            .await
    }

    pub fn get_state(&self) -> Result<Value> {
        to_json(&self.manager.get_state())
    }

    /// `{state: "start" | "stop"}`
    pub async fn set_state(&self, opts: Value) -> Result<Value> {
        let opts: StateOpts = parse_opts(opts)?;
        let action: StateAction = opts.state.parse()?;
        to_json(&self.manager.set_state(action).await?)
    }

    /// `{type, id}` → safe credential view
    pub async fn get_node_credentials(&self, opts: Value) -> Result<Value> {
        let opts: CredentialsOpts = parse_opts(opts)?;
        Ok(Value::Object(
            self.manager
                .get_node_credentials(&opts.node_type, &opts.id)
                .await,
        ))
    }

    async fn resolve_scope(&self, opts: &ContextOpts) -> Result<String> {
        let id = || {
            opts.id
                .as_deref()
                .filter(|id| !id.is_empty())
                .ok_or_else(|| FlowError::InvalidRequest(format!("{} scope needs an id", opts.scope)))
        };
        match opts.scope.as_str() {
            "global" => Ok(GLOBAL_SCOPE.to_string()),
            "flow" => Ok(flow_scope(id()?)),
            "node" => {
                let node = id()?;
                let flow = self
                    .manager
                    .flow_of(node)
                    .await
                    .ok_or_else(|| FlowError::NotFound(format!("node {}", node)))?;
                Ok(node_scope(node, &flow))
            }
            other => Err(FlowError::InvalidRequest(format!(
                "unknown context scope: {}",
                other
            ))),
        }
    }

    /// `{scope, id?, key?, store?}`. Without a key, every key of the scope
    /// with its value.
    pub async fn context_get(&self, opts: Value) -> Result<Value> {
        let opts: ContextOpts = parse_opts(opts)?;
        let scope = self.resolve_scope(&opts).await?;
        if opts.key.is_some() {
            let value = self.context.get(&scope, &opts.key()?).await?;
            return Ok(value.unwrap_or(Value::Null));
        }
        let mut values = Map::new();
        for key in self.context.keys(&scope, opts.store.as_deref()).await? {
            let lookup = match &opts.store {
                Some(store) => format!("{}#{}", key, store),
                None => key.clone(),
            };
            if let Some(value) = self.context.get(&scope, &lookup).await? {
                values.insert(key, value);
            }
        }
        Ok(Value::Object(values))
    }

    /// `{scope, id?, key, store?, value}`
    pub async fn context_set(&self, opts: Value) -> Result<()> {
        let mut opts: ContextOpts = parse_opts(opts)?;
        let scope = self.resolve_scope(&opts).await?;
        let key = opts.key()?;
        let value = opts
            .value
            .take()
            .ok_or_else(|| FlowError::InvalidRequest("missing context value".to_string()))?;
        self.context.set(&scope, &key, Some(value)).await
    }

    /// `{scope, id?, store?}` → key list
    pub async fn context_keys(&self, opts: Value) -> Result<Vec<String>> {
        let opts: ContextOpts = parse_opts(opts)?;
        let scope = self.resolve_scope(&opts).await?;
        self.context.keys(&scope, opts.store.as_deref()).await
    }

    /// `{scope, id?, key?, store?}`. Without a key the whole scope goes.
    pub async fn context_delete(&self, opts: Value) -> Result<()> {
        let opts: ContextOpts = parse_opts(opts)?;
        let scope = self.resolve_scope(&opts).await?;
        if opts.key.is_some() {
            return self.context.set(&scope, &opts.key()?, None).await;
        }
        self.context.delete(&scope).await
    }

    /// Drop context of nodes and flows that are no longer deployed
    pub async fn context_clean(&self) -> Result<()> {
        self.manager.clean_context().await
    }
}
