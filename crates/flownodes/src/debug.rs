use async_trait::async_trait;
use flowcore::{EventEmitter, Message, Node, NodeConfig, NodeContext, NodeError, NodeStatus};
use flowruntime::{NodeFactory, NodeMetadata};
use parking_lot::Mutex;
use serde_json::Value;

/// Logs every message it receives
pub struct DebugNode {
    /// Dotted path of the message property to log; whole message when absent
    complete: Option<String>,
    /// Mirror the logged value into the node status
    to_status: bool,
    events: Mutex<Option<EventEmitter>>,
}

impl DebugNode {
    fn select<'a>(&self, msg: &'a Message) -> Option<&'a Value> {
        let Some(path) = self.complete.as_deref() else {
            return Some(msg);
        };
        path.split('.').try_fold(msg, |value, part| value.get(part))
    }
}

#[async_trait]
impl Node for DebugNode {
    fn node_type(&self) -> &str {
        "debug"
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
        let events = self.events.lock().clone();
        let Some(events) = events else {
            return Ok(());
        };
        match self.select(&msg) {
            Some(value) => {
                tracing::info!(node_id = %events.node_id(), value = %value, "debug");
                if self.to_status {
                    let text: String = value.to_string().chars().take(32).collect();
                    events.status(NodeStatus::text(text));
                }
            }
            None => tracing::info!(node_id = %events.node_id(), "debug: property not set"),
        }
        Ok(())
    }
}

pub struct DebugNodeFactory;

impl NodeFactory for DebugNodeFactory {
    fn create(&self, config: &NodeConfig) -> Result<Box<dyn Node>, NodeError> {
        let complete = match config.props.get("complete") {
            None | Some(Value::Null) => None,
            Some(Value::Bool(true)) => None,
            Some(Value::String(path)) if path == "true" || path.is_empty() => None,
            Some(Value::String(path)) => Some(path.clone()),
            Some(other) => {
                return Err(NodeError::Configuration(format!(
                    "complete must be a property path, got {}",
                    other
                )))
            }
        };
        Ok(Box::new(DebugNode {
            complete,
            to_status: config
                .props
                .get("tostatus")
                .and_then(Value::as_bool)
                .unwrap_or(false),
            events: Mutex::new(None),
        }))
    }

    fn node_type(&self) -> &str {
        "debug"
    }

    fn metadata(&self) -> NodeMetadata {
        NodeMetadata {
            description: "Logs received messages for debugging".to_string(),
            category: "debug".to_string(),
            ..Default::default()
        }
    }
}
