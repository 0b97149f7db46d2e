//! Catch and status nodes
//!
//! The runtime delivers errors to catch nodes and status changes to status
//! nodes as messages (`{"error": {..}}` / `{"status": {..}}`). Both keep a
//! running `count` and the `last` delivery in their node context, which is
//! where anything downstream picks them up.

use async_trait::async_trait;
use flowcore::{ContextAccess, EventEmitter, Message, Node, NodeConfig, NodeContext, NodeError};
use flowruntime::{NodeFactory, NodeMetadata};
use parking_lot::Mutex;
use serde_json::Value;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandlerKind {
    Catch,
    Status,
}

impl HandlerKind {
    fn node_type(self) -> &'static str {
        match self {
            HandlerKind::Catch => flowruntime::flows::CATCH_TYPE,
            HandlerKind::Status => flowruntime::flows::STATUS_TYPE,
        }
    }

    fn field(self) -> &'static str {
        match self {
            HandlerKind::Catch => "error",
            HandlerKind::Status => "status",
        }
    }
}

struct Attached {
    context: Arc<dyn ContextAccess>,
    events: EventEmitter,
}

pub struct HandlerNode {
    kind: HandlerKind,
    attached: Mutex<Option<Arc<Attached>>>,
}

impl HandlerNode {
    pub fn new(kind: HandlerKind) -> Self {
        Self {
            kind,
            attached: Mutex::new(None),
        }
    }

    async fn record(&self, attached: &Attached, delivery: Value) -> flowcore::Result<u64> {
        let count = attached
            .context
            .get("count")
            .await?
            .and_then(|v| v.as_u64())
            .unwrap_or(0)
            + 1;
        attached.context.set("count", Some(Value::from(count))).await?;
        attached.context.set("last", Some(delivery)).await?;
        Ok(count)
    }
}

#[async_trait]
impl Node for HandlerNode {
    fn node_type(&self) -> &str {
        self.kind.node_type()
    }

    async fn start(&mut self, ctx: NodeContext) -> Result<(), NodeError> {
        *self.attached.lock() = Some(Arc::new(Attached {
            context: ctx.context,
            events: ctx.events,
        }));
        Ok(())
    }

    async fn close(&mut self, _removed: bool) -> Result<(), NodeError> {
        self.attached.lock().take();
        Ok(())
    }

    async fn receive(&self, msg: Message) -> Result<(), NodeError> {
        let attached = self.attached.lock().clone();
        let Some(attached) = attached else {
            return Ok(());
        };
        let Some(delivery) = msg.get(self.kind.field()).cloned() else {
            return Err(NodeError::ExecutionFailed(format!(
                "{} node got a message without {}",
                self.kind.node_type(),
                self.kind.field()
            )));
        };
        let count = self
            .record(&attached, delivery)
            .await
            .map_err(|e| NodeError::ExecutionFailed(e.to_string()))?;
        tracing::debug!(
            node_id = %attached.events.node_id(),
            kind = ?self.kind,
            count,
            "Handled delivery"
        );
        Ok(())
    }
}

pub struct HandlerNodeFactory(pub HandlerKind);

impl NodeFactory for HandlerNodeFactory {
    fn create(&self, _config: &NodeConfig) -> Result<Box<dyn Node>, NodeError> {
        Ok(Box::new(HandlerNode::new(self.0)))
    }

    fn node_type(&self) -> &str {
        self.0.node_type()
    }

    fn metadata(&self) -> NodeMetadata {
        let description = match self.0 {
            HandlerKind::Catch => "Receives errors raised by nodes in its scope",
            HandlerKind::Status => "Receives status changes of nodes in its scope",
        };
        NodeMetadata {
            description: description.to_string(),
            category: "common".to_string(),
            ..Default::default()
        }
    }
}
