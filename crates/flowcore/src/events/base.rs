use crate::{DiffResult, FlowId, NodeId, NodeStatus};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use uuid::Uuid;

pub type DeployId = Uuid;

/// Events emitted by running nodes and by the flow manager
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum RuntimeEvent {
    NodeStatus {
        flow_id: FlowId,
        node_id: NodeId,
        status: NodeStatus,
        timestamp: DateTime<Utc>,
    },
    NodeError {
        flow_id: FlowId,
        node_id: NodeId,
        error: String,
        timestamp: DateTime<Utc>,
    },
    FlowsStarted {
        deploy_id: DeployId,
        deployment_type: String,
        revision: Option<String>,
        timestamp: DateTime<Utc>,
    },
    FlowsStopped {
        deploy_id: DeployId,
        timestamp: DateTime<Utc>,
    },
    Deployed {
        deploy_id: DeployId,
        revision: String,
        added: usize,
        changed: usize,
        removed: usize,
        rewired: usize,
        timestamp: DateTime<Utc>,
    },
}

impl RuntimeEvent {
    pub fn deployed(deploy_id: DeployId, revision: String, diff: &DiffResult) -> Self {
        RuntimeEvent::Deployed {
            deploy_id,
            revision,
            added: diff.added.len(),
            changed: diff.changed.len(),
            removed: diff.removed.len(),
            rewired: diff.rewired.len(),
            timestamp: Utc::now(),
        }
    }
}

/// Per-node handle for reporting status and errors
#[derive(Clone)]
pub struct EventEmitter {
    flow_id: FlowId,
    node_id: NodeId,
    sender: broadcast::Sender<RuntimeEvent>,
}

impl EventEmitter {
    pub fn new(flow_id: FlowId, node_id: NodeId, sender: broadcast::Sender<RuntimeEvent>) -> Self {
        Self {
            flow_id,
            node_id,
            sender,
        }
    }

    /// Report a status change; bubbles to status nodes
    pub fn status(&self, status: NodeStatus) {
        let _ = self.sender.send(RuntimeEvent::NodeStatus {
            flow_id: self.flow_id.clone(),
            node_id: self.node_id.clone(),
            status,
            timestamp: Utc::now(),
        });
    }

    /// Report an error; bubbles to catch nodes
    pub fn error(&self, error: impl Into<String>) {
        let _ = self.sender.send(RuntimeEvent::NodeError {
            flow_id: self.flow_id.clone(),
            node_id: self.node_id.clone(),
            error: error.into(),
            timestamp: Utc::now(),
        });
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }
}

/// Global event bus
pub struct EventBus {
    sender: broadcast::Sender<RuntimeEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<RuntimeEvent> {
        self.sender.subscribe()
    }

    pub fn emit(&self, event: RuntimeEvent) {
        let _ = self.sender.send(event);
    }

    pub fn create_emitter(&self, flow_id: &str, node_id: &str) -> EventEmitter {
        EventEmitter::new(flow_id.to_string(), node_id.to_string(), self.sender.clone())
    }
}
