//! Core abstractions for the flow runtime
//!
//! This crate provides the fundamental types and traits that all other
//! components depend on: the deployed configuration model, the error
//! taxonomy, the node lifecycle trait and the configuration diff engine.
//! It does no I/O.

mod config;
mod diff;
mod error;
pub mod events;
mod node;

pub use config::{
    subflow_node_id, FlowConfig, FlowDefinition, FlowId, NodeConfig, NodeId, SubflowTemplate,
    GLOBAL_FLOW_ID, SUBFLOW_INSTANCE_PREFIX, SUBFLOW_TYPE, TAB_TYPE,
};
pub use diff::{diff, diff_config, DiffResult};
pub use error::{DiffError, FlowError, NodeError};
pub use events::*;
pub use node::{ContextAccess, Message, Node, NodeContext, NodeStatus};

/// Result type for flow operations
pub type Result<T> = std::result::Result<T, FlowError>;
