//! Standard node library
//!
//! Built-in nodes that exercise the runtime: a timer, a logger, error and
//! status handlers, and a credential-holding config node.

mod credentials;
mod debug;
mod handler;
mod time;

pub use credentials::{ApiCredentialsNode, ApiCredentialsNodeFactory, API_CREDENTIALS_TYPE};
pub use debug::{DebugNode, DebugNodeFactory};
pub use handler::{HandlerKind, HandlerNode, HandlerNodeFactory};
pub use time::{InjectNode, InjectNodeFactory};
use flowruntime::NodeRegistry;

use std::sync::Arc;

/// Register all standard nodes with a registry
pub fn register_all(registry: &mut NodeRegistry) {
    registry.register(Arc::new(time::InjectNodeFactory));
    registry.register(Arc::new(debug::DebugNodeFactory));
    registry.register(Arc::new(handler::HandlerNodeFactory(HandlerKind::Catch)));
    registry.register(Arc::new(handler::HandlerNodeFactory(HandlerKind::Status)));
    registry.register(Arc::new(credentials::ApiCredentialsNodeFactory));
}
