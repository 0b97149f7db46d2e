//! Flow execution-state runtime
//!
//! This crate owns everything that changes while flows run: the deployed
//! configuration and its lifecycle, node context storage, and the
//! encrypted credential vault. Node implementations live elsewhere and are
//! plugged in through the [`NodeRegistry`].

pub mod api;
pub mod context;
pub mod credentials;
pub mod flows;
mod registry;
mod runtime;
pub mod storage;

pub use api::RuntimeApi;
pub use context::{ContextHandle, ContextStore};
pub use credentials::{CredentialBlob, CredentialVault, KeyType};
pub use flows::{DeploymentType, FlowManager, FlowRequest, FlowState, StateAction};
pub use registry::{
    CredentialDefinition, CredentialKind, NodeCategory, NodeFactory, NodeMetadata, NodeRegistry,
};
pub use runtime::{FlowRuntime, RuntimeConfig};
pub use storage::{LocalStorage, MemoryStorage, Storage};
