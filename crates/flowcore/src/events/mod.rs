// crates/flowcore/src/events/mod.rs

mod base;

pub use base::{DeployId, EventBus, EventEmitter, RuntimeEvent};
