//! Flow lifecycle: deploys, the running flow arena and event bubbling

mod flow;
mod manager;

pub use flow::{Flow, SubflowInstanceNode, CATCH_TYPE, STATUS_TYPE};
pub use manager::{
    DeploymentType, FlowManager, FlowRequest, FlowState, FlowsSnapshot, StateAction, StateReport,
    FLOW_STATE_KEY,
};
