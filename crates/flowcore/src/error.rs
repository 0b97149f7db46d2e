use thiserror::Error;

#[derive(Error, Debug)]
pub enum FlowError {
    /// Optimistic concurrency check failed on deploy
    #[error("Conflict: expected revision {expected}, current revision is {actual}")]
    Conflict { expected: String, actual: String },

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Failed to load credentials: {0}")]
    CredentialsLoadFailed(String),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Invalid flow configuration: {0}")]
    Diff(#[from] DiffError),

    #[error("Node error: {0}")]
    Node(#[from] NodeError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl FlowError {
    /// Stable machine-readable code, used by API layers to map errors
    pub fn code(&self) -> &'static str {
        match self {
            FlowError::Conflict { .. } => "conflict",
            FlowError::NotFound(_) => "not_found",
            FlowError::CredentialsLoadFailed(_) => "credentials_load_failed",
            FlowError::InvalidRequest(_) | FlowError::Diff(_) => "invalid_request",
            FlowError::Storage(_) | FlowError::Io(_) | FlowError::Serialization(_) => {
                "storage_error"
            }
            FlowError::Node(_) => "node_error",
        }
    }
}

#[derive(Error, Debug, Clone)]
pub enum NodeError {
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Node initialization failed: {0}")]
    InitializationFailed(String),

    #[error("Close failed: {0}")]
    CloseFailed(String),

    #[error("Execution failed: {0}")]
    ExecutionFailed(String),

    #[error("Unknown node type: {0}")]
    UnknownNodeType(String),

    #[error("Cancelled")]
    Cancelled,
}

/// Structural problems in a node array. Any of these fails a diff outright.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DiffError {
    #[error("node at index {index} has no id")]
    MissingId { index: usize },

    #[error("duplicate node id: {0}")]
    DuplicateId(String),

    #[error("node {node} references unknown flow {flow}")]
    UnknownContainer { node: String, flow: String },
}
