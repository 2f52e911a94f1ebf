use crate::{NodeId, PortType};
use std::fmt;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum FlowError {
    #[error("Node error: {0}")]
    Node(#[from] NodeError),

    #[error("Workflow error: {0}")]
    Workflow(#[from] WorkflowError),

    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error("Execution error: {0}")]
    Execution(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum NodeError {
    #[error("Missing required input: {0}")]
    MissingInput(String),

    #[error("Invalid input type for '{field}': expected {expected}, got {actual}")]
    InvalidInputType {
        field: String,
        expected: String,
        actual: String,
    },

    #[error("Input '{port}' is unavailable: upstream node '{node_id}' failed: {error}")]
    UpstreamFailed {
        port: String,
        node_id: NodeId,
        error: String,
    },

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Execution failed: {0}")]
    ExecutionFailed(String),

    #[error("Node initialization failed: {0}")]
    InitializationFailed(String),

    #[error("Credential resolution failed for '{slot}': {message}")]
    CredentialResolution { slot: String, message: String },

    #[error("Timeout after {millis}ms")]
    Timeout { millis: u64 },

    #[error("Cancelled")]
    Cancelled,
}

impl NodeError {
    /// Whether another attempt could plausibly change the outcome.
    pub fn is_retryable(&self) -> bool {
        !matches!(
            self,
            NodeError::Cancelled
                | NodeError::CredentialResolution { .. }
                | NodeError::InitializationFailed(_)
        )
    }
}

#[derive(Error, Debug)]
pub enum WorkflowError {
    #[error("Workflow not found: {0}")]
    NotFound(String),

    #[error("Invalid workflow: {0}")]
    Invalid(String),

    #[error("Node not found: {0}")]
    NodeNotFound(String),

    #[error("Unknown node type: {0}")]
    UnknownNodeType(String),

    #[error("Execution not found: {0}")]
    ExecutionNotFound(String),
}

/// Every structural defect found in a workflow, reported together.
#[derive(Error, Debug, Clone, PartialEq)]
pub struct ValidationError {
    pub violations: Vec<Violation>,
}

impl ValidationError {
    pub fn new(violations: Vec<Violation>) -> Self {
        Self { violations }
    }

    pub fn contains(&self, predicate: impl Fn(&Violation) -> bool) -> bool {
        self.violations.iter().any(predicate)
    }
}

impl fmt::Display for ValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "workflow failed validation with {} violation(s)", self.violations.len())?;
        for violation in &self.violations {
            write!(f, "\n  - {}", violation)?;
        }
        Ok(())
    }
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum Violation {
    #[error("duplicate node id '{0}'")]
    DuplicateNodeId(NodeId),

    #[error("node '{node_id}' has unknown type '{node_type}'")]
    UnknownNodeType { node_id: NodeId, node_type: String },

    #[error("connection {from_node}.{from_port} -> {to_node}.{to_port} references missing node '{missing}'")]
    DanglingConnection {
        from_node: NodeId,
        from_port: String,
        to_node: NodeId,
        to_port: String,
        missing: NodeId,
    },

    #[error("node '{node_id}' has no output port '{port}'")]
    UnknownOutputPort { node_id: NodeId, port: String },

    #[error("node '{node_id}' has no input port '{port}'")]
    UnknownInputPort { node_id: NodeId, port: String },

    #[error("input '{node_id}.{port}' is single-valued but has {count} incoming connections")]
    MultipleSources {
        node_id: NodeId,
        port: String,
        count: usize,
    },

    #[error("required input '{node_id}.{port}' has no connection and no default")]
    MissingRequiredInput { node_id: NodeId, port: String },

    #[error("required input '{node_id}.{port}' ({expected}) has no source of a compatible type")]
    IncompatibleRequiredInput {
        node_id: NodeId,
        port: String,
        expected: PortType,
    },

    #[error("cycle detected between nodes [{}]", .nodes.join(", "))]
    Cycle { nodes: Vec<NodeId> },

    #[error("node '{node_id}' has undeclared config key '{key}'")]
    UnknownConfigKey { node_id: NodeId, key: String },

    #[error("node '{node_id}' is missing required setting '{key}'")]
    MissingRequiredSetting { node_id: NodeId, key: String },

    #[error("setting '{key}' of node '{node_id}' is {actual} but must be {expected}")]
    ConfigTypeMismatch {
        node_id: NodeId,
        key: String,
        expected: PortType,
        actual: PortType,
    },

    #[error("node '{node_id}' is missing required credential '{slot}'")]
    MissingCredential { node_id: NodeId, slot: String },

    #[error("node '{node_id}' references undeclared credential slot '{slot}'")]
    UnknownCredentialSlot { node_id: NodeId, slot: String },
}
