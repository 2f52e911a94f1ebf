//! Core abstractions for the weave engine
//!
//! This crate provides the fundamental types and traits that all other
//! components depend on: the workflow model, the node contract, the
//! execution record and the error taxonomy.

pub mod credential;
mod error;
pub mod events;
mod node;
pub mod record;
mod value;
mod workflow;

pub use credential::{CredentialRef, Secret};
pub use error::{FlowError, NodeError, ValidationError, Violation, WorkflowError};
pub use events::*;
pub use node::{Node, NodeContext, NodeOutput, NodeState};
pub use record::{
    ExecutionRecord, ExecutionStatus, NodeAttempt, NodeExecutionResult, NodeStatus, SkipReason,
};
pub use value::{InputSlot, PortType, UpstreamFailure, Value};
pub use workflow::{
    BackoffPolicy, Connection, ErrorHandling, NodeId, NodeSpec, Position, Workflow, WorkflowId,
    WorkflowSettings,
};

/// Result type for flow operations
pub type Result<T> = std::result::Result<T, FlowError>;
