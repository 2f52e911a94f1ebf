//! Workflow execution runtime
//!
//! This crate provides the actual execution engine that runs workflows:
//! the node registry, graph validation, credential resolution, the
//! execution tracker and the DAG-based parallel executor.

pub mod credentials;
mod context;
mod executor;
mod plan;
mod registry;
mod runtime;
pub mod sink;
mod tracker;
pub mod validator;

pub use context::{ContextBuilder, PreparedInputs};
pub use credentials::{
    CredentialCache, CredentialError, CredentialResolver, EnvCredentialResolver,
    StaticCredentialResolver,
};
pub use executor::WorkflowExecutor;
pub use plan::DependencyPlan;
pub use registry::{
    CredentialRequirement, NodeFactory, NodeMetadata, NodeRegistry, PortDefinition,
    SettingDefinition,
};
pub use runtime::{Engine, RuntimeConfig};
pub use sink::{ExecutionSink, MemorySink, NoopSink};
pub use tracker::ExecutionTracker;
pub use validator::{validate, ValidatedWorkflow, ValidationWarning};
