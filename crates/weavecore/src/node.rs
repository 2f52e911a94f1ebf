use crate::credential::Secret;
use crate::events::{EventEmitter, ExecutionId};
use crate::{InputSlot, NodeError, NodeId, Value};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;

/// Core trait that all executable nodes implement
#[async_trait]
pub trait Node: Send + Sync {
    /// Unique type identifier (e.g., "transform.json_parse", "time.delay")
    fn node_type(&self) -> &str;

    /// Execute the node with given context. Called once per attempt.
    async fn execute(&self, ctx: NodeContext) -> Result<NodeOutput, NodeError>;
}

/// Execution context passed to each node attempt
#[derive(Clone)]
pub struct NodeContext {
    /// Node instance id within the workflow
    pub node_id: NodeId,

    /// Run this invocation belongs to
    pub execution_id: ExecutionId,

    /// 1-based attempt number
    pub attempt: u32,

    /// Input slots keyed by input port id
    pub inputs: HashMap<String, InputSlot>,

    /// Static configuration merged over declared setting defaults
    pub config: HashMap<String, Value>,

    /// Resolved credentials keyed by credential slot
    pub credentials: HashMap<String, Secret>,

    /// State shared by every attempt of this node within one run
    pub state: Arc<RwLock<NodeState>>,

    /// Event emitter for real-time updates
    pub events: EventEmitter,

    /// Cancelled when the run is cancelled or this attempt times out
    pub cancellation: CancellationToken,
}

impl NodeContext {
    pub fn new(node_id: impl Into<NodeId>, execution_id: ExecutionId, events: EventEmitter) -> Self {
        Self {
            node_id: node_id.into(),
            execution_id,
            attempt: 1,
            inputs: HashMap::new(),
            config: HashMap::new(),
            credentials: HashMap::new(),
            state: Arc::new(RwLock::new(NodeState::default())),
            events,
            cancellation: CancellationToken::new(),
        }
    }

    /// Get a required single input value, surfacing upstream failure markers
    pub fn require_input(&self, name: &str) -> Result<&Value, NodeError> {
        self.inputs
            .get(name)
            .ok_or_else(|| NodeError::MissingInput(name.to_string()))?
            .value(name)
    }

    /// Raw slot, for nodes that want to react to upstream failures themselves
    pub fn input_slot(&self, name: &str) -> Option<&InputSlot> {
        self.inputs.get(name)
    }

    /// Get config value or return error
    pub fn require_config(&self, name: &str) -> Result<&Value, NodeError> {
        self.config
            .get(name)
            .ok_or_else(|| NodeError::Configuration(format!("Missing config: {}", name)))
    }

    /// Get config with default
    pub fn get_config_or(&self, name: &str, default: Value) -> Value {
        self.config.get(name).cloned().unwrap_or(default)
    }

    pub fn require_credential(&self, slot: &str) -> Result<&Secret, NodeError> {
        self.credentials
            .get(slot)
            .ok_or_else(|| NodeError::Configuration(format!("Missing credential: {}", slot)))
    }
}

/// Persistent state for a node instance
#[derive(Debug, Default, Clone, Serialize, Deserialize)]
pub struct NodeState {
    pub data: HashMap<String, Value>,
}

/// Output from node execution
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeOutput {
    /// Output port values
    pub outputs: HashMap<String, Value>,
}

impl NodeOutput {
    pub fn new() -> Self {
        Self {
            outputs: HashMap::new(),
        }
    }

    pub fn with_output(mut self, port: impl Into<String>, value: impl Into<Value>) -> Self {
        self.outputs.insert(port.into(), value.into());
        self
    }
}

impl Default for NodeOutput {
    fn default() -> Self {
        Self::new()
    }
}

