use crate::credentials::CredentialCache;
use crate::registry::NodeMetadata;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use weavecore::{
    EventBus, ExecutionId, ExecutionRecord, InputSlot, NodeContext, NodeError, NodeSpec,
    NodeState, NodeStatus, Secret, UpstreamFailure, Value, Workflow,
};

/// Inputs and config captured for a node when it becomes ready. Upstream
/// results are final by then, so every attempt of the node reuses them.
#[derive(Debug, Clone)]
pub struct PreparedInputs {
    pub inputs: HashMap<String, InputSlot>,
    pub config: HashMap<String, Value>,
}

/// Assembles the `NodeContext` handed to each node attempt.
pub struct ContextBuilder {
    execution_id: ExecutionId,
    workflow: Arc<Workflow>,
    credentials: Arc<CredentialCache>,
    run_inputs: Arc<HashMap<String, Value>>,
    events: Arc<EventBus>,
}

impl ContextBuilder {
    pub fn new(
        execution_id: ExecutionId,
        workflow: Arc<Workflow>,
        credentials: Arc<CredentialCache>,
        run_inputs: Arc<HashMap<String, Value>>,
        events: Arc<EventBus>,
    ) -> Self {
        Self {
            execution_id,
            workflow,
            credentials,
            run_inputs,
            events,
        }
    }

    /// Read upstream outputs out of `record` into one slot per declared input.
    ///
    /// Connected ports take the recorded output of their source port, or an
    /// upstream-failure marker when the source failed, and never a default.
    /// Unconnected ports fall back to the run inputs (root nodes only) and
    /// then to the port default.
    pub fn prepare(
        &self,
        node: &NodeSpec,
        metadata: &NodeMetadata,
        record: &ExecutionRecord,
        is_root: bool,
    ) -> PreparedInputs {
        let mut inputs = HashMap::new();

        for port in &metadata.inputs {
            let mut slots = Vec::new();
            let mut connected = false;
            for conn in self.workflow.incoming(&node.id).filter(|c| c.to_port == port.id) {
                connected = true;
                let Some(source) = record.node(&conn.from_node) else {
                    continue;
                };
                match source.status {
                    NodeStatus::Success => {
                        if let Some(value) = source.outputs.as_ref().and_then(|o| o.get(&conn.from_port)) {
                            slots.push(InputSlot::Value(value.clone()));
                        }
                    }
                    NodeStatus::Error | NodeStatus::Cancelled => {
                        slots.push(InputSlot::UpstreamFailed(UpstreamFailure {
                            node_id: conn.from_node.clone(),
                            port: conn.from_port.clone(),
                            error: source.error.clone().unwrap_or_default(),
                        }));
                    }
                    _ => {}
                }
            }

            let slot = if !connected {
                is_root
                    .then(|| self.run_inputs.get(&port.id).cloned())
                    .flatten()
                    .or_else(|| port.default.clone())
                    .map(InputSlot::Value)
            } else if port.multi {
                Some(InputSlot::Many(slots))
            } else {
                // A source that succeeded without emitting this port leaves it empty
                slots.into_iter().next()
            };

            if let Some(slot) = slot {
                inputs.insert(port.id.clone(), slot);
            }
        }

        let mut config: HashMap<String, Value> = metadata
            .settings
            .iter()
            .filter_map(|s| s.default.clone().map(|d| (s.key.clone(), d)))
            .collect();
        config.extend(node.config.iter().map(|(k, v)| (k.clone(), v.clone())));

        PreparedInputs { inputs, config }
    }

    pub async fn resolve_credentials(&self, node: &NodeSpec) -> Result<HashMap<String, Secret>, NodeError> {
        self.credentials.resolve_node(node).await
    }

    pub fn build(
        &self,
        node: &NodeSpec,
        prepared: &PreparedInputs,
        credentials: HashMap<String, Secret>,
        attempt: u32,
        state: Arc<RwLock<NodeState>>,
        cancellation: CancellationToken,
    ) -> NodeContext {
        NodeContext {
            node_id: node.id.clone(),
            execution_id: self.execution_id,
            attempt,
            inputs: prepared.inputs.clone(),
            config: prepared.config.clone(),
            credentials,
            state,
            events: self.events.create_emitter(self.execution_id, node.id.clone()),
            cancellation,
        }
    }
}
