// Shared fixtures for the runtime integration tests

#![allow(dead_code)]

use async_trait::async_trait;
use futures::future::BoxFuture;
use futures::FutureExt;
use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex};
use weavecore::{
    Node, NodeContext, NodeError, NodeOutput, PortType, Value, Workflow, WorkflowSettings,
};
use weaveruntime::{Engine, NodeFactory, NodeMetadata, NodeRegistry, PortDefinition, RuntimeConfig};

pub const STEP: &str = "test.step";

pub type Behavior =
    Arc<dyn Fn(NodeContext) -> BoxFuture<'static, Result<NodeOutput, NodeError>> + Send + Sync>;

/// Wrap an async closure as node behaviour.
pub fn behavior<F, Fut>(f: F) -> Behavior
where
    F: Fn(NodeContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<NodeOutput, NodeError>> + Send + 'static,
{
    Arc::new(move |ctx| f(ctx).boxed())
}

struct FnNode {
    node_type: String,
    behavior: Behavior,
}

#[async_trait]
impl Node for FnNode {
    fn node_type(&self) -> &str {
        &self.node_type
    }

    async fn execute(&self, ctx: NodeContext) -> Result<NodeOutput, NodeError> {
        (self.behavior)(ctx).await
    }
}

pub struct FnFactory {
    node_type: String,
    metadata: NodeMetadata,
    behavior: Behavior,
}

impl FnFactory {
    pub fn new(node_type: &str, metadata: NodeMetadata, behavior: Behavior) -> Self {
        Self {
            node_type: node_type.to_string(),
            metadata,
            behavior,
        }
    }
}

impl NodeFactory for FnFactory {
    fn create(&self, _config: &HashMap<String, Value>) -> Result<Box<dyn Node>, NodeError> {
        Ok(Box::new(FnNode {
            node_type: self.node_type.clone(),
            behavior: self.behavior.clone(),
        }))
    }

    fn node_type(&self) -> &str {
        &self.node_type
    }

    fn metadata(&self) -> NodeMetadata {
        self.metadata.clone()
    }
}

/// One fan-in string input, one string output.
pub fn step_metadata() -> NodeMetadata {
    NodeMetadata::new("Test step", "test")
        .with_input(PortDefinition::new("in", PortType::String).multi())
        .with_output(PortDefinition::new("out", PortType::String))
}

pub fn engine_with(factories: Vec<FnFactory>) -> Engine {
    let mut registry = NodeRegistry::new();
    for factory in factories {
        registry.register(Arc::new(factory));
    }
    Engine::with_registry(Arc::new(registry), RuntimeConfig::default())
}

pub fn step_engine(behavior: Behavior) -> Engine {
    engine_with(vec![FnFactory::new(STEP, step_metadata(), behavior)])
}

/// Chain of step nodes connected `out -> in`.
pub fn chain(ids: &[&str]) -> Workflow {
    let mut wf = Workflow::new("chain");
    for id in ids {
        wf.add_node(weavecore::NodeSpec::new(*id, STEP));
    }
    for pair in ids.windows(2) {
        wf.connect(pair[0], "out", pair[1], "in");
    }
    wf
}

/// `A -> B -> D`, `A -> C -> D`
pub fn diamond(settings: WorkflowSettings) -> Workflow {
    let mut wf = Workflow::new("diamond").with_settings(settings);
    for id in ["A", "B", "C", "D"] {
        wf.add_node(weavecore::NodeSpec::new(id, STEP));
    }
    wf.connect("A", "out", "B", "in");
    wf.connect("A", "out", "C", "in");
    wf.connect("B", "out", "D", "in");
    wf.connect("C", "out", "D", "in");
    wf
}

/// Ordered log of node invocations.
#[derive(Clone, Default)]
pub struct Journal(Arc<Mutex<Vec<String>>>);

impl Journal {
    pub fn push(&self, node_id: &str) {
        self.0.lock().unwrap().push(node_id.to_string());
    }

    pub fn entries(&self) -> Vec<String> {
        self.0.lock().unwrap().clone()
    }

    pub fn count(&self, node_id: &str) -> usize {
        self.entries().iter().filter(|e| *e == node_id).count()
    }

    pub fn position(&self, node_id: &str) -> usize {
        self.entries()
            .iter()
            .position(|e| e == node_id)
            .unwrap_or_else(|| panic!("{} never ran", node_id))
    }
}

pub fn echo(node_id: &str) -> Result<NodeOutput, NodeError> {
    Ok(NodeOutput::new().with_output("out", node_id))
}
