use async_trait::async_trait;
use std::collections::HashMap;
use weavecore::{Node, NodeContext, NodeError, NodeOutput, PortType, Value};
use weaveruntime::{NodeFactory, NodeMetadata, PortDefinition};

/// Manual trigger: starts a run and hands its payload to the first nodes
pub struct ManualTriggerNode;

#[async_trait]
impl Node for ManualTriggerNode {
    fn node_type(&self) -> &str {
        "core.trigger"
    }

    async fn execute(&self, ctx: NodeContext) -> Result<NodeOutput, NodeError> {
        let payload = match ctx.input_slot("payload") {
            Some(slot) => slot.value("payload")?.clone(),
            None => Value::Object(HashMap::new()),
        };
        ctx.events.info("Workflow triggered");

        Ok(NodeOutput::new().with_output("payload", payload))
    }
}

pub struct ManualTriggerNodeFactory;

impl NodeFactory for ManualTriggerNodeFactory {
    fn create(&self, _config: &HashMap<String, Value>) -> Result<Box<dyn Node>, NodeError> {
        Ok(Box::new(ManualTriggerNode))
    }

    fn node_type(&self) -> &str {
        "core.trigger"
    }

    fn metadata(&self) -> NodeMetadata {
        NodeMetadata::new("Starts a workflow with the run payload", "core")
            .as_trigger()
            .with_input(
                PortDefinition::new("payload", PortType::Object)
                    .with_description("Filled from the run inputs"),
            )
            .with_output(PortDefinition::new("payload", PortType::Object))
    }
}
