use async_trait::async_trait;
use std::collections::HashMap;
use weavecore::{InputSlot, Node, NodeContext, NodeError, NodeOutput, PortType, Value};
use weaveruntime::{NodeFactory, NodeMetadata, PortDefinition, SettingDefinition};

/// Simple debug node that logs its input
pub struct DebugNode {
    label: String,
}

#[async_trait]
impl Node for DebugNode {
    fn node_type(&self) -> &str {
        "debug.log"
    }

    async fn execute(&self, ctx: NodeContext) -> Result<NodeOutput, NodeError> {
        let message = match ctx.input_slot("message") {
            Some(InputSlot::UpstreamFailed(failure)) => {
                ctx.events.warn(format!(
                    "{}: upstream node '{}' failed: {}",
                    self.label, failure.node_id, failure.error
                ));
                return Ok(NodeOutput::new().with_output("message", Value::Null));
            }
            Some(slot) => slot.value("message")?.clone(),
            None => Value::from("(no message)"),
        };

        let rendered = match &message {
            Value::String(s) => s.clone(),
            other => other.to_plain_json().to_string(),
        };
        tracing::info!(node_id = %ctx.node_id, "{}: {}", self.label, rendered);
        ctx.events.info(format!("{}: {}", self.label, rendered));

        Ok(NodeOutput::new().with_output("message", message))
    }
}

pub struct DebugNodeFactory;

impl NodeFactory for DebugNodeFactory {
    fn create(&self, config: &HashMap<String, Value>) -> Result<Box<dyn Node>, NodeError> {
        let label = config
            .get("label")
            .and_then(|v| v.as_str())
            .unwrap_or("DEBUG")
            .to_string();
        Ok(Box::new(DebugNode { label }))
    }

    fn node_type(&self) -> &str {
        "debug.log"
    }

    fn metadata(&self) -> NodeMetadata {
        NodeMetadata::new("Logs its input for debugging", "debug")
            .with_input(
                PortDefinition::new("message", PortType::String)
                    .with_description("Value to log; non-strings are logged as JSON"),
            )
            .with_output(PortDefinition::new("message", PortType::String))
            .with_setting(SettingDefinition::new("label", PortType::String).with_default("DEBUG"))
    }
}
