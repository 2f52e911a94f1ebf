use async_trait::async_trait;
use std::collections::HashMap;
use tokio::time::{sleep, Duration};
use weavecore::{Node, NodeContext, NodeError, NodeOutput, PortType, Value};
use weaveruntime::{NodeFactory, NodeMetadata, PortDefinition, SettingDefinition};

/// Delay execution for a specified duration
pub struct DelayNode;

#[async_trait]
impl Node for DelayNode {
    fn node_type(&self) -> &str {
        "time.delay"
    }

    async fn execute(&self, ctx: NodeContext) -> Result<NodeOutput, NodeError> {
        let delay_ms = ctx
            .get_config_or("delay_ms", Value::Number(1000.0))
            .as_f64()
            .filter(|ms| *ms >= 0.0)
            .ok_or_else(|| {
                NodeError::Configuration("delay_ms must be a non-negative number".to_string())
            })? as u64;

        ctx.events.info(format!("Delaying for {}ms", delay_ms));

        tokio::select! {
            _ = sleep(Duration::from_millis(delay_ms)) => {}
            _ = ctx.cancellation.cancelled() => return Err(NodeError::Cancelled),
        }
        ctx.events.progress(100.0, Some(format!("waited {}ms", delay_ms)));

        // Pass the input through unchanged
        let value = match ctx.input_slot("value") {
            Some(slot) => slot.value("value")?.clone(),
            None => Value::Null,
        };
        Ok(NodeOutput::new().with_output("value", value))
    }
}

pub struct DelayNodeFactory;

impl NodeFactory for DelayNodeFactory {
    fn create(&self, _config: &HashMap<String, Value>) -> Result<Box<dyn Node>, NodeError> {
        Ok(Box::new(DelayNode))
    }

    fn node_type(&self) -> &str {
        "time.delay"
    }

    fn metadata(&self) -> NodeMetadata {
        NodeMetadata::new("Delay execution for specified milliseconds", "time")
            .with_input(PortDefinition::new("value", PortType::Object))
            .with_output(PortDefinition::new("value", PortType::Object))
            .with_setting(
                SettingDefinition::new("delay_ms", PortType::Number)
                    .with_default(1000.0)
                    .with_description("How long to wait"),
            )
    }
}
