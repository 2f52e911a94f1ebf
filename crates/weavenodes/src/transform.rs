use async_trait::async_trait;
use std::collections::HashMap;
use weavecore::{Node, NodeContext, NodeError, NodeOutput, PortType, Value};
use weaveruntime::{NodeFactory, NodeMetadata, PortDefinition, SettingDefinition};

/// Parse JSON string to Value
pub struct JsonParseNode;

#[async_trait]
impl Node for JsonParseNode {
    fn node_type(&self) -> &str {
        "transform.json_parse"
    }

    async fn execute(&self, ctx: NodeContext) -> Result<NodeOutput, NodeError> {
        let input = ctx.require_input("json")?;
        let text = input.as_str().ok_or_else(|| NodeError::InvalidInputType {
            field: "json".to_string(),
            expected: PortType::String.to_string(),
            actual: input
                .kind()
                .map(|k| k.to_string())
                .unwrap_or_else(|| "null".to_string()),
        })?;

        let parsed: serde_json::Value = serde_json::from_str(text)
            .map_err(|e| NodeError::ExecutionFailed(format!("JSON parse error: {}", e)))?;

        Ok(NodeOutput::new().with_output("parsed", Value::Json(parsed)))
    }
}

pub struct JsonParseNodeFactory;

impl NodeFactory for JsonParseNodeFactory {
    fn create(&self, _config: &HashMap<String, Value>) -> Result<Box<dyn Node>, NodeError> {
        Ok(Box::new(JsonParseNode))
    }

    fn node_type(&self) -> &str {
        "transform.json_parse"
    }

    fn metadata(&self) -> NodeMetadata {
        NodeMetadata::new("Parse JSON string", "transform")
            .with_input(PortDefinition::new("json", PortType::String).required())
            .with_output(PortDefinition::new("parsed", PortType::Object))
    }
}

/// Stringify Value to JSON
pub struct JsonStringifyNode {
    pretty: bool,
}

#[async_trait]
impl Node for JsonStringifyNode {
    fn node_type(&self) -> &str {
        "transform.json_stringify"
    }

    async fn execute(&self, ctx: NodeContext) -> Result<NodeOutput, NodeError> {
        let value = ctx.require_input("value")?.to_plain_json();

        let json_str = if self.pretty {
            serde_json::to_string_pretty(&value)
        } else {
            serde_json::to_string(&value)
        }
        .map_err(|e| NodeError::ExecutionFailed(format!("JSON stringify error: {}", e)))?;

        Ok(NodeOutput::new().with_output("json", json_str))
    }
}

pub struct JsonStringifyNodeFactory;

impl NodeFactory for JsonStringifyNodeFactory {
    fn create(&self, config: &HashMap<String, Value>) -> Result<Box<dyn Node>, NodeError> {
        let pretty = match config.get("pretty") {
            None => false,
            Some(value) => value.as_bool().ok_or_else(|| {
                NodeError::Configuration("pretty must be a boolean".to_string())
            })?,
        };
        Ok(Box::new(JsonStringifyNode { pretty }))
    }

    fn node_type(&self) -> &str {
        "transform.json_stringify"
    }

    fn metadata(&self) -> NodeMetadata {
        NodeMetadata::new("Convert value to JSON string", "transform")
            .with_input(PortDefinition::new("value", PortType::Object).required())
            .with_output(PortDefinition::new("json", PortType::String))
            .with_setting(SettingDefinition::new("pretty", PortType::Boolean).with_default(false))
    }
}
