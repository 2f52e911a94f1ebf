use crate::{NodeError, NodeId};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

/// Dynamic value type for node inputs/outputs
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", content = "value")]
pub enum Value {
    Null,
    Bool(bool),
    Number(f64),
    String(String),
    Bytes(Vec<u8>),
    Json(serde_json::Value),
    Array(Vec<Value>),
    Object(HashMap<String, Value>),
}

/// Declared type of a port. Metadata only, values are never coerced.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum PortType {
    String,
    Number,
    Boolean,
    Object,
    Array,
    File,
}

impl fmt::Display for PortType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            PortType::String => "string",
            PortType::Number => "number",
            PortType::Boolean => "boolean",
            PortType::Object => "object",
            PortType::Array => "array",
            PortType::File => "file",
        };
        f.write_str(name)
    }
}

impl Value {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Number(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_json(&self) -> Option<&serde_json::Value> {
        match self {
            Value::Json(j) => Some(j),
            _ => None,
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// The port type this value would satisfy, `None` for null.
    pub fn kind(&self) -> Option<PortType> {
        match self {
            Value::Null => None,
            Value::Bool(_) => Some(PortType::Boolean),
            Value::Number(_) => Some(PortType::Number),
            Value::String(_) => Some(PortType::String),
            Value::Bytes(_) => Some(PortType::File),
            Value::Array(_) => Some(PortType::Array),
            Value::Object(_) => Some(PortType::Object),
            Value::Json(json) => match json {
                serde_json::Value::Null => None,
                serde_json::Value::Bool(_) => Some(PortType::Boolean),
                serde_json::Value::Number(_) => Some(PortType::Number),
                serde_json::Value::String(_) => Some(PortType::String),
                serde_json::Value::Array(_) => Some(PortType::Array),
                serde_json::Value::Object(_) => Some(PortType::Object),
            },
        }
    }

    /// Convert untagged JSON (as typed by a user) into a `Value` tree.
    pub fn from_plain_json(json: serde_json::Value) -> Self {
        match json {
            serde_json::Value::Null => Value::Null,
            serde_json::Value::Bool(b) => Value::Bool(b),
            serde_json::Value::Number(n) => Value::Number(n.as_f64().unwrap_or_default()),
            serde_json::Value::String(s) => Value::String(s),
            serde_json::Value::Array(arr) => {
                Value::Array(arr.into_iter().map(Value::from_plain_json).collect())
            }
            serde_json::Value::Object(obj) => Value::Object(
                obj.into_iter()
                    .map(|(k, v)| (k, Value::from_plain_json(v)))
                    .collect(),
            ),
        }
    }

    /// Inverse of `from_plain_json`: the untagged JSON a user would write.
    pub fn to_plain_json(&self) -> serde_json::Value {
        match self {
            Value::Null => serde_json::Value::Null,
            Value::Bool(b) => serde_json::Value::Bool(*b),
            Value::Number(n) => serde_json::Number::from_f64(*n)
                .map(serde_json::Value::Number)
                .unwrap_or(serde_json::Value::Null),
            Value::String(s) => serde_json::Value::String(s.clone()),
            Value::Bytes(bytes) => serde_json::Value::Array(
                bytes.iter().map(|b| serde_json::Value::from(*b)).collect(),
            ),
            Value::Json(json) => json.clone(),
            Value::Array(items) => {
                serde_json::Value::Array(items.iter().map(Value::to_plain_json).collect())
            }
            Value::Object(map) => serde_json::Value::Object(
                map.iter().map(|(k, v)| (k.clone(), v.to_plain_json())).collect(),
            ),
        }
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::String(s)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::String(s.to_string())
    }
}

impl From<f64> for Value {
    fn from(n: f64) -> Self {
        Value::Number(n)
    }
}

impl From<i64> for Value {
    fn from(n: i64) -> Self {
        Value::Number(n as f64)
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl From<serde_json::Value> for Value {
    fn from(j: serde_json::Value) -> Self {
        Value::Json(j)
    }
}

impl From<Vec<Value>> for Value {
    fn from(items: Vec<Value>) -> Self {
        Value::Array(items)
    }
}

/// Marker delivered in place of a value whose producer failed.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct UpstreamFailure {
    pub node_id: NodeId,
    pub port: String,
    pub error: String,
}

/// What a node receives on one of its input ports.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "slot", content = "content", rename_all = "snake_case")]
pub enum InputSlot {
    Value(Value),
    UpstreamFailed(UpstreamFailure),
    /// One entry per connection into a multi-valued port.
    Many(Vec<InputSlot>),
}

impl InputSlot {
    pub fn as_value(&self) -> Option<&Value> {
        match self {
            InputSlot::Value(value) => Some(value),
            _ => None,
        }
    }

    pub fn is_upstream_failed(&self) -> bool {
        matches!(self, InputSlot::UpstreamFailed(_))
    }

    /// Resolve to a value, surfacing the failure marker as an error.
    pub fn value(&self, port: &str) -> Result<&Value, NodeError> {
        match self {
            InputSlot::Value(value) => Ok(value),
            InputSlot::UpstreamFailed(failure) => Err(NodeError::UpstreamFailed {
                port: port.to_string(),
                node_id: failure.node_id.clone(),
                error: failure.error.clone(),
            }),
            InputSlot::Many(_) => Err(NodeError::InvalidInputType {
                field: port.to_string(),
                expected: "single value".to_string(),
                actual: "multiple values".to_string(),
            }),
        }
    }
}

impl From<Value> for InputSlot {
    fn from(value: Value) -> Self {
        InputSlot::Value(value)
    }
}
