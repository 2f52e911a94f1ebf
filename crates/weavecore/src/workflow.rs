use crate::credential::CredentialRef;
use crate::Value;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;
use uuid::Uuid;

pub type WorkflowId = Uuid;
pub type NodeId = String;

/// Complete workflow definition
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Workflow {
    pub id: WorkflowId,
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    pub nodes: Vec<NodeSpec>,
    #[serde(default)]
    pub connections: Vec<Connection>,
    #[serde(default)]
    pub settings: WorkflowSettings,
}

impl Workflow {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            description: None,
            nodes: Vec::new(),
            connections: Vec::new(),
            settings: WorkflowSettings::default(),
        }
    }

    pub fn add_node(&mut self, node: NodeSpec) -> NodeId {
        let id = node.id.clone();
        self.nodes.push(node);
        id
    }

    pub fn connect(
        &mut self,
        from_node: impl Into<NodeId>,
        from_port: impl Into<String>,
        to_node: impl Into<NodeId>,
        to_port: impl Into<String>,
    ) {
        self.connections.push(Connection {
            from_node: from_node.into(),
            from_port: from_port.into(),
            to_node: to_node.into(),
            to_port: to_port.into(),
        });
    }

    pub fn with_settings(mut self, settings: WorkflowSettings) -> Self {
        self.settings = settings;
        self
    }

    pub fn find_node(&self, id: &str) -> Option<&NodeSpec> {
        self.nodes.iter().find(|n| n.id == id)
    }

    /// Connections feeding into `node_id`.
    pub fn incoming<'a>(&'a self, node_id: &'a str) -> impl Iterator<Item = &'a Connection> + 'a {
        self.connections.iter().filter(move |c| c.to_node == node_id)
    }

    /// Connections leaving `node_id`.
    pub fn outgoing<'a>(&'a self, node_id: &'a str) -> impl Iterator<Item = &'a Connection> + 'a {
        self.connections.iter().filter(move |c| c.from_node == node_id)
    }
}

/// Node instance in a workflow
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeSpec {
    pub id: NodeId,
    pub node_type: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub config: HashMap<String, Value>,
    /// Credential slot name -> reference understood by the credential resolver.
    #[serde(default)]
    pub credentials: HashMap<String, CredentialRef>,
    #[serde(default)]
    pub timeout_ms: Option<u64>,
    #[serde(default)]
    pub position: Option<Position>,
}

impl NodeSpec {
    pub fn new(id: impl Into<NodeId>, node_type: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            node_type: node_type.into(),
            name: None,
            config: HashMap::new(),
            credentials: HashMap::new(),
            timeout_ms: None,
            position: None,
        }
    }

    pub fn with_config(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.config.insert(key.into(), value.into());
        self
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn with_credential(mut self, slot: impl Into<String>, reference: impl Into<CredentialRef>) -> Self {
        self.credentials.insert(slot.into(), reference.into());
        self
    }

    pub fn with_timeout(mut self, timeout_ms: u64) -> Self {
        self.timeout_ms = Some(timeout_ms);
        self
    }

    pub fn with_position(mut self, x: f32, y: f32) -> Self {
        self.position = Some(Position { x, y });
        self
    }
}

/// Connection between nodes
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Connection {
    pub from_node: NodeId,
    pub from_port: String,
    pub to_node: NodeId,
    pub to_port: String,
}

/// Node position in visual editor
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct Position {
    pub x: f32,
    pub y: f32,
}

/// Delay between retry attempts, growing geometrically up to a ceiling.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BackoffPolicy {
    pub delay_ms: u64,
    pub multiplier: f64,
    pub max_delay_ms: u64,
}

impl BackoffPolicy {
    /// Delay before `attempt` (the first retry is attempt 2).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(2).min(31) as i32;
        let scaled = self.delay_ms as f64 * self.multiplier.max(1.0).powi(exponent);
        let capped = scaled.min(self.max_delay_ms as f64).max(0.0);
        Duration::from_millis(capped as u64)
    }
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            delay_ms: 100,
            multiplier: 2.0,
            max_delay_ms: 5_000,
        }
    }
}

/// Global workflow settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkflowSettings {
    pub on_error: ErrorHandling,
    pub retry_count: u32,
    /// Falls back to the runtime's default backoff when unset.
    pub retry_backoff: Option<BackoffPolicy>,
    pub node_timeout_ms: Option<u64>,
    /// Hard deadline for the whole run, measured from its start.
    pub run_timeout_ms: Option<u64>,
    pub max_parallel_nodes: Option<usize>,
    /// Editor concern, carried for round-tripping only.
    pub auto_save: bool,
}

impl Default for WorkflowSettings {
    fn default() -> Self {
        Self {
            on_error: ErrorHandling::Stop,
            retry_count: 3,
            retry_backoff: None,
            node_timeout_ms: None,
            run_timeout_ms: None,
            max_parallel_nodes: None,
            auto_save: false,
        }
    }
}

impl WorkflowSettings {
    pub fn with_error_handling(mut self, on_error: ErrorHandling) -> Self {
        self.on_error = on_error;
        self
    }

    pub fn with_run_timeout(mut self, timeout_ms: u64) -> Self {
        self.run_timeout_ms = Some(timeout_ms);
        self
    }

    pub fn with_retries(mut self, retry_count: u32, backoff: BackoffPolicy) -> Self {
        self.on_error = ErrorHandling::Retry;
        self.retry_count = retry_count;
        self.retry_backoff = Some(backoff);
        self
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum ErrorHandling {
    /// Abort on the first unrecoverable node failure.
    #[default]
    Stop,
    /// Record the failure and let dependents run with an upstream-failure marker.
    Continue,
    /// Re-attempt failed nodes, then behave like `Stop`.
    Retry,
}

impl ErrorHandling {
    pub fn aborts_on_failure(self) -> bool {
        !matches!(self, ErrorHandling::Continue)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_grows_and_caps() {
        let backoff = BackoffPolicy {
            delay_ms: 100,
            multiplier: 2.0,
            max_delay_ms: 350,
        };
        assert_eq!(backoff.delay_for(2), Duration::from_millis(100));
        assert_eq!(backoff.delay_for(3), Duration::from_millis(200));
        assert_eq!(backoff.delay_for(4), Duration::from_millis(350));
        assert_eq!(backoff.delay_for(40), Duration::from_millis(350));
    }

    #[test]
    fn settings_deserialize_with_defaults() {
        let settings: WorkflowSettings =
            serde_json::from_str(r#"{"on_error": "continue"}"#).unwrap();
        assert_eq!(settings.on_error, ErrorHandling::Continue);
        assert_eq!(settings.retry_count, 3);
        assert!(settings.node_timeout_ms.is_none());
    }
}
