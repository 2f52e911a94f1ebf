use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use weavecore::{Node, NodeError, PortType, Value, WorkflowError};

/// Factory trait for creating node instances
pub trait NodeFactory: Send + Sync {
    /// Create a new instance of the node with given configuration
    fn create(&self, config: &HashMap<String, Value>) -> Result<Box<dyn Node>, NodeError>;

    /// Get node type identifier
    fn node_type(&self) -> &str;

    /// Declared ports, settings and credentials of this node type
    fn metadata(&self) -> NodeMetadata {
        NodeMetadata::default()
    }
}

/// Metadata about a node type
#[derive(Debug, Clone, Serialize)]
pub struct NodeMetadata {
    pub description: String,
    pub category: String,
    /// Trigger nodes start a workflow; a trigger that cannot resolve its
    /// credentials aborts the whole run.
    pub trigger: bool,
    pub inputs: Vec<PortDefinition>,
    pub outputs: Vec<PortDefinition>,
    pub settings: Vec<SettingDefinition>,
    pub credentials: Vec<CredentialRequirement>,
}

impl Default for NodeMetadata {
    fn default() -> Self {
        Self {
            description: String::new(),
            category: "general".to_string(),
            trigger: false,
            inputs: Vec::new(),
            outputs: Vec::new(),
            settings: Vec::new(),
            credentials: Vec::new(),
        }
    }
}

impl NodeMetadata {
    pub fn new(description: impl Into<String>, category: impl Into<String>) -> Self {
        Self {
            description: description.into(),
            category: category.into(),
            ..Self::default()
        }
    }

    pub fn as_trigger(mut self) -> Self {
        self.trigger = true;
        self
    }

    pub fn with_input(mut self, port: PortDefinition) -> Self {
        self.inputs.push(port);
        self
    }

    pub fn with_output(mut self, port: PortDefinition) -> Self {
        self.outputs.push(port);
        self
    }

    pub fn with_setting(mut self, setting: SettingDefinition) -> Self {
        self.settings.push(setting);
        self
    }

    pub fn with_credential(mut self, credential: CredentialRequirement) -> Self {
        self.credentials.push(credential);
        self
    }

    pub fn input(&self, id: &str) -> Option<&PortDefinition> {
        self.inputs.iter().find(|p| p.id == id)
    }

    pub fn output(&self, id: &str) -> Option<&PortDefinition> {
        self.outputs.iter().find(|p| p.id == id)
    }

    pub fn setting(&self, key: &str) -> Option<&SettingDefinition> {
        self.settings.iter().find(|s| s.key == key)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct PortDefinition {
    pub id: String,
    pub port_type: PortType,
    pub description: String,
    pub required: bool,
    pub default: Option<Value>,
    /// Accepts any number of incoming connections
    pub multi: bool,
}

impl PortDefinition {
    pub fn new(id: impl Into<String>, port_type: PortType) -> Self {
        Self {
            id: id.into(),
            port_type,
            description: String::new(),
            required: false,
            default: None,
            multi: false,
        }
    }

    pub fn required(mut self) -> Self {
        self.required = true;
        self
    }

    pub fn multi(mut self) -> Self {
        self.multi = true;
        self
    }

    pub fn with_default(mut self, value: impl Into<Value>) -> Self {
        self.default = Some(value.into());
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SettingDefinition {
    pub key: String,
    pub setting_type: PortType,
    pub description: String,
    pub required: bool,
    pub default: Option<Value>,
}

impl SettingDefinition {
    pub fn new(key: impl Into<String>, setting_type: PortType) -> Self {
        Self {
            key: key.into(),
            setting_type,
            description: String::new(),
            required: false,
            default: None,
        }
    }

    pub fn required(mut self) -> Self {
        self.required = true;
        self
    }

    pub fn with_default(mut self, value: impl Into<Value>) -> Self {
        self.default = Some(value.into());
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct CredentialRequirement {
    pub slot: String,
    pub description: String,
    pub required: bool,
}

impl CredentialRequirement {
    pub fn required(slot: impl Into<String>) -> Self {
        Self {
            slot: slot.into(),
            description: String::new(),
            required: true,
        }
    }

    pub fn optional(slot: impl Into<String>) -> Self {
        Self {
            slot: slot.into(),
            description: String::new(),
            required: false,
        }
    }
}

/// Registry of available node types
pub struct NodeRegistry {
    factories: HashMap<String, Arc<dyn NodeFactory>>,
}

impl NodeRegistry {
    pub fn new() -> Self {
        Self {
            factories: HashMap::new(),
        }
    }

    /// Register a node factory
    pub fn register(&mut self, factory: Arc<dyn NodeFactory>) {
        let node_type = factory.node_type().to_string();
        tracing::info!("Registering node type: {}", node_type);
        self.factories.insert(node_type, factory);
    }

    /// Resolve a node type to its factory
    pub fn resolve(&self, node_type: &str) -> Result<Arc<dyn NodeFactory>, WorkflowError> {
        self.factories
            .get(node_type)
            .cloned()
            .ok_or_else(|| WorkflowError::UnknownNodeType(node_type.to_string()))
    }

    /// Create a node instance from a node type and config
    pub fn create_node(
        &self,
        node_type: &str,
        config: &HashMap<String, Value>,
    ) -> Result<Box<dyn Node>, WorkflowError> {
        let factory = self.resolve(node_type)?;

        factory
            .create(config)
            .map_err(|e| WorkflowError::Invalid(format!("Failed to create node: {}", e)))
    }

    pub fn contains(&self, node_type: &str) -> bool {
        self.factories.contains_key(node_type)
    }

    /// Get all registered node types, sorted
    pub fn list_node_types(&self) -> Vec<String> {
        let mut types: Vec<String> = self.factories.keys().cloned().collect();
        types.sort();
        types
    }

    /// Get metadata for a node type
    pub fn get_metadata(&self, node_type: &str) -> Option<NodeMetadata> {
        self.factories.get(node_type).map(|f| f.metadata())
    }
}

impl Default for NodeRegistry {
    fn default() -> Self {
        Self::new()
    }
}
