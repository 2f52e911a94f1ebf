//! Structural validation of a workflow before it is allowed to run.
//!
//! Validation is a pure function of the workflow and the registry's node
//! metadata. It reports every violation it finds rather than stopping at the
//! first one, and separates hard violations from type warnings. A port type
//! mismatch only blocks a run when it leaves a required input without a
//! single compatible source.

use crate::registry::{NodeMetadata, NodeRegistry};
use petgraph::algo::{tarjan_scc, toposort};
use petgraph::graph::{DiGraph, NodeIndex};
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;
use weavecore::{NodeId, PortType, ValidationError, Violation, Workflow};

/// Non-blocking findings.
#[derive(Debug, Clone, PartialEq)]
pub enum ValidationWarning {
    PortTypeMismatch {
        from_node: NodeId,
        from_port: String,
        from_type: PortType,
        to_node: NodeId,
        to_port: String,
        to_type: PortType,
    },
    DefaultTypeMismatch {
        node_id: NodeId,
        port: String,
        expected: PortType,
        actual: PortType,
    },
}

impl fmt::Display for ValidationWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ValidationWarning::PortTypeMismatch {
                from_node,
                from_port,
                from_type,
                to_node,
                to_port,
                to_type,
            } => write!(
                f,
                "{}.{} ({}) feeds {}.{} ({})",
                from_node, from_port, from_type, to_node, to_port, to_type
            ),
            ValidationWarning::DefaultTypeMismatch {
                node_id,
                port,
                expected,
                actual,
            } => write!(
                f,
                "default of {}.{} is {} but the port is {}",
                node_id, port, actual, expected
            ),
        }
    }
}

/// A workflow that passed validation, with everything the executor needs to
/// plan it.
#[derive(Clone)]
pub struct ValidatedWorkflow {
    pub workflow: Arc<Workflow>,
    pub metadata: HashMap<NodeId, NodeMetadata>,
    /// Dependency graph, one vertex per node, at most one edge per node pair
    pub graph: DiGraph<NodeId, ()>,
    pub node_to_index: HashMap<NodeId, NodeIndex>,
    /// A topological order of all nodes
    pub order: Vec<NodeId>,
    pub warnings: Vec<ValidationWarning>,
}

impl fmt::Debug for ValidatedWorkflow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ValidatedWorkflow")
            .field("workflow_id", &self.workflow.id)
            .field("order", &self.order)
            .field("warnings", &self.warnings)
            .finish()
    }
}

/// Validate `workflow` against the node types known to `registry`.
pub fn validate(
    workflow: &Workflow,
    registry: &NodeRegistry,
) -> Result<ValidatedWorkflow, ValidationError> {
    let mut violations = Vec::new();
    let mut warnings = Vec::new();

    // Node identity and per-node schema checks
    let mut seen = HashSet::new();
    let mut reported_duplicates = HashSet::new();
    let mut metadata = HashMap::new();
    for node in &workflow.nodes {
        if !seen.insert(node.id.as_str()) {
            if reported_duplicates.insert(node.id.as_str()) {
                violations.push(Violation::DuplicateNodeId(node.id.clone()));
            }
            continue;
        }

        let Some(meta) = registry.get_metadata(&node.node_type) else {
            violations.push(Violation::UnknownNodeType {
                node_id: node.id.clone(),
                node_type: node.node_type.clone(),
            });
            continue;
        };

        let mut keys: Vec<&String> = node.config.keys().collect();
        keys.sort();
        for key in keys {
            let Some(setting) = meta.setting(key) else {
                violations.push(Violation::UnknownConfigKey {
                    node_id: node.id.clone(),
                    key: key.clone(),
                });
                continue;
            };
            if let Some(actual) = node.config[key].kind() {
                if actual != setting.setting_type {
                    violations.push(Violation::ConfigTypeMismatch {
                        node_id: node.id.clone(),
                        key: key.clone(),
                        expected: setting.setting_type,
                        actual,
                    });
                }
            }
        }
        for setting in &meta.settings {
            if setting.required && setting.default.is_none() && !node.config.contains_key(&setting.key) {
                violations.push(Violation::MissingRequiredSetting {
                    node_id: node.id.clone(),
                    key: setting.key.clone(),
                });
            }
        }

        for requirement in &meta.credentials {
            if requirement.required && !node.credentials.contains_key(&requirement.slot) {
                violations.push(Violation::MissingCredential {
                    node_id: node.id.clone(),
                    slot: requirement.slot.clone(),
                });
            }
        }
        let mut slots: Vec<&String> = node.credentials.keys().collect();
        slots.sort();
        for slot in slots {
            if !meta.credentials.iter().any(|c| &c.slot == slot) {
                violations.push(Violation::UnknownCredentialSlot {
                    node_id: node.id.clone(),
                    slot: slot.clone(),
                });
            }
        }

        for port in &meta.inputs {
            if let Some(actual) = port.default.as_ref().and_then(|d| d.kind()) {
                if actual != port.port_type {
                    warnings.push(ValidationWarning::DefaultTypeMismatch {
                        node_id: node.id.clone(),
                        port: port.id.clone(),
                        expected: port.port_type,
                        actual,
                    });
                }
            }
        }

        metadata.insert(node.id.clone(), meta);
    }

    // Connections: referential integrity and port existence
    let mut sources_per_input: HashMap<(&str, &str), usize> = HashMap::new();
    let mut compatible_per_input: HashMap<(&str, &str), usize> = HashMap::new();
    for conn in &workflow.connections {
        let mut dangling = false;
        for missing in [&conn.from_node, &conn.to_node] {
            if !seen.contains(missing.as_str()) {
                dangling = true;
                violations.push(Violation::DanglingConnection {
                    from_node: conn.from_node.clone(),
                    from_port: conn.from_port.clone(),
                    to_node: conn.to_node.clone(),
                    to_port: conn.to_port.clone(),
                    missing: missing.clone(),
                });
            }
        }
        if dangling {
            continue;
        }

        *sources_per_input
            .entry((conn.to_node.as_str(), conn.to_port.as_str()))
            .or_default() += 1;

        let output = metadata.get(&conn.from_node).map(|m| m.output(&conn.from_port));
        let input = metadata.get(&conn.to_node).map(|m| m.input(&conn.to_port));
        if let Some(None) = output {
            violations.push(Violation::UnknownOutputPort {
                node_id: conn.from_node.clone(),
                port: conn.from_port.clone(),
            });
        }
        if let Some(None) = input {
            violations.push(Violation::UnknownInputPort {
                node_id: conn.to_node.clone(),
                port: conn.to_port.clone(),
            });
        }
        if let (Some(Some(out_port)), Some(Some(in_port))) = (output, input) {
            if out_port.port_type == in_port.port_type {
                *compatible_per_input
                    .entry((conn.to_node.as_str(), conn.to_port.as_str()))
                    .or_default() += 1;
            } else {
                warnings.push(ValidationWarning::PortTypeMismatch {
                    from_node: conn.from_node.clone(),
                    from_port: conn.from_port.clone(),
                    from_type: out_port.port_type,
                    to_node: conn.to_node.clone(),
                    to_port: conn.to_port.clone(),
                    to_type: in_port.port_type,
                });
            }
        }
    }

    // Input cardinality and required inputs
    for node in &workflow.nodes {
        let Some(meta) = metadata.get(&node.id) else {
            continue;
        };
        for port in &meta.inputs {
            let count = sources_per_input
                .get(&(node.id.as_str(), port.id.as_str()))
                .copied()
                .unwrap_or(0);
            if count > 1 && !port.multi {
                violations.push(Violation::MultipleSources {
                    node_id: node.id.clone(),
                    port: port.id.clone(),
                    count,
                });
            }
            if count == 0 && port.required && port.default.is_none() {
                violations.push(Violation::MissingRequiredInput {
                    node_id: node.id.clone(),
                    port: port.id.clone(),
                });
            }
            let key = (node.id.as_str(), port.id.as_str());
            if count > 0 && port.required && !compatible_per_input.contains_key(&key) {
                violations.push(Violation::IncompatibleRequiredInput {
                    node_id: node.id.clone(),
                    port: port.id.clone(),
                    expected: port.port_type,
                });
            }
        }
    }

    // Acyclicity
    let mut graph = DiGraph::new();
    let mut node_to_index = HashMap::new();
    for node in &workflow.nodes {
        if !node_to_index.contains_key(&node.id) {
            let idx = graph.add_node(node.id.clone());
            node_to_index.insert(node.id.clone(), idx);
        }
    }
    for conn in &workflow.connections {
        if let (Some(from), Some(to)) = (
            node_to_index.get(&conn.from_node),
            node_to_index.get(&conn.to_node),
        ) {
            graph.update_edge(*from, *to, ());
        }
    }
    let mut cycles: Vec<Vec<NodeId>> = tarjan_scc(&graph)
        .into_iter()
        .filter(|scc| scc.len() > 1 || graph.contains_edge(scc[0], scc[0]))
        .map(|scc| {
            let mut nodes: Vec<NodeId> = scc.into_iter().map(|idx| graph[idx].clone()).collect();
            nodes.sort();
            nodes
        })
        .collect();
    cycles.sort();
    violations.extend(cycles.into_iter().map(|nodes| Violation::Cycle { nodes }));

    if !violations.is_empty() {
        tracing::debug!(
            workflow_id = %workflow.id,
            violations = violations.len(),
            "workflow rejected by validation"
        );
        return Err(ValidationError::new(violations));
    }

    let order = toposort(&graph, None)
        .map_err(|cycle| {
            ValidationError::new(vec![Violation::Cycle {
                nodes: vec![graph[cycle.node_id()].clone()],
            }])
        })?
        .into_iter()
        .map(|idx| graph[idx].clone())
        .collect();

    for warning in &warnings {
        tracing::warn!(workflow_id = %workflow.id, "{}", warning);
    }

    Ok(ValidatedWorkflow {
        workflow: Arc::new(workflow.clone()),
        metadata,
        graph,
        node_to_index,
        order,
        warnings,
    })
}
