//! Execution record: the persisted outcome of one workflow run.

use crate::events::ExecutionId;
use crate::{NodeId, Value, WorkflowId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fmt;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl ExecutionStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            ExecutionStatus::Completed | ExecutionStatus::Failed | ExecutionStatus::Cancelled
        )
    }
}

impl fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ExecutionStatus::Pending => "pending",
            ExecutionStatus::Running => "running",
            ExecutionStatus::Completed => "completed",
            ExecutionStatus::Failed => "failed",
            ExecutionStatus::Cancelled => "cancelled",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum NodeStatus {
    Idle,
    Running,
    Success,
    Error,
    Skipped,
    Cancelled,
}

impl NodeStatus {
    pub fn is_terminal(self) -> bool {
        !matches!(self, NodeStatus::Idle | NodeStatus::Running)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    /// The run aborted after another node failed.
    UpstreamFailed,
    /// The run was cancelled before this node was dispatched.
    RunCancelled,
    /// The run hit its deadline before this node was dispatched.
    DeadlineExceeded,
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SkipReason::UpstreamFailed => f.write_str("run aborted after a node failure"),
            SkipReason::RunCancelled => f.write_str("run cancelled"),
            SkipReason::DeadlineExceeded => f.write_str("run deadline exceeded"),
        }
    }
}

/// One invocation of a node.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NodeAttempt {
    pub attempt: u32,
    pub success: bool,
    pub error: Option<String>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub duration_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NodeExecutionResult {
    pub node_type: String,
    pub status: NodeStatus,
    pub success: bool,
    /// Present iff the node succeeded.
    pub outputs: Option<HashMap<String, Value>>,
    pub error: Option<String>,
    pub skip_reason: Option<SkipReason>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub duration_ms: u64,
    pub attempts: Vec<NodeAttempt>,
}

impl NodeExecutionResult {
    pub fn idle(node_type: impl Into<String>) -> Self {
        Self {
            node_type: node_type.into(),
            status: NodeStatus::Idle,
            success: false,
            outputs: None,
            error: None,
            skip_reason: None,
            started_at: None,
            finished_at: None,
            duration_ms: 0,
            attempts: Vec::new(),
        }
    }

    pub fn attempt_count(&self) -> usize {
        self.attempts.len()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ExecutionRecord {
    pub execution_id: ExecutionId,
    pub workflow_id: WorkflowId,
    pub status: ExecutionStatus,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub nodes: BTreeMap<NodeId, NodeExecutionResult>,
}

impl ExecutionRecord {
    pub fn new(execution_id: ExecutionId, workflow_id: WorkflowId) -> Self {
        Self {
            execution_id,
            workflow_id,
            status: ExecutionStatus::Pending,
            started_at: None,
            finished_at: None,
            nodes: BTreeMap::new(),
        }
    }

    pub fn node(&self, node_id: &str) -> Option<&NodeExecutionResult> {
        self.nodes.get(node_id)
    }

    pub fn node_status(&self, node_id: &str) -> Option<NodeStatus> {
        self.nodes.get(node_id).map(|n| n.status)
    }

    pub fn output(&self, node_id: &str, port: &str) -> Option<&Value> {
        self.nodes.get(node_id)?.outputs.as_ref()?.get(port)
    }

    /// Nodes that ended in `error` or `cancelled`, with their messages.
    pub fn failed_nodes(&self) -> Vec<(&NodeId, &str)> {
        self.nodes
            .iter()
            .filter(|(_, n)| matches!(n.status, NodeStatus::Error | NodeStatus::Cancelled))
            .map(|(id, n)| (id, n.error.as_deref().unwrap_or("unknown error")))
            .collect()
    }

    /// Nodes that finished successfully.
    pub fn completed_nodes(&self) -> Vec<&NodeId> {
        self.nodes
            .iter()
            .filter(|(_, n)| n.status == NodeStatus::Success)
            .map(|(id, _)| id)
            .collect()
    }

    pub fn has_errors(&self) -> bool {
        !self.failed_nodes().is_empty()
    }

    pub fn duration_ms(&self) -> Option<u64> {
        let started = self.started_at?;
        let finished = self.finished_at?;
        Some((finished - started).num_milliseconds().max(0) as u64)
    }
}
