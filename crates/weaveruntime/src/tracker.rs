//! Authoritative store of a run's `ExecutionRecord`.
//!
//! The executor loop is the only writer. Status queries read cloned
//! snapshots. Once the run status is terminal the record is sealed and every
//! further write is dropped with a warning, which keeps repeated queries of a
//! finished run identical.

use chrono::{DateTime, Utc};
use std::collections::HashMap;
use tokio::sync::{RwLock, RwLockReadGuard};
use tokio_util::sync::CancellationToken;
use weavecore::{
    ExecutionId, ExecutionRecord, ExecutionStatus, NodeAttempt, NodeExecutionResult, NodeStatus,
    SkipReason, Value, Workflow,
};

pub struct ExecutionTracker {
    execution_id: ExecutionId,
    record: RwLock<ExecutionRecord>,
    cancellation: CancellationToken,
}

impl ExecutionTracker {
    pub fn new(execution_id: ExecutionId, workflow: &Workflow) -> Self {
        let mut record = ExecutionRecord::new(execution_id, workflow.id);
        for node in &workflow.nodes {
            record
                .nodes
                .entry(node.id.clone())
                .or_insert_with(|| NodeExecutionResult::idle(node.node_type.clone()));
        }
        Self {
            execution_id,
            record: RwLock::new(record),
            cancellation: CancellationToken::new(),
        }
    }

    pub fn execution_id(&self) -> ExecutionId {
        self.execution_id
    }

    /// Point-in-time copy of the record.
    pub async fn snapshot(&self) -> ExecutionRecord {
        self.record.read().await.clone()
    }

    pub async fn read(&self) -> RwLockReadGuard<'_, ExecutionRecord> {
        self.record.read().await
    }

    pub async fn status(&self) -> ExecutionStatus {
        self.record.read().await.status
    }

    /// `pending -> running`.
    pub async fn start(&self) -> bool {
        let mut record = self.record.write().await;
        if record.status != ExecutionStatus::Pending {
            tracing::warn!(execution_id = %record.execution_id, status = %record.status, "run already started");
            return false;
        }
        record.status = ExecutionStatus::Running;
        record.started_at = Some(Utc::now());
        true
    }

    /// Seal the run with a terminal status. Returns false if it was already sealed.
    pub async fn finish(&self, status: ExecutionStatus) -> bool {
        let mut record = self.record.write().await;
        if record.status.is_terminal() {
            tracing::warn!(
                execution_id = %record.execution_id,
                current = %record.status,
                requested = %status,
                "ignoring status transition on a sealed run"
            );
            return false;
        }
        record.status = status;
        record.finished_at = Some(Utc::now());
        true
    }

    pub async fn node_running(&self, node_id: &str, started_at: DateTime<Utc>) {
        self.update_node(node_id, |node| {
            node.status = NodeStatus::Running;
            node.started_at.get_or_insert(started_at);
        })
        .await;
    }

    /// Append an attempt. Attempt numbers must increase by one.
    pub async fn record_attempt(&self, node_id: &str, attempt: NodeAttempt) {
        self.update_node(node_id, |node| {
            let expected = node.attempts.len() as u32 + 1;
            if attempt.attempt != expected {
                tracing::warn!(
                    node_id,
                    attempt = attempt.attempt,
                    expected,
                    "dropping out-of-order attempt"
                );
                return;
            }
            node.attempts.push(attempt);
        })
        .await;
    }

    pub async fn complete_node(&self, node_id: &str, outputs: HashMap<String, Value>) {
        self.update_node(node_id, |node| {
            node.status = NodeStatus::Success;
            node.success = true;
            node.outputs = Some(outputs);
            node.error = None;
            Self::close_timing(node);
        })
        .await;
    }

    /// Terminal failure: `error` for ordinary failures and timeouts,
    /// `cancelled` when the node stopped because the run was cancelled.
    pub async fn fail_node(&self, node_id: &str, status: NodeStatus, error: String) {
        self.update_node(node_id, |node| {
            node.status = status;
            node.success = false;
            node.outputs = None;
            node.error = Some(error);
            Self::close_timing(node);
        })
        .await;
    }

    pub async fn skip_node(&self, node_id: &str, reason: SkipReason) {
        self.update_node(node_id, |node| {
            node.status = NodeStatus::Skipped;
            node.success = false;
            node.skip_reason = Some(reason);
            node.error = Some(reason.to_string());
            node.finished_at = Some(Utc::now());
        })
        .await;
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancellation.clone()
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancellation.is_cancelled()
    }

    /// Flip the run's cancellation signal. Returns whether the run was still live.
    pub async fn cancel(&self) -> bool {
        let live = !self.record.read().await.status.is_terminal();
        if live {
            self.cancellation.cancel();
        }
        live
    }

    fn close_timing(node: &mut NodeExecutionResult) {
        let finished = Utc::now();
        node.finished_at = Some(finished);
        node.duration_ms = node
            .started_at
            .map(|s| (finished - s).num_milliseconds().max(0) as u64)
            .unwrap_or(0);
    }

    async fn update_node(&self, node_id: &str, apply: impl FnOnce(&mut NodeExecutionResult)) {
        let mut record = self.record.write().await;
        if record.status.is_terminal() {
            tracing::warn!(node_id, "ignoring node update on a sealed run");
            return;
        }
        match record.nodes.get_mut(node_id) {
            Some(node) if node.status.is_terminal() => {
                tracing::warn!(node_id, status = ?node.status, "node result already written");
            }
            Some(node) => apply(node),
            None => tracing::warn!(node_id, "update for unknown node"),
        }
    }
}
