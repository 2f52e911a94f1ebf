use async_trait::async_trait;
use std::collections::HashMap;
use tokio::sync::RwLock;
use weavecore::{ExecutionId, ExecutionRecord, FlowError};

/// Receives every sealed execution record.
#[async_trait]
pub trait ExecutionSink: Send + Sync {
    async fn persist(&self, record: &ExecutionRecord) -> Result<(), FlowError>;

    /// Fetch a persisted record. Sinks that cannot read back return `None`.
    async fn load(&self, _execution_id: ExecutionId) -> Result<Option<ExecutionRecord>, FlowError> {
        Ok(None)
    }
}

/// Discards records.
#[derive(Debug, Default)]
pub struct NoopSink;

#[async_trait]
impl ExecutionSink for NoopSink {
    async fn persist(&self, _record: &ExecutionRecord) -> Result<(), FlowError> {
        Ok(())
    }
}

/// Keeps every persisted record in memory, keyed by execution.
#[derive(Debug, Default)]
pub struct MemorySink {
    records: RwLock<HashMap<ExecutionId, ExecutionRecord>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn get(&self, execution_id: ExecutionId) -> Option<ExecutionRecord> {
        self.records.read().await.get(&execution_id).cloned()
    }

    pub async fn len(&self) -> usize {
        self.records.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.records.read().await.is_empty()
    }
}

#[async_trait]
impl ExecutionSink for MemorySink {
    async fn persist(&self, record: &ExecutionRecord) -> Result<(), FlowError> {
        self.records
            .write()
            .await
            .insert(record.execution_id, record.clone());
        Ok(())
    }

    async fn load(&self, execution_id: ExecutionId) -> Result<Option<ExecutionRecord>, FlowError> {
        Ok(self.get(execution_id).await)
    }
}
