use crate::credentials::{CredentialCache, CredentialResolver, EnvCredentialResolver};
use crate::registry::NodeRegistry;
use crate::sink::{ExecutionSink, NoopSink};
use crate::tracker::ExecutionTracker;
use crate::validator::validate;
use crate::WorkflowExecutor;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, watch, RwLock};
use tracing::{debug, error, info, warn};
use uuid::Uuid;
use weavecore::{
    BackoffPolicy, EventBus, ExecutionEvent, ExecutionId, ExecutionRecord, FlowError, Value,
    Workflow, WorkflowError, WorkflowId,
};

/// A run owned by the engine.
#[derive(Clone)]
struct RunHandle {
    tracker: Arc<ExecutionTracker>,
    done: watch::Receiver<bool>,
}

impl RunHandle {
    async fn wait(mut self, execution_id: ExecutionId) -> Result<ExecutionRecord, FlowError> {
        self.done.wait_for(|finished| *finished).await.map_err(|_| {
            FlowError::Execution(format!("execution {} ended unexpectedly", execution_id))
        })?;
        Ok(self.tracker.snapshot().await)
    }
}

/// Live runs plus the finished ones still held in memory, oldest first.
#[derive(Default)]
struct RunTable {
    runs: HashMap<ExecutionId, RunHandle>,
    finished: VecDeque<ExecutionId>,
}

impl RunTable {
    /// Note that a run finished and drop the oldest finished runs above `keep`.
    fn retire(&mut self, execution_id: ExecutionId, keep: usize) {
        self.finished.push_back(execution_id);
        while self.finished.len() > keep {
            if let Some(evicted) = self.finished.pop_front() {
                self.runs.remove(&evicted);
                debug!(execution_id = %evicted, "finished run evicted from memory");
            }
        }
    }

    fn forget(&mut self, execution_id: ExecutionId) -> bool {
        let Some(position) = self.finished.iter().position(|id| *id == execution_id) else {
            return false;
        };
        self.finished.remove(position);
        self.runs.remove(&execution_id).is_some()
    }
}

/// Main runtime for executing workflows
pub struct Engine {
    registry: Arc<NodeRegistry>,
    executor: Arc<WorkflowExecutor>,
    event_bus: Arc<EventBus>,
    credentials: Arc<dyn CredentialResolver>,
    sink: Arc<dyn ExecutionSink>,
    workflows: Arc<RwLock<HashMap<WorkflowId, Workflow>>>,
    runs: Arc<RwLock<RunTable>>,
    retain_finished_runs: usize,
}

impl Engine {
    /// Create a new runtime with default settings
    pub fn new() -> Self {
        Self::with_config(RuntimeConfig::default())
    }

    /// Create a new runtime with custom configuration
    pub fn with_config(config: RuntimeConfig) -> Self {
        Self::with_registry(Arc::new(NodeRegistry::new()), config)
    }

    /// Create a new runtime with a pre-configured registry
    pub fn with_registry(registry: Arc<NodeRegistry>, config: RuntimeConfig) -> Self {
        let executor = WorkflowExecutor::new(config.max_parallel_nodes)
            .with_default_timeout(config.default_node_timeout_ms.map(Duration::from_millis))
            .with_default_run_timeout(config.default_run_timeout_ms.map(Duration::from_millis))
            .with_default_backoff(config.default_backoff.clone());

        Self {
            registry,
            executor: Arc::new(executor),
            event_bus: Arc::new(EventBus::new(config.event_buffer_size)),
            credentials: Arc::new(EnvCredentialResolver::new()),
            sink: Arc::new(NoopSink),
            workflows: Arc::new(RwLock::new(HashMap::new())),
            runs: Arc::new(RwLock::new(RunTable::default())),
            retain_finished_runs: config.retain_finished_runs,
        }
    }

    pub fn with_credential_resolver(mut self, resolver: Arc<dyn CredentialResolver>) -> Self {
        self.credentials = resolver;
        self
    }

    pub fn with_sink(mut self, sink: Arc<dyn ExecutionSink>) -> Self {
        self.sink = sink;
        self
    }

    pub fn registry(&self) -> &Arc<NodeRegistry> {
        &self.registry
    }

    /// Register a workflow
    pub async fn register_workflow(&self, workflow: Workflow) -> WorkflowId {
        let id = workflow.id;
        self.workflows.write().await.insert(id, workflow);
        id
    }

    pub async fn workflow(&self, workflow_id: WorkflowId) -> Option<Workflow> {
        self.workflows.read().await.get(&workflow_id).cloned()
    }

    /// Validate a registered workflow and start it in the background.
    pub async fn start_run(
        &self,
        workflow_id: WorkflowId,
        inputs: HashMap<String, Value>,
    ) -> Result<ExecutionId, FlowError> {
        let workflow = self
            .workflow(workflow_id)
            .await
            .ok_or_else(|| WorkflowError::NotFound(workflow_id.to_string()))?;
        let (execution_id, _) = self.launch(&workflow, inputs).await?;
        Ok(execution_id)
    }

    /// Validate and run a workflow to completion without registering it.
    pub async fn execute(
        &self,
        workflow: &Workflow,
        inputs: HashMap<String, Value>,
    ) -> Result<ExecutionRecord, FlowError> {
        let (execution_id, run) = self.launch(workflow, inputs).await?;
        run.wait(execution_id).await
    }

    /// Point-in-time copy of a run's record. Runs no longer held in memory
    /// are looked up in the sink.
    pub async fn status(&self, execution_id: ExecutionId) -> Option<ExecutionRecord> {
        let tracker = self
            .runs
            .read()
            .await
            .runs
            .get(&execution_id)
            .map(|run| run.tracker.clone());
        match tracker {
            Some(tracker) => Some(tracker.snapshot().await),
            None => self.persisted(execution_id).await,
        }
    }

    /// Drop a finished run from memory. Returns false for unknown or live runs.
    pub async fn forget(&self, execution_id: ExecutionId) -> bool {
        self.runs.write().await.forget(execution_id)
    }

    /// Request cancellation. Returns false for unknown or already finished runs.
    pub async fn cancel(&self, execution_id: ExecutionId) -> bool {
        let Some(tracker) = self
            .runs
            .read()
            .await
            .runs
            .get(&execution_id)
            .map(|run| run.tracker.clone())
        else {
            return false;
        };

        let acknowledged = tracker.cancel().await;
        if acknowledged {
            info!(execution_id = %execution_id, "cancellation requested");
            self.event_bus.emit(ExecutionEvent::CancellationRequested {
                execution_id,
                timestamp: Utc::now(),
            });
        }
        acknowledged
    }

    /// Wait for a run to reach a terminal status.
    pub async fn wait(&self, execution_id: ExecutionId) -> Result<ExecutionRecord, FlowError> {
        let run = self.runs.read().await.runs.get(&execution_id).cloned();
        match run {
            Some(run) => run.wait(execution_id).await,
            None => self
                .persisted(execution_id)
                .await
                .ok_or_else(|| WorkflowError::ExecutionNotFound(execution_id.to_string()).into()),
        }
    }

    /// Subscribe to execution events
    pub fn subscribe_events(&self) -> broadcast::Receiver<ExecutionEvent> {
        self.event_bus.subscribe()
    }

    pub fn event_bus(&self) -> &Arc<EventBus> {
        &self.event_bus
    }

    async fn persisted(&self, execution_id: ExecutionId) -> Option<ExecutionRecord> {
        match self.sink.load(execution_id).await {
            Ok(record) => record,
            Err(e) => {
                warn!(execution_id = %execution_id, error = %e, "failed to load execution record");
                None
            }
        }
    }

    async fn launch(
        &self,
        workflow: &Workflow,
        inputs: HashMap<String, Value>,
    ) -> Result<(ExecutionId, RunHandle), FlowError> {
        let validated = validate(workflow, &self.registry)?;
        for warning in &validated.warnings {
            warn!(workflow_id = %workflow.id, "{}", warning);
        }

        let execution_id = Uuid::new_v4();
        let tracker = Arc::new(ExecutionTracker::new(execution_id, workflow));
        let (done_tx, done_rx) = watch::channel(false);
        let handle = RunHandle {
            tracker: tracker.clone(),
            done: done_rx,
        };
        self.runs
            .write()
            .await
            .runs
            .insert(execution_id, handle.clone());

        let executor = self.executor.clone();
        let registry = self.registry.clone();
        let event_bus = self.event_bus.clone();
        let sink = self.sink.clone();
        let runs = self.runs.clone();
        let keep = self.retain_finished_runs;
        let credentials = Arc::new(CredentialCache::new(self.credentials.clone()));

        tokio::spawn(async move {
            let record = match executor
                .execute(&validated, &registry, tracker.clone(), credentials, event_bus, inputs)
                .await
            {
                Ok(record) => record,
                Err(e) => {
                    error!(execution_id = %execution_id, error = %e, "execution aborted");
                    tracker.snapshot().await
                }
            };
            if let Err(e) = sink.persist(&record).await {
                warn!(execution_id = %execution_id, error = %e, "failed to persist execution record");
            }
            let _ = done_tx.send(true);
            runs.write().await.retire(execution_id, keep);
        });

        Ok((execution_id, handle))
    }
}

impl Default for Engine {
    fn default() -> Self {
        Self::new()
    }
}

/// Configuration for the runtime
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    pub max_parallel_nodes: usize,
    pub event_buffer_size: usize,
    pub default_node_timeout_ms: Option<u64>,
    pub default_run_timeout_ms: Option<u64>,
    pub default_backoff: BackoffPolicy,
    /// Finished runs kept in memory; older ones are only reachable through the sink.
    pub retain_finished_runs: usize,
}

impl RuntimeConfig {
    /// Load from a JSON file; absent fields keep their defaults.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, FlowError> {
        let content = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&content)?)
    }
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            max_parallel_nodes: 10,
            event_buffer_size: 1000,
            default_node_timeout_ms: None,
            default_run_timeout_ms: None,
            default_backoff: BackoffPolicy::default(),
            retain_finished_runs: 1000,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_fills_missing_fields() {
        let config: RuntimeConfig =
            serde_json::from_str(r#"{"max_parallel_nodes": 2, "default_node_timeout_ms": 500}"#)
                .unwrap();
        assert_eq!(config.max_parallel_nodes, 2);
        assert_eq!(config.event_buffer_size, 1000);
        assert_eq!(config.default_node_timeout_ms, Some(500));
        assert_eq!(config.default_backoff, BackoffPolicy::default());
        assert_eq!(config.retain_finished_runs, 1000);
        assert_eq!(config.default_run_timeout_ms, None);
    }

    #[test]
    fn run_table_keeps_the_newest_finished_runs() {
        let mut table = RunTable::default();
        let ids: Vec<ExecutionId> = (0..3).map(|_| Uuid::new_v4()).collect();
        for id in &ids {
            let (_tx, done) = watch::channel(true);
            let workflow = Workflow::new("retained");
            table.runs.insert(
                *id,
                RunHandle {
                    tracker: Arc::new(ExecutionTracker::new(*id, &workflow)),
                    done,
                },
            );
            table.retire(*id, 2);
        }

        assert!(!table.runs.contains_key(&ids[0]));
        assert!(table.runs.contains_key(&ids[1]));
        assert!(table.forget(ids[2]));
        assert!(!table.forget(ids[2]));
        assert_eq!(table.finished, VecDeque::from(vec![ids[1]]));
    }
}
