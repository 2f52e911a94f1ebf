use crate::context::{ContextBuilder, PreparedInputs};
use crate::credentials::CredentialCache;
use crate::plan::DependencyPlan;
use crate::registry::NodeRegistry;
use crate::tracker::ExecutionTracker;
use crate::validator::ValidatedWorkflow;
use chrono::{DateTime, Utc};
use futures::stream::{FuturesUnordered, StreamExt};
use futures::FutureExt;
use std::any::Any;
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, timeout, Duration};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};
use weavecore::{
    BackoffPolicy, ErrorHandling, EventBus, ExecutionEvent, ExecutionId, ExecutionRecord, ExecutionStatus,
    FlowError, Node, NodeAttempt, NodeError, NodeId, NodeOutput, NodeSpec, NodeState, NodeStatus,
    SkipReason, Value,
};

/// Executes validated workflows as DAGs with parallel execution
pub struct WorkflowExecutor {
    max_parallel: usize,
    default_timeout: Option<Duration>,
    default_run_timeout: Option<Duration>,
    default_backoff: BackoffPolicy,
}

impl WorkflowExecutor {
    pub fn new(max_parallel: usize) -> Self {
        Self {
            max_parallel: max_parallel.max(1),
            default_timeout: None,
            default_run_timeout: None,
            default_backoff: BackoffPolicy::default(),
        }
    }

    /// Backoff for workflows whose settings leave `retry_backoff` unset
    pub fn with_default_backoff(mut self, backoff: BackoffPolicy) -> Self {
        self.default_backoff = backoff;
        self
    }

    /// Timeout applied to nodes that set none themselves
    pub fn with_default_timeout(mut self, default_timeout: Option<Duration>) -> Self {
        self.default_timeout = default_timeout;
        self
    }

    /// Deadline for workflows that set no `run_timeout_ms`
    pub fn with_default_run_timeout(mut self, run_timeout: Option<Duration>) -> Self {
        self.default_run_timeout = run_timeout;
        self
    }

    /// Run a validated workflow to completion, recording everything in `tracker`.
    ///
    /// Node failures never surface as `Err`; they are captured in the returned
    /// record and escalate only as far as the workflow's error handling allows.
    #[instrument(
        name = "workflow_execute",
        skip_all,
        fields(
            workflow_id = %validated.workflow.id,
            execution_id = %tracker.execution_id(),
        )
    )]
    pub async fn execute(
        &self,
        validated: &ValidatedWorkflow,
        registry: &NodeRegistry,
        tracker: Arc<ExecutionTracker>,
        credentials: Arc<CredentialCache>,
        event_bus: Arc<EventBus>,
        run_inputs: HashMap<String, Value>,
    ) -> Result<ExecutionRecord, FlowError> {
        let execution_id = tracker.execution_id();
        let workflow = validated.workflow.clone();
        let start_time = Instant::now();

        if !tracker.start().await {
            return Err(FlowError::Execution(format!(
                "execution {} was already started",
                execution_id
            )));
        }

        event_bus.emit(ExecutionEvent::WorkflowStarted {
            execution_id,
            workflow_id: workflow.id,
            timestamp: Utc::now(),
        });

        info!(
            nodes = workflow.nodes.len(),
            on_error = ?workflow.settings.on_error,
            "Starting workflow execution: {}",
            workflow.name
        );

        let builder = Arc::new(ContextBuilder::new(
            execution_id,
            workflow.clone(),
            credentials,
            Arc::new(run_inputs),
            event_bus.clone(),
        ));
        let run_token = tracker.cancellation_token();
        let deadline_token = run_token.child_token();
        let mut run = Run {
            validated,
            registry,
            tracker: tracker.clone(),
            events: event_bus.clone(),
            builder,
            plan: DependencyPlan::new(validated),
            instances: HashMap::new(),
            running: FuturesUnordered::new(),
            last_errors: HashMap::new(),
            halt: deadline_token.child_token(),
            deadline_token,
            run_token,
            run_timeout: workflow
                .settings
                .run_timeout_ms
                .map(Duration::from_millis)
                .or(self.default_run_timeout),
            timed_out: false,
            aborted: false,
            pending_skipped: false,
            max_parallel: workflow
                .settings
                .max_parallel_nodes
                .unwrap_or(self.max_parallel)
                .max(1),
            default_timeout: self.default_timeout,
            backoff: workflow
                .settings
                .retry_backoff
                .clone()
                .unwrap_or_else(|| self.default_backoff.clone()),
            execution_id,
        };

        let outcome = run.drive().await;
        let status = match &outcome {
            Ok(()) => run.final_status().await,
            Err(e) => {
                error!(error = %e, "execution loop failed");
                ExecutionStatus::Failed
            }
        };
        tracker.finish(status).await;

        let duration_ms = start_time.elapsed().as_millis() as u64;
        event_bus.emit(ExecutionEvent::WorkflowCompleted {
            execution_id,
            status,
            duration_ms,
            timestamp: Utc::now(),
        });

        let record = tracker.snapshot().await;
        match status {
            ExecutionStatus::Completed if record.has_errors() => warn!(
                duration_ms,
                failed = record.failed_nodes().len(),
                "workflow completed with node errors"
            ),
            ExecutionStatus::Completed => info!(duration_ms, "workflow completed"),
            ExecutionStatus::Cancelled => warn!(
                duration_ms,
                completed = record.completed_nodes().len(),
                "workflow cancelled"
            ),
            _ if run.timed_out => error!(
                duration_ms,
                completed = record.completed_nodes().len(),
                "workflow exceeded its deadline"
            ),
            _ => {
                for (node_id, message) in record.failed_nodes() {
                    error!(node_id = %node_id, error = message, "workflow failed");
                }
            }
        }

        outcome?;
        Ok(record)
    }
}

/// A node instance created for this run.
struct Instance {
    node: Arc<dyn Node>,
    prepared: Arc<PreparedInputs>,
    state: Arc<RwLock<NodeState>>,
}

enum AttemptOutcome {
    Finished {
        result: Result<NodeOutput, NodeError>,
        started_at: DateTime<Utc>,
        finished_at: DateTime<Utc>,
        duration_ms: u64,
    },
    /// A retry whose backoff was interrupted before the node was invoked.
    Abandoned,
}

struct AttemptReport {
    node_id: NodeId,
    attempt: u32,
    outcome: AttemptOutcome,
}

enum Wake {
    Joined(Option<Result<AttemptReport, tokio::task::JoinError>>),
    Halted,
    Deadline,
}

/// State of one run, owned by the coordinating loop.
struct Run<'a> {
    validated: &'a ValidatedWorkflow,
    registry: &'a NodeRegistry,
    tracker: Arc<ExecutionTracker>,
    events: Arc<EventBus>,
    builder: Arc<ContextBuilder>,
    plan: DependencyPlan,
    instances: HashMap<NodeId, Instance>,
    running: FuturesUnordered<JoinHandle<AttemptReport>>,
    last_errors: HashMap<NodeId, String>,
    /// Cancelled by the caller through the tracker
    run_token: CancellationToken,
    /// Child of `run_token`, cancelled when the run deadline passes.
    /// Parent of every attempt token.
    deadline_token: CancellationToken,
    /// Stops new dispatch: cancelled on abort or with `deadline_token`
    halt: CancellationToken,
    run_timeout: Option<Duration>,
    timed_out: bool,
    aborted: bool,
    pending_skipped: bool,
    max_parallel: usize,
    default_timeout: Option<Duration>,
    backoff: BackoffPolicy,
    execution_id: ExecutionId,
}

impl<'a> Run<'a> {
    async fn drive(&mut self) -> Result<(), FlowError> {
        let deadline = self.run_timeout.map(|limit| tokio::time::Instant::now() + limit);
        loop {
            while !self.halt.is_cancelled() && self.running.len() < self.max_parallel {
                let Some(node_id) = self.plan.next_ready() else {
                    break;
                };
                self.dispatch(node_id).await;
            }

            if self.halt.is_cancelled() && !self.pending_skipped {
                self.skip_pending().await;
            }

            if self.running.is_empty() {
                break;
            }

            let wake = tokio::select! {
                joined = self.running.next() => Wake::Joined(joined),
                _ = self.halt.cancelled(), if !self.pending_skipped => Wake::Halted,
                _ = sleep_until(deadline.unwrap_or_else(tokio::time::Instant::now)),
                    if deadline.is_some() && !self.timed_out => Wake::Deadline,
            };

            match wake {
                Wake::Joined(Some(joined)) => {
                    let report = joined
                        .map_err(|e| FlowError::Execution(format!("Task join error: {}", e)))?;
                    self.handle_report(report).await;
                }
                Wake::Joined(None) => {}
                Wake::Halted => {
                    if self.run_token.is_cancelled() {
                        warn!("cancellation requested, no further nodes will start");
                    }
                }
                Wake::Deadline => self.deadline_passed().await,
            }
        }
        Ok(())
    }

    /// Stop dispatch, abort every attempt still in flight and fail its node.
    async fn deadline_passed(&mut self) {
        let limit_ms = self.run_timeout.map_or(0, |d| d.as_millis() as u64);
        warn!(run_timeout_ms = limit_ms, "run deadline exceeded");
        self.timed_out = true;
        self.deadline_token.cancel();

        for handle in self.running.iter() {
            handle.abort();
        }
        self.running = FuturesUnordered::new();

        let in_flight: Vec<(NodeId, u32)> = {
            let record = self.tracker.read().await;
            record
                .nodes
                .iter()
                .filter(|(_, n)| n.status == NodeStatus::Running)
                .map(|(id, n)| (id.clone(), n.attempts.len() as u32 + 1))
                .collect()
        };
        let message = format!("run deadline of {}ms exceeded", limit_ms);
        for (node_id, attempt) in in_flight {
            error!(node_id = %node_id, attempt, "Node aborted at run deadline");
            self.events.emit(ExecutionEvent::NodeFailed {
                execution_id: self.execution_id,
                node_id: node_id.clone(),
                attempt,
                error: message.clone(),
                will_retry: false,
                timestamp: Utc::now(),
            });
            self.last_errors.remove(&node_id);
            self.tracker
                .fail_node(&node_id, NodeStatus::Error, message.clone())
                .await;
        }
    }

    async fn dispatch(&mut self, node_id: NodeId) {
        let workflow = &self.validated.workflow;
        let (Some(spec), Some(metadata)) = (
            workflow.find_node(&node_id),
            self.validated.metadata.get(&node_id),
        ) else {
            error!(node_id = %node_id, "ready node missing from validated workflow");
            return;
        };

        let prepared = {
            let record = self.tracker.read().await;
            self.builder
                .prepare(spec, metadata, &record, self.plan.is_root(&node_id))
        };

        let started_at = Utc::now();
        self.tracker.node_running(&node_id, started_at).await;

        match self.registry.create_node(&spec.node_type, &prepared.config) {
            Ok(node) => {
                self.instances.insert(
                    node_id.clone(),
                    Instance {
                        node: Arc::from(node),
                        prepared: Arc::new(prepared),
                        state: Arc::new(RwLock::new(NodeState::default())),
                    },
                );
                self.spawn_attempt(&node_id, 1, None);
            }
            Err(e) => {
                let report = AttemptReport {
                    node_id,
                    attempt: 1,
                    outcome: AttemptOutcome::Finished {
                        result: Err(NodeError::InitializationFailed(e.to_string())),
                        started_at,
                        finished_at: Utc::now(),
                        duration_ms: 0,
                    },
                };
                self.handle_report(report).await;
            }
        }
    }

    fn spawn_attempt(&mut self, node_id: &str, attempt: u32, delay: Option<Duration>) {
        let (Some(instance), Some(spec)) = (
            self.instances.get(node_id),
            self.validated.workflow.find_node(node_id),
        ) else {
            return;
        };

        let settings = &self.validated.workflow.settings;
        let node_timeout = spec
            .timeout_ms
            .or(settings.node_timeout_ms)
            .map(Duration::from_millis)
            .or(self.default_timeout);

        let job = AttemptJob {
            execution_id: self.execution_id,
            spec: spec.clone(),
            attempt,
            delay,
            node: instance.node.clone(),
            prepared: instance.prepared.clone(),
            state: instance.state.clone(),
            builder: self.builder.clone(),
            events: self.events.clone(),
            timeout: node_timeout,
            halt: self.halt.clone(),
            attempt_parent: self.deadline_token.clone(),
        };

        debug!(node_id, attempt, ?delay, "dispatching node");
        self.running.push(tokio::spawn(job.run()));
    }

    async fn handle_report(&mut self, report: AttemptReport) {
        let AttemptReport {
            node_id,
            attempt,
            outcome,
        } = report;

        match outcome {
            AttemptOutcome::Abandoned => self.abandon(node_id, attempt).await,
            AttemptOutcome::Finished {
                result,
                started_at,
                finished_at,
                duration_ms,
            } => {
                self.tracker
                    .record_attempt(
                        &node_id,
                        NodeAttempt {
                            attempt,
                            success: result.is_ok(),
                            error: result.as_ref().err().map(ToString::to_string),
                            started_at,
                            finished_at,
                            duration_ms,
                        },
                    )
                    .await;

                match result {
                    Ok(output) => self.node_succeeded(node_id, output, duration_ms).await,
                    Err(e) => self.node_failed(node_id, attempt, e).await,
                }
            }
        }
    }

    async fn node_succeeded(&mut self, node_id: NodeId, output: NodeOutput, duration_ms: u64) {
        info!(node_id = %node_id, duration_ms, "Node completed");

        self.events.emit(ExecutionEvent::NodeCompleted {
            execution_id: self.execution_id,
            node_id: node_id.clone(),
            outputs: output.outputs.clone(),
            duration_ms,
            timestamp: Utc::now(),
        });

        self.tracker.complete_node(&node_id, output.outputs).await;
        self.last_errors.remove(&node_id);
        self.plan.resolve(&node_id);
    }

    async fn node_failed(&mut self, node_id: NodeId, attempt: u32, error: NodeError) {
        let settings = &self.validated.workflow.settings;
        let will_retry = settings.on_error == ErrorHandling::Retry
            && error.is_retryable()
            && attempt <= settings.retry_count
            && !self.halt.is_cancelled();

        self.events.emit(ExecutionEvent::NodeFailed {
            execution_id: self.execution_id,
            node_id: node_id.clone(),
            attempt,
            error: error.to_string(),
            will_retry,
            timestamp: Utc::now(),
        });

        if will_retry {
            let delay = self.backoff.delay_for(attempt + 1);
            warn!(
                node_id = %node_id,
                attempt,
                max_attempts = settings.retry_count + 1,
                delay_ms = delay.as_millis() as u64,
                error = %error,
                "Node attempt failed, retrying"
            );
            self.last_errors.insert(node_id.clone(), error.to_string());
            self.spawn_attempt(&node_id, attempt + 1, Some(delay));
            return;
        }

        let status = if matches!(error, NodeError::Cancelled) && self.run_token.is_cancelled() {
            NodeStatus::Cancelled
        } else {
            NodeStatus::Error
        };
        error!(node_id = %node_id, attempt, error = %error, "Node failed");
        self.tracker.fail_node(&node_id, status, error.to_string()).await;
        self.propagate_failure(&node_id, &error);
    }

    /// A pending retry was interrupted by abort or cancellation.
    async fn abandon(&mut self, node_id: NodeId, attempt: u32) {
        let last_error = self.last_errors.remove(&node_id).unwrap_or_default();
        if self.run_token.is_cancelled() {
            info!(node_id = %node_id, attempt, "retry abandoned after cancellation");
            self.tracker
                .fail_node(
                    &node_id,
                    NodeStatus::Cancelled,
                    format!("cancelled before attempt {}: {}", attempt, last_error),
                )
                .await;
        } else {
            info!(node_id = %node_id, attempt, "retry abandoned after run abort");
            self.tracker
                .fail_node(&node_id, NodeStatus::Error, last_error)
                .await;
        }
    }

    fn propagate_failure(&mut self, node_id: &str, error: &NodeError) {
        let is_trigger = self
            .validated
            .metadata
            .get(node_id)
            .is_some_and(|m| m.trigger);
        let trigger_cannot_start = is_trigger && matches!(error, NodeError::CredentialResolution { .. });

        if self.validated.workflow.settings.on_error.aborts_on_failure() || trigger_cannot_start {
            if !self.aborted {
                warn!(node_id, "aborting run after node failure");
                self.aborted = true;
            }
            self.halt.cancel();
        } else if !self.halt.is_cancelled() {
            // Continue: dependents run and see the upstream-failure marker
            self.plan.resolve(node_id);
        }
    }

    /// Mark every node that was never dispatched as skipped.
    async fn skip_pending(&mut self) {
        let reason = if self.run_token.is_cancelled() {
            SkipReason::RunCancelled
        } else if self.timed_out {
            SkipReason::DeadlineExceeded
        } else {
            SkipReason::UpstreamFailed
        };
        self.plan.clear_ready();

        let idle: Vec<NodeId> = {
            let record = self.tracker.read().await;
            record
                .nodes
                .iter()
                .filter(|(_, n)| n.status == NodeStatus::Idle)
                .map(|(id, _)| id.clone())
                .collect()
        };

        for node_id in idle {
            debug!(node_id = %node_id, %reason, "skipping node");
            self.tracker.skip_node(&node_id, reason).await;
            self.events.emit(ExecutionEvent::NodeSkipped {
                execution_id: self.execution_id,
                node_id,
                reason,
                timestamp: Utc::now(),
            });
        }
        self.pending_skipped = true;
    }

    async fn final_status(&self) -> ExecutionStatus {
        let record = self.tracker.read().await;
        let stopped_by_signal = record.nodes.values().any(|n| {
            n.skip_reason == Some(SkipReason::RunCancelled) || n.status == NodeStatus::Cancelled
        });

        if self.run_token.is_cancelled() && stopped_by_signal {
            ExecutionStatus::Cancelled
        } else if self.aborted || self.timed_out {
            ExecutionStatus::Failed
        } else {
            ExecutionStatus::Completed
        }
    }
}

/// Everything one attempt needs, moved into its task.
struct AttemptJob {
    execution_id: ExecutionId,
    spec: NodeSpec,
    attempt: u32,
    delay: Option<Duration>,
    node: Arc<dyn Node>,
    prepared: Arc<PreparedInputs>,
    state: Arc<RwLock<NodeState>>,
    builder: Arc<ContextBuilder>,
    events: Arc<EventBus>,
    timeout: Option<Duration>,
    halt: CancellationToken,
    attempt_parent: CancellationToken,
}

impl AttemptJob {
    async fn run(self) -> AttemptReport {
        let node_id = self.spec.id.clone();
        let attempt = self.attempt;

        if let Some(delay) = self.delay {
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = self.halt.cancelled() => {}
            }
        }
        // Retries are new dispatches and honor abort/cancellation
        if attempt > 1 && self.halt.is_cancelled() {
            return AttemptReport {
                node_id,
                attempt,
                outcome: AttemptOutcome::Abandoned,
            };
        }

        self.events.emit(ExecutionEvent::NodeStarted {
            execution_id: self.execution_id,
            node_id: node_id.clone(),
            node_type: self.spec.node_type.clone(),
            attempt,
            timestamp: Utc::now(),
        });

        let started_at = Utc::now();
        let clock = Instant::now();
        let result = self.invoke().await;

        AttemptReport {
            node_id,
            attempt,
            outcome: AttemptOutcome::Finished {
                result,
                started_at,
                finished_at: Utc::now(),
                duration_ms: clock.elapsed().as_millis() as u64,
            },
        }
    }

    async fn invoke(&self) -> Result<NodeOutput, NodeError> {
        let credentials = self.builder.resolve_credentials(&self.spec).await?;
        let token = self.attempt_parent.child_token();
        let ctx = self.builder.build(
            &self.spec,
            &self.prepared,
            credentials,
            self.attempt,
            self.state.clone(),
            token.clone(),
        );

        let invocation = AssertUnwindSafe(self.node.execute(ctx)).catch_unwind();
        let outcome = match self.timeout {
            Some(limit) => match timeout(limit, invocation).await {
                Ok(outcome) => outcome,
                Err(_) => {
                    // Ask cooperative nodes to stop whatever they spawned
                    token.cancel();
                    return Err(NodeError::Timeout {
                        millis: limit.as_millis() as u64,
                    });
                }
            },
            None => invocation.await,
        };

        outcome.unwrap_or_else(|panic| Err(NodeError::ExecutionFailed(panic_message(panic))))
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        format!("node panicked: {}", message)
    } else if let Some(message) = payload.downcast_ref::<String>() {
        format!("node panicked: {}", message)
    } else {
        "node panicked".to_string()
    }
}
