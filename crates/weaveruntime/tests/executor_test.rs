// crates/weaveruntime/tests/executor_test.rs

mod common;

use common::*;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Barrier, Notify};
use weavecore::{
    BackoffPolicy, ErrorHandling, ExecutionEvent, ExecutionStatus, FlowError, InputSlot, Node,
    NodeError, NodeOutput, NodeSpec, NodeStatus, SkipReason, Value, Violation, WorkflowSettings,
};
use weaveruntime::{Engine, NodeFactory, NodeMetadata, NodeRegistry, RuntimeConfig};

fn fast_retries(count: u32) -> WorkflowSettings {
    WorkflowSettings::default().with_retries(
        count,
        BackoffPolicy {
            delay_ms: 1,
            multiplier: 2.0,
            max_delay_ms: 10,
        },
    )
}

// ============================================================================
// Ordering
// ============================================================================

#[tokio::test]
async fn test_every_node_runs_once_after_its_dependencies() {
    let journal = Journal::default();
    let log = journal.clone();
    let engine = step_engine(behavior(move |ctx| {
        let log = log.clone();
        async move {
            log.push(&ctx.node_id);
            echo(&ctx.node_id)
        }
    }));

    let record = engine
        .execute(&diamond(WorkflowSettings::default()), HashMap::new())
        .await
        .unwrap();

    assert_eq!(record.status, ExecutionStatus::Completed);
    for id in ["A", "B", "C", "D"] {
        assert_eq!(journal.count(id), 1, "{} should run exactly once", id);
        assert_eq!(record.node_status(id), Some(NodeStatus::Success));
        assert_eq!(record.node(id).unwrap().attempt_count(), 1);
    }
    assert!(journal.position("A") < journal.position("B"));
    assert!(journal.position("A") < journal.position("C"));
    assert!(journal.position("B") < journal.position("D"));
    assert!(journal.position("C") < journal.position("D"));
    assert!(record.finished_at.is_some());
}

#[tokio::test]
async fn test_fan_in_receives_every_upstream_value() {
    let seen = Arc::new(std::sync::Mutex::new(Vec::new()));
    let sink = seen.clone();
    let engine = step_engine(behavior(move |ctx| {
        let sink = sink.clone();
        async move {
            if ctx.node_id == "D" {
                if let Some(InputSlot::Many(slots)) = ctx.input_slot("in") {
                    let mut values: Vec<String> = slots
                        .iter()
                        .filter_map(|s| s.as_value().and_then(|v| v.as_str()).map(String::from))
                        .collect();
                    values.sort();
                    *sink.lock().unwrap() = values;
                }
            }
            echo(&ctx.node_id)
        }
    }));

    engine
        .execute(&diamond(WorkflowSettings::default()), HashMap::new())
        .await
        .unwrap();

    assert_eq!(*seen.lock().unwrap(), vec!["B".to_string(), "C".to_string()]);
}

#[tokio::test]
async fn test_cycle_is_rejected_before_any_node_runs() {
    let journal = Journal::default();
    let log = journal.clone();
    let engine = step_engine(behavior(move |ctx| {
        let log = log.clone();
        async move {
            log.push(&ctx.node_id);
            echo(&ctx.node_id)
        }
    }));

    let mut wf = chain(&["A", "B"]);
    wf.connect("B", "out", "A", "in");
    let workflow_id = engine.register_workflow(wf).await;

    let err = engine.start_run(workflow_id, HashMap::new()).await.unwrap_err();
    match err {
        FlowError::Validation(e) => {
            assert!(e.contains(|v| matches!(v, Violation::Cycle { nodes } if nodes.len() == 2)));
        }
        other => panic!("expected validation error, got {:?}", other),
    }
    assert!(journal.entries().is_empty());
}

// ============================================================================
// Concurrency
// ============================================================================

#[tokio::test]
async fn test_independent_branches_run_concurrently() {
    // B and C only get past the barrier if both are in flight together
    let barrier = Arc::new(Barrier::new(2));
    let gate = barrier.clone();
    let engine = step_engine(behavior(move |ctx| {
        let gate = gate.clone();
        async move {
            if ctx.node_id == "B" || ctx.node_id == "C" {
                gate.wait().await;
            }
            echo(&ctx.node_id)
        }
    }));

    let record = tokio::time::timeout(
        Duration::from_secs(5),
        engine.execute(&diamond(WorkflowSettings::default()), HashMap::new()),
    )
    .await
    .expect("branches deadlocked")
    .unwrap();

    assert_eq!(record.status, ExecutionStatus::Completed);
}

#[tokio::test]
async fn test_parallelism_bound_is_respected() {
    let current = Arc::new(AtomicUsize::new(0));
    let peak = Arc::new(AtomicUsize::new(0));
    let (now, max) = (current.clone(), peak.clone());
    let engine = step_engine(behavior(move |ctx| {
        let (now, max) = (now.clone(), max.clone());
        async move {
            let running = now.fetch_add(1, Ordering::SeqCst) + 1;
            max.fetch_max(running, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(20)).await;
            now.fetch_sub(1, Ordering::SeqCst);
            echo(&ctx.node_id)
        }
    }));

    let mut settings = WorkflowSettings::default();
    settings.max_parallel_nodes = Some(2);
    let mut wf = weavecore::Workflow::new("wide").with_settings(settings);
    for id in ["a", "b", "c", "d", "e"] {
        wf.add_node(NodeSpec::new(id, STEP));
    }

    let record = engine.execute(&wf, HashMap::new()).await.unwrap();

    assert_eq!(record.status, ExecutionStatus::Completed);
    assert!(peak.load(Ordering::SeqCst) <= 2);
}

// ============================================================================
// Error handling
// ============================================================================

#[tokio::test]
async fn test_stop_lets_siblings_finish_and_skips_the_rest() {
    let journal = Journal::default();
    let b_failed = Arc::new(Notify::new());
    let (log, signal) = (journal.clone(), b_failed.clone());
    let engine = step_engine(behavior(move |ctx| {
        let (log, signal) = (log.clone(), signal.clone());
        async move {
            log.push(&ctx.node_id);
            match ctx.node_id.as_str() {
                "B" => {
                    signal.notify_one();
                    Err(NodeError::ExecutionFailed("boom".into()))
                }
                // C is in flight when B fails and only finishes afterwards
                "C" => {
                    signal.notified().await;
                    tokio::time::sleep(Duration::from_millis(20)).await;
                    echo("C")
                }
                id => echo(id),
            }
        }
    }));

    let record = engine
        .execute(&diamond(WorkflowSettings::default()), HashMap::new())
        .await
        .unwrap();

    assert_eq!(record.status, ExecutionStatus::Failed);
    assert_eq!(record.node_status("A"), Some(NodeStatus::Success));
    assert_eq!(record.node_status("B"), Some(NodeStatus::Error));
    assert_eq!(record.node_status("C"), Some(NodeStatus::Success));
    assert_eq!(record.node_status("D"), Some(NodeStatus::Skipped));
    assert_eq!(
        record.node("D").unwrap().skip_reason,
        Some(SkipReason::UpstreamFailed)
    );
    assert_eq!(journal.count("D"), 0);

    let failed = record.failed_nodes();
    assert_eq!(failed.len(), 1);
    assert_eq!(failed[0].0, "B");
    assert!(failed[0].1.contains("boom"));
}

#[tokio::test]
async fn test_continue_hands_failure_marker_downstream() {
    let observed = Arc::new(std::sync::Mutex::new((0usize, Vec::<String>::new())));
    let sink = observed.clone();
    let engine = step_engine(behavior(move |ctx| {
        let sink = sink.clone();
        async move {
            match ctx.node_id.as_str() {
                "B" => Err(NodeError::ExecutionFailed("bad input".into())),
                "D" => {
                    let Some(InputSlot::Many(slots)) = ctx.input_slot("in") else {
                        return Err(NodeError::MissingInput("in".into()));
                    };
                    let mut seen = sink.lock().unwrap();
                    for slot in slots {
                        match slot {
                            InputSlot::UpstreamFailed(failure) => {
                                assert_eq!(failure.node_id, "B");
                                seen.0 += 1;
                            }
                            other => seen
                                .1
                                .push(other.as_value().and_then(|v| v.as_str()).unwrap_or("").into()),
                        }
                    }
                    echo("D")
                }
                id => echo(id),
            }
        }
    }));

    let settings = WorkflowSettings::default().with_error_handling(ErrorHandling::Continue);
    let record = engine.execute(&diamond(settings), HashMap::new()).await.unwrap();

    assert_eq!(record.status, ExecutionStatus::Completed);
    assert!(record.has_errors());
    assert_eq!(record.node_status("B"), Some(NodeStatus::Error));
    assert_eq!(record.node_status("D"), Some(NodeStatus::Success));

    let (failures, values) = observed.lock().unwrap().clone();
    assert_eq!(failures, 1);
    assert_eq!(values, vec!["C".to_string()]);
}

#[tokio::test]
async fn test_failure_marker_converts_to_node_error() {
    let engine = step_engine(behavior(|ctx| async move {
        if ctx.node_id == "A" {
            return Err(NodeError::ExecutionFailed("nope".into()));
        }
        if let Some(InputSlot::Many(slots)) = ctx.input_slot("in") {
            for slot in slots {
                slot.value("in")?;
            }
        }
        echo(&ctx.node_id)
    }));

    let mut settings = WorkflowSettings::default().with_error_handling(ErrorHandling::Continue);
    settings.retry_count = 0;
    let record = engine
        .execute(&chain(&["A", "B"]).with_settings(settings), HashMap::new())
        .await
        .unwrap();

    let b = record.node("B").unwrap();
    assert_eq!(b.status, NodeStatus::Error);
    assert!(b.error.as_deref().unwrap().contains("upstream node 'A' failed: nope"));
}

#[tokio::test]
async fn test_retry_recovers_after_transient_failures() {
    let calls = Arc::new(AtomicU32::new(0));
    let counter = calls.clone();
    let engine = step_engine(behavior(move |ctx| {
        let counter = counter.clone();
        async move {
            if ctx.node_id == "B" {
                let n = counter.fetch_add(1, Ordering::SeqCst) + 1;
                assert_eq!(ctx.attempt, n);
                if n < 3 {
                    return Err(NodeError::ExecutionFailed(format!("flaky {}", n)));
                }
            }
            echo(&ctx.node_id)
        }
    }));
    let mut events = engine.subscribe_events();

    let record = engine
        .execute(&diamond(fast_retries(3)), HashMap::new())
        .await
        .unwrap();

    assert_eq!(record.status, ExecutionStatus::Completed);
    assert_eq!(calls.load(Ordering::SeqCst), 3);
    let b = record.node("B").unwrap();
    assert_eq!(b.status, NodeStatus::Success);
    let outcomes: Vec<(u32, bool)> = b.attempts.iter().map(|a| (a.attempt, a.success)).collect();
    assert_eq!(outcomes, vec![(1, false), (2, false), (3, true)]);

    let mut retries = 0;
    while let Ok(event) = events.try_recv() {
        if let ExecutionEvent::NodeFailed { will_retry: true, .. } = event {
            retries += 1;
        }
    }
    assert_eq!(retries, 2);
}

#[tokio::test]
async fn test_retry_exhaustion_fails_the_run() {
    let engine = step_engine(behavior(|ctx| async move {
        if ctx.node_id == "B" {
            return Err(NodeError::ExecutionFailed("always".into()));
        }
        echo(&ctx.node_id)
    }));

    let record = engine
        .execute(&chain(&["A", "B", "C"]).with_settings(fast_retries(2)), HashMap::new())
        .await
        .unwrap();

    assert_eq!(record.status, ExecutionStatus::Failed);
    assert_eq!(record.node("B").unwrap().attempt_count(), 3);
    assert_eq!(record.node_status("B"), Some(NodeStatus::Error));
    assert_eq!(record.node_status("C"), Some(NodeStatus::Skipped));
}

#[tokio::test]
async fn test_timeout_fails_the_node() {
    let engine = step_engine(behavior(|ctx| async move {
        if ctx.node_id == "slow" {
            tokio::time::sleep(Duration::from_secs(30)).await;
        }
        echo(&ctx.node_id)
    }));

    let mut wf = weavecore::Workflow::new("timeout");
    wf.add_node(NodeSpec::new("slow", STEP).with_timeout(50));

    let record = tokio::time::timeout(Duration::from_secs(5), engine.execute(&wf, HashMap::new()))
        .await
        .expect("timeout was not enforced")
        .unwrap();

    assert_eq!(record.status, ExecutionStatus::Failed);
    let slow = record.node("slow").unwrap();
    assert_eq!(slow.status, NodeStatus::Error);
    assert_eq!(
        slow.error.as_deref(),
        Some(NodeError::Timeout { millis: 50 }.to_string().as_str())
    );
}

struct RejectingFactory {
    creates: Arc<AtomicUsize>,
}

impl NodeFactory for RejectingFactory {
    fn create(&self, _config: &HashMap<String, Value>) -> Result<Box<dyn Node>, NodeError> {
        self.creates.fetch_add(1, Ordering::SeqCst);
        Err(NodeError::Configuration("endpoint unreachable".into()))
    }

    fn node_type(&self) -> &str {
        "test.rejecting"
    }

    fn metadata(&self) -> NodeMetadata {
        step_metadata()
    }
}

#[tokio::test]
async fn test_initialization_failure_is_not_retried() {
    let creates = Arc::new(AtomicUsize::new(0));
    let mut registry = NodeRegistry::new();
    registry.register(Arc::new(RejectingFactory {
        creates: creates.clone(),
    }));
    let engine = Engine::with_registry(Arc::new(registry), RuntimeConfig::default());

    let mut wf = weavecore::Workflow::new("rejecting").with_settings(fast_retries(3));
    wf.add_node(NodeSpec::new("bad", "test.rejecting"));

    let record = engine.execute(&wf, HashMap::new()).await.unwrap();

    assert_eq!(record.status, ExecutionStatus::Failed);
    assert_eq!(creates.load(Ordering::SeqCst), 1);
    let bad = record.node("bad").unwrap();
    assert_eq!(bad.status, NodeStatus::Error);
    assert_eq!(bad.attempt_count(), 1);
    let error = bad.error.as_deref().unwrap();
    assert!(error.starts_with("Node initialization failed"));
    assert!(error.contains("endpoint unreachable"));
}

#[tokio::test]
async fn test_run_deadline_stops_the_whole_run() {
    let engine = step_engine(behavior(|ctx| async move {
        if ctx.node_id == "B" {
            // Ignores its cancellation token
            tokio::time::sleep(Duration::from_secs(30)).await;
        }
        echo(&ctx.node_id)
    }));
    let wf = chain(&["A", "B", "C"]).with_settings(WorkflowSettings::default().with_run_timeout(100));

    let record = tokio::time::timeout(Duration::from_secs(5), engine.execute(&wf, HashMap::new()))
        .await
        .expect("run deadline was not enforced")
        .unwrap();

    assert_eq!(record.status, ExecutionStatus::Failed);
    assert_eq!(record.node_status("A"), Some(NodeStatus::Success));
    let b = record.node("B").unwrap();
    assert_eq!(b.status, NodeStatus::Error);
    assert_eq!(b.error.as_deref(), Some("run deadline of 100ms exceeded"));
    assert_eq!(record.node_status("C"), Some(NodeStatus::Skipped));
    assert_eq!(
        record.node("C").unwrap().skip_reason,
        Some(SkipReason::DeadlineExceeded)
    );
}

#[tokio::test]
async fn test_run_deadline_left_unreached_changes_nothing() {
    let engine = step_engine(behavior(|ctx| async move { echo(&ctx.node_id) }));
    let settings = WorkflowSettings::default().with_run_timeout(60_000);

    let record = engine.execute(&diamond(settings), HashMap::new()).await.unwrap();

    assert_eq!(record.status, ExecutionStatus::Completed);
    assert_eq!(record.completed_nodes().len(), 4);
}

#[tokio::test]
async fn test_panicking_node_is_recorded_as_failure() {
    let engine = step_engine(behavior(|ctx| async move {
        if ctx.node_id == "A" {
            panic!("node blew up");
        }
        echo(&ctx.node_id)
    }));

    let record = engine
        .execute(&chain(&["A", "B"]), HashMap::new())
        .await
        .unwrap();

    assert_eq!(record.status, ExecutionStatus::Failed);
    let a = record.node("A").unwrap();
    assert_eq!(a.status, NodeStatus::Error);
    assert!(a.error.as_deref().unwrap().contains("node blew up"));
    assert_eq!(record.node_status("B"), Some(NodeStatus::Skipped));
}

// ============================================================================
// Cancellation
// ============================================================================

#[tokio::test]
async fn test_cancellation_prevents_further_dispatch() {
    let journal = Journal::default();
    let started = Arc::new(Notify::new());
    let release = Arc::new(Notify::new());
    let (log, b_started, b_release) = (journal.clone(), started.clone(), release.clone());
    let engine = step_engine(behavior(move |ctx| {
        let (log, b_started, b_release) = (log.clone(), b_started.clone(), b_release.clone());
        async move {
            log.push(&ctx.node_id);
            if ctx.node_id == "B" {
                b_started.notify_one();
                b_release.notified().await;
            }
            echo(&ctx.node_id)
        }
    }));

    let workflow_id = engine.register_workflow(chain(&["A", "B", "C"])).await;
    let execution_id = engine.start_run(workflow_id, HashMap::new()).await.unwrap();

    started.notified().await;
    assert!(engine.cancel(execution_id).await);
    release.notify_one();

    let record = engine.wait(execution_id).await.unwrap();
    assert_eq!(record.status, ExecutionStatus::Cancelled);
    assert_eq!(record.node_status("A"), Some(NodeStatus::Success));
    assert_eq!(record.node_status("B"), Some(NodeStatus::Success));
    assert_eq!(record.output("B", "out"), Some(&Value::from("B")));
    assert_eq!(record.node_status("C"), Some(NodeStatus::Skipped));
    assert_eq!(
        record.node("C").unwrap().skip_reason,
        Some(SkipReason::RunCancelled)
    );
    assert_eq!(journal.count("C"), 0);
    assert_eq!(record.completed_nodes().len(), 2);

    // Finished runs no longer accept cancellation
    assert!(!engine.cancel(execution_id).await);
}

#[tokio::test]
async fn test_cancellation_keeps_waiting_sibling_from_starting() {
    let journal = Journal::default();
    let started = Arc::new(Notify::new());
    let release = Arc::new(Notify::new());
    let (log, gate_started, gate_release) = (journal.clone(), started.clone(), release.clone());
    let engine = step_engine(behavior(move |ctx| {
        let (log, gate_started, gate_release) =
            (log.clone(), gate_started.clone(), gate_release.clone());
        async move {
            log.push(&ctx.node_id);
            if ctx.node_id == "B" || ctx.node_id == "C" {
                gate_started.notify_one();
                gate_release.notified().await;
            }
            echo(&ctx.node_id)
        }
    }));

    // One slot: whichever sibling goes first holds it, the other waits
    let settings = WorkflowSettings {
        max_parallel_nodes: Some(1),
        ..WorkflowSettings::default()
    };
    let workflow_id = engine.register_workflow(diamond(settings)).await;
    let execution_id = engine.start_run(workflow_id, HashMap::new()).await.unwrap();

    started.notified().await;
    assert!(engine.cancel(execution_id).await);
    release.notify_one();

    let record = engine.wait(execution_id).await.unwrap();
    assert_eq!(record.status, ExecutionStatus::Cancelled);
    assert_eq!(record.node_status("A"), Some(NodeStatus::Success));

    let (ran, waiting) = if journal.count("B") == 1 { ("B", "C") } else { ("C", "B") };
    assert_eq!(journal.count(ran), 1);
    assert_eq!(record.node_status(ran), Some(NodeStatus::Success));
    assert_eq!(journal.count(waiting), 0);
    for never_started in [waiting, "D"] {
        let node = record.node(never_started).unwrap();
        assert_eq!(node.status, NodeStatus::Skipped);
        assert_eq!(node.skip_reason, Some(SkipReason::RunCancelled));
    }
}

#[tokio::test]
async fn test_cooperative_node_observes_cancellation() {
    let started = Arc::new(Notify::new());
    let signal = started.clone();
    let engine = step_engine(behavior(move |ctx| {
        let signal = signal.clone();
        async move {
            if ctx.node_id == "A" {
                signal.notify_one();
                ctx.cancellation.cancelled().await;
                return Err(NodeError::Cancelled);
            }
            echo(&ctx.node_id)
        }
    }));

    let workflow_id = engine.register_workflow(chain(&["A", "B"])).await;
    let execution_id = engine.start_run(workflow_id, HashMap::new()).await.unwrap();
    started.notified().await;
    engine.cancel(execution_id).await;

    let record = engine.wait(execution_id).await.unwrap();
    assert_eq!(record.status, ExecutionStatus::Cancelled);
    assert_eq!(record.node_status("A"), Some(NodeStatus::Cancelled));
    assert_eq!(record.node_status("B"), Some(NodeStatus::Skipped));
    assert_eq!(record.node("A").unwrap().attempt_count(), 1);
}

#[tokio::test]
async fn test_cancellation_abandons_pending_retry() {
    let engine = step_engine(behavior(|_ctx| async move {
        Err::<NodeOutput, _>(NodeError::ExecutionFailed("down".into()))
    }));
    let mut events = engine.subscribe_events();

    let settings = WorkflowSettings::default().with_retries(
        5,
        BackoffPolicy {
            delay_ms: 10_000,
            multiplier: 1.0,
            max_delay_ms: 10_000,
        },
    );
    let workflow_id = engine
        .register_workflow(chain(&["A"]).with_settings(settings))
        .await;
    let execution_id = engine.start_run(workflow_id, HashMap::new()).await.unwrap();

    // Wait until the first failure has been scheduled for retry
    loop {
        if let ExecutionEvent::NodeFailed { will_retry, .. } = events.recv().await.unwrap() {
            assert!(will_retry);
            break;
        }
    }
    assert!(engine.cancel(execution_id).await);

    let record = tokio::time::timeout(Duration::from_secs(5), engine.wait(execution_id))
        .await
        .expect("backoff ignored cancellation")
        .unwrap();
    assert_eq!(record.status, ExecutionStatus::Cancelled);
    let a = record.node("A").unwrap();
    assert_eq!(a.status, NodeStatus::Cancelled);
    assert_eq!(a.attempt_count(), 1);
    assert!(a.error.as_deref().unwrap().contains("down"));
}
