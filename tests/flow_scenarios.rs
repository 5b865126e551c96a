use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::future::BoxFuture;
use serde_json::{json, Value};
use uuid::Uuid;

use flowrun_core::config::{EngineConfig, EventsConfig};
use flowrun_core::traits::{ExecutionStore, RecordSource};
use flowrun_core::{
    Edge, EventBus, ExecutionConfig, ExecutionDetail, ExecutionStatus, FlowDefinition, FlowError,
    FlowEvent, FlowExecution, FlowNodeExecution, GuardrailConfig, JobId, Node, NodeUpdate, Result,
};
use flowrun_engine::{FlowRunner, FlowService, GuardrailRegistry, StartRequest};
use flowrun_store::SqliteStore;
use flowrun_test_utils::{guarded_flow, linear_flow, router_flow, temp_store, MockExecutor};

struct Harness {
    _dir: tempfile::TempDir,
    store: Arc<SqliteStore>,
    executor: Arc<MockExecutor>,
    service: FlowService,
}

fn harness(executor: MockExecutor) -> Harness {
    let (dir, store) = temp_store();
    let executor = Arc::new(executor);
    let bus = Arc::new(EventBus::new(EventsConfig::default(), store.clone()));
    let records: Arc<dyn RecordSource> = store.clone();
    let runner = FlowRunner::new(
        executor.clone(),
        store.clone(),
        bus,
        Arc::new(GuardrailRegistry::with_builtins(Some(records))),
    );
    let service = FlowService::new(runner, store.clone(), store.clone(), EngineConfig::default());
    Harness {
        _dir: dir,
        store,
        executor,
        service,
    }
}

impl Harness {
    async fn start(&self, flow: &FlowDefinition, job_id: &str, inputs: Value) -> i64 {
        self.store.save_flow(flow).unwrap();
        let request = StartRequest {
            flow_id: Some(flow.id),
            job_id: Some(JobId::from_str(job_id)),
            config: ExecutionConfig {
                inputs: inputs.as_object().cloned().unwrap_or_default(),
                ..ExecutionConfig::default()
            },
        };
        let started = self.service.start_execution(request).await.unwrap();
        assert_eq!(started.status, ExecutionStatus::Pending);
        started.execution_id
    }

    async fn run(&self, flow: &FlowDefinition, job_id: &str, inputs: Value) -> ExecutionDetail {
        let id = self.start(flow, job_id, inputs).await;
        self.service.wait(id).await.unwrap();
        self.service.get_execution(id).await.unwrap()
    }
}

fn node_ids(detail: &ExecutionDetail) -> Vec<&str> {
    detail.nodes.iter().map(|n| n.node_id.as_str()).collect()
}

#[tokio::test]
async fn test_guarded_table_not_empty_fails_job() {
    let h = harness(MockExecutor::new());
    for name in ["Acme", "Globex", "Initech"] {
        h.store.insert_record(Some(name), false).unwrap();
    }
    let flow = guarded_flow(GuardrailConfig::new("empty_data_processing"), 2);
    let detail = h.run(&flow, "job-1", json!({})).await;

    assert_eq!(detail.execution.status, ExecutionStatus::Failed);
    assert_eq!(detail.execution.job_id.as_str(), "job-1");
    assert_eq!(detail.node("a").unwrap().status, ExecutionStatus::Completed);

    let b = detail.node("b").unwrap();
    assert_eq!(b.status, ExecutionStatus::Failed);
    assert_eq!(b.attempts, 3);
    assert!(b
        .error
        .as_deref()
        .unwrap()
        .contains("The data_processing table contains 3 records"));
    assert!(detail.node("c").is_none());
    assert_eq!(h.executor.calls_for("b").len(), 3);
}

#[tokio::test]
async fn test_retry_events_follow_start_in_attempt_order() {
    let h = harness(MockExecutor::new());
    for name in ["Acme", "Globex", "Initech"] {
        h.store.insert_record(Some(name), false).unwrap();
    }
    let flow = guarded_flow(GuardrailConfig::new("empty_data_processing"), 2);
    let detail = h.run(&flow, "job-1", json!({})).await;
    let events: Vec<FlowEvent> = h
        .service
        .history(detail.execution.id, 10_000, 0)
        .await
        .unwrap()
        .iter()
        .map(|e| serde_json::from_str(&e.content).unwrap())
        .collect();

    let position = |wanted: &dyn Fn(&FlowEvent) -> bool| events.iter().position(|e| wanted(e)).unwrap();
    let started = position(&|e| matches!(e, FlowEvent::NodeStarted { node_id, attempt: 1 } if node_id == "b"));
    let retry_2 = position(&|e| matches!(e, FlowEvent::NodeRetry { node_id, attempt: 2, .. } if node_id == "b"));
    let retry_3 = position(&|e| matches!(e, FlowEvent::NodeRetry { node_id, attempt: 3, .. } if node_id == "b"));
    let failed = position(&|e| matches!(e, FlowEvent::NodeFailed { node_id, .. } if node_id == "b"));
    assert!(started < retry_2);
    assert!(retry_2 < retry_3);
    assert!(retry_3 < failed);

    // Every node starts before it settles, and retries only count up
    let mut attempts: Vec<u32> = Vec::new();
    for (i, event) in events.iter().enumerate() {
        match event {
            FlowEvent::NodeCompleted { node_id, .. } | FlowEvent::NodeFailed { node_id, .. } => {
                let first_start = events.iter().position(
                    |e| matches!(e, FlowEvent::NodeStarted { node_id: n, .. } if n == node_id),
                );
                assert!(first_start.is_some_and(|s| s < i), "{} settled before starting", node_id);
            }
            FlowEvent::NodeRetry { node_id, attempt, .. } if node_id == "b" => attempts.push(*attempt),
            _ => {}
        }
    }
    assert_eq!(attempts, vec![2, 3]);

    let last = events.last().unwrap();
    assert!(matches!(
        last,
        FlowEvent::ExecutionStatus {
            status: ExecutionStatus::Failed,
            ..
        }
    ));
}

#[tokio::test]
async fn test_guarded_table_empty_completes_job() {
    let h = harness(MockExecutor::new());
    let flow = guarded_flow(GuardrailConfig::new("empty_data_processing"), 2);
    let detail = h.run(&flow, "job-1", json!({})).await;

    assert_eq!(detail.execution.status, ExecutionStatus::Completed);
    assert_eq!(node_ids(&detail), vec!["a", "b", "c"]);
    assert_eq!(detail.node("b").unwrap().attempts, 1);
}

#[tokio::test]
async fn test_router_only_runs_selected_subgraph() {
    let h = harness(MockExecutor::new());
    let flow = router_flow();

    let high = h.run(&flow, "router-high", json!({"count": 15})).await;
    assert_eq!(high.execution.status, ExecutionStatus::Completed);
    assert_eq!(node_ids(&high), vec!["a", "r", "yes", "yes_after"]);

    let low = h.run(&flow, "router-low", json!({"count": 3})).await;
    assert_eq!(low.execution.status, ExecutionStatus::Completed);
    assert_eq!(node_ids(&low), vec!["a", "r", "no", "no_after"]);
}

#[tokio::test]
async fn test_cancel_after_first_node() {
    let executor = MockExecutor::new();
    let gate = executor.gate("a");
    let h = harness(executor);
    let id = h.start(&linear_flow(), "cancel-job", json!({})).await;

    gate.entered().await;
    let status = h.service.cancel_execution(id).await.unwrap();
    assert_eq!(status, ExecutionStatus::Running);
    gate.release();

    assert_eq!(h.service.wait(id).await.unwrap(), ExecutionStatus::Cancelled);
    let detail = h.service.get_execution(id).await.unwrap();
    assert_eq!(detail.execution.status, ExecutionStatus::Cancelled);
    assert_eq!(node_ids(&detail), vec!["a"]);
    assert_eq!(detail.node("a").unwrap().status, ExecutionStatus::Completed);
    assert_eq!(detail.node("a").unwrap().result, Some(json!("a done")));

    // Terminal executions are left alone
    let again = h.service.cancel_execution(id).await.unwrap();
    assert_eq!(again, ExecutionStatus::Cancelled);
}

#[tokio::test]
async fn test_concurrent_executions_are_isolated() {
    let executor = MockExecutor::new()
        .delay("a", Duration::from_millis(30))
        .delay("b", Duration::from_millis(30));
    let h = harness(executor);
    let flow = linear_flow();

    let first = h.start(&flow, "iso-1", json!({"tag": "one"})).await;
    let second = h.start(&flow, "iso-2", json!({"tag": "two"})).await;
    assert_eq!(h.service.wait(first).await.unwrap(), ExecutionStatus::Completed);
    assert_eq!(h.service.wait(second).await.unwrap(), ExecutionStatus::Completed);

    for (id, job) in [(first, "iso-1"), (second, "iso-2")] {
        let detail = h.service.get_execution(id).await.unwrap();
        assert_eq!(detail.execution.job_id.as_str(), job);
        assert_eq!(node_ids(&detail), vec!["a", "b", "c"]);
        assert!(detail.nodes.iter().all(|n| n.flow_execution_id == id));

        let events = h.service.history(id, 1000, 0).await.unwrap();
        assert!(!events.is_empty());
        assert!(events.iter().all(|e| e.job_id.as_str() == job));
    }

    let listed = h.service.list_executions_by_flow(flow.id).await.unwrap();
    assert_eq!(listed.len(), 2);

    // Each execution's nodes saw only its own state
    let tags: Vec<Value> = h
        .executor
        .calls_for("c")
        .iter()
        .map(|c| c.state["tag"].clone())
        .collect();
    assert_eq!(tags.len(), 2);
    assert!(tags.contains(&json!("one")));
    assert!(tags.contains(&json!("two")));
}

#[tokio::test]
async fn test_history_pages_slice_full_log() {
    let h = harness(MockExecutor::new());
    let detail = h.run(&linear_flow(), "paged", json!({})).await;
    let id = detail.execution.id;

    let full = h.service.history(id, 10_000, 0).await.unwrap();
    assert!(full.len() > 5);
    for (i, event) in full.iter().enumerate() {
        assert_eq!(event.sequence, i as u64);
    }
    assert_eq!(h.service.count_logs(&JobId::from_str("paged")).await.unwrap(), full.len() as u64);

    for limit in [1, 2, 5, full.len(), full.len() + 3] {
        for offset in [0, 1, 3, full.len() - 1, full.len(), full.len() + 2] {
            let page = h.service.history(id, limit, offset).await.unwrap();
            let start = offset.min(full.len());
            let end = (offset + limit).min(full.len());
            assert_eq!(page, full[start..end].to_vec(), "limit={} offset={}", limit, offset);
        }
    }

    let first: FlowEvent = serde_json::from_str(&full[0].content).unwrap();
    assert_eq!(
        first,
        FlowEvent::ExecutionStatus {
            status: ExecutionStatus::Preparing,
            message: None
        }
    );

    assert!(matches!(
        h.service.history(id, 0, 0).await,
        Err(FlowError::InvalidInput(_))
    ));
    assert!(matches!(
        h.service.history(id, 10_001, 0).await,
        Err(FlowError::InvalidInput(_))
    ));
}

#[tokio::test]
async fn test_dynamic_flow_runs_under_nil_flow_id() {
    let h = harness(MockExecutor::new());
    let request = StartRequest {
        flow_id: None,
        job_id: None,
        config: ExecutionConfig {
            nodes: vec![Node::agent("x"), Node::task("y")],
            edges: vec![Edge::new("x", "y")],
            ..ExecutionConfig::default()
        },
    };
    let started = h.service.start_execution(request).await.unwrap();
    assert!(!started.job_id.as_str().is_empty());
    assert_eq!(h.service.wait(started.execution_id).await.unwrap(), ExecutionStatus::Completed);

    let detail = h.service.get_execution_by_job(&started.job_id).await.unwrap();
    assert_eq!(detail.execution.flow_id, Uuid::nil());
    assert_eq!(node_ids(&detail), vec!["x", "y"]);
    let listed = h.service.list_executions_by_flow(Uuid::nil()).await.unwrap();
    assert_eq!(listed.len(), 1);
}

#[tokio::test]
async fn test_start_request_validation() {
    let h = harness(MockExecutor::new());

    let missing = StartRequest {
        flow_id: Some(Uuid::new_v4()),
        ..StartRequest::default()
    };
    assert!(matches!(
        h.service.start_execution(missing).await,
        Err(FlowError::NotFound(_))
    ));

    assert!(matches!(
        h.service.start_execution(StartRequest::default()).await,
        Err(FlowError::InvalidInput(_))
    ));

    let flow = linear_flow();
    let id = h.start(&flow, "dup-job", json!({})).await;
    h.service.wait(id).await.unwrap();
    let duplicate = StartRequest {
        flow_id: Some(flow.id),
        job_id: Some(JobId::from_str("dup-job")),
        ..StartRequest::default()
    };
    assert!(matches!(
        h.service.start_execution(duplicate).await,
        Err(FlowError::Conflict(_))
    ));

    assert!(matches!(
        h.service.get_execution(4242).await,
        Err(FlowError::NotFound(_))
    ));
    assert!(matches!(
        h.service.cancel_execution(4242).await,
        Err(FlowError::NotFound(_))
    ));
}

#[tokio::test]
async fn test_cancel_orphaned_execution() {
    let h = harness(MockExecutor::new());
    let job_id = JobId::from_str("orphan");
    let execution = h
        .store
        .create_execution(Uuid::nil(), &job_id, json!({}))
        .await
        .unwrap();

    let status = h.service.cancel_execution(execution.id).await.unwrap();
    assert_eq!(status, ExecutionStatus::Cancelled);
    let detail = h.service.get_execution(execution.id).await.unwrap();
    assert_eq!(detail.execution.status, ExecutionStatus::Cancelled);
}

#[tokio::test]
async fn test_shutdown_stops_running_executions() {
    let executor = MockExecutor::new();
    let gate = executor.gate("a");
    let h = harness(executor);
    let id = h.start(&linear_flow(), "shutdown-job", json!({})).await;
    gate.entered().await;

    h.service.shutdown().await;
    assert_eq!(h.service.active_count(), 0);

    let detail = h.service.get_execution(id).await.unwrap();
    assert_eq!(detail.execution.status, ExecutionStatus::Cancelled);
    assert_eq!(detail.node("a").unwrap().status, ExecutionStatus::Cancelled);
    assert!(detail.node("b").is_none());

    let late = StartRequest {
        flow_id: Some(linear_flow().id),
        ..StartRequest::default()
    };
    assert!(matches!(
        h.service.start_execution(late).await,
        Err(FlowError::Conflict(_))
    ));
}

/// Execution store whose first read reports a stale status.
struct StaleFirstRead {
    inner: Arc<SqliteStore>,
    stale: Mutex<Option<ExecutionStatus>>,
}

impl ExecutionStore for StaleFirstRead {
    fn create_execution(&self, flow_id: Uuid, job_id: &JobId, config: Value) -> BoxFuture<'_, Result<FlowExecution>> {
        self.inner.create_execution(flow_id, job_id, config)
    }

    fn update_execution(
        &self,
        execution_id: i64,
        status: ExecutionStatus,
        result: Option<Value>,
        error: Option<String>,
    ) -> BoxFuture<'_, Result<()>> {
        self.inner.update_execution(execution_id, status, result, error)
    }

    fn get_execution(&self, execution_id: i64) -> BoxFuture<'_, Result<Option<FlowExecution>>> {
        let stale = self.stale.lock().unwrap().take();
        Box::pin(async move {
            let mut execution = self.inner.get_execution(execution_id).await?;
            if let (Some(e), Some(status)) = (execution.as_mut(), stale) {
                e.status = status;
            }
            Ok(execution)
        })
    }

    fn get_execution_by_job(&self, job_id: &JobId) -> BoxFuture<'_, Result<Option<FlowExecution>>> {
        self.inner.get_execution_by_job(job_id)
    }

    fn list_executions_by_flow(&self, flow_id: Uuid) -> BoxFuture<'_, Result<Vec<FlowExecution>>> {
        self.inner.list_executions_by_flow(flow_id)
    }

    fn create_node_execution(&self, execution_id: i64, node_id: &str) -> BoxFuture<'_, Result<FlowNodeExecution>> {
        self.inner.create_node_execution(execution_id, node_id)
    }

    fn update_node_execution(&self, id: i64, update: NodeUpdate) -> BoxFuture<'_, Result<()>> {
        self.inner.update_node_execution(id, update)
    }

    fn list_node_executions(&self, execution_id: i64) -> BoxFuture<'_, Result<Vec<FlowNodeExecution>>> {
        self.inner.list_node_executions(execution_id)
    }
}

#[tokio::test]
async fn test_cancel_racing_completion_returns_final_status() {
    let (_dir, store) = temp_store();
    let job_id = JobId::from_str("raced");
    let execution = store.create_execution(Uuid::nil(), &job_id, json!({})).await.unwrap();
    for status in [ExecutionStatus::Running, ExecutionStatus::Completed] {
        store.update_execution(execution.id, status, None, None).await.unwrap();
    }

    let bus = Arc::new(EventBus::new(EventsConfig::default(), store.clone()));
    let runner = FlowRunner::new(
        Arc::new(MockExecutor::new()),
        store.clone(),
        bus,
        Arc::new(GuardrailRegistry::with_builtins(None)),
    );
    let stale = Arc::new(StaleFirstRead {
        inner: store.clone(),
        stale: Mutex::new(Some(ExecutionStatus::Running)),
    });
    let service = FlowService::new(runner, store.clone(), stale, EngineConfig::default());

    let status = service.cancel_execution(execution.id).await.unwrap();
    assert_eq!(status, ExecutionStatus::Completed);
    let stored = store.get_execution(execution.id).await.unwrap().unwrap();
    assert_eq!(stored.status, ExecutionStatus::Completed);
}
