//! Execution coordinator.
//!
//! One [`FlowRunner::run`] call owns one flow execution from PENDING to a
//! terminal status. It compiles the flow, then repeatedly promotes ready
//! nodes and dispatches them (bounded by `max_parallel`), running the
//! guardrail retry loop inside each node task. It is the only writer of the
//! execution's records.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Map, Value};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use flowrun_core::config::EngineConfig;
use flowrun_core::traits::{ExecutionStore, NodeExecutor};
use flowrun_core::{
    EventBus, ExecutionConfig, ExecutionStatus, FlowDefinition, FlowError, FlowEvent, JobId, Node,
    NodeRequest, NodeUpdate, ProgressSink, Result,
};

use crate::context::{merged_output, ExecutionContext};
use crate::graph::{ConditionScope, ExecutionPlan, GraphCompiler, NodeKind, PlanNode};
use crate::guardrail::{Guardrail, GuardrailRegistry};
use crate::pipeline::{CallbackContext, CallbackPipeline, GuardrailCallback, NodeCallback, NodeCompletion};
use crate::schedule::{Resolution, Schedule};

/// Effective policy for one execution: engine defaults with the request's
/// overrides applied.
#[derive(Debug, Clone, PartialEq)]
pub struct RunSettings {
    pub max_parallel: usize,
    pub continue_on_error: bool,
    pub timeouts_always_fatal: bool,
    pub max_retry_limit: u32,
    pub max_execution_time: Option<Duration>,
    pub allow_tagged_loops: bool,
}

impl RunSettings {
    pub fn resolve(engine: &EngineConfig, config: &ExecutionConfig) -> Self {
        let secs = config
            .max_execution_time
            .unwrap_or(engine.default_max_execution_time_secs);
        Self {
            max_parallel: config.max_parallel.unwrap_or(engine.max_parallel).max(1),
            continue_on_error: config.continue_on_error.unwrap_or(engine.continue_on_error),
            timeouts_always_fatal: config
                .timeouts_always_fatal
                .unwrap_or(engine.timeouts_always_fatal),
            max_retry_limit: config
                .max_retry_limit
                .unwrap_or(engine.default_max_retry_limit),
            max_execution_time: (secs > 0).then(|| Duration::from_secs(secs)),
            allow_tagged_loops: engine.allow_tagged_loops,
        }
    }
}

impl Default for RunSettings {
    fn default() -> Self {
        Self::resolve(&EngineConfig::default(), &ExecutionConfig::default())
    }
}

/// Everything needed to drive one execution.
pub struct RunJob {
    pub execution_id: i64,
    pub job_id: JobId,
    pub flow: FlowDefinition,
    pub inputs: Map<String, Value>,
    pub settings: RunSettings,
    /// Stops further dispatch; in-flight nodes finish and are recorded.
    pub cancel: CancellationToken,
    /// Stops in-flight nodes as well (shutdown).
    pub abort: CancellationToken,
}

impl RunJob {
    fn stop_requested(&self) -> bool {
        self.cancel.is_cancelled() || self.abort.is_cancelled()
    }
}

/// Terminal state written when a run ends.
#[derive(Debug, Clone)]
struct Outcome {
    status: ExecutionStatus,
    result: Option<Value>,
    error: Option<String>,
}

/// What a settled node hands to the scheduler.
struct Settled {
    output: Value,
    /// Router branch handle, when the node is a router.
    selected: Option<String>,
}

struct RunState<'p> {
    schedule: Schedule<'p>,
    context: ExecutionContext,
    /// Node id to its record id, for dispatched nodes not yet settled.
    running: HashMap<String, i64>,
    failures: Vec<(String, String)>,
    fatal: Option<String>,
    cancelled_nodes: usize,
}

/// Drives flow executions.
#[derive(Clone)]
pub struct FlowRunner {
    executor: Arc<dyn NodeExecutor>,
    store: Arc<dyn ExecutionStore>,
    bus: Arc<EventBus>,
    guardrails: Arc<GuardrailRegistry>,
    callbacks: CallbackPipeline,
}

impl FlowRunner {
    pub fn new(
        executor: Arc<dyn NodeExecutor>,
        store: Arc<dyn ExecutionStore>,
        bus: Arc<EventBus>,
        guardrails: Arc<GuardrailRegistry>,
    ) -> Self {
        let callbacks = CallbackPipeline::new().with_bus(bus.clone());
        Self {
            executor,
            store,
            bus,
            guardrails,
            callbacks,
        }
    }

    /// Add a callback run around every dispatched node attempt.
    pub fn with_callback(mut self, callback: Arc<dyn NodeCallback>) -> Self {
        self.callbacks.push(callback);
        self
    }

    pub fn bus(&self) -> &Arc<EventBus> {
        &self.bus
    }

    /// Run an execution to a terminal status and record it.
    pub async fn run(&self, job: RunJob) -> ExecutionStatus {
        info!(
            job_id = %job.job_id,
            execution_id = job.execution_id,
            flow = %job.flow.name,
            "Flow execution started"
        );

        let outcome = match self.drive(&job).await {
            Ok(outcome) => outcome,
            Err(e) => {
                error!(job_id = %job.job_id, error = %e, "Flow execution failed");
                Outcome {
                    status: ExecutionStatus::Failed,
                    result: None,
                    error: Some(e.to_string()),
                }
            }
        };

        if let Err(e) = self
            .store
            .update_execution(
                job.execution_id,
                outcome.status,
                outcome.result.clone(),
                outcome.error.clone(),
            )
            .await
        {
            error!(job_id = %job.job_id, error = %e, "Failed to record final execution status");
        }
        self.bus.emit(
            &job.job_id,
            &FlowEvent::ExecutionStatus {
                status: outcome.status,
                message: outcome.error.clone(),
            },
        );
        info!(job_id = %job.job_id, status = %outcome.status, "Flow execution finished");
        outcome.status
    }

    async fn drive(&self, job: &RunJob) -> Result<Outcome> {
        if job.stop_requested() {
            return Ok(cancelled_before_start());
        }

        self.set_status(job, ExecutionStatus::Preparing).await?;
        let flow = &job.flow;
        let plan = GraphCompiler::new()
            .allow_tagged_loops(job.settings.allow_tagged_loops)
            .compile(&flow.nodes, &flow.edges, &flow.flow_config)?;
        let guardrails = self.build_guardrails(&plan)?;
        debug!(
            job_id = %job.job_id,
            layers = plan.layers().len(),
            guardrails = guardrails.len(),
            "Flow prepared"
        );

        if job.stop_requested() {
            return Ok(cancelled_before_start());
        }
        self.set_status(job, ExecutionStatus::Running).await?;
        Ok(self.execute(job, &plan, &guardrails).await)
    }

    async fn set_status(&self, job: &RunJob, status: ExecutionStatus) -> Result<()> {
        self.store
            .update_execution(job.execution_id, status, None, None)
            .await?;
        self.bus.emit(
            &job.job_id,
            &FlowEvent::ExecutionStatus {
                status,
                message: None,
            },
        );
        Ok(())
    }

    fn build_guardrails(&self, plan: &ExecutionPlan) -> Result<HashMap<String, Arc<dyn Guardrail>>> {
        let mut built = HashMap::new();
        for pn in plan.nodes() {
            if let Some(config) = &pn.node.data.guardrail {
                let guardrail = self.guardrails.create(config).map_err(|e| match e {
                    FlowError::Configuration(msg) => {
                        FlowError::Configuration(format!("node {}: {}", pn.id(), msg))
                    }
                    other => other,
                })?;
                built.insert(pn.id().to_string(), guardrail);
            }
        }
        Ok(built)
    }

    async fn execute(
        &self,
        job: &RunJob,
        plan: &ExecutionPlan,
        guardrails: &HashMap<String, Arc<dyn Guardrail>>,
    ) -> Outcome {
        let settings = &job.settings;
        // Cancelled on a fatal failure so in-flight nodes stop early
        let halt = job.abort.child_token();
        let mut state = RunState {
            schedule: Schedule::new(plan),
            context: ExecutionContext::new(job.inputs.clone()),
            running: HashMap::new(),
            failures: Vec::new(),
            fatal: None,
            cancelled_nodes: 0,
        };
        let mut queue: VecDeque<String> = VecDeque::new();
        let mut inflight: JoinSet<(String, u32, Result<Value>)> = JoinSet::new();

        'run: loop {
            for resolution in state.schedule.promote() {
                match resolution {
                    Resolution::Run(id) => queue.push_back(id),
                    Resolution::Skip { node_id, reason } | Resolution::Block { node_id, reason } => {
                        debug!(job_id = %job.job_id, node_id = %node_id, reason = %reason, "Node skipped");
                        self.bus
                            .emit(&job.job_id, &FlowEvent::NodeSkipped { node_id, reason });
                    }
                }
            }

            while state.fatal.is_none() && !job.stop_requested() && inflight.len() < settings.max_parallel {
                let Some(id) = queue.pop_front() else { break };
                let Some(pn) = plan.node(&id) else { continue };

                state.schedule.start(&id);
                let record = match self.store.create_node_execution(job.execution_id, &id).await {
                    Ok(record) => record,
                    Err(e) => {
                        error!(job_id = %job.job_id, node_id = %id, error = %e, "Failed to record node start");
                        state.schedule.fail(&id);
                        state.fatal = Some(format!("failed to record node '{}': {}", id, e));
                        halt.cancel();
                        break;
                    }
                };

                if pn.kind.is_in_process() {
                    self.bus.emit(
                        &job.job_id,
                        &FlowEvent::NodeStarted {
                            node_id: id.clone(),
                            attempt: 1,
                        },
                    );
                    let result = self.run_in_process(job, plan, pn, &mut state.context);
                    state.running.insert(id.clone(), record.id);
                    self.settle(job, &mut state, &halt, &id, 1, result).await;
                    continue 'run;
                }

                state.running.insert(id.clone(), record.id);
                let task = self.node_task(job, plan, pn, &state.context, guardrails, &halt);
                inflight.spawn(async move {
                    let (attempts, result) = task.run().await;
                    (id, attempts, result)
                });
            }

            let Some(joined) = inflight.join_next().await else {
                break;
            };
            match joined {
                Ok((id, attempts, result)) => {
                    let result = result.map(|output| Settled {
                        output,
                        selected: None,
                    });
                    self.settle(job, &mut state, &halt, &id, attempts, result).await;
                }
                Err(e) => {
                    error!(job_id = %job.job_id, error = %e, "Node task panicked");
                    state.fatal.get_or_insert_with(|| format!("node task panicked: {}", e));
                    halt.cancel();
                }
            }
        }

        // Records left running belong to tasks that died without reporting
        for (node_id, record_id) in state.running.drain() {
            let update = NodeUpdate {
                status: ExecutionStatus::Failed,
                attempts: 0,
                result: None,
                error: Some("node task aborted".into()),
            };
            if let Err(e) = self.store.update_node_execution(record_id, update).await {
                warn!(node_id = %node_id, error = %e, "Failed to close node record");
            }
        }

        self.conclude(job, state)
    }

    fn conclude(&self, job: &RunJob, state: RunState<'_>) -> Outcome {
        let result = Some(json!({ "outputs": state.context.outputs() }));
        let unfinished = state.schedule.unfinished();

        if let Some(error) = state.fatal {
            return Outcome {
                status: ExecutionStatus::Failed,
                result,
                error: Some(error),
            };
        }
        if state.cancelled_nodes > 0 || (job.stop_requested() && !unfinished.is_empty()) {
            info!(
                job_id = %job.job_id,
                not_started = unfinished.len(),
                "Flow execution cancelled"
            );
            return Outcome {
                status: ExecutionStatus::Cancelled,
                result,
                error: None,
            };
        }
        if !state.failures.is_empty() {
            let summary = state
                .failures
                .iter()
                .map(|(id, msg)| format!("{}: {}", id, msg))
                .collect::<Vec<_>>()
                .join("; ");
            return Outcome {
                status: ExecutionStatus::Failed,
                result,
                error: Some(format!("{} node(s) failed: {}", state.failures.len(), summary)),
            };
        }
        Outcome {
            status: ExecutionStatus::Completed,
            result,
            error: None,
        }
    }

    /// Record a node's final result and update the schedule.
    async fn settle(
        &self,
        job: &RunJob,
        state: &mut RunState<'_>,
        halt: &CancellationToken,
        node_id: &str,
        attempts: u32,
        result: Result<Settled>,
    ) {
        let Some(record_id) = state.running.remove(node_id) else {
            warn!(node_id = %node_id, "Settled a node that was not running");
            return;
        };

        let (update, db_context) = match result {
            Ok(settled) => {
                let update = NodeUpdate {
                    status: ExecutionStatus::Completed,
                    attempts,
                    result: Some(settled.output.clone()),
                    error: None,
                };
                if let Err(e) = state.context.record(node_id, settled.output) {
                    warn!(node_id = %node_id, error = %e, "Node output already recorded");
                }
                state.schedule.complete(node_id, settled.selected.as_deref());
                self.bus.emit(
                    &job.job_id,
                    &FlowEvent::NodeCompleted {
                        node_id: node_id.to_string(),
                        attempts,
                    },
                );
                (update, "completion")
            }
            Err(FlowError::Cancelled) => {
                state.schedule.cancel(node_id);
                state.cancelled_nodes += 1;
                self.bus.emit(
                    &job.job_id,
                    &FlowEvent::NodeFailed {
                        node_id: node_id.to_string(),
                        kind: FlowError::Cancelled.kind().to_string(),
                        error: FlowError::Cancelled.to_string(),
                    },
                );
                let update = NodeUpdate {
                    status: ExecutionStatus::Cancelled,
                    attempts,
                    result: None,
                    error: Some(FlowError::Cancelled.to_string()),
                };
                (update, "cancellation")
            }
            Err(e) => {
                let message = node_error_message(&e);
                warn!(
                    job_id = %job.job_id,
                    node_id = %node_id,
                    kind = e.kind(),
                    error = %message,
                    "Node failed"
                );
                state.schedule.fail(node_id);
                self.bus.emit(
                    &job.job_id,
                    &FlowEvent::NodeFailed {
                        node_id: node_id.to_string(),
                        kind: e.kind().to_string(),
                        error: message.clone(),
                    },
                );

                let settings = &job.settings;
                let is_timeout = matches!(e, FlowError::Timeout { .. });
                let fatal = !settings.continue_on_error || (is_timeout && settings.timeouts_always_fatal);
                if fatal && state.fatal.is_none() {
                    state.fatal = Some(format!("Node '{}' failed: {}", node_id, message));
                    halt.cancel();
                }
                state.failures.push((node_id.to_string(), message.clone()));

                let update = NodeUpdate {
                    status: ExecutionStatus::Failed,
                    attempts,
                    result: None,
                    error: Some(message),
                };
                (update, "failure")
            }
        };

        if let Err(e) = self.store.update_node_execution(record_id, update).await {
            error!(node_id = %node_id, error = %e, "Failed to record node {}", db_context);
            if state.fatal.is_none() {
                state.fatal = Some(format!("failed to record node '{}': {}", node_id, e));
                halt.cancel();
            }
        }
    }

    /// Evaluate a router or state node without the executor.
    fn run_in_process(
        &self,
        job: &RunJob,
        plan: &ExecutionPlan,
        pn: &PlanNode,
        context: &mut ExecutionContext,
    ) -> Result<Settled> {
        match pn.kind {
            NodeKind::Router => {
                let condition = pn.condition.as_ref().ok_or_else(|| {
                    FlowError::Configuration(format!("router node {} has no routerCondition", pn.id()))
                })?;
                let sources: Vec<&str> = plan.incoming(pn.id()).map(|e| e.source.as_str()).collect();
                let output = merged_output(&context.inputs_from(sources));
                let value = condition.evaluate(&ConditionScope {
                    state: context.state(),
                    nodes: context.outputs(),
                    output: &output,
                });

                let handle = match &value {
                    Value::Bool(b) => Some(b.to_string()),
                    Value::String(s) => Some(s.clone()),
                    Value::Number(n) => Some(n.to_string()),
                    _ => None,
                };
                let selected = handle.filter(|h| {
                    plan.outgoing(pn.id())
                        .any(|e| e.handle.as_deref() == Some(h.as_str()))
                });
                match selected {
                    Some(handle) => {
                        info!(
                            job_id = %job.job_id,
                            node_id = %pn.id(),
                            handle = %handle,
                            "Router selected branch"
                        );
                        self.bus.emit(
                            &job.job_id,
                            &FlowEvent::RouterDecision {
                                node_id: pn.id().to_string(),
                                handle: handle.clone(),
                            },
                        );
                        Ok(Settled {
                            output: json!({ "selected": handle }),
                            selected: Some(handle),
                        })
                    }
                    None => Err(FlowError::NodeExecution {
                        node: pn.id().to_string(),
                        message: format!(
                            "router condition `{}` evaluated to {}, which matches no branch",
                            condition.source(),
                            value
                        ),
                    }),
                }
            }
            NodeKind::State => {
                if let Some(definition) = &pn.node.data.state_definition {
                    context.apply_state_defaults(definition)?;
                }
                Ok(Settled {
                    output: Value::Object(context.state().clone()),
                    selected: None,
                })
            }
            other => Err(FlowError::Configuration(format!(
                "node kind {:?} is not evaluated in-process",
                other
            ))),
        }
    }

    fn node_task(
        &self,
        job: &RunJob,
        plan: &ExecutionPlan,
        pn: &PlanNode,
        context: &ExecutionContext,
        guardrails: &HashMap<String, Arc<dyn Guardrail>>,
        halt: &CancellationToken,
    ) -> NodeTask {
        let node = pn.node.clone();
        let sources: Vec<&str> = plan.incoming(pn.id()).map(|e| e.source.as_str()).collect();
        let mut pipeline = self.callbacks.clone();
        if let Some(guardrail) = guardrails.get(pn.id()) {
            pipeline.push(Arc::new(GuardrailCallback::new(guardrail.clone())));
        }
        let timeout = match node.data.max_execution_time {
            Some(0) => None,
            Some(secs) => Some(Duration::from_secs(secs)),
            None => job.settings.max_execution_time,
        };

        NodeTask {
            job_id: job.job_id.clone(),
            inputs: context.inputs_from(sources),
            state: context.state().clone(),
            max_retry_limit: node.data.max_retry_limit.unwrap_or(job.settings.max_retry_limit),
            timeout,
            executor: self.executor.clone(),
            bus: self.bus.clone(),
            pipeline,
            token: halt.child_token(),
            node,
        }
    }
}

fn cancelled_before_start() -> Outcome {
    Outcome {
        status: ExecutionStatus::Cancelled,
        result: None,
        error: None,
    }
}

/// Error text stored on a failed node: guardrail feedback and executor
/// messages as-is, anything else rendered in full.
fn node_error_message(error: &FlowError) -> String {
    match error {
        FlowError::GuardrailValidation { feedback, .. } => feedback.clone(),
        FlowError::NodeExecution { message, .. } => message.clone(),
        other => other.to_string(),
    }
}

/// One dispatched node: the attempt loop with guardrail feedback, under
/// the node timeout.
struct NodeTask {
    job_id: JobId,
    node: Node,
    inputs: BTreeMap<String, Value>,
    state: Map<String, Value>,
    max_retry_limit: u32,
    timeout: Option<Duration>,
    executor: Arc<dyn NodeExecutor>,
    bus: Arc<EventBus>,
    pipeline: CallbackPipeline,
    token: CancellationToken,
}

impl NodeTask {
    async fn run(self) -> (u32, Result<Value>) {
        let attempts = AtomicU32::new(0);
        let result = match self.timeout {
            Some(limit) => match tokio::time::timeout(limit, self.attempts(&attempts)).await {
                Ok(result) => result,
                Err(_) => {
                    self.token.cancel();
                    warn!(
                        job_id = %self.job_id,
                        node_id = %self.node.id,
                        timeout_secs = limit.as_secs(),
                        "Node timed out"
                    );
                    Err(FlowError::Timeout {
                        node: self.node.id.clone(),
                        timeout_secs: limit.as_secs(),
                    })
                }
            },
            None => self.attempts(&attempts).await,
        };
        let attempts = attempts.load(Ordering::SeqCst);

        let ctx = self.callback_context(attempts);
        let completion = match &result {
            Ok(output) => NodeCompletion::Completed {
                output: output.clone(),
                attempts,
            },
            Err(e) => NodeCompletion::Failed {
                error: node_error_message(e),
                attempts,
            },
        };
        self.pipeline.on_complete(&ctx, &completion).await;
        (attempts, result)
    }

    async fn attempts(&self, counter: &AtomicU32) -> Result<Value> {
        let node_id = &self.node.id;
        let mut feedback: Vec<String> = Vec::new();

        for attempt in 1..=self.max_retry_limit.saturating_add(1) {
            if self.token.is_cancelled() {
                return Err(FlowError::Cancelled);
            }
            counter.store(attempt, Ordering::SeqCst);

            let event = match feedback.last() {
                None => FlowEvent::NodeStarted {
                    node_id: node_id.clone(),
                    attempt,
                },
                Some(last) => FlowEvent::NodeRetry {
                    node_id: node_id.clone(),
                    attempt,
                    feedback: last.clone(),
                },
            };
            self.bus.emit(&self.job_id, &event);

            let ctx = self.callback_context(attempt);
            self.pipeline.on_start(&ctx).await;

            let request = NodeRequest {
                job_id: self.job_id.clone(),
                node: self.node.clone(),
                inputs: self.inputs.clone(),
                state: self.state.clone(),
                attempt,
                feedback: feedback.clone(),
                progress: ProgressSink::new(self.bus.clone(), self.job_id.clone(), node_id.clone()),
            };
            let mut output = tokio::select! {
                result = self.executor.execute(request, self.token.clone()) => {
                    result.map_err(|e| classify(node_id, e))?
                }
                _ = self.token.cancelled() => return Err(FlowError::Cancelled),
            };

            match self.pipeline.process_output(&ctx, &mut output).await {
                Some(verdict) if !verdict.valid => {
                    info!(
                        job_id = %self.job_id,
                        node_id = %node_id,
                        attempt,
                        feedback = %verdict.feedback,
                        "Output rejected by guardrail"
                    );
                    feedback.push(verdict.feedback);
                }
                _ => return Ok(output),
            }
        }

        Err(FlowError::GuardrailValidation {
            node: node_id.clone(),
            feedback: feedback.pop().unwrap_or_default(),
        })
    }

    fn callback_context(&self, attempt: u32) -> CallbackContext {
        CallbackContext {
            job_id: self.job_id.clone(),
            node_id: self.node.id.clone(),
            attempt,
        }
    }
}

/// Executor errors are node execution errors unless they already carry a
/// more specific kind.
fn classify(node_id: &str, error: FlowError) -> FlowError {
    match error {
        FlowError::Cancelled | FlowError::NodeExecution { .. } | FlowError::Timeout { .. } => error,
        other => FlowError::NodeExecution {
            node: node_id.to_string(),
            message: other.to_string(),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_settings_overrides() {
        let engine = EngineConfig::default();
        let config = ExecutionConfig {
            max_parallel: Some(0),
            continue_on_error: Some(true),
            max_execution_time: Some(0),
            ..ExecutionConfig::default()
        };
        let settings = RunSettings::resolve(&engine, &config);
        assert_eq!(settings.max_parallel, 1);
        assert!(settings.continue_on_error);
        assert!(settings.timeouts_always_fatal);
        assert_eq!(settings.max_retry_limit, 2);
        assert_eq!(settings.max_execution_time, None);
    }

    #[test]
    fn test_default_settings() {
        let settings = RunSettings::default();
        assert_eq!(settings.max_parallel, 1);
        assert!(!settings.continue_on_error);
        assert_eq!(settings.max_execution_time, Some(Duration::from_secs(600)));
    }

    #[test]
    fn test_node_error_message() {
        let err = FlowError::GuardrailValidation {
            node: "b".into(),
            feedback: "The data_processing table contains 3 records.".into(),
        };
        assert_eq!(node_error_message(&err), "The data_processing table contains 3 records.");
        let err = FlowError::Timeout {
            node: "b".into(),
            timeout_secs: 5,
        };
        assert_eq!(node_error_message(&err), "Node timeout after 5s: b");
    }

    #[test]
    fn test_classify_wraps_foreign_errors() {
        let err = classify("a", FlowError::Http("502".into()));
        assert!(matches!(err, FlowError::NodeExecution { ref node, .. } if node == "a"));
        assert!(matches!(classify("a", FlowError::Cancelled), FlowError::Cancelled));
    }

    use flowrun_core::config::EventsConfig;
    use flowrun_core::traits::RecordSource;
    use flowrun_core::{Edge, ExecutionDetail, GuardrailConfig};
    use flowrun_store::SqliteStore;
    use flowrun_test_utils::{fan_out_flow, guarded_flow, linear_flow, memory_store, router_flow};
    use flowrun_test_utils::{MockExecutor, Reply, StaticRecords};

    struct Harness {
        store: Arc<SqliteStore>,
        runner: FlowRunner,
        executor: Arc<MockExecutor>,
    }

    fn harness(executor: MockExecutor, records: Option<Arc<dyn RecordSource>>) -> Harness {
        let store = memory_store();
        let bus = Arc::new(EventBus::new(EventsConfig::default(), store.clone()));
        let executor = Arc::new(executor);
        let runner = FlowRunner::new(
            executor.clone(),
            store.clone(),
            bus,
            Arc::new(GuardrailRegistry::with_builtins(records)),
        );
        Harness {
            store,
            runner,
            executor,
        }
    }

    impl Harness {
        async fn job(&self, flow: FlowDefinition, settings: RunSettings, inputs: Value) -> RunJob {
            let job_id = JobId::new();
            let exec = self
                .store
                .create_execution(flow.id, &job_id, json!({}))
                .await
                .unwrap();
            RunJob {
                execution_id: exec.id,
                job_id,
                flow,
                inputs: inputs.as_object().cloned().unwrap_or_default(),
                settings,
                cancel: CancellationToken::new(),
                abort: CancellationToken::new(),
            }
        }

        async fn run(&self, flow: FlowDefinition, settings: RunSettings) -> ExecutionDetail {
            let job = self.job(flow, settings, json!({})).await;
            self.finish(job).await
        }

        async fn finish(&self, job: RunJob) -> ExecutionDetail {
            let id = job.execution_id;
            self.runner.run(job).await;
            self.detail(id).await
        }

        async fn detail(&self, id: i64) -> ExecutionDetail {
            let execution = self.store.get_execution(id).await.unwrap().unwrap();
            let nodes = self.store.list_node_executions(id).await.unwrap();
            ExecutionDetail { execution, nodes }
        }
    }

    fn node_ids(detail: &ExecutionDetail) -> Vec<&str> {
        detail.nodes.iter().map(|n| n.node_id.as_str()).collect()
    }

    #[tokio::test]
    async fn test_linear_flow_completes() {
        let h = harness(MockExecutor::new().respond("b", json!({"rows": 3})), None);
        let detail = h.run(linear_flow(), RunSettings::default()).await;

        assert_eq!(detail.execution.status, ExecutionStatus::Completed);
        assert_eq!(node_ids(&detail), vec!["a", "b", "c"]);
        assert!(detail.nodes.iter().all(|n| n.status == ExecutionStatus::Completed && n.attempts == 1));
        let result = detail.execution.result.unwrap();
        assert_eq!(result["outputs"]["b"]["rows"], 3);
        assert_eq!(result["outputs"]["a"], "a done");

        // Downstream nodes see completed predecessors only
        let c_call = &h.executor.calls_for("c")[0];
        assert_eq!(c_call.inputs.keys().collect::<Vec<_>>(), vec!["b"]);
    }

    #[tokio::test]
    async fn test_guardrail_retry_passes_feedback() {
        let executor = MockExecutor::new().script(
            "b",
            vec![
                Reply::Output(json!("total_count: 2")),
                Reply::Output(json!("total_count: 7")),
            ],
        );
        let h = harness(executor, None);
        let flow = guarded_flow(
            GuardrailConfig::new("minimum_number").with_param("min_value", json!(5)),
            2,
        );
        let detail = h.run(flow, RunSettings::default()).await;

        assert_eq!(detail.execution.status, ExecutionStatus::Completed);
        let b = detail.node("b").unwrap();
        assert_eq!(b.attempts, 2);
        assert_eq!(b.result, Some(json!("total_count: 7")));

        let calls = h.executor.calls_for("b");
        assert_eq!(calls.len(), 2);
        assert!(calls[0].feedback.is_empty());
        assert_eq!(calls[1].attempt, 2);
        assert_eq!(calls[1].feedback.len(), 1);
        assert!(calls[1].feedback[0].contains("total_count"));
    }

    #[tokio::test]
    async fn test_guardrail_exhaustion_fails_flow() {
        let records: Arc<dyn RecordSource> = Arc::new(StaticRecords::with_total(3));
        let h = harness(MockExecutor::new(), Some(records));
        let flow = guarded_flow(GuardrailConfig::new("empty_data_processing"), 2);
        let detail = h.run(flow, RunSettings::default()).await;

        assert_eq!(detail.execution.status, ExecutionStatus::Failed);
        assert_eq!(node_ids(&detail), vec!["a", "b"]);
        assert_eq!(detail.node("a").unwrap().status, ExecutionStatus::Completed);
        let b = detail.node("b").unwrap();
        assert_eq!(b.status, ExecutionStatus::Failed);
        assert_eq!(b.attempts, 3);
        assert!(b.error.as_deref().unwrap().contains("contains 3 records"));
        assert!(detail.execution.error.unwrap().starts_with("Node 'b' failed:"));
        assert_eq!(h.executor.calls_for("b").len(), 3);
    }

    #[tokio::test]
    async fn test_router_selects_branch() {
        let h = harness(MockExecutor::new(), None);
        let job = h.job(router_flow(), RunSettings::default(), json!({"count": 15})).await;
        let detail = h.finish(job).await;

        assert_eq!(detail.execution.status, ExecutionStatus::Completed);
        assert_eq!(node_ids(&detail), vec!["a", "r", "yes", "yes_after"]);
        assert_eq!(detail.node("r").unwrap().result, Some(json!({"selected": "true"})));
        assert!(h.executor.calls_for("r").is_empty());
    }

    #[tokio::test]
    async fn test_listener_on_router_runs_after_decision() {
        let h = harness(MockExecutor::new(), None);
        let flow = FlowDefinition::new(
            "router-listener",
            vec![
                Node::router("r", "state.count > 10"),
                Node::task("x"),
                Node::task("y"),
                Node::listener("l", vec!["r".into()]),
            ],
            vec![Edge::branch("r", "true", "x"), Edge::branch("r", "false", "y")],
        );
        let job = h.job(flow, RunSettings::default(), json!({"count": 15})).await;
        let detail = h.finish(job).await;

        assert_eq!(detail.execution.status, ExecutionStatus::Completed);
        let mut ran = node_ids(&detail);
        ran.sort();
        assert_eq!(ran, vec!["l", "r", "x"]);
        assert_eq!(detail.node("l").unwrap().status, ExecutionStatus::Completed);
        assert!(detail.node("y").is_none());
    }

    #[tokio::test]
    async fn test_router_without_matching_branch_fails() {
        let h = harness(MockExecutor::new(), None);
        let flow = FlowDefinition::new(
            "bad-router",
            vec![Node::router("r", "state.mode"), Node::task("x"), Node::task("y")],
            vec![Edge::branch("r", "fast", "x"), Edge::branch("r", "slow", "y")],
        );
        let job = h.job(flow, RunSettings::default(), json!({"mode": "medium"})).await;
        let detail = h.finish(job).await;

        assert_eq!(detail.execution.status, ExecutionStatus::Failed);
        assert_eq!(node_ids(&detail), vec!["r"]);
        assert!(detail.node("r").unwrap().error.as_deref().unwrap().contains("matches no branch"));
    }

    #[tokio::test]
    async fn test_state_node_seeds_defaults() {
        let h = harness(MockExecutor::new(), None);
        let flow = FlowDefinition::new(
            "stateful",
            vec![Node::state("s", json!({"region": "eu", "count": 0})), Node::task("t")],
            vec![Edge::new("s", "t")],
        );
        let job = h.job(flow, RunSettings::default(), json!({"count": 4})).await;
        let detail = h.finish(job).await;

        assert_eq!(detail.execution.status, ExecutionStatus::Completed);
        assert_eq!(detail.node("s").unwrap().result, Some(json!({"count": 4, "region": "eu"})));
        let call = &h.executor.calls_for("t")[0];
        assert_eq!(call.state["region"], "eu");
        assert_eq!(call.state["count"], 4);
    }

    #[tokio::test]
    async fn test_executor_errors_are_not_retried() {
        let h = harness(MockExecutor::new().fail("b", "runtime unavailable"), None);
        let detail = h.run(linear_flow(), RunSettings::default()).await;

        assert_eq!(detail.execution.status, ExecutionStatus::Failed);
        let b = detail.node("b").unwrap();
        assert_eq!(b.attempts, 1);
        assert_eq!(b.error.as_deref(), Some("runtime unavailable"));
        assert!(detail.node("c").is_none());
    }

    #[tokio::test]
    async fn test_continue_on_error_runs_independent_nodes() {
        let h = harness(MockExecutor::new().fail("n1", "boom"), None);
        let settings = RunSettings {
            continue_on_error: true,
            ..RunSettings::default()
        };
        let detail = h.run(fan_out_flow(3), settings).await;

        assert_eq!(detail.execution.status, ExecutionStatus::Failed);
        assert_eq!(detail.execution.error.as_deref(), Some("1 node(s) failed: n1: boom"));
        assert_eq!(detail.node("n0").unwrap().status, ExecutionStatus::Completed);
        assert_eq!(detail.node("n2").unwrap().status, ExecutionStatus::Completed);
    }

    #[tokio::test]
    async fn test_parallel_dispatch_is_bounded() {
        let mut executor = MockExecutor::new();
        for i in 0..4 {
            executor = executor.delay(&format!("n{}", i), Duration::from_millis(50));
        }
        let h = harness(executor, None);
        let settings = RunSettings {
            max_parallel: 2,
            ..RunSettings::default()
        };
        let detail = h.run(fan_out_flow(4), settings).await;

        assert_eq!(detail.execution.status, ExecutionStatus::Completed);
        assert_eq!(detail.nodes.len(), 4);
        assert_eq!(h.executor.peak_concurrency(), 2);
    }

    #[tokio::test]
    async fn test_timeout_fails_node_even_with_continue_on_error() {
        let h = harness(MockExecutor::new().hang("b"), None);
        let settings = RunSettings {
            continue_on_error: true,
            max_execution_time: Some(Duration::from_secs(1)),
            ..RunSettings::default()
        };
        let detail = h.run(linear_flow(), settings).await;

        assert_eq!(detail.execution.status, ExecutionStatus::Failed);
        let b = detail.node("b").unwrap();
        assert_eq!(b.status, ExecutionStatus::Failed);
        assert!(b.error.as_deref().unwrap().contains("timeout"));
        assert!(detail.node("c").is_none());
    }

    #[tokio::test]
    async fn test_cancel_between_nodes() {
        let executor = MockExecutor::new();
        let gate = executor.gate("a");
        let h = harness(executor, None);
        let job = h.job(linear_flow(), RunSettings::default(), json!({})).await;
        let cancel = job.cancel.clone();
        let id = job.execution_id;

        let runner = h.runner.clone();
        let handle = tokio::spawn(async move { runner.run(job).await });
        gate.entered().await;
        cancel.cancel();
        gate.release();
        assert_eq!(handle.await.unwrap(), ExecutionStatus::Cancelled);

        let detail = h.detail(id).await;
        assert_eq!(detail.execution.status, ExecutionStatus::Cancelled);
        assert_eq!(node_ids(&detail), vec!["a"]);
        assert_eq!(detail.node("a").unwrap().status, ExecutionStatus::Completed);
        assert_eq!(detail.node("a").unwrap().result, Some(json!("a done")));
    }

    #[tokio::test]
    async fn test_compile_error_fails_at_preparing() {
        let h = harness(MockExecutor::new(), None);
        let flow = FlowDefinition::new(
            "cyclic",
            vec![Node::task("x"), Node::task("y")],
            vec![Edge::new("x", "y"), Edge::new("y", "x")],
        );
        let detail = h.run(flow, RunSettings::default()).await;

        assert_eq!(detail.execution.status, ExecutionStatus::Failed);
        assert!(detail.execution.error.unwrap().contains("cycle"));
        assert!(detail.nodes.is_empty());
    }

    #[tokio::test]
    async fn test_unknown_guardrail_is_configuration_error() {
        let h = harness(MockExecutor::new(), None);
        let flow = guarded_flow(GuardrailConfig::new("no_such_check"), 1);
        let detail = h.run(flow, RunSettings::default()).await;

        assert_eq!(detail.execution.status, ExecutionStatus::Failed);
        assert!(detail
            .execution
            .error
            .unwrap()
            .contains("unknown guardrail type: no_such_check"));
        assert!(detail.nodes.is_empty());
    }
}
