//! Execution service: the operations exposed to the gateway and CLI.
//!
//! The service validates start requests, records the PENDING execution and
//! hands it to a spawned [`FlowRunner`]. It keeps a handle per active run so
//! cancel requests reach the owning coordinator; the coordinator remains the
//! only writer of the execution's status.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use serde::Deserialize;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use uuid::Uuid;

use flowrun_core::config::EngineConfig;
use flowrun_core::traits::{ExecutionStore, FlowRepository};
use flowrun_core::{
    EventBus, ExecutionConfig, ExecutionDetail, ExecutionStatus, FlowDefinition, FlowError,
    FlowExecution, JobId, LogEvent, Result, StartedExecution, Subscription,
};

use crate::coordinator::{FlowRunner, RunJob, RunSettings};

/// Largest page accepted by [`FlowService::history`].
pub const MAX_HISTORY_LIMIT: usize = 10_000;

const DYNAMIC_FLOW_NAME: &str = "dynamic flow";

/// Start-execution request. Without `flow_id` the flow comes inline in
/// `config`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct StartRequest {
    #[serde(default)]
    pub flow_id: Option<Uuid>,
    #[serde(default)]
    pub job_id: Option<JobId>,
    #[serde(default)]
    pub config: ExecutionConfig,
}

struct ActiveRun {
    job_id: JobId,
    cancel: CancellationToken,
    done: watch::Receiver<Option<ExecutionStatus>>,
}

pub struct FlowService {
    runner: FlowRunner,
    flows: Arc<dyn FlowRepository>,
    store: Arc<dyn ExecutionStore>,
    engine: EngineConfig,
    active: Arc<Mutex<HashMap<i64, ActiveRun>>>,
    shutdown: CancellationToken,
}

impl FlowService {
    pub fn new(
        runner: FlowRunner,
        flows: Arc<dyn FlowRepository>,
        store: Arc<dyn ExecutionStore>,
        engine: EngineConfig,
    ) -> Self {
        Self {
            runner,
            flows,
            store,
            engine,
            active: Arc::new(Mutex::new(HashMap::new())),
            shutdown: CancellationToken::new(),
        }
    }

    pub fn bus(&self) -> &Arc<EventBus> {
        self.runner.bus()
    }

    /// Record a PENDING execution and start its coordinator.
    pub async fn start_execution(&self, request: StartRequest) -> Result<StartedExecution> {
        if self.shutdown.is_cancelled() {
            return Err(FlowError::Conflict("service is shutting down".to_string()));
        }
        let job_id = match request.job_id {
            Some(job_id) if job_id.as_str().trim().is_empty() => {
                return Err(FlowError::InvalidInput("job_id must not be empty".to_string()))
            }
            Some(job_id) => job_id,
            None => JobId::new(),
        };
        let flow = self.resolve_flow(request.flow_id, &request.config).await?;
        let settings = RunSettings::resolve(&self.engine, &request.config);

        let config = serde_json::to_value(&request.config)?;
        let execution = self.store.create_execution(flow.id, &job_id, config).await?;
        info!(
            execution_id = execution.id,
            job_id = %job_id,
            flow_id = %flow.id,
            "Flow execution created"
        );

        let cancel = CancellationToken::new();
        let (done_tx, done_rx) = watch::channel(None);
        if let Ok(mut active) = self.active.lock() {
            active.insert(
                execution.id,
                ActiveRun {
                    job_id: job_id.clone(),
                    cancel: cancel.clone(),
                    done: done_rx,
                },
            );
        }

        let job = RunJob {
            execution_id: execution.id,
            job_id: job_id.clone(),
            flow,
            inputs: request.config.inputs.clone(),
            settings,
            cancel,
            abort: self.shutdown.child_token(),
        };
        let runner = self.runner.clone();
        let active = self.active.clone();
        tokio::spawn(async move {
            let execution_id = job.execution_id;
            let job_id = job.job_id.clone();
            let status = runner.run(job).await;
            runner.bus().release_job(&job_id);
            if let Ok(mut active) = active.lock() {
                active.remove(&execution_id);
            }
            // Receivers may all be gone
            let _ = done_tx.send(Some(status));
        });

        Ok(StartedExecution {
            execution_id: execution.id,
            job_id,
            status: ExecutionStatus::Pending,
            message: "Flow execution started".to_string(),
        })
    }

    async fn resolve_flow(&self, flow_id: Option<Uuid>, config: &ExecutionConfig) -> Result<FlowDefinition> {
        match flow_id {
            Some(id) => self
                .flows
                .get_flow(id)
                .await?
                .ok_or_else(|| FlowError::NotFound(format!("flow {}", id))),
            None if config.has_inline_flow() => Ok(FlowDefinition {
                id: Uuid::nil(),
                name: config
                    .flow_name
                    .clone()
                    .unwrap_or_else(|| DYNAMIC_FLOW_NAME.to_string()),
                crew_id: None,
                nodes: config.nodes.clone(),
                edges: config.edges.clone(),
                flow_config: config.flow_config.clone().unwrap_or_default(),
            }),
            None => Err(FlowError::InvalidInput(
                "either flow_id or inline config.nodes is required".to_string(),
            )),
        }
    }

    pub async fn get_execution(&self, execution_id: i64) -> Result<ExecutionDetail> {
        let execution = self
            .store
            .get_execution(execution_id)
            .await?
            .ok_or_else(|| FlowError::NotFound(format!("execution {}", execution_id)))?;
        self.detail(execution).await
    }

    pub async fn get_execution_by_job(&self, job_id: &JobId) -> Result<ExecutionDetail> {
        let execution = self
            .store
            .get_execution_by_job(job_id)
            .await?
            .ok_or_else(|| FlowError::NotFound(format!("job {}", job_id)))?;
        self.detail(execution).await
    }

    async fn detail(&self, execution: FlowExecution) -> Result<ExecutionDetail> {
        let nodes = self.store.list_node_executions(execution.id).await?;
        Ok(ExecutionDetail { execution, nodes })
    }

    pub async fn list_executions_by_flow(&self, flow_id: Uuid) -> Result<Vec<FlowExecution>> {
        self.store.list_executions_by_flow(flow_id).await
    }

    /// Ask the owning coordinator to stop dispatching. Terminal executions
    /// are left alone and their status returned.
    pub async fn cancel_execution(&self, execution_id: i64) -> Result<ExecutionStatus> {
        let execution = self
            .store
            .get_execution(execution_id)
            .await?
            .ok_or_else(|| FlowError::NotFound(format!("execution {}", execution_id)))?;
        if execution.status.is_terminal() {
            return Ok(execution.status);
        }

        let signalled = match self.active.lock() {
            Ok(active) => active.get(&execution_id).map(|run| {
                run.cancel.cancel();
                run.job_id.clone()
            }),
            Err(_) => None,
        };
        match signalled {
            Some(job_id) => {
                info!(execution_id, job_id = %job_id, "Cancellation requested");
                Ok(execution.status)
            }
            None => {
                // No coordinator in this process owns it
                warn!(execution_id, "Cancelling orphaned execution");
                match self
                    .store
                    .update_execution(execution_id, ExecutionStatus::Cancelled, None, None)
                    .await
                {
                    Ok(()) => Ok(ExecutionStatus::Cancelled),
                    // A coordinator finished it after the status read
                    Err(FlowError::Conflict(_)) => self.current_status(execution_id).await,
                    Err(e) => Err(e),
                }
            }
        }
    }

    async fn current_status(&self, execution_id: i64) -> Result<ExecutionStatus> {
        self.store
            .get_execution(execution_id)
            .await?
            .map(|e| e.status)
            .ok_or_else(|| FlowError::NotFound(format!("execution {}", execution_id)))
    }

    pub fn subscribe(&self, job_id: &JobId) -> Subscription {
        self.bus().subscribe(job_id)
    }

    /// Persisted events of an execution, sliced at `[offset, offset + limit)`.
    pub async fn history(&self, execution_id: i64, limit: usize, offset: usize) -> Result<Vec<LogEvent>> {
        if !(1..=MAX_HISTORY_LIMIT).contains(&limit) {
            return Err(FlowError::InvalidInput(format!(
                "limit must be between 1 and {}",
                MAX_HISTORY_LIMIT
            )));
        }
        let execution = self
            .store
            .get_execution(execution_id)
            .await?
            .ok_or_else(|| FlowError::NotFound(format!("execution {}", execution_id)))?;
        self.bus().history(&execution.job_id, limit, offset).await
    }

    pub async fn history_by_job(&self, job_id: &JobId, limit: usize, offset: usize) -> Result<Vec<LogEvent>> {
        if !(1..=MAX_HISTORY_LIMIT).contains(&limit) {
            return Err(FlowError::InvalidInput(format!(
                "limit must be between 1 and {}",
                MAX_HISTORY_LIMIT
            )));
        }
        self.bus().history(job_id, limit, offset).await
    }

    pub async fn count_logs(&self, job_id: &JobId) -> Result<u64> {
        self.bus().count(job_id).await
    }

    pub fn active_count(&self) -> usize {
        self.active.lock().map(|a| a.len()).unwrap_or(0)
    }

    /// Wait for an execution to reach a terminal status.
    pub async fn wait(&self, execution_id: i64) -> Result<ExecutionStatus> {
        let done = self
            .active
            .lock()
            .ok()
            .and_then(|active| active.get(&execution_id).map(|run| run.done.clone()));
        if let Some(mut done) = done {
            let status = match done.wait_for(|s| s.is_some()).await {
                Ok(status) => *status,
                Err(_) => None,
            };
            if let Some(status) = status {
                return Ok(status);
            }
        }
        let execution = self
            .store
            .get_execution(execution_id)
            .await?
            .ok_or_else(|| FlowError::NotFound(format!("execution {}", execution_id)))?;
        Ok(execution.status)
    }

    /// Abort running executions, wait for their coordinators to record the
    /// outcome, then drain the event bus.
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        let ids: Vec<i64> = self
            .active
            .lock()
            .map(|a| a.keys().copied().collect())
            .unwrap_or_default();
        if !ids.is_empty() {
            info!(executions = ids.len(), "Waiting for running executions to stop");
        }
        for id in ids {
            if let Err(e) = self.wait(id).await {
                warn!(execution_id = id, error = %e, "Execution did not stop cleanly");
            }
        }
        self.bus().shutdown().await;
    }
}
