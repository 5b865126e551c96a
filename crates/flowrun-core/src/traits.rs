use futures::future::BoxFuture;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::error::Result;
use crate::types::*;

/// Bridge to the external agent runtime.
///
/// Implementations honor `cancel` at safe points, report progress through
/// `request.progress` as it arrives, and never retry on their own.
pub trait NodeExecutor: Send + Sync + 'static {
    /// Executor name (used in logs).
    fn name(&self) -> &str;

    /// Run one attempt of a node and return its output.
    fn execute(
        &self,
        request: NodeRequest,
        cancel: CancellationToken,
    ) -> BoxFuture<'_, Result<serde_json::Value>>;
}

/// Read access to stored flow definitions.
pub trait FlowRepository: Send + Sync + 'static {
    fn get_flow(&self, flow_id: Uuid) -> BoxFuture<'_, Result<Option<FlowDefinition>>>;
}

/// Flow and node execution records.
pub trait ExecutionStore: Send + Sync + 'static {
    /// Insert a PENDING execution. Fails with `Conflict` if the job id exists.
    fn create_execution(
        &self,
        flow_id: Uuid,
        job_id: &JobId,
        config: serde_json::Value,
    ) -> BoxFuture<'_, Result<FlowExecution>>;

    /// Move an execution forward. Backward transitions fail with `Conflict`.
    fn update_execution(
        &self,
        execution_id: i64,
        status: ExecutionStatus,
        result: Option<serde_json::Value>,
        error: Option<String>,
    ) -> BoxFuture<'_, Result<()>>;

    fn get_execution(&self, execution_id: i64) -> BoxFuture<'_, Result<Option<FlowExecution>>>;

    fn get_execution_by_job(&self, job_id: &JobId) -> BoxFuture<'_, Result<Option<FlowExecution>>>;

    /// Executions of a flow, newest first.
    fn list_executions_by_flow(&self, flow_id: Uuid) -> BoxFuture<'_, Result<Vec<FlowExecution>>>;

    /// Insert a RUNNING node record. Fails with `Conflict` if the node already has one.
    fn create_node_execution(
        &self,
        execution_id: i64,
        node_id: &str,
    ) -> BoxFuture<'_, Result<FlowNodeExecution>>;

    fn update_node_execution(&self, id: i64, update: NodeUpdate) -> BoxFuture<'_, Result<()>>;

    /// Node records of an execution in creation order.
    fn list_node_executions(&self, execution_id: i64) -> BoxFuture<'_, Result<Vec<FlowNodeExecution>>>;
}

/// Durable event history keyed by job id.
pub trait LogStore: Send + Sync + 'static {
    /// Append a batch in the given order.
    fn append_logs(&self, events: &[LogEvent]) -> BoxFuture<'_, Result<()>>;

    /// Events in emission order, sliced at `[offset, offset + limit)`.
    fn get_logs(&self, job_id: &JobId, limit: usize, offset: usize) -> BoxFuture<'_, Result<Vec<LogEvent>>>;

    fn count_logs(&self, job_id: &JobId) -> BoxFuture<'_, Result<u64>>;
}

/// Read-only view of the data-processing table.
pub trait RecordSource: Send + Sync + 'static {
    fn record_stats(&self) -> BoxFuture<'_, Result<RecordStats>>;
}
