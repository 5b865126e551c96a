use std::path::Path;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use rusqlite::{params, Connection, ErrorCode, OptionalExtension};
use tracing::debug;
use uuid::Uuid;

use flowrun_core::error::{FlowError, Result};
use flowrun_core::traits::{ExecutionStore, FlowRepository, LogStore, RecordSource};
use flowrun_core::types::{
    ExecutionStatus, FlowDefinition, FlowExecution, FlowNodeExecution, JobId, LogEvent, NodeUpdate,
    RecordStats,
};

const SCHEMA: &str = "
    CREATE TABLE IF NOT EXISTS flows (
        id TEXT PRIMARY KEY,
        name TEXT NOT NULL,
        definition TEXT NOT NULL,
        updated_at TEXT NOT NULL
    );

    CREATE TABLE IF NOT EXISTS flow_executions (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        flow_id TEXT NOT NULL,
        job_id TEXT NOT NULL UNIQUE,
        status TEXT NOT NULL,
        config TEXT NOT NULL,
        result TEXT,
        error TEXT,
        created_at TEXT NOT NULL,
        updated_at TEXT NOT NULL,
        completed_at TEXT
    );

    CREATE INDEX IF NOT EXISTS idx_flow_executions_flow
        ON flow_executions(flow_id, id);

    CREATE TABLE IF NOT EXISTS flow_node_executions (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        flow_execution_id INTEGER NOT NULL REFERENCES flow_executions(id),
        node_id TEXT NOT NULL,
        status TEXT NOT NULL,
        attempts INTEGER NOT NULL DEFAULT 0,
        result TEXT,
        error TEXT,
        created_at TEXT NOT NULL,
        updated_at TEXT NOT NULL,
        completed_at TEXT,
        UNIQUE (flow_execution_id, node_id)
    );

    CREATE TABLE IF NOT EXISTS execution_logs (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        job_id TEXT NOT NULL,
        sequence INTEGER NOT NULL,
        content TEXT NOT NULL,
        timestamp TEXT NOT NULL
    );

    CREATE INDEX IF NOT EXISTS idx_execution_logs_job
        ON execution_logs(job_id, id);

    CREATE TABLE IF NOT EXISTS data_processing (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        company_name TEXT,
        processed INTEGER NOT NULL DEFAULT 0
    );";

const EXECUTION_COLUMNS: &str =
    "id, flow_id, job_id, status, config, result, error, created_at, updated_at, completed_at";

const NODE_COLUMNS: &str =
    "id, flow_execution_id, node_id, status, attempts, result, error, created_at, updated_at, completed_at";

/// SQLite-backed store for flows, executions, node records, event history
/// and the data-processing table.
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    /// Open or create a SQLite database at the given path.
    pub fn open(path: &Path) -> Result<Self> {
        // Create parent directories
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                FlowError::Database(format!("Failed to create db directory: {}", e))
            })?;
        }

        let conn = Connection::open(path).map_err(db_err)?;

        // Enable WAL mode for better concurrent performance
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")
            .map_err(db_err)?;
        conn.execute_batch(SCHEMA).map_err(db_err)?;

        debug!(path = %path.display(), "SQLite store opened");
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Open an in-memory database (for testing).
    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().map_err(db_err)?;
        conn.execute_batch(SCHEMA).map_err(db_err)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|e| FlowError::Database(e.to_string()))
    }

    /// Insert or replace a flow definition.
    pub fn save_flow(&self, flow: &FlowDefinition) -> Result<()> {
        let definition = serde_json::to_string(flow)?;
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO flows (id, name, definition, updated_at) VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(id) DO UPDATE SET
                name = excluded.name,
                definition = excluded.definition,
                updated_at = excluded.updated_at",
            params![flow.id.to_string(), flow.name, definition, Utc::now().to_rfc3339()],
        )
        .map_err(db_err)?;
        Ok(())
    }

    /// Add a row to the data-processing table.
    pub fn insert_record(&self, company_name: Option<&str>, processed: bool) -> Result<i64> {
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO data_processing (company_name, processed) VALUES (?1, ?2)",
            params![company_name, processed],
        )
        .map_err(db_err)?;
        Ok(conn.last_insert_rowid())
    }

    pub fn clear_records(&self) -> Result<u64> {
        let conn = self.lock()?;
        let n = conn.execute("DELETE FROM data_processing", []).map_err(db_err)?;
        Ok(n as u64)
    }

    fn query_execution(conn: &Connection, column: &str, key: &dyn rusqlite::ToSql) -> Result<Option<FlowExecution>> {
        let sql = format!(
            "SELECT {} FROM flow_executions WHERE {} = ?1",
            EXECUTION_COLUMNS, column
        );
        let raw = conn
            .query_row(&sql, [key], RawExecution::from_row)
            .optional()
            .map_err(db_err)?;
        raw.map(RawExecution::into_execution).transpose()
    }

    fn query_node(conn: &Connection, id: i64) -> Result<Option<FlowNodeExecution>> {
        let sql = format!("SELECT {} FROM flow_node_executions WHERE id = ?1", NODE_COLUMNS);
        let raw = conn
            .query_row(&sql, [id], RawNode::from_row)
            .optional()
            .map_err(db_err)?;
        raw.map(RawNode::into_node).transpose()
    }
}

fn db_err(e: rusqlite::Error) -> FlowError {
    FlowError::Database(e.to_string())
}

fn is_unique_violation(e: &rusqlite::Error) -> bool {
    matches!(e, rusqlite::Error::SqliteFailure(f, _) if f.code == ErrorCode::ConstraintViolation)
}

fn parse_ts(s: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| FlowError::Database(format!("bad timestamp '{}': {}", s, e)))
}

fn parse_status(s: &str) -> Result<ExecutionStatus> {
    ExecutionStatus::parse(s).ok_or_else(|| FlowError::Database(format!("unknown status '{}'", s)))
}

fn parse_json(s: Option<String>) -> Result<Option<serde_json::Value>> {
    s.map(|s| serde_json::from_str(&s)).transpose().map_err(FlowError::from)
}

struct RawExecution {
    id: i64,
    flow_id: String,
    job_id: String,
    status: String,
    config: String,
    result: Option<String>,
    error: Option<String>,
    created_at: String,
    updated_at: String,
    completed_at: Option<String>,
}

impl RawExecution {
    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            flow_id: row.get(1)?,
            job_id: row.get(2)?,
            status: row.get(3)?,
            config: row.get(4)?,
            result: row.get(5)?,
            error: row.get(6)?,
            created_at: row.get(7)?,
            updated_at: row.get(8)?,
            completed_at: row.get(9)?,
        })
    }

    fn into_execution(self) -> Result<FlowExecution> {
        Ok(FlowExecution {
            id: self.id,
            flow_id: Uuid::parse_str(&self.flow_id)
                .map_err(|e| FlowError::Database(format!("bad flow id '{}': {}", self.flow_id, e)))?,
            job_id: JobId(self.job_id),
            status: parse_status(&self.status)?,
            config: serde_json::from_str(&self.config)?,
            result: parse_json(self.result)?,
            error: self.error,
            created_at: parse_ts(&self.created_at)?,
            updated_at: parse_ts(&self.updated_at)?,
            completed_at: self.completed_at.as_deref().map(parse_ts).transpose()?,
        })
    }
}

struct RawNode {
    id: i64,
    flow_execution_id: i64,
    node_id: String,
    status: String,
    attempts: u32,
    result: Option<String>,
    error: Option<String>,
    created_at: String,
    updated_at: String,
    completed_at: Option<String>,
}

impl RawNode {
    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            flow_execution_id: row.get(1)?,
            node_id: row.get(2)?,
            status: row.get(3)?,
            attempts: row.get(4)?,
            result: row.get(5)?,
            error: row.get(6)?,
            created_at: row.get(7)?,
            updated_at: row.get(8)?,
            completed_at: row.get(9)?,
        })
    }

    fn into_node(self) -> Result<FlowNodeExecution> {
        Ok(FlowNodeExecution {
            id: self.id,
            flow_execution_id: self.flow_execution_id,
            node_id: self.node_id,
            status: parse_status(&self.status)?,
            attempts: self.attempts,
            result: parse_json(self.result)?,
            error: self.error,
            created_at: parse_ts(&self.created_at)?,
            updated_at: parse_ts(&self.updated_at)?,
            completed_at: self.completed_at.as_deref().map(parse_ts).transpose()?,
        })
    }
}

impl FlowRepository for SqliteStore {
    fn get_flow(&self, flow_id: Uuid) -> BoxFuture<'_, Result<Option<FlowDefinition>>> {
        Box::pin(async move {
            let conn = self.lock()?;
            let definition: Option<String> = conn
                .query_row(
                    "SELECT definition FROM flows WHERE id = ?1",
                    [flow_id.to_string()],
                    |row| row.get(0),
                )
                .optional()
                .map_err(db_err)?;
            definition
                .map(|d| serde_json::from_str(&d))
                .transpose()
                .map_err(FlowError::from)
        })
    }
}

impl ExecutionStore for SqliteStore {
    fn create_execution(
        &self,
        flow_id: Uuid,
        job_id: &JobId,
        config: serde_json::Value,
    ) -> BoxFuture<'_, Result<FlowExecution>> {
        let job_id = job_id.clone();
        Box::pin(async move {
            let conn = self.lock()?;
            let now = Utc::now().to_rfc3339();
            conn.execute(
                "INSERT INTO flow_executions (flow_id, job_id, status, config, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?5)",
                params![
                    flow_id.to_string(),
                    job_id.as_str(),
                    ExecutionStatus::Pending.as_str(),
                    config.to_string(),
                    now
                ],
            )
            .map_err(|e| {
                if is_unique_violation(&e) {
                    FlowError::Conflict(format!("job_id '{}' already exists", job_id))
                } else {
                    db_err(e)
                }
            })?;
            let id = conn.last_insert_rowid();
            Self::query_execution(&conn, "id", &id)?
                .ok_or_else(|| FlowError::Database(format!("execution {} vanished after insert", id)))
        })
    }

    fn update_execution(
        &self,
        execution_id: i64,
        status: ExecutionStatus,
        result: Option<serde_json::Value>,
        error: Option<String>,
    ) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            let conn = self.lock()?;
            let current = Self::query_execution(&conn, "id", &execution_id)?
                .ok_or_else(|| FlowError::NotFound(format!("execution {}", execution_id)))?;
            if current.status != status && !current.status.can_transition_to(status) {
                return Err(FlowError::Conflict(format!(
                    "execution {} cannot move from {} to {}",
                    execution_id, current.status, status
                )));
            }

            let now = Utc::now().to_rfc3339();
            let completed_at = status.is_terminal().then(|| now.clone());
            conn.execute(
                "UPDATE flow_executions SET
                    status = ?1,
                    result = COALESCE(?2, result),
                    error = COALESCE(?3, error),
                    updated_at = ?4,
                    completed_at = COALESCE(completed_at, ?5)
                 WHERE id = ?6",
                params![
                    status.as_str(),
                    result.map(|r| r.to_string()),
                    error,
                    now,
                    completed_at,
                    execution_id
                ],
            )
            .map_err(db_err)?;
            Ok(())
        })
    }

    fn get_execution(&self, execution_id: i64) -> BoxFuture<'_, Result<Option<FlowExecution>>> {
        Box::pin(async move {
            let conn = self.lock()?;
            Self::query_execution(&conn, "id", &execution_id)
        })
    }

    fn get_execution_by_job(&self, job_id: &JobId) -> BoxFuture<'_, Result<Option<FlowExecution>>> {
        let job_id = job_id.clone();
        Box::pin(async move {
            let conn = self.lock()?;
            Self::query_execution(&conn, "job_id", &job_id.0)
        })
    }

    fn list_executions_by_flow(&self, flow_id: Uuid) -> BoxFuture<'_, Result<Vec<FlowExecution>>> {
        Box::pin(async move {
            let conn = self.lock()?;
            let sql = format!(
                "SELECT {} FROM flow_executions WHERE flow_id = ?1 ORDER BY id DESC",
                EXECUTION_COLUMNS
            );
            let mut stmt = conn.prepare(&sql).map_err(db_err)?;
            let rows = stmt
                .query_map([flow_id.to_string()], RawExecution::from_row)
                .map_err(db_err)?;

            let mut executions = Vec::new();
            for row in rows {
                executions.push(row.map_err(db_err)?.into_execution()?);
            }
            Ok(executions)
        })
    }

    fn create_node_execution(
        &self,
        execution_id: i64,
        node_id: &str,
    ) -> BoxFuture<'_, Result<FlowNodeExecution>> {
        let node_id = node_id.to_string();
        Box::pin(async move {
            let conn = self.lock()?;
            let now = Utc::now().to_rfc3339();
            conn.execute(
                "INSERT INTO flow_node_executions
                    (flow_execution_id, node_id, status, attempts, created_at, updated_at)
                 VALUES (?1, ?2, ?3, 0, ?4, ?4)",
                params![execution_id, node_id, ExecutionStatus::Running.as_str(), now],
            )
            .map_err(|e| {
                if is_unique_violation(&e) {
                    FlowError::Conflict(format!(
                        "node '{}' already has a record in execution {}",
                        node_id, execution_id
                    ))
                } else {
                    db_err(e)
                }
            })?;
            let id = conn.last_insert_rowid();
            Self::query_node(&conn, id)?
                .ok_or_else(|| FlowError::Database(format!("node record {} vanished after insert", id)))
        })
    }

    fn update_node_execution(&self, id: i64, update: NodeUpdate) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            let conn = self.lock()?;
            let current = Self::query_node(&conn, id)?
                .ok_or_else(|| FlowError::NotFound(format!("node record {}", id)))?;
            if !current.status.can_transition_to(update.status) {
                return Err(FlowError::Conflict(format!(
                    "node '{}' cannot move from {} to {}",
                    current.node_id, current.status, update.status
                )));
            }

            let now = Utc::now().to_rfc3339();
            let completed_at = update.status.is_terminal().then(|| now.clone());
            conn.execute(
                "UPDATE flow_node_executions SET
                    status = ?1,
                    attempts = ?2,
                    result = COALESCE(?3, result),
                    error = COALESCE(?4, error),
                    updated_at = ?5,
                    completed_at = ?6
                 WHERE id = ?7",
                params![
                    update.status.as_str(),
                    update.attempts,
                    update.result.map(|r| r.to_string()),
                    update.error,
                    now,
                    completed_at,
                    id
                ],
            )
            .map_err(db_err)?;
            Ok(())
        })
    }

    fn list_node_executions(&self, execution_id: i64) -> BoxFuture<'_, Result<Vec<FlowNodeExecution>>> {
        Box::pin(async move {
            let conn = self.lock()?;
            let sql = format!(
                "SELECT {} FROM flow_node_executions WHERE flow_execution_id = ?1 ORDER BY id ASC",
                NODE_COLUMNS
            );
            let mut stmt = conn.prepare(&sql).map_err(db_err)?;
            let rows = stmt
                .query_map([execution_id], RawNode::from_row)
                .map_err(db_err)?;

            let mut nodes = Vec::new();
            for row in rows {
                nodes.push(row.map_err(db_err)?.into_node()?);
            }
            Ok(nodes)
        })
    }
}

impl LogStore for SqliteStore {
    fn append_logs(&self, events: &[LogEvent]) -> BoxFuture<'_, Result<()>> {
        let events = events.to_vec();
        Box::pin(async move {
            let mut conn = self.lock()?;
            let tx = conn.transaction().map_err(db_err)?;
            {
                let mut stmt = tx
                    .prepare(
                        "INSERT INTO execution_logs (job_id, sequence, content, timestamp)
                         VALUES (?1, ?2, ?3, ?4)",
                    )
                    .map_err(db_err)?;
                for event in &events {
                    stmt.execute(params![
                        event.job_id.as_str(),
                        event.sequence as i64,
                        event.content,
                        event.timestamp.to_rfc3339()
                    ])
                    .map_err(db_err)?;
                }
            }
            tx.commit().map_err(db_err)?;
            Ok(())
        })
    }

    fn get_logs(&self, job_id: &JobId, limit: usize, offset: usize) -> BoxFuture<'_, Result<Vec<LogEvent>>> {
        let job_id = job_id.clone();
        Box::pin(async move {
            // An offset past i64::MAX is past every stored row
            let Ok(offset) = i64::try_from(offset) else {
                return Ok(Vec::new());
            };
            let limit = i64::try_from(limit).unwrap_or(i64::MAX);
            let conn = self.lock()?;
            let mut stmt = conn
                .prepare(
                    "SELECT sequence, content, timestamp FROM execution_logs
                     WHERE job_id = ?1
                     ORDER BY id ASC
                     LIMIT ?2 OFFSET ?3",
                )
                .map_err(db_err)?;
            let rows = stmt
                .query_map(params![job_id.as_str(), limit, offset], |row| {
                    let sequence: i64 = row.get(0)?;
                    let content: String = row.get(1)?;
                    let ts: String = row.get(2)?;
                    Ok((sequence, content, ts))
                })
                .map_err(db_err)?;

            let mut events = Vec::new();
            for row in rows {
                let (sequence, content, ts) = row.map_err(db_err)?;
                events.push(LogEvent {
                    job_id: job_id.clone(),
                    sequence: sequence as u64,
                    content,
                    timestamp: parse_ts(&ts)?,
                });
            }
            Ok(events)
        })
    }

    fn count_logs(&self, job_id: &JobId) -> BoxFuture<'_, Result<u64>> {
        let job_id = job_id.clone();
        Box::pin(async move {
            let conn = self.lock()?;
            let n: i64 = conn
                .query_row(
                    "SELECT COUNT(*) FROM execution_logs WHERE job_id = ?1",
                    [job_id.as_str()],
                    |row| row.get(0),
                )
                .map_err(db_err)?;
            Ok(n as u64)
        })
    }
}

impl RecordSource for SqliteStore {
    fn record_stats(&self) -> BoxFuture<'_, Result<RecordStats>> {
        Box::pin(async move {
            let conn = self.lock()?;
            let (total, unprocessed, null_company_name): (i64, i64, i64) = conn
                .query_row(
                    "SELECT COUNT(*),
                            COALESCE(SUM(CASE WHEN processed = 0 THEN 1 ELSE 0 END), 0),
                            COALESCE(SUM(CASE WHEN company_name IS NULL THEN 1 ELSE 0 END), 0)
                     FROM data_processing",
                    [],
                    |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
                )
                .map_err(db_err)?;
            Ok(RecordStats {
                total: total as u64,
                unprocessed: unprocessed as u64,
                null_company_name: null_company_name as u64,
            })
        })
    }
}
