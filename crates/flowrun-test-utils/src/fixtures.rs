use std::sync::{Arc, Mutex};

use futures::future::BoxFuture;

use flowrun_core::traits::RecordSource;
use flowrun_core::{Edge, FlowDefinition, GuardrailConfig, Node, RecordStats, Result};
use flowrun_store::SqliteStore;

/// Fresh in-memory SQLite store.
pub fn memory_store() -> Arc<SqliteStore> {
    Arc::new(SqliteStore::in_memory().expect("in-memory sqlite"))
}

/// File-backed store in a temp directory that lives as long as the guard.
pub fn temp_store() -> (tempfile::TempDir, Arc<SqliteStore>) {
    let dir = tempfile::tempdir().expect("tempdir");
    let store = SqliteStore::open(&dir.path().join("flowrun.db")).expect("open sqlite");
    (dir, Arc::new(store))
}

/// `a (agent) -> b (task) -> c (task)`
pub fn linear_flow() -> FlowDefinition {
    FlowDefinition::new(
        "linear",
        vec![Node::agent("a"), Node::task("b"), Node::task("c")],
        vec![Edge::new("a", "b"), Edge::new("b", "c")],
    )
}

/// `a (agent) -> b (task, guarded) -> c (task)`
pub fn guarded_flow(guardrail: GuardrailConfig, max_retry_limit: u32) -> FlowDefinition {
    FlowDefinition::new(
        "guarded",
        vec![
            Node::agent("a"),
            Node::task("b")
                .with_guardrail(guardrail)
                .with_max_retry_limit(max_retry_limit),
            Node::task("c"),
        ],
        vec![Edge::new("a", "b"), Edge::new("b", "c")],
    )
}

/// `a -> r (router on state.count > 10)`, with `true -> yes -> yes_after`
/// and `false -> no -> no_after`.
pub fn router_flow() -> FlowDefinition {
    FlowDefinition::new(
        "router",
        vec![
            Node::agent("a"),
            Node::router("r", "state.count > 10"),
            Node::task("yes"),
            Node::task("yes_after"),
            Node::task("no"),
            Node::task("no_after"),
        ],
        vec![
            Edge::new("a", "r"),
            Edge::branch("r", "true", "yes"),
            Edge::new("yes", "yes_after"),
            Edge::branch("r", "false", "no"),
            Edge::new("no", "no_after"),
        ],
    )
}

/// Independent nodes with no edges, all in layer 0.
pub fn fan_out_flow(width: usize) -> FlowDefinition {
    let nodes = (0..width).map(|i| Node::task(format!("n{}", i))).collect();
    FlowDefinition::new("fan-out", nodes, vec![])
}

/// Record source with settable counts.
#[derive(Default)]
pub struct StaticRecords {
    stats: Mutex<RecordStats>,
}

impl StaticRecords {
    pub fn new(stats: RecordStats) -> Self {
        Self {
            stats: Mutex::new(stats),
        }
    }

    /// `total` records, all processed and named.
    pub fn with_total(total: u64) -> Self {
        Self::new(RecordStats {
            total,
            ..RecordStats::default()
        })
    }

    pub fn set(&self, stats: RecordStats) {
        if let Ok(mut s) = self.stats.lock() {
            *s = stats;
        }
    }
}

impl RecordSource for StaticRecords {
    fn record_stats(&self) -> BoxFuture<'_, Result<RecordStats>> {
        let stats = self.stats.lock().map(|s| *s).unwrap_or_default();
        Box::pin(async move { Ok(stats) })
    }
}
