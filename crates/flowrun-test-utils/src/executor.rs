use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::future::BoxFuture;
use serde_json::Value;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

use flowrun_core::traits::NodeExecutor;
use flowrun_core::{FlowError, NodeRequest, Result};

/// One scripted reply of the mock executor.
#[derive(Debug, Clone)]
pub enum Reply {
    Output(Value),
    Error(String),
    /// Never answers; only cancellation ends the call.
    Hang,
}

impl From<Value> for Reply {
    fn from(value: Value) -> Self {
        Reply::Output(value)
    }
}

/// A recorded executor call.
#[derive(Debug, Clone)]
pub struct Call {
    pub node_id: String,
    pub attempt: u32,
    pub feedback: Vec<String>,
    pub inputs: BTreeMap<String, Value>,
    pub state: serde_json::Map<String, Value>,
}

/// Pauses a node inside the executor until released.
#[derive(Default)]
pub struct Gate {
    entered: Notify,
    release: Notify,
}

impl Gate {
    /// Wait until the gated node has entered the executor.
    pub async fn entered(&self) {
        self.entered.notified().await;
    }

    pub fn release(&self) {
        self.release.notify_one();
    }
}

/// Scripted `NodeExecutor` for tests.
///
/// Each node replies from its script in order, then repeats its fallback
/// (by default `"<node_id> done"`). Every call is recorded.
#[derive(Default)]
pub struct MockExecutor {
    scripts: Mutex<HashMap<String, VecDeque<Reply>>>,
    fallbacks: Mutex<HashMap<String, Reply>>,
    delays: Mutex<HashMap<String, Duration>>,
    gates: Mutex<HashMap<String, Arc<Gate>>>,
    calls: Mutex<Vec<Call>>,
    active: Arc<AtomicUsize>,
    peak: Arc<AtomicUsize>,
}

impl MockExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Always answer `node_id` with `output`.
    pub fn respond(self, node_id: &str, output: Value) -> Self {
        self.set_fallback(node_id, Reply::Output(output));
        self
    }

    /// Answer successive attempts of `node_id` with `replies`, then fall back.
    pub fn script(self, node_id: &str, replies: Vec<Reply>) -> Self {
        if let Ok(mut scripts) = self.scripts.lock() {
            scripts.entry(node_id.to_string()).or_default().extend(replies);
        }
        self
    }

    pub fn fail(self, node_id: &str, message: &str) -> Self {
        self.set_fallback(node_id, Reply::Error(message.to_string()));
        self
    }

    pub fn hang(self, node_id: &str) -> Self {
        self.set_fallback(node_id, Reply::Hang);
        self
    }

    pub fn delay(self, node_id: &str, delay: Duration) -> Self {
        if let Ok(mut delays) = self.delays.lock() {
            delays.insert(node_id.to_string(), delay);
        }
        self
    }

    /// Hold `node_id` inside the executor until the returned gate is released.
    pub fn gate(&self, node_id: &str) -> Arc<Gate> {
        let gate = Arc::new(Gate::default());
        if let Ok(mut gates) = self.gates.lock() {
            gates.insert(node_id.to_string(), gate.clone());
        }
        gate
    }

    fn set_fallback(&self, node_id: &str, reply: Reply) {
        if let Ok(mut fallbacks) = self.fallbacks.lock() {
            fallbacks.insert(node_id.to_string(), reply);
        }
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().map(|c| c.clone()).unwrap_or_default()
    }

    pub fn calls_for(&self, node_id: &str) -> Vec<Call> {
        self.calls()
            .into_iter()
            .filter(|c| c.node_id == node_id)
            .collect()
    }

    /// Node ids in call order.
    pub fn call_order(&self) -> Vec<String> {
        self.calls().into_iter().map(|c| c.node_id).collect()
    }

    /// Most calls observed in flight at once.
    pub fn peak_concurrency(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }

    fn next_reply(&self, node_id: &str) -> Reply {
        let scripted = self
            .scripts
            .lock()
            .ok()
            .and_then(|mut s| s.get_mut(node_id).and_then(|q| q.pop_front()));
        scripted
            .or_else(|| {
                self.fallbacks
                    .lock()
                    .ok()
                    .and_then(|f| f.get(node_id).cloned())
            })
            .unwrap_or_else(|| Reply::Output(Value::String(format!("{} done", node_id))))
    }
}

/// Decrements the in-flight counter when a call ends or is dropped.
struct InFlight(Arc<AtomicUsize>);

impl Drop for InFlight {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

impl NodeExecutor for MockExecutor {
    fn name(&self) -> &str {
        "mock"
    }

    fn execute(&self, request: NodeRequest, cancel: CancellationToken) -> BoxFuture<'_, Result<Value>> {
        Box::pin(async move {
            let node_id = request.node.id.clone();
            if let Ok(mut calls) = self.calls.lock() {
                calls.push(Call {
                    node_id: node_id.clone(),
                    attempt: request.attempt,
                    feedback: request.feedback.clone(),
                    inputs: request.inputs.clone(),
                    state: request.state.clone(),
                });
            }
            let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            let _in_flight = InFlight(self.active.clone());

            request.progress.emit(format!("{} attempt {} started", node_id, request.attempt));

            let gate = self.gates.lock().ok().and_then(|g| g.get(&node_id).cloned());
            if let Some(gate) = gate {
                gate.entered.notify_one();
                tokio::select! {
                    _ = gate.release.notified() => {}
                    _ = cancel.cancelled() => return Err(FlowError::Cancelled),
                }
            }

            let delay = self.delays.lock().ok().and_then(|d| d.get(&node_id).copied());
            if let Some(delay) = delay {
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    _ = cancel.cancelled() => return Err(FlowError::Cancelled),
                }
            }

            match self.next_reply(&node_id) {
                Reply::Output(value) => Ok(value),
                Reply::Error(message) => Err(FlowError::NodeExecution {
                    node: node_id,
                    message,
                }),
                Reply::Hang => {
                    cancel.cancelled().await;
                    Err(FlowError::Cancelled)
                }
            }
        })
    }
}
