use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use futures::stream::{BoxStream, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, Notify};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use crate::config::EventsConfig;
use crate::error::Result;
use crate::traits::LogStore;
use crate::types::{ExecutionStatus, JobId, LogEvent};

/// Structured event content emitted by the coordinator and executors.
///
/// Published on the bus as its JSON rendering.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum FlowEvent {
    ExecutionStatus {
        status: ExecutionStatus,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        message: Option<String>,
    },
    NodeStarted { node_id: String, attempt: u32 },
    NodeProgress { node_id: String, message: String },
    NodeRetry { node_id: String, attempt: u32, feedback: String },
    NodeCompleted { node_id: String, attempts: u32 },
    NodeFailed { node_id: String, kind: String, error: String },
    NodeSkipped { node_id: String, reason: String },
    RouterDecision { node_id: String, handle: String },
    CallbackError { node_id: String, stage: String, error: String },
}

impl FlowEvent {
    pub fn render(&self) -> String {
        serde_json::to_string(self)
            .unwrap_or_else(|e| serde_json::json!({ "event": "unrenderable", "error": e.to_string() }).to_string())
    }
}

/// Observable counters for the bus.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct BusStats {
    pub published: u64,
    /// Events a live subscriber missed because it fell behind.
    pub live_dropped: u64,
    /// Events evicted from a full persistence queue before being written.
    pub persist_dropped: u64,
    pub persisted: u64,
    pub persist_failed: u64,
}

struct PersistQueue {
    events: VecDeque<LogEvent>,
    sequences: HashMap<JobId, u64>,
}

struct BusInner {
    config: EventsConfig,
    live: Mutex<HashMap<JobId, broadcast::Sender<LogEvent>>>,
    queue: Mutex<PersistQueue>,
    wake_writer: Notify,
    drained: Notify,
    /// Events queued or being written.
    pending: AtomicUsize,
    writer_running: AtomicBool,
    published: AtomicU64,
    live_dropped: AtomicU64,
    persist_dropped: AtomicU64,
    persisted: AtomicU64,
    persist_failed: AtomicU64,
    shutdown: CancellationToken,
}

/// Per-job event bus.
///
/// Every publish fans out to the job's live subscribers and is queued for
/// a background writer that appends batches to the log store. Neither path
/// blocks the publisher: live receivers that lag lose their oldest events
/// and a full persistence queue evicts its oldest entry. Both cases are
/// counted in [`BusStats`].
pub struct EventBus {
    inner: Arc<BusInner>,
    store: Arc<dyn LogStore>,
    writer: Mutex<Option<JoinHandle<()>>>,
}

impl EventBus {
    /// Create the bus and spawn its persistence writer. Must be called
    /// from within a tokio runtime.
    pub fn new(config: EventsConfig, store: Arc<dyn LogStore>) -> Self {
        let inner = Arc::new(BusInner {
            config,
            live: Mutex::new(HashMap::new()),
            queue: Mutex::new(PersistQueue {
                events: VecDeque::new(),
                sequences: HashMap::new(),
            }),
            wake_writer: Notify::new(),
            drained: Notify::new(),
            pending: AtomicUsize::new(0),
            writer_running: AtomicBool::new(true),
            published: AtomicU64::new(0),
            live_dropped: AtomicU64::new(0),
            persist_dropped: AtomicU64::new(0),
            persisted: AtomicU64::new(0),
            persist_failed: AtomicU64::new(0),
            shutdown: CancellationToken::new(),
        });

        let writer = tokio::spawn(run_writer(inner.clone(), store.clone()));
        Self {
            inner,
            store,
            writer: Mutex::new(Some(writer)),
        }
    }

    /// Publish an event for a job. Never blocks on subscribers or storage.
    pub fn publish(&self, job_id: &JobId, content: impl Into<String>, timestamp: DateTime<Utc>) {
        let content = content.into();
        {
            let Ok(mut queue) = self.inner.queue.lock() else {
                error!("Event queue lock poisoned, dropping event");
                return;
            };
            let seq = queue.sequences.entry(job_id.clone()).or_insert(0);
            let event = LogEvent {
                job_id: job_id.clone(),
                sequence: *seq,
                content,
                timestamp,
            };
            *seq += 1;

            if queue.events.len() >= self.inner.config.persist_capacity {
                if let Some(evicted) = queue.events.pop_front() {
                    self.inner.persist_dropped.fetch_add(1, Ordering::Relaxed);
                    warn!(
                        job_id = %evicted.job_id,
                        sequence = evicted.sequence,
                        "Persistence queue full, dropped oldest event"
                    );
                }
            } else {
                self.inner.pending.fetch_add(1, Ordering::SeqCst);
            }
            queue.events.push_back(event.clone());

            // Fan out under the queue lock so live order matches sequence order
            if let Ok(live) = self.inner.live.lock() {
                if let Some(tx) = live.get(job_id) {
                    // Ignore error if every receiver is gone
                    let _ = tx.send(event);
                }
            }
        }
        self.inner.published.fetch_add(1, Ordering::Relaxed);
        self.inner.wake_writer.notify_one();
    }

    /// Publish a structured event stamped with the current time.
    pub fn emit(&self, job_id: &JobId, event: &FlowEvent) {
        self.publish(job_id, event.render(), Utc::now());
    }

    /// Subscribe to live events for a job, starting now.
    pub fn subscribe(&self, job_id: &JobId) -> Subscription {
        let rx = match self.inner.live.lock() {
            Ok(mut live) => live
                .entry(job_id.clone())
                .or_insert_with(|| broadcast::channel(self.inner.config.live_capacity).0)
                .subscribe(),
            Err(_) => {
                // A closed receiver ends the stream immediately
                let (tx, rx) = broadcast::channel(1);
                drop(tx);
                rx
            }
        };
        debug!(job_id = %job_id, "Live subscriber registered");
        Subscription {
            job_id: job_id.clone(),
            rx,
            inner: self.inner.clone(),
        }
    }

    pub fn subscriber_count(&self, job_id: &JobId) -> usize {
        self.inner
            .live
            .lock()
            .ok()
            .and_then(|live| live.get(job_id).map(|tx| tx.receiver_count()))
            .unwrap_or(0)
    }

    /// Persisted events for a job in emission order.
    ///
    /// Waits for queued events to reach the store first.
    pub async fn history(&self, job_id: &JobId, limit: usize, offset: usize) -> Result<Vec<LogEvent>> {
        self.flush().await;
        self.store.get_logs(job_id, limit, offset).await
    }

    pub async fn count(&self, job_id: &JobId) -> Result<u64> {
        self.flush().await;
        self.store.count_logs(job_id).await
    }

    /// Wait until every queued event has been handed to the store.
    pub async fn flush(&self) {
        loop {
            let drained = self.inner.drained.notified();
            tokio::pin!(drained);
            drained.as_mut().enable();
            if self.inner.pending.load(Ordering::SeqCst) == 0
                || !self.inner.writer_running.load(Ordering::SeqCst)
            {
                return;
            }
            drained.await;
        }
    }

    /// Drop the sequence counter of a finished job.
    pub fn release_job(&self, job_id: &JobId) {
        if let Ok(mut queue) = self.inner.queue.lock() {
            queue.sequences.remove(job_id);
        }
    }

    pub fn stats(&self) -> BusStats {
        BusStats {
            published: self.inner.published.load(Ordering::Relaxed),
            live_dropped: self.inner.live_dropped.load(Ordering::Relaxed),
            persist_dropped: self.inner.persist_dropped.load(Ordering::Relaxed),
            persisted: self.inner.persisted.load(Ordering::Relaxed),
            persist_failed: self.inner.persist_failed.load(Ordering::Relaxed),
        }
    }

    /// Drain the persistence queue, stop the writer and end all live streams.
    pub async fn shutdown(&self) {
        self.inner.shutdown.cancel();
        let handle = self.writer.lock().ok().and_then(|mut w| w.take());
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                error!(error = %e, "Event writer task failed");
            }
        }
        if let Ok(mut live) = self.inner.live.lock() {
            live.clear();
        }
        debug!("Event bus shut down");
    }
}

async fn run_writer(inner: Arc<BusInner>, store: Arc<dyn LogStore>) {
    loop {
        let batch: Vec<LogEvent> = match inner.queue.lock() {
            Ok(mut queue) => {
                let n = queue.events.len().min(inner.config.persist_batch_size);
                queue.events.drain(..n).collect()
            }
            Err(_) => {
                error!("Event queue lock poisoned, writer stopping");
                break;
            }
        };

        if batch.is_empty() {
            if inner.shutdown.is_cancelled() {
                break;
            }
            tokio::select! {
                _ = inner.wake_writer.notified() => {}
                _ = inner.shutdown.cancelled() => {}
            }
            continue;
        }

        let n = batch.len();
        match store.append_logs(&batch).await {
            Ok(()) => {
                inner.persisted.fetch_add(n as u64, Ordering::Relaxed);
            }
            Err(e) => {
                inner.persist_failed.fetch_add(n as u64, Ordering::Relaxed);
                error!(error = %e, events = n, "Failed to persist event batch");
            }
        }
        if inner.pending.fetch_sub(n, Ordering::SeqCst) == n {
            inner.drained.notify_waiters();
        }
    }
    inner.writer_running.store(false, Ordering::SeqCst);
    inner.drained.notify_waiters();
    debug!("Event writer stopped");
}

/// Live event stream for one job. Dropping it unregisters the subscriber.
pub struct Subscription {
    job_id: JobId,
    rx: broadcast::Receiver<LogEvent>,
    inner: Arc<BusInner>,
}

impl Subscription {
    pub fn job_id(&self) -> &JobId {
        &self.job_id
    }

    /// Next live event, or `None` once the bus shuts down.
    pub async fn recv(&mut self) -> Option<LogEvent> {
        loop {
            match self.rx.recv().await {
                Ok(event) => return Some(event),
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    self.inner.live_dropped.fetch_add(n, Ordering::Relaxed);
                    warn!(job_id = %self.job_id, skipped = n, "Live subscriber lagged, dropped oldest events");
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    pub fn into_stream(self) -> BoxStream<'static, LogEvent> {
        futures::stream::unfold(self, |mut sub| async move {
            sub.recv().await.map(|event| (event, sub))
        })
        .boxed()
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Ok(mut live) = self.inner.live.lock() {
            // Our own receiver is still alive here
            let last = live
                .get(&self.job_id)
                .is_some_and(|tx| tx.receiver_count() <= 1);
            if last {
                live.remove(&self.job_id);
                debug!(job_id = %self.job_id, "Last live subscriber left");
            }
        }
    }
}

/// Handle an executor uses to report incremental progress for one node.
#[derive(Clone)]
pub struct ProgressSink {
    target: Option<(Arc<EventBus>, JobId)>,
    node_id: String,
}

impl ProgressSink {
    pub fn new(bus: Arc<EventBus>, job_id: JobId, node_id: impl Into<String>) -> Self {
        Self {
            target: Some((bus, job_id)),
            node_id: node_id.into(),
        }
    }

    /// A sink that discards everything.
    pub fn disabled() -> Self {
        Self {
            target: None,
            node_id: String::new(),
        }
    }

    pub fn emit(&self, message: impl Into<String>) {
        if let Some((bus, job_id)) = &self.target {
            bus.emit(
                job_id,
                &FlowEvent::NodeProgress {
                    node_id: self.node_id.clone(),
                    message: message.into(),
                },
            );
        }
    }
}
