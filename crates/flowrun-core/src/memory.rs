use std::sync::Mutex;

use futures::future::BoxFuture;
use tokio::sync::watch;

use crate::error::{FlowError, Result};
use crate::traits::LogStore;
use crate::types::{JobId, LogEvent};

/// In-process log store.
pub struct MemoryLogStore {
    events: Mutex<Vec<LogEvent>>,
    paused: watch::Sender<bool>,
}

impl MemoryLogStore {
    pub fn new() -> Self {
        Self {
            events: Mutex::new(Vec::new()),
            paused: watch::channel(false).0,
        }
    }

    /// Hold every append until [`resume`](Self::resume) is called.
    pub fn pause(&self) {
        self.paused.send_replace(true);
    }

    pub fn resume(&self) {
        self.paused.send_replace(false);
    }

    pub fn len(&self) -> usize {
        self.events.lock().map(|e| e.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Vec<LogEvent>>> {
        self.events
            .lock()
            .map_err(|e| FlowError::Database(e.to_string()))
    }
}

impl Default for MemoryLogStore {
    fn default() -> Self {
        Self::new()
    }
}

impl LogStore for MemoryLogStore {
    fn append_logs(&self, events: &[LogEvent]) -> BoxFuture<'_, Result<()>> {
        let events = events.to_vec();
        Box::pin(async move {
            let mut paused = self.paused.subscribe();
            paused
                .wait_for(|p| !*p)
                .await
                .map_err(|e| FlowError::Database(e.to_string()))?;
            self.lock()?.extend(events);
            Ok(())
        })
    }

    fn get_logs(&self, job_id: &JobId, limit: usize, offset: usize) -> BoxFuture<'_, Result<Vec<LogEvent>>> {
        let job_id = job_id.clone();
        Box::pin(async move {
            Ok(self
                .lock()?
                .iter()
                .filter(|e| e.job_id == job_id)
                .skip(offset)
                .take(limit)
                .cloned()
                .collect())
        })
    }

    fn count_logs(&self, job_id: &JobId) -> BoxFuture<'_, Result<u64>> {
        let job_id = job_id.clone();
        Box::pin(async move {
            Ok(self.lock()?.iter().filter(|e| e.job_id == job_id).count() as u64)
        })
    }
}
