use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use flowrun_core::{FlowEvent, LogEvent};

/// A live log frame pushed to stream subscribers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogFrame {
    pub job_id: String,
    pub content: String,
    pub timestamp: DateTime<Utc>,
    #[serde(rename = "type")]
    pub frame_type: String,
}

impl LogFrame {
    pub fn live(event: &LogEvent) -> Self {
        Self {
            job_id: event.job_id.to_string(),
            content: event.content.clone(),
            timestamp: event.timestamp,
            frame_type: "live".to_string(),
        }
    }
}

/// Whether the event content announces a terminal execution status.
pub fn is_terminal(event: &LogEvent) -> bool {
    matches!(
        serde_json::from_str::<FlowEvent>(&event.content),
        Ok(FlowEvent::ExecutionStatus { status, .. }) if status.is_terminal()
    )
}
