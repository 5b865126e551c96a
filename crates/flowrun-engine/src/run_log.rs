use std::path::PathBuf;

use chrono::Utc;
use futures::future::BoxFuture;
use serde::Serialize;
use serde_json::Value;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::debug;

use flowrun_core::Result;

use crate::guardrail::{output_text, ValidationOutcome};
use crate::pipeline::{sanitize, CallbackContext, NodeCallback, NodeCompletion, Stage};

/// Characters of output kept in a log entry.
const PREVIEW_CHARS: usize = 500;

/// JSONL run logger.
///
/// Writes one JSON object per line to `{log_dir}/{job_id}.jsonl`. The file
/// is append-only and flushed after every entry, so a crash mid-run leaves
/// all earlier lines intact.
pub struct RunLogger {
    log_dir: PathBuf,
    write_lock: Mutex<()>,
}

/// A single log entry written to the JSONL file.
#[derive(Serialize)]
struct LogEntry<'a> {
    timestamp: String,
    job_id: &'a str,
    node_id: &'a str,
    event_type: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    attempt: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    detail: Option<Value>,
}

impl RunLogger {
    pub fn new(log_dir: PathBuf) -> Self {
        Self {
            log_dir,
            write_lock: Mutex::new(()),
        }
    }

    pub fn path_for(&self, ctx: &CallbackContext) -> PathBuf {
        self.log_dir
            .join(format!("{}.jsonl", sanitize(ctx.job_id.as_str())))
    }

    async fn write(&self, ctx: &CallbackContext, entry: LogEntry<'_>) -> Result<()> {
        let line = format!("{}\n", serde_json::to_string(&entry)?);
        let path = self.path_for(ctx);

        let _guard = self.write_lock.lock().await;
        tokio::fs::create_dir_all(&self.log_dir).await?;
        let file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await?;
        let mut writer = tokio::io::BufWriter::new(file);
        writer.write_all(line.as_bytes()).await?;
        writer.flush().await?;
        debug!(path = %path.display(), event = entry.event_type, "Run log entry written");
        Ok(())
    }

    fn entry<'a>(ctx: &'a CallbackContext, event_type: &'static str, detail: Option<Value>) -> LogEntry<'a> {
        LogEntry {
            timestamp: Utc::now().to_rfc3339(),
            job_id: ctx.job_id.as_str(),
            node_id: &ctx.node_id,
            event_type,
            attempt: Some(ctx.attempt),
            detail,
        }
    }
}

impl NodeCallback for RunLogger {
    fn name(&self) -> &str {
        "run_logger"
    }

    fn stage(&self) -> Stage {
        Stage::Logging
    }

    fn on_start<'a>(&'a self, ctx: &'a CallbackContext) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move { self.write(ctx, Self::entry(ctx, "node_started", None)).await })
    }

    fn on_output<'a>(
        &'a self,
        ctx: &'a CallbackContext,
        output: &'a mut Value,
    ) -> BoxFuture<'a, Result<Option<ValidationOutcome>>> {
        Box::pin(async move {
            let preview: String = output_text(output).chars().take(PREVIEW_CHARS).collect();
            let detail = serde_json::json!({ "output": preview });
            self.write(ctx, Self::entry(ctx, "node_output", Some(detail))).await?;
            Ok(None)
        })
    }

    fn on_complete<'a>(
        &'a self,
        ctx: &'a CallbackContext,
        completion: &'a NodeCompletion,
    ) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            let mut entry = match completion {
                NodeCompletion::Completed { attempts, .. } => Self::entry(
                    ctx,
                    "node_completed",
                    Some(serde_json::json!({ "attempts": attempts })),
                ),
                NodeCompletion::Failed { error, attempts } => Self::entry(
                    ctx,
                    "node_failed",
                    Some(serde_json::json!({ "attempts": attempts, "error": error })),
                ),
            };
            entry.attempt = None;
            self.write(ctx, entry).await
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flowrun_core::JobId;

    fn ctx(attempt: u32) -> CallbackContext {
        CallbackContext {
            job_id: JobId::from_str("job-1"),
            node_id: "b".into(),
            attempt,
        }
    }

    fn read_lines(path: &std::path::Path) -> Vec<Value> {
        std::fs::read_to_string(path)
            .unwrap()
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect()
    }

    #[tokio::test]
    async fn test_writes_one_line_per_callback() {
        let dir = tempfile::tempdir().unwrap();
        let logger = RunLogger::new(dir.path().to_path_buf());

        logger.on_start(&ctx(1)).await.unwrap();
        logger.on_output(&ctx(1), &mut Value::String("first".into())).await.unwrap();
        logger.on_start(&ctx(2)).await.unwrap();
        logger
            .on_complete(
                &ctx(2),
                &NodeCompletion::Completed {
                    output: Value::Null,
                    attempts: 2,
                },
            )
            .await
            .unwrap();

        let lines = read_lines(&logger.path_for(&ctx(1)));
        let kinds: Vec<&str> = lines.iter().map(|l| l["event_type"].as_str().unwrap()).collect();
        assert_eq!(kinds, vec!["node_started", "node_output", "node_started", "node_completed"]);
        assert_eq!(lines[1]["detail"]["output"], "first");
        assert_eq!(lines[2]["attempt"], 2);
        assert_eq!(lines[3]["detail"]["attempts"], 2);
        assert!(lines[3].get("attempt").is_none());
    }

    #[tokio::test]
    async fn test_output_preview_truncated() {
        let dir = tempfile::tempdir().unwrap();
        let logger = RunLogger::new(dir.path().to_path_buf());
        let mut long = Value::String("x".repeat(2000));
        logger.on_output(&ctx(1), &mut long).await.unwrap();

        let lines = read_lines(&logger.path_for(&ctx(1)));
        assert_eq!(lines[0]["detail"]["output"].as_str().unwrap().len(), PREVIEW_CHARS);
    }
}
