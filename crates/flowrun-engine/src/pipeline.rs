//! Callback pipeline run around every node attempt.
//!
//! Callbacks are grouped into fixed stages and invoked in stage order:
//! logging, storage, transformation, validation. A callback that fails in
//! any stage but validation is logged and skipped. Validation callbacks are
//! never skipped: an error there counts as a rejected output.

use std::path::PathBuf;
use std::sync::Arc;

use futures::future::BoxFuture;
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, warn};

use flowrun_core::{EventBus, FlowError, FlowEvent, JobId, Result};

use crate::guardrail::{Guardrail, OutputCleaner, ValidationOutcome};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Logging,
    Storage,
    Transformation,
    Validation,
}

impl Stage {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Logging => "logging",
            Self::Storage => "storage",
            Self::Transformation => "transformation",
            Self::Validation => "validation",
        }
    }
}

/// Identifies the attempt a callback is invoked for.
#[derive(Debug, Clone)]
pub struct CallbackContext {
    pub job_id: JobId,
    pub node_id: String,
    pub attempt: u32,
}

/// Final outcome of a node, handed to `on_complete`.
#[derive(Debug, Clone)]
pub enum NodeCompletion {
    Completed { output: Value, attempts: u32 },
    Failed { error: String, attempts: u32 },
}

/// A strongly-typed pipeline callback.
pub trait NodeCallback: Send + Sync + 'static {
    fn name(&self) -> &str;

    fn stage(&self) -> Stage;

    fn on_start<'a>(&'a self, _ctx: &'a CallbackContext) -> BoxFuture<'a, Result<()>> {
        Box::pin(async { Ok(()) })
    }

    /// Inspect or rewrite one attempt's output. Validation callbacks return
    /// a verdict; other stages return `None`.
    fn on_output<'a>(
        &'a self,
        ctx: &'a CallbackContext,
        output: &'a mut Value,
    ) -> BoxFuture<'a, Result<Option<ValidationOutcome>>>;

    fn on_complete<'a>(
        &'a self,
        _ctx: &'a CallbackContext,
        _completion: &'a NodeCompletion,
    ) -> BoxFuture<'a, Result<()>> {
        Box::pin(async { Ok(()) })
    }
}

/// Ordered set of callbacks. Cheap to clone.
#[derive(Clone, Default)]
pub struct CallbackPipeline {
    callbacks: Vec<Arc<dyn NodeCallback>>,
    bus: Option<Arc<EventBus>>,
}

impl CallbackPipeline {
    pub fn new() -> Self {
        Self::default()
    }

    /// Report skipped callback errors as `callback_error` events.
    pub fn with_bus(mut self, bus: Arc<EventBus>) -> Self {
        self.bus = Some(bus);
        self
    }

    /// Add a callback. Order within a stage is insertion order.
    pub fn with(mut self, callback: Arc<dyn NodeCallback>) -> Self {
        self.push(callback);
        self
    }

    pub fn push(&mut self, callback: Arc<dyn NodeCallback>) {
        let pos = self
            .callbacks
            .iter()
            .position(|c| c.stage() > callback.stage())
            .unwrap_or(self.callbacks.len());
        self.callbacks.insert(pos, callback);
    }

    pub fn len(&self) -> usize {
        self.callbacks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.callbacks.is_empty()
    }

    /// Callback names in invocation order.
    pub fn names(&self) -> Vec<&str> {
        self.callbacks.iter().map(|c| c.name()).collect()
    }

    pub async fn on_start(&self, ctx: &CallbackContext) {
        for cb in &self.callbacks {
            if let Err(e) = cb.on_start(ctx).await {
                self.report(ctx, cb.as_ref(), &e);
            }
        }
    }

    /// Run every stage over an attempt's output.
    ///
    /// Returns the combined verdict of the validation stage, or `None` when
    /// no validator is attached.
    pub async fn process_output(&self, ctx: &CallbackContext, output: &mut Value) -> Option<ValidationOutcome> {
        let mut verdicts = Vec::new();
        for cb in &self.callbacks {
            match cb.on_output(ctx, output).await {
                Ok(Some(verdict)) if cb.stage() == Stage::Validation => verdicts.push(verdict),
                Ok(_) => {}
                Err(e) if cb.stage() == Stage::Validation => {
                    warn!(
                        job_id = %ctx.job_id,
                        node_id = %ctx.node_id,
                        callback = cb.name(),
                        error = %e,
                        "Validator raised, treating output as invalid"
                    );
                    verdicts.push(ValidationOutcome::invalid(format!(
                        "Validation could not be completed ({}): {}",
                        cb.name(),
                        e
                    )));
                }
                Err(e) => self.report(ctx, cb.as_ref(), &e),
            }
        }
        if verdicts.is_empty() {
            None
        } else {
            Some(ValidationOutcome::combine(verdicts))
        }
    }

    pub async fn on_complete(&self, ctx: &CallbackContext, completion: &NodeCompletion) {
        for cb in &self.callbacks {
            if let Err(e) = cb.on_complete(ctx, completion).await {
                self.report(ctx, cb.as_ref(), &e);
            }
        }
    }

    fn report(&self, ctx: &CallbackContext, cb: &dyn NodeCallback, error: &FlowError) {
        warn!(
            job_id = %ctx.job_id,
            node_id = %ctx.node_id,
            callback = cb.name(),
            stage = cb.stage().as_str(),
            error = %error,
            "Callback failed, skipping"
        );
        if let Some(bus) = &self.bus {
            bus.emit(
                &ctx.job_id,
                &FlowEvent::CallbackError {
                    node_id: ctx.node_id.clone(),
                    stage: cb.stage().as_str().to_string(),
                    error: error.to_string(),
                },
            );
        }
    }
}

/// Validation stage wrapper around a guardrail.
pub struct GuardrailCallback {
    guardrail: Arc<dyn Guardrail>,
}

impl GuardrailCallback {
    pub fn new(guardrail: Arc<dyn Guardrail>) -> Self {
        Self { guardrail }
    }
}

impl NodeCallback for GuardrailCallback {
    fn name(&self) -> &str {
        self.guardrail.name()
    }

    fn stage(&self) -> Stage {
        Stage::Validation
    }

    fn on_output<'a>(
        &'a self,
        ctx: &'a CallbackContext,
        output: &'a mut Value,
    ) -> BoxFuture<'a, Result<Option<ValidationOutcome>>> {
        Box::pin(async move {
            let verdict = self.guardrail.validate(output).await?;
            debug!(
                job_id = %ctx.job_id,
                node_id = %ctx.node_id,
                attempt = ctx.attempt,
                valid = verdict.valid,
                guardrail = self.guardrail.name(),
                "Guardrail verdict"
            );
            Ok(Some(verdict))
        })
    }
}

/// Transformation stage: strips code fences and balances JSON in text output.
pub struct CleanOutput;

impl NodeCallback for CleanOutput {
    fn name(&self) -> &str {
        "clean_output"
    }

    fn stage(&self) -> Stage {
        Stage::Transformation
    }

    fn on_output<'a>(
        &'a self,
        _ctx: &'a CallbackContext,
        output: &'a mut Value,
    ) -> BoxFuture<'a, Result<Option<ValidationOutcome>>> {
        Box::pin(async move {
            OutputCleaner::repair_value(output);
            Ok(None)
        })
    }
}

/// Storage stage: writes each attempt's raw output to
/// `{dir}/{job_id}/{node_id}.attempt{n}.json`.
pub struct OutputFiles {
    dir: PathBuf,
}

impl OutputFiles {
    pub fn new(dir: PathBuf) -> Self {
        Self { dir }
    }

    pub fn path_for(&self, ctx: &CallbackContext) -> PathBuf {
        self.dir
            .join(sanitize(ctx.job_id.as_str()))
            .join(format!("{}.attempt{}.json", sanitize(&ctx.node_id), ctx.attempt))
    }
}

impl NodeCallback for OutputFiles {
    fn name(&self) -> &str {
        "output_files"
    }

    fn stage(&self) -> Stage {
        Stage::Storage
    }

    fn on_output<'a>(
        &'a self,
        ctx: &'a CallbackContext,
        output: &'a mut Value,
    ) -> BoxFuture<'a, Result<Option<ValidationOutcome>>> {
        Box::pin(async move {
            let path = self.path_for(ctx);
            if let Some(parent) = path.parent() {
                tokio::fs::create_dir_all(parent).await?;
            }
            let body = serde_json::to_vec_pretty(output)?;
            tokio::fs::write(&path, body).await?;
            debug!(path = %path.display(), "Stored node output");
            Ok(None)
        })
    }
}

/// Keep job and node ids usable as path components.
pub(crate) fn sanitize(name: &str) -> String {
    name.chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::Mutex;

    struct Recorder {
        name: &'static str,
        stage: Stage,
        seen: Arc<Mutex<Vec<String>>>,
        fail: bool,
        verdict: Option<ValidationOutcome>,
    }

    impl Recorder {
        fn new(name: &'static str, stage: Stage, seen: &Arc<Mutex<Vec<String>>>) -> Self {
            Self {
                name,
                stage,
                seen: seen.clone(),
                fail: false,
                verdict: None,
            }
        }
    }

    impl NodeCallback for Recorder {
        fn name(&self) -> &str {
            self.name
        }

        fn stage(&self) -> Stage {
            self.stage
        }

        fn on_output<'a>(
            &'a self,
            _ctx: &'a CallbackContext,
            _output: &'a mut Value,
        ) -> BoxFuture<'a, Result<Option<ValidationOutcome>>> {
            Box::pin(async move {
                self.seen.lock().unwrap().push(self.name.to_string());
                if self.fail {
                    return Err(FlowError::Configuration(format!("{} broke", self.name)));
                }
                Ok(self.verdict.clone())
            })
        }
    }

    fn ctx() -> CallbackContext {
        CallbackContext {
            job_id: JobId::from_str("job"),
            node_id: "node".into(),
            attempt: 1,
        }
    }

    #[tokio::test]
    async fn test_stage_order_regardless_of_insertion() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let pipeline = CallbackPipeline::new()
            .with(Arc::new(Recorder::new("validate", Stage::Validation, &seen)))
            .with(Arc::new(Recorder::new("transform", Stage::Transformation, &seen)))
            .with(Arc::new(Recorder::new("log", Stage::Logging, &seen)))
            .with(Arc::new(Recorder::new("store", Stage::Storage, &seen)))
            .with(Arc::new(Recorder::new("log2", Stage::Logging, &seen)));

        assert_eq!(pipeline.names(), vec!["log", "log2", "store", "transform", "validate"]);
        pipeline.process_output(&ctx(), &mut json!("x")).await;
        assert_eq!(
            *seen.lock().unwrap(),
            vec!["log", "log2", "store", "transform", "validate"]
        );
    }

    #[tokio::test]
    async fn test_failing_non_validation_callback_is_skipped() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let mut broken = Recorder::new("store", Stage::Storage, &seen);
        broken.fail = true;
        let mut validator = Recorder::new("validate", Stage::Validation, &seen);
        validator.verdict = Some(ValidationOutcome::valid(""));

        let pipeline = CallbackPipeline::new()
            .with(Arc::new(broken))
            .with(Arc::new(validator));
        let verdict = pipeline.process_output(&ctx(), &mut json!("x")).await.unwrap();
        assert!(verdict.valid);
        assert_eq!(*seen.lock().unwrap(), vec!["store", "validate"]);
    }

    #[tokio::test]
    async fn test_failing_validator_counts_as_invalid() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let mut validator = Recorder::new("validate", Stage::Validation, &seen);
        validator.fail = true;
        let pipeline = CallbackPipeline::new().with(Arc::new(validator));
        let verdict = pipeline.process_output(&ctx(), &mut json!("x")).await.unwrap();
        assert!(!verdict.valid);
        assert!(verdict.feedback.contains("validate broke"));
    }

    #[tokio::test]
    async fn test_no_validator_no_verdict() {
        let pipeline = CallbackPipeline::new().with(Arc::new(CleanOutput));
        let mut output = json!("```json\n{\"a\": 1}\n```");
        assert!(pipeline.process_output(&ctx(), &mut output).await.is_none());
        assert_eq!(output, json!({"a": 1}));
    }

    #[tokio::test]
    async fn test_output_files() {
        let dir = tempfile::tempdir().unwrap();
        let files = OutputFiles::new(dir.path().to_path_buf());
        let pipeline = CallbackPipeline::new().with(Arc::new(files));
        pipeline.process_output(&ctx(), &mut json!({"k": "v"})).await;

        let written = std::fs::read_to_string(dir.path().join("job").join("node.attempt1.json")).unwrap();
        let parsed: Value = serde_json::from_str(&written).unwrap();
        assert_eq!(parsed["k"], "v");
    }

    #[test]
    fn test_sanitize() {
        assert_eq!(sanitize("../etc/passwd"), "___etc_passwd");
        assert_eq!(sanitize("job-1_a"), "job-1_a");
    }
}
