pub mod context;
pub mod coordinator;
pub mod executor;
pub mod graph;
pub mod guardrail;
pub mod pipeline;
pub mod run_log;
pub mod schedule;
pub mod service;

pub use context::ExecutionContext;
pub use coordinator::{FlowRunner, RunJob, RunSettings};
pub use executor::HttpNodeExecutor;
pub use graph::{Condition, ExecutionPlan, GraphCompiler, NodeKind};
pub use guardrail::{Guardrail, GuardrailDeps, GuardrailRegistry, ValidationOutcome};
pub use pipeline::{CallbackPipeline, CleanOutput, GuardrailCallback, NodeCallback, OutputFiles, Stage};
pub use run_log::RunLogger;
pub use service::{FlowService, StartRequest};
