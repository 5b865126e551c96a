//! Output guardrails.
//!
//! A guardrail inspects one node attempt's output and either accepts it or
//! returns feedback that is handed to the next attempt. Guardrails are built
//! from a node's `guardrail` JSON by the [`GuardrailRegistry`].

pub mod company_count;
pub mod minimum_number;
pub mod output_shape;
pub mod records;
pub mod registry;

use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use flowrun_core::Result;

pub use company_count::CompanyCount;
pub use minimum_number::MinimumNumber;
pub use output_shape::{OutputCleaner, RequiredKeys};
pub use records::{RecordCheck, RecordGuardrail};
pub use registry::{GuardrailDeps, GuardrailRegistry};

/// Verdict on one attempt's output.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationOutcome {
    pub valid: bool,
    pub feedback: String,
}

impl ValidationOutcome {
    pub fn valid(feedback: impl Into<String>) -> Self {
        Self {
            valid: true,
            feedback: feedback.into(),
        }
    }

    pub fn invalid(feedback: impl Into<String>) -> Self {
        Self {
            valid: false,
            feedback: feedback.into(),
        }
    }

    /// Combine several verdicts: valid only if every one is, feedback of the
    /// failing ones joined in order.
    pub fn combine(outcomes: Vec<ValidationOutcome>) -> Self {
        let failed: Vec<&str> = outcomes
            .iter()
            .filter(|o| !o.valid)
            .map(|o| o.feedback.as_str())
            .collect();
        if failed.is_empty() {
            let feedback = outcomes
                .iter()
                .map(|o| o.feedback.as_str())
                .filter(|f| !f.is_empty())
                .collect::<Vec<_>>()
                .join("\n");
            Self::valid(feedback)
        } else {
            Self::invalid(failed.join("\n"))
        }
    }
}

/// A validator for node output.
pub trait Guardrail: Send + Sync + 'static {
    /// Registered type tag, used in logs and diagnostics.
    fn name(&self) -> &str;

    fn validate<'a>(&'a self, output: &'a Value) -> BoxFuture<'a, Result<ValidationOutcome>>;
}

/// Text view of an output: strings as-is, everything else as compact JSON.
pub fn output_text(output: &Value) -> String {
    match output {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}
