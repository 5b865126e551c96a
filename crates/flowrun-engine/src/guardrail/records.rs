use std::sync::Arc;

use futures::future::BoxFuture;
use serde_json::Value;

use flowrun_core::traits::RecordSource;
use flowrun_core::{FlowError, GuardrailConfig, Result};

use super::{Guardrail, ValidationOutcome};

/// What a record-backed guardrail asserts about the data-processing table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordCheck {
    /// `empty_data_processing`
    Empty,
    /// `data_processing`
    AllProcessed,
    /// `data_processing_count`
    MinimumCount(u64),
    /// `company_name_not_null`
    CompanyNamesPresent,
}

impl RecordCheck {
    pub fn tag(&self) -> &'static str {
        match self {
            Self::Empty => "empty_data_processing",
            Self::AllProcessed => "data_processing",
            Self::MinimumCount(_) => "data_processing_count",
            Self::CompanyNamesPresent => "company_name_not_null",
        }
    }

    /// Parse the check for a guardrail tag, reading its parameters.
    pub fn from_config(config: &GuardrailConfig) -> Result<Self> {
        match config.guardrail_type.as_str() {
            "empty_data_processing" => Ok(Self::Empty),
            "data_processing" => Ok(Self::AllProcessed),
            "company_name_not_null" => Ok(Self::CompanyNamesPresent),
            "data_processing_count" => {
                let minimum = match config.parameters.get("minimum_count") {
                    None | Some(Value::Null) => 0,
                    Some(Value::Number(n)) => n.as_u64().ok_or_else(|| {
                        FlowError::Configuration(format!(
                            "data_processing_count: minimum_count must be a non-negative integer, got {}",
                            n
                        ))
                    })?,
                    Some(Value::String(s)) => s.trim().parse::<u64>().map_err(|_| {
                        FlowError::Configuration(format!(
                            "data_processing_count: minimum_count '{}' is not an integer",
                            s
                        ))
                    })?,
                    Some(other) => {
                        return Err(FlowError::Configuration(format!(
                            "data_processing_count: minimum_count must be an integer, got {}",
                            other
                        )))
                    }
                };
                Ok(Self::MinimumCount(minimum))
            }
            other => Err(FlowError::Configuration(format!(
                "not a record guardrail: {}",
                other
            ))),
        }
    }
}

/// Guardrail that ignores the node output and checks the record source.
pub struct RecordGuardrail {
    check: RecordCheck,
    source: Arc<dyn RecordSource>,
}

impl RecordGuardrail {
    pub fn new(check: RecordCheck, source: Arc<dyn RecordSource>) -> Self {
        Self { check, source }
    }

    async fn run(&self) -> Result<ValidationOutcome> {
        let stats = self.source.record_stats().await.map_err(|e| {
            FlowError::Database(format!("{}: failed to read records: {}", self.check.tag(), e))
        })?;

        let outcome = match self.check {
            RecordCheck::Empty => {
                if stats.total == 0 {
                    ValidationOutcome::valid("The data_processing table is empty as required.")
                } else {
                    ValidationOutcome::invalid(format!(
                        "The data_processing table contains {} records. The table must be empty to proceed.",
                        stats.total
                    ))
                }
            }
            RecordCheck::AllProcessed => {
                if stats.total == 0 {
                    ValidationOutcome::invalid("No records found in the database. Please ensure data is loaded.")
                } else if stats.unprocessed > 0 {
                    ValidationOutcome::invalid(format!(
                        "There are still {} unprocessed records in the database. Please try again later.",
                        stats.unprocessed
                    ))
                } else {
                    ValidationOutcome::valid("All data records have been processed successfully.")
                }
            }
            RecordCheck::MinimumCount(minimum) => {
                if stats.total >= minimum {
                    ValidationOutcome::valid(format!(
                        "Success: The number of records in the data_processing table ({}) meets or exceeds the minimum count ({}).",
                        stats.total, minimum
                    ))
                } else {
                    ValidationOutcome::invalid(format!(
                        "Insufficient records: The number of records in the data_processing table ({}) is below the minimum count required ({}).",
                        stats.total, minimum
                    ))
                }
            }
            RecordCheck::CompanyNamesPresent => {
                if stats.total == 0 {
                    ValidationOutcome::invalid("No records found in the database. Please ensure data is loaded.")
                } else if stats.null_company_name > 0 {
                    ValidationOutcome::invalid(format!(
                        "There are {} records with null company_name in the database. Please fix these records.",
                        stats.null_company_name
                    ))
                } else {
                    ValidationOutcome::valid("All records have non-null company_name values.")
                }
            }
        };
        Ok(outcome)
    }
}

impl Guardrail for RecordGuardrail {
    fn name(&self) -> &str {
        self.check.tag()
    }

    fn validate<'a>(&'a self, _output: &'a Value) -> BoxFuture<'a, Result<ValidationOutcome>> {
        Box::pin(self.run())
    }
}
