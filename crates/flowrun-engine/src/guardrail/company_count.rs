use std::collections::BTreeSet;
use std::sync::OnceLock;

use futures::future::BoxFuture;
use regex::Regex;
use serde_json::Value;
use tracing::debug;

use flowrun_core::{FlowError, GuardrailConfig, Result};

use super::{Guardrail, ValidationOutcome};

const TEXT_KEYS: &[&str] = &["content", "raw_output", "output", "text", "result", "response"];

const COMMON_WORDS: &[&str] = &[
    "The", "This", "That", "These", "Those", "Their", "There", "They", "Company", "Corporation",
];

/// Requires text output to name at least `min_companies` distinct companies.
pub struct CompanyCount {
    min_companies: usize,
}

impl CompanyCount {
    pub fn new(min_companies: usize) -> Self {
        Self { min_companies }
    }

    pub fn from_config(config: &GuardrailConfig) -> Result<Self> {
        let min = match config.parameters.get("min_companies") {
            None | Some(Value::Null) => 50,
            Some(Value::Number(n)) => n.as_u64().ok_or_else(|| {
                FlowError::Configuration(format!(
                    "company_count: min_companies must be a non-negative integer, got {}",
                    n
                ))
            })? as usize,
            Some(other) => {
                return Err(FlowError::Configuration(format!(
                    "company_count: min_companies must be an integer, got {}",
                    other
                )))
            }
        };
        Ok(Self::new(min))
    }

    fn check(&self, output: &Value) -> ValidationOutcome {
        let text = company_text(output);
        if text.trim().is_empty() {
            return ValidationOutcome::invalid(format!(
                "No content found in the output. Please provide a detailed list of at least {} companies.",
                self.min_companies
            ));
        }

        let companies = extract_companies(&text);
        debug!(found = companies.len(), min = self.min_companies, "company_count check");
        if companies.len() >= self.min_companies {
            ValidationOutcome::valid("")
        } else {
            ValidationOutcome::invalid(format!(
                "Your response only includes {} companies, but at least {} are required. \
                 Please try again and provide more company names.",
                companies.len(),
                self.min_companies
            ))
        }
    }
}

impl Guardrail for CompanyCount {
    fn name(&self) -> &str {
        "company_count"
    }

    fn validate<'a>(&'a self, output: &'a Value) -> BoxFuture<'a, Result<ValidationOutcome>> {
        Box::pin(async move { Ok(self.check(output)) })
    }
}

fn company_text(output: &Value) -> String {
    match output {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        Value::Object(map) => TEXT_KEYS
            .iter()
            .find_map(|k| map.get(*k).and_then(Value::as_str).filter(|s| !s.is_empty()))
            .map(str::to_string)
            .unwrap_or_else(|| serde_json::to_string_pretty(output).unwrap_or_default()),
        other => other.to_string(),
    }
}

fn patterns() -> &'static [Regex] {
    static PATTERNS: OnceLock<Vec<Regex>> = OnceLock::new();
    PATTERNS.get_or_init(|| {
        [
            // Names ending in a legal or industry suffix
            r"\b([A-Z][A-Za-z0-9&'\-\.]*(?:[ \t]+[A-Z&][A-Za-z0-9&'\-\.]*){0,5}[ \t]+(?:Inc|Corp|Corporation|LLC|Ltd|Limited|Co|Company|Group|Holdings|Industries|Technologies|Partners|Solutions|International|Systems|Services|Bank|Insurance|Financial|Capital|Investments|Pharmaceuticals|Energy|Communications|Media|Healthcare|Automotive|AG|GmbH|SA|SARL))\b",
            // Quoted names
            r#"["“]([A-Z][^"”\n]{2,})["”]"#,
            // List items, up to a description separator
            r"(?m)^[ \t]*(?:\d+[.)]|[-*•])[ \t]+([A-Z][A-Za-z0-9&'\-\. ]{2,}?)[ \t]*(?:$|:|\(| - )",
            // Runs of capitalized words
            r"\b([A-Z][a-zA-Z0-9]+(?: [A-Z][a-zA-Z0-9]+){1,5})\b",
        ]
        .iter()
        .filter_map(|p| Regex::new(p).ok())
        .collect()
    })
}

/// Distinct company-like names in `text`.
pub fn extract_companies(text: &str) -> BTreeSet<String> {
    let mut companies = BTreeSet::new();
    for pattern in patterns() {
        for caps in pattern.captures_iter(text) {
            let Some(m) = caps.get(1) else { continue };
            let name = m.as_str().trim().trim_end_matches(['.', ',']).trim();
            if name.chars().count() < 3 || COMMON_WORDS.contains(&name) {
                continue;
            }
            companies.insert(name.to_string());
        }
    }
    companies
}
