use std::sync::OnceLock;

use futures::future::BoxFuture;
use regex::{Regex, RegexBuilder};
use serde_json::{Map, Value};
use tracing::debug;

use flowrun_core::{FlowError, GuardrailConfig, Result};

use super::{Guardrail, ValidationOutcome};

/// Keys checked for count-like fields inside `metadata` and nested objects.
const COUNT_KEYS: &[&str] = &["count", "total_count", "items_count", "results_count", "size", "length"];

/// Fields whose value may be derived from the length of a `results` array.
const RESULTS_LEN_FIELDS: &[&str] = &["count", "total_count", "results_count", "length", "size"];

/// Fields for which count-related keys are tried as aliases.
const COUNT_ALIAS_FIELDS: &[&str] = &["count", "total_count", "items", "results"];

/// Substrings that make a field count-like for the text phrase patterns.
const COUNT_TERMS: &[&str] = &["count", "total", "items", "results", "matches", "size", "length"];

const NUMBER: &str = r"([0-9]+(?:\.[0-9]+)?)";

/// Requires a numeric field in the output to reach a minimum.
///
/// Parameters: `min_value` (default 1), `field_name` (default
/// `total_count`) and an optional `message` used as feedback when the
/// value is too small.
pub struct MinimumNumber {
    min_value: f64,
    field_name: String,
    message: String,
    field_pattern: Regex,
    proximity_pattern: Regex,
}

#[derive(Debug, Clone, PartialEq)]
enum Extracted {
    Number(f64),
    NotNumeric(String),
}

impl MinimumNumber {
    pub fn new(min_value: f64, field_name: impl Into<String>, message: Option<String>) -> Result<Self> {
        let field_name = field_name.into();
        if field_name.is_empty() {
            return Err(FlowError::Configuration(
                "minimum_number: field_name must not be empty".into(),
            ));
        }
        let escaped = regex::escape(&field_name);
        let field_pattern = build(&format!(r#"["']?{}["']?\s*[:=]\s*{}"#, escaped, NUMBER))?;
        let parts: Vec<String> = field_name
            .split('_')
            .filter(|p| !p.is_empty())
            .map(regex::escape)
            .collect();
        let proximity_pattern = build(&format!(
            r"(?:{}|{})[^0-9]*{}",
            escaped,
            parts.join("|"),
            NUMBER
        ))?;
        let message = message.unwrap_or_else(|| {
            format!(
                "The output should contain a '{}' value of at least {}",
                field_name,
                fmt_num(min_value)
            )
        });

        Ok(Self {
            min_value,
            field_name,
            message,
            field_pattern,
            proximity_pattern,
        })
    }

    pub fn from_config(config: &GuardrailConfig) -> Result<Self> {
        let params = &config.parameters;
        let min_value = match params.get("min_value") {
            None | Some(Value::Null) => 1.0,
            Some(Value::Number(n)) => n.as_f64().unwrap_or(1.0),
            Some(Value::String(s)) => s.trim().parse::<f64>().map_err(|_| {
                FlowError::Configuration(format!("minimum_number: min_value '{}' is not a number", s))
            })?,
            Some(other) => {
                return Err(FlowError::Configuration(format!(
                    "minimum_number: min_value must be a number, got {}",
                    other
                )))
            }
        };
        let field_name = params
            .get("field_name")
            .and_then(Value::as_str)
            .unwrap_or("total_count");
        let message = params
            .get("message")
            .and_then(Value::as_str)
            .map(str::to_string);
        Self::new(min_value, field_name, message)
    }

    fn check(&self, output: &Value) -> ValidationOutcome {
        let field = &self.field_name;
        let min = fmt_num(self.min_value);
        match self.extract(output) {
            None => ValidationOutcome::invalid(format!(
                "No {} found in the output. Please include a {} value of at least {}.",
                field, field, min
            )),
            Some(Extracted::NotNumeric(raw)) => ValidationOutcome::invalid(format!(
                "The {} value '{}' is not a valid number. Please provide a numeric value of at least {}.",
                field, raw, min
            )),
            Some(Extracted::Number(value)) => {
                debug!(field = %field, value, min = self.min_value, "minimum_number check");
                if value >= self.min_value {
                    ValidationOutcome::valid("")
                } else {
                    ValidationOutcome::invalid(self.message.clone())
                }
            }
        }
    }

    fn extract(&self, output: &Value) -> Option<Extracted> {
        match output {
            Value::Object(map) => self.from_object(map).map(coerce),
            Value::String(text) => match serde_json::from_str::<Value>(text) {
                Ok(Value::Object(map)) => self.from_object(&map).map(coerce),
                _ => self.from_text(text).map(Extracted::Number),
            },
            Value::Null => None,
            other => self.from_text(&other.to_string()).map(Extracted::Number),
        }
    }

    fn from_object(&self, data: &Map<String, Value>) -> Option<Value> {
        let field = self.field_name.as_str();
        let lower = field.to_lowercase();

        if let Some(v) = data.get(field) {
            return Some(v.clone());
        }

        if RESULTS_LEN_FIELDS.contains(&lower.as_str()) {
            if let Some(Value::Array(results)) = data.get("results") {
                return Some(Value::from(results.len()));
            }
        }

        if let Some(Value::Object(metadata)) = data.get("metadata") {
            if let Some(v) = metadata.get(field) {
                return Some(v.clone());
            }
            if let Some(v) = self.count_alias(metadata, &lower) {
                return Some(v);
            }
        }

        match field {
            "total_count" => {
                if let Some(v) = data.get("count") {
                    return Some(v.clone());
                }
            }
            "count" => {
                if let Some(v) = data.get("total_count") {
                    return Some(v.clone());
                }
            }
            _ => {}
        }

        for value in data.values() {
            if let Value::Object(nested) = value {
                if let Some(v) = nested.get(field) {
                    return Some(v.clone());
                }
                if let Some(v) = self.count_alias(nested, &lower) {
                    return Some(v);
                }
            }
        }

        None
    }

    fn count_alias(&self, data: &Map<String, Value>, lower_field: &str) -> Option<Value> {
        if !COUNT_ALIAS_FIELDS.contains(&lower_field) {
            return None;
        }
        COUNT_KEYS.iter().find_map(|k| data.get(*k).cloned())
    }

    fn from_text(&self, text: &str) -> Option<f64> {
        if text.trim().is_empty() {
            return None;
        }

        if let Some(n) = first_capture(&self.field_pattern, text) {
            return Some(n);
        }

        let lower = self.field_name.to_lowercase();
        if COUNT_TERMS.iter().any(|t| lower.contains(t)) {
            for pattern in count_patterns() {
                if let Some(n) = first_capture(pattern, text) {
                    return Some(n);
                }
            }
        }

        if let Some(n) = first_capture(&self.proximity_pattern, text) {
            return Some(n);
        }

        // Last resort: the largest number above 1, else the largest at all
        let numbers: Vec<f64> = any_number()?
            .captures_iter(text)
            .filter_map(|c| c.get(1)?.as_str().parse::<f64>().ok())
            .collect();
        let significant = numbers.iter().copied().filter(|n| *n > 1.0).fold(None, max_of);
        significant.or_else(|| numbers.iter().copied().fold(None, max_of))
    }
}

impl Guardrail for MinimumNumber {
    fn name(&self) -> &str {
        "minimum_number"
    }

    fn validate<'a>(&'a self, output: &'a Value) -> BoxFuture<'a, Result<ValidationOutcome>> {
        Box::pin(async move { Ok(self.check(output)) })
    }
}

fn build(pattern: &str) -> Result<Regex> {
    RegexBuilder::new(pattern)
        .case_insensitive(true)
        .build()
        .map_err(|e| FlowError::Configuration(format!("invalid guardrail pattern: {}", e)))
}

fn count_patterns() -> &'static [Regex] {
    static PATTERNS: OnceLock<Vec<Regex>> = OnceLock::new();
    PATTERNS.get_or_init(|| {
        [
            r"found\s+([0-9]+(?:\.[0-9]+)?)\s+(?:items?|results?|matches?)",
            r"(?:total|found)(?:\s+count)?:\s*([0-9]+(?:\.[0-9]+)?)",
            r"([0-9]+(?:\.[0-9]+)?)\s+(?:items?|results?|matches?)\s+(?:found|returned)",
            r"results?\s+count:\s*([0-9]+(?:\.[0-9]+)?)",
            r"([0-9]+(?:\.[0-9]+)?)\s+total",
            r"(?:contains|has|with)\s+([0-9]+(?:\.[0-9]+)?)\s+(?:items?|results?|entries|records)",
            r"(?:size|length|count)(?:\s+is)?(?:\s+equal\s+to)?:\s*([0-9]+(?:\.[0-9]+)?)",
        ]
        .iter()
        .filter_map(|p| RegexBuilder::new(p).case_insensitive(true).build().ok())
        .collect()
    })
}

fn any_number() -> Option<&'static Regex> {
    static ANY: OnceLock<Option<Regex>> = OnceLock::new();
    ANY.get_or_init(|| Regex::new(r"\b([0-9]+(?:\.[0-9]+)?)\b").ok())
        .as_ref()
}

fn first_capture(pattern: &Regex, text: &str) -> Option<f64> {
    pattern
        .captures(text)
        .and_then(|c| c.get(1))
        .and_then(|m| m.as_str().parse::<f64>().ok())
}

fn first_integer(text: &str) -> Option<f64> {
    let start = text.find(|c: char| c.is_ascii_digit())?;
    let digits: String = text[start..].chars().take_while(|c| c.is_ascii_digit()).collect();
    digits.parse::<f64>().ok()
}

fn max_of(acc: Option<f64>, n: f64) -> Option<f64> {
    Some(acc.map_or(n, |a| a.max(n)))
}

fn coerce(value: Value) -> Extracted {
    match value {
        Value::Number(n) => n
            .as_f64()
            .map(Extracted::Number)
            .unwrap_or_else(|| Extracted::NotNumeric(n.to_string())),
        Value::String(s) => match s.trim().parse::<f64>() {
            Ok(n) => Extracted::Number(n),
            Err(_) => first_integer(&s)
                .map(Extracted::Number)
                .unwrap_or(Extracted::NotNumeric(s)),
        },
        other => Extracted::NotNumeric(other.to_string()),
    }
}

fn fmt_num(n: f64) -> String {
    if n.fract() == 0.0 && n.abs() < 1e15 {
        format!("{}", n as i64)
    } else {
        n.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn guard(min: f64, field: &str) -> MinimumNumber {
        MinimumNumber::new(min, field, None).unwrap()
    }

    #[test]
    fn test_root_field() {
        let g = guard(10.0, "total_count");
        assert!(g.check(&json!({"total_count": 12})).valid);
        assert!(g.check(&json!({"total_count": 10})).valid);
        let low = g.check(&json!({"total_count": 3}));
        assert!(!low.valid);
        assert_eq!(low.feedback, "The output should contain a 'total_count' value of at least 10");
    }

    #[test]
    fn test_json_string_output() {
        let g = guard(5.0, "total_count");
        assert!(g.check(&Value::String(r#"{"total_count": 7}"#.into())).valid);
    }

    #[test]
    fn test_results_length_and_aliases() {
        let g = guard(2.0, "total_count");
        assert!(g.check(&json!({"results": [1, 2, 3]})).valid);
        assert!(g.check(&json!({"count": 4})).valid);
        assert!(g.check(&json!({"metadata": {"items_count": 9}})).valid);
        assert!(g.check(&json!({"summary": {"total_count": 5}})).valid);
    }

    #[test]
    fn test_string_values_are_coerced() {
        let g = guard(3.0, "total_count");
        assert!(g.check(&json!({"total_count": "42 results"})).valid);
        let bad = g.check(&json!({"total_count": "many"}));
        assert!(!bad.valid);
        assert!(bad.feedback.contains("'many' is not a valid number"));
    }

    #[test]
    fn test_missing_field() {
        let g = guard(3.0, "score");
        let out = g.check(&json!({"other": 1}));
        assert!(!out.valid);
        assert_eq!(
            out.feedback,
            "No score found in the output. Please include a score value of at least 3."
        );
    }

    #[test]
    fn test_text_patterns() {
        let g = guard(10.0, "total_count");
        assert!(g.check(&Value::String("Summary\nTotal_Count = 15".into())).valid);
        assert!(g.check(&Value::String("We found 12 results for the query".into())).valid);
        assert!(!g.check(&Value::String("Search returned 4 items found".into())).valid);
    }

    #[test]
    fn test_text_fallback_largest_number() {
        let g = guard(100.0, "score");
        // "score" never appears, so the largest number wins
        assert!(g.check(&Value::String("between 1 and 250 widgets, maybe 3".into())).valid);
        assert!(!g.check(&Value::String("only 1".into())).valid);
    }

    #[test]
    fn test_custom_message_and_config() {
        let config = GuardrailConfig::new("minimum_number")
            .with_param("min_value", json!(5))
            .with_param("field_name", json!("hits"))
            .with_param("message", json!("need more hits"));
        let g = MinimumNumber::from_config(&config).unwrap();
        let out = g.check(&json!({"hits": 2}));
        assert_eq!(out.feedback, "need more hits");
    }

    #[test]
    fn test_invalid_min_value_is_configuration_error() {
        let config = GuardrailConfig::new("minimum_number").with_param("min_value", json!("lots"));
        assert!(matches!(
            MinimumNumber::from_config(&config),
            Err(FlowError::Configuration(_))
        ));
    }
}
