use futures::future::BoxFuture;
use serde_json::Value;

use flowrun_core::{FlowError, GuardrailConfig, Result};

use super::{output_text, Guardrail, ValidationOutcome};

/// Validates output structure: a JSON object carrying every required key,
/// within a maximum rendered length.
pub struct RequiredKeys {
    pub keys: Vec<String>,
    /// Maximum allowed output length (characters).
    pub max_length: usize,
}

impl RequiredKeys {
    pub fn new(keys: Vec<String>) -> Self {
        Self {
            keys,
            max_length: 100_000,
        }
    }

    pub fn from_config(config: &GuardrailConfig) -> Result<Self> {
        let keys = match config.parameters.get("keys") {
            None | Some(Value::Null) => Vec::new(),
            Some(Value::Array(items)) => items
                .iter()
                .map(|v| {
                    v.as_str().map(str::to_string).ok_or_else(|| {
                        FlowError::Configuration(format!("required_keys: key must be a string, got {}", v))
                    })
                })
                .collect::<Result<Vec<_>>>()?,
            Some(other) => {
                return Err(FlowError::Configuration(format!(
                    "required_keys: keys must be an array, got {}",
                    other
                )))
            }
        };
        let mut guard = Self::new(keys);
        if let Some(max) = config.parameters.get("max_length").and_then(Value::as_u64) {
            guard.max_length = max as usize;
        }
        Ok(guard)
    }

    /// Issues found in the output, empty when it is acceptable.
    pub fn issues(&self, output: &Value) -> Vec<String> {
        let mut issues = Vec::new();

        let text = output_text(output);
        let len = text.chars().count();
        if len > self.max_length {
            issues.push(format!("Output exceeds max length: {} > {}", len, self.max_length));
        }

        if !self.keys.is_empty() {
            let parsed = match output {
                Value::String(s) => serde_json::from_str::<Value>(&OutputCleaner::heuristic_repair(s))
                    .map_err(|e| format!("Output is not valid JSON: {}", e)),
                other => Ok(other.clone()),
            };
            match parsed {
                Ok(Value::Object(obj)) => {
                    for key in &self.keys {
                        if !obj.contains_key(key) {
                            issues.push(format!("Missing required key: '{}'", key));
                        }
                    }
                }
                Ok(_) => issues.push("Expected JSON object but got non-object".to_string()),
                Err(e) => issues.push(e),
            }
        }

        issues
    }
}

impl Guardrail for RequiredKeys {
    fn name(&self) -> &str {
        "required_keys"
    }

    fn validate<'a>(&'a self, output: &'a Value) -> BoxFuture<'a, Result<ValidationOutcome>> {
        Box::pin(async move {
            let issues = self.issues(output);
            Ok(if issues.is_empty() {
                ValidationOutcome::valid("")
            } else {
                ValidationOutcome::invalid(issues.join("\n"))
            })
        })
    }
}

/// Heuristic cleanup of agent text output.
pub struct OutputCleaner;

impl OutputCleaner {
    /// Apply heuristic repairs to output.
    /// - Strips markdown code fences
    /// - Trims whitespace
    /// - Balances JSON braces
    pub fn heuristic_repair(output: &str) -> String {
        let result = strip_code_fences(output);
        let result = result.trim();
        if result.starts_with('{') || result.starts_with('[') {
            balance_braces(result)
        } else {
            result.to_string()
        }
    }

    /// Repair a string output in place; structured outputs are left alone.
    /// Returns true when the value changed.
    pub fn repair_value(output: &mut Value) -> bool {
        let Value::String(text) = output else {
            return false;
        };
        let repaired = Self::heuristic_repair(text);
        if repaired == *text {
            return false;
        }
        *output = match serde_json::from_str::<Value>(&repaired) {
            Ok(parsed @ (Value::Object(_) | Value::Array(_))) => parsed,
            _ => Value::String(repaired),
        };
        true
    }
}

/// Strip markdown code fences from text.
fn strip_code_fences(text: &str) -> String {
    let trimmed = text.trim();

    if let Some(start) = trimmed.find("```json") {
        let after = &trimmed[start + 7..];
        if let Some(end) = after.find("```") {
            return after[..end].trim().to_string();
        }
    }

    if let Some(start) = trimmed.find("```") {
        let after = &trimmed[start + 3..];
        // Skip optional language tag on same line
        let content_start = after.find('\n').map_or(0, |p| p + 1);
        let after = &after[content_start..];
        if let Some(end) = after.find("```") {
            return after[..end].trim().to_string();
        }
    }

    trimmed.to_string()
}

/// Append missing closers, innermost first.
fn balance_braces(text: &str) -> String {
    let mut open: Vec<char> = Vec::new();
    let mut in_string = false;
    let mut escape_next = false;

    for ch in text.chars() {
        if escape_next {
            escape_next = false;
            continue;
        }
        if ch == '\\' && in_string {
            escape_next = true;
            continue;
        }
        if ch == '"' {
            in_string = !in_string;
            continue;
        }
        if in_string {
            continue;
        }
        match ch {
            '{' => open.push('}'),
            '[' => open.push(']'),
            '}' | ']' => {
                if open.last() == Some(&ch) {
                    open.pop();
                }
            }
            _ => {}
        }
    }

    let mut result = text.to_string();
    if in_string {
        result.push('"');
    }
    while let Some(closer) = open.pop() {
        result.push(closer);
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_heuristic_repair_markdown() {
        let input = "```json\n{\"key\": \"value\", \"count\": 42}\n```";
        assert_eq!(
            OutputCleaner::heuristic_repair(input),
            r#"{"key": "value", "count": 42}"#
        );
    }

    #[test]
    fn test_heuristic_repair_markdown_with_lang() {
        let input = "```python\nprint('hello')\n```";
        assert_eq!(OutputCleaner::heuristic_repair(input), "print('hello')");
    }

    #[test]
    fn test_nested_balancing_closes_in_order() {
        let input = r#"{"items": [{"a": 1"#;
        let result = OutputCleaner::heuristic_repair(input);
        assert_eq!(result, r#"{"items": [{"a": 1}]}"#);
        assert!(serde_json::from_str::<Value>(&result).is_ok());
    }

    #[test]
    fn test_braces_inside_strings_ignored() {
        let input = r#"{"msg": "use { and }", "open": true"#;
        let result = balance_braces(input);
        assert!(serde_json::from_str::<Value>(&result).is_ok());
    }

    #[test]
    fn test_plain_text_unchanged() {
        let mut v = json!("Hello, this is plain text output.");
        assert!(!OutputCleaner::repair_value(&mut v));
    }

    #[test]
    fn test_repair_value_parses_fenced_json() {
        let mut v = json!("```json\n{\"total_count\": 3}\n```");
        assert!(OutputCleaner::repair_value(&mut v));
        assert_eq!(v, json!({"total_count": 3}));
    }

    #[test]
    fn test_required_keys() {
        let guard = RequiredKeys::new(vec!["name".into(), "age".into()]);
        assert!(guard.issues(&json!({"name": "Alice", "age": 30})).is_empty());
        assert!(guard.issues(&json!(r#"{"name": "Alice", "age": 30}"#)).is_empty());

        let issues = guard.issues(&json!({"name": "Alice"}));
        assert_eq!(issues.len(), 1);
        assert!(issues[0].contains("age"));

        let issues = guard.issues(&json!("not json at all"));
        assert!(issues[0].contains("not valid JSON"));

        let issues = guard.issues(&json!([1, 2]));
        assert!(issues[0].contains("non-object"));
    }

    #[test]
    fn test_max_length() {
        let mut guard = RequiredKeys::new(vec![]);
        guard.max_length = 10;
        assert!(guard.issues(&json!("hi")).is_empty());
        let issues = guard.issues(&json!("this is a very long output string"));
        assert!(issues[0].contains("max length"));
    }

    #[test]
    fn test_from_config() {
        let config = GuardrailConfig::new("required_keys")
            .with_param("keys", json!(["summary"]))
            .with_param("max_length", json!(50));
        let guard = RequiredKeys::from_config(&config).unwrap();
        assert_eq!(guard.keys, vec!["summary".to_string()]);
        assert_eq!(guard.max_length, 50);

        let bad = GuardrailConfig::new("required_keys").with_param("keys", json!("summary"));
        assert!(RequiredKeys::from_config(&bad).is_err());
    }
}
