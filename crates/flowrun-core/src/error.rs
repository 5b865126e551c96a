use thiserror::Error;

#[derive(Debug, Error)]
pub enum FlowError {
    // Compile-time errors
    #[error("Graph error: {message} (nodes: {})", nodes.join(", "))]
    Graph { message: String, nodes: Vec<String> },

    #[error("Configuration error: {0}")]
    Configuration(String),

    // Node-level errors
    #[error("Node execution failed: {node}: {message}")]
    NodeExecution { node: String, message: String },

    #[error("Guardrail validation failed for {node}: {feedback}")]
    GuardrailValidation { node: String, feedback: String },

    #[error("Node timeout after {timeout_secs}s: {node}")]
    Timeout { node: String, timeout_secs: u64 },

    #[error("Execution cancelled")]
    Cancelled,

    // Service errors
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Config file not found: {0}")]
    ConfigNotFound(String),

    // Storage errors
    #[error("Database error: {0}")]
    Database(String),

    // Executor transport errors
    #[error("HTTP error: {0}")]
    Http(String),

    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // JSON errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl FlowError {
    /// Shorthand for a graph error over a set of node ids.
    pub fn graph(message: impl Into<String>, nodes: Vec<String>) -> Self {
        FlowError::Graph {
            message: message.into(),
            nodes,
        }
    }

    /// Cancellation is terminal but is not counted as a failure.
    pub fn is_failure(&self) -> bool {
        !matches!(self, FlowError::Cancelled)
    }

    /// Stable kind tag used in node records and events.
    pub fn kind(&self) -> &'static str {
        match self {
            FlowError::Graph { .. } => "graph_error",
            FlowError::Configuration(_) | FlowError::ConfigNotFound(_) => "configuration_error",
            FlowError::NodeExecution { .. } => "node_execution_error",
            FlowError::GuardrailValidation { .. } => "guardrail_validation_error",
            FlowError::Timeout { .. } => "timeout_error",
            FlowError::Cancelled => "cancellation",
            FlowError::NotFound(_) => "not_found",
            FlowError::Conflict(_) => "conflict",
            FlowError::InvalidInput(_) => "invalid_input",
            FlowError::Database(_) => "database_error",
            FlowError::Http(_) => "http_error",
            FlowError::Io(_) => "io_error",
            FlowError::Json(_) => "json_error",
        }
    }
}

pub type Result<T> = std::result::Result<T, FlowError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_graph_error_lists_nodes() {
        let err = FlowError::graph("cycle detected", vec!["a".into(), "b".into()]);
        assert_eq!(err.to_string(), "Graph error: cycle detected (nodes: a, b)");
        assert_eq!(err.kind(), "graph_error");
    }

    #[test]
    fn test_cancelled_is_not_failure() {
        assert!(!FlowError::Cancelled.is_failure());
        assert!(FlowError::Timeout {
            node: "a".into(),
            timeout_secs: 3
        }
        .is_failure());
    }
}
