use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::event::ProgressSink;

/// External correlation key for one execution run.
#[derive(Debug, Clone, Hash, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(pub String);

impl JobId {
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn from_str(s: &str) -> Self {
        Self(s.to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for JobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Lifecycle status shared by flow executions and node executions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExecutionStatus {
    Pending,
    Preparing,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl ExecutionStatus {
    fn rank(self) -> u8 {
        match self {
            Self::Pending => 0,
            Self::Preparing => 1,
            Self::Running => 2,
            Self::Completed | Self::Failed | Self::Cancelled => 3,
        }
    }

    pub fn is_terminal(self) -> bool {
        self.rank() == 3
    }

    /// Transitions only move forward; terminal states never change.
    pub fn can_transition_to(self, next: ExecutionStatus) -> bool {
        next.rank() > self.rank()
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::Preparing => "PREPARING",
            Self::Running => "RUNNING",
            Self::Completed => "COMPLETED",
            Self::Failed => "FAILED",
            Self::Cancelled => "CANCELLED",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_uppercase().as_str() {
            "PENDING" => Some(Self::Pending),
            "PREPARING" => Some(Self::Preparing),
            "RUNNING" => Some(Self::Running),
            "COMPLETED" => Some(Self::Completed),
            "FAILED" => Some(Self::Failed),
            "CANCELLED" => Some(Self::Cancelled),
            _ => None,
        }
    }
}

impl std::fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Guardrail attached to a task node.
///
/// Wire form is `{"type": "<tag>", ...parameters}`. A bare JSON string is
/// accepted as well: either an encoded object or just the type tag.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "RawGuardrail")]
pub struct GuardrailConfig {
    #[serde(rename = "type")]
    pub guardrail_type: String,
    #[serde(flatten)]
    pub parameters: serde_json::Map<String, serde_json::Value>,
}

/// Accepted wire shapes for a guardrail.
#[derive(Deserialize)]
#[serde(untagged)]
pub enum RawGuardrail {
    Text(String),
    Object(serde_json::Map<String, serde_json::Value>),
}

impl TryFrom<RawGuardrail> for GuardrailConfig {
    type Error = String;

    fn try_from(raw: RawGuardrail) -> std::result::Result<Self, Self::Error> {
        let mut map = match raw {
            RawGuardrail::Object(map) => map,
            RawGuardrail::Text(text) => match serde_json::from_str::<serde_json::Value>(&text) {
                Ok(serde_json::Value::Object(map)) => map,
                _ => {
                    let tag = text.trim();
                    if tag.is_empty() {
                        return Err("guardrail type is empty".to_string());
                    }
                    return Ok(GuardrailConfig::new(tag));
                }
            },
        };
        match map.remove("type") {
            Some(serde_json::Value::String(t)) if !t.trim().is_empty() => Ok(GuardrailConfig {
                guardrail_type: t,
                parameters: map,
            }),
            _ => Err("guardrail config requires a string \"type\" field".to_string()),
        }
    }
}

impl GuardrailConfig {
    pub fn new(guardrail_type: impl Into<String>) -> Self {
        Self {
            guardrail_type: guardrail_type.into(),
            parameters: serde_json::Map::new(),
        }
    }

    pub fn with_param(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.parameters.insert(key.into(), value);
        self
    }
}

/// Per-node payload carried under `data` in the flow wire format.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NodeData {
    #[serde(default)]
    pub label: String,
    #[serde(default, rename = "listenTo", alias = "listen_to", skip_serializing_if = "Vec::is_empty")]
    pub listen_to: Vec<String>,
    #[serde(default, rename = "routerCondition", alias = "router_condition", skip_serializing_if = "Option::is_none")]
    pub router_condition: Option<String>,
    #[serde(default, rename = "stateType", alias = "state_type", skip_serializing_if = "Option::is_none")]
    pub state_type: Option<String>,
    #[serde(default, rename = "stateDefinition", alias = "state_definition", skip_serializing_if = "Option::is_none")]
    pub state_definition: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub guardrail: Option<GuardrailConfig>,
    #[serde(default, alias = "maxRetryLimit", skip_serializing_if = "Option::is_none")]
    pub max_retry_limit: Option<u32>,
    /// Seconds.
    #[serde(default, alias = "maxExecutionTime", skip_serializing_if = "Option::is_none")]
    pub max_execution_time: Option<u64>,
    /// Marks the node as part of an allowed loop construct.
    #[serde(default, rename = "loop", skip_serializing_if = "std::ops::Not::not")]
    pub loop_construct: bool,
    /// Everything else the editor stores (crew name, agent/task refs, ...).
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

/// A node in a stored flow definition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Node {
    pub id: String,
    /// Raw kind tag; resolved by the compiler's kind registry.
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub position: Option<serde_json::Value>,
    #[serde(default)]
    pub data: NodeData,
}

impl Node {
    pub fn new(id: impl Into<String>, kind: impl Into<String>) -> Self {
        let id = id.into();
        Self {
            data: NodeData {
                label: id.clone(),
                ..NodeData::default()
            },
            id,
            kind: kind.into(),
            position: None,
        }
    }

    pub fn agent(id: impl Into<String>) -> Self {
        Self::new(id, "agent")
    }

    pub fn task(id: impl Into<String>) -> Self {
        Self::new(id, "task")
    }

    pub fn router(id: impl Into<String>, condition: impl Into<String>) -> Self {
        let mut node = Self::new(id, "router");
        node.data.router_condition = Some(condition.into());
        node
    }

    pub fn listener(id: impl Into<String>, listen_to: Vec<String>) -> Self {
        let mut node = Self::new(id, "listener");
        node.data.listen_to = listen_to;
        node
    }

    pub fn state(id: impl Into<String>, definition: serde_json::Value) -> Self {
        let mut node = Self::new(id, "state");
        node.data.state_type = Some("structured".to_string());
        node.data.state_definition = Some(definition);
        node
    }

    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.data.label = label.into();
        self
    }

    pub fn with_guardrail(mut self, guardrail: GuardrailConfig) -> Self {
        self.data.guardrail = Some(guardrail);
        self
    }

    pub fn with_max_retry_limit(mut self, limit: u32) -> Self {
        self.data.max_retry_limit = Some(limit);
        self
    }

    pub fn with_max_execution_time(mut self, secs: u64) -> Self {
        self.data.max_execution_time = Some(secs);
        self
    }

    pub fn with_loop(mut self) -> Self {
        self.data.loop_construct = true;
        self
    }

    pub fn with_extra(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.data.extra.insert(key.into(), value);
        self
    }
}

/// A control-flow edge between two nodes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Edge {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub source: String,
    pub target: String,
    #[serde(default, rename = "sourceHandle", alias = "source_handle", skip_serializing_if = "Option::is_none")]
    pub source_handle: Option<String>,
    #[serde(default, rename = "targetHandle", alias = "target_handle", skip_serializing_if = "Option::is_none")]
    pub target_handle: Option<String>,
}

impl Edge {
    pub fn new(source: impl Into<String>, target: impl Into<String>) -> Self {
        Self {
            id: None,
            source: source.into(),
            target: target.into(),
            source_handle: None,
            target_handle: None,
        }
    }

    /// Edge leaving a router through a named handle.
    pub fn branch(
        source: impl Into<String>,
        handle: impl Into<String>,
        target: impl Into<String>,
    ) -> Self {
        let mut edge = Self::new(source, target);
        edge.source_handle = Some(handle.into());
        edge
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FlowConfig {
    #[serde(default)]
    pub actions: Vec<serde_json::Value>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

/// A stored flow: the engine reads it once per execution and never mutates it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlowDefinition {
    pub id: Uuid,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub crew_id: Option<String>,
    #[serde(default)]
    pub nodes: Vec<Node>,
    #[serde(default)]
    pub edges: Vec<Edge>,
    #[serde(default)]
    pub flow_config: FlowConfig,
}

impl FlowDefinition {
    pub fn new(name: impl Into<String>, nodes: Vec<Node>, edges: Vec<Edge>) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            crew_id: None,
            nodes,
            edges,
            flow_config: FlowConfig::default(),
        }
    }
}

/// Per-execution overrides supplied with a start request.
///
/// When no flow id is given, `nodes`/`edges`/`flow_config` describe an
/// inline flow that runs under the nil flow id.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExecutionConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_parallel: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub continue_on_error: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeouts_always_fatal: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_retry_limit: Option<u32>,
    /// Seconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_execution_time: Option<u64>,
    /// Initial flow state, visible to router conditions as `state.*`.
    #[serde(default, skip_serializing_if = "serde_json::Map::is_empty")]
    pub inputs: serde_json::Map<String, serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub flow_name: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub nodes: Vec<Node>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub edges: Vec<Edge>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub flow_config: Option<FlowConfig>,
}

impl ExecutionConfig {
    pub fn has_inline_flow(&self) -> bool {
        !self.nodes.is_empty()
    }
}

/// One run of a flow.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlowExecution {
    pub id: i64,
    pub flow_id: Uuid,
    pub job_id: JobId,
    pub status: ExecutionStatus,
    pub config: serde_json::Value,
    pub result: Option<serde_json::Value>,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

/// Execution record of a single node within one flow execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlowNodeExecution {
    pub id: i64,
    pub flow_execution_id: i64,
    pub node_id: String,
    pub status: ExecutionStatus,
    pub attempts: u32,
    pub result: Option<serde_json::Value>,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

/// Fields written when a node record moves forward.
#[derive(Debug, Clone, PartialEq)]
pub struct NodeUpdate {
    pub status: ExecutionStatus,
    pub attempts: u32,
    pub result: Option<serde_json::Value>,
    pub error: Option<String>,
}

/// Execution plus its node records, as returned by the status endpoint.
#[derive(Debug, Clone, Serialize)]
pub struct ExecutionDetail {
    #[serde(flatten)]
    pub execution: FlowExecution,
    pub nodes: Vec<FlowNodeExecution>,
}

impl ExecutionDetail {
    pub fn node(&self, node_id: &str) -> Option<&FlowNodeExecution> {
        self.nodes.iter().find(|n| n.node_id == node_id)
    }
}

/// Response to a start request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StartedExecution {
    pub execution_id: i64,
    pub job_id: JobId,
    pub status: ExecutionStatus,
    pub message: String,
}

/// One persisted or live event for a job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEvent {
    pub job_id: JobId,
    /// Per-job emission order, assigned at publish time.
    pub sequence: u64,
    pub content: String,
    pub timestamp: DateTime<Utc>,
}

/// Snapshot of the data-processing table consulted by record guardrails.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordStats {
    pub total: u64,
    pub unprocessed: u64,
    pub null_company_name: u64,
}

/// Everything a node executor sees for one attempt.
#[derive(Clone)]
pub struct NodeRequest {
    pub job_id: JobId,
    pub node: Node,
    /// Outputs of completed predecessors, keyed by node id.
    pub inputs: BTreeMap<String, serde_json::Value>,
    /// Flow state at dispatch time.
    pub state: serde_json::Map<String, serde_json::Value>,
    /// 1-based attempt number.
    pub attempt: u32,
    /// Guardrail feedback from earlier attempts, oldest first.
    pub feedback: Vec<String>,
    pub progress: ProgressSink,
}

impl NodeRequest {
    /// Task description for the agent runtime with any guardrail feedback appended.
    pub fn prompt(&self) -> String {
        let mut prompt = self
            .node
            .data
            .extra
            .get("description")
            .and_then(|v| v.as_str())
            .unwrap_or(&self.node.data.label)
            .to_string();

        if !self.inputs.is_empty() {
            prompt.push_str("\n\n## Context\n");
            for (id, value) in &self.inputs {
                let display = match value {
                    serde_json::Value::String(s) => s.clone(),
                    other => other.to_string(),
                };
                prompt.push_str(&format!("**{}**: {}\n", id, display));
            }
        }

        if let Some(last) = self.feedback.last() {
            prompt.push_str("\n\n## Previous attempt was rejected\n");
            prompt.push_str(last);
        }
        prompt
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_transitions_are_monotonic() {
        use ExecutionStatus::*;
        assert!(Pending.can_transition_to(Preparing));
        assert!(Preparing.can_transition_to(Failed));
        assert!(Running.can_transition_to(Cancelled));
        assert!(!Running.can_transition_to(Pending));
        assert!(!Completed.can_transition_to(Failed));
        assert!(!Cancelled.can_transition_to(Completed));
    }

    #[test]
    fn test_status_wire_format() {
        let json = serde_json::to_string(&ExecutionStatus::Completed).unwrap();
        assert_eq!(json, "\"COMPLETED\"");
        assert_eq!(ExecutionStatus::parse("cancelled"), Some(ExecutionStatus::Cancelled));
        assert_eq!(ExecutionStatus::parse("unknown"), None);
    }

    #[test]
    fn test_parse_flow_wire_format() {
        let raw = serde_json::json!({
            "id": "5b8c1e7e-3f5c-4f43-9a4b-2c1a2b3c4d5e",
            "name": "research",
            "nodes": [
                {"id": "a", "type": "agentNode", "position": {"x": 0, "y": 0},
                 "data": {"label": "Research", "crewName": "crew-1"}},
                {"id": "b", "type": "task", "data": {
                    "label": "Store",
                    "listenTo": ["a"],
                    "guardrail": {"type": "minimum_number", "min_value": 5},
                    "max_retry_limit": 1
                }},
                {"id": "r", "type": "router", "data": {"routerCondition": "state.count > 10"}}
            ],
            "edges": [
                {"id": "e1", "source": "a", "target": "b"},
                {"source": "b", "target": "r", "sourceHandle": "out"}
            ]
        });
        let flow: FlowDefinition = serde_json::from_value(raw).unwrap();
        assert_eq!(flow.nodes.len(), 3);
        assert_eq!(flow.nodes[0].kind, "agentNode");
        assert_eq!(flow.nodes[0].data.extra["crewName"], "crew-1");
        assert_eq!(flow.nodes[1].data.listen_to, vec!["a"]);
        let guardrail = flow.nodes[1].data.guardrail.as_ref().unwrap();
        assert_eq!(guardrail.guardrail_type, "minimum_number");
        assert_eq!(guardrail.parameters["min_value"], 5);
        assert_eq!(flow.nodes[1].data.max_retry_limit, Some(1));
        assert_eq!(
            flow.nodes[2].data.router_condition.as_deref(),
            Some("state.count > 10")
        );
        assert_eq!(flow.edges[1].source_handle.as_deref(), Some("out"));
        assert!(flow.flow_config.actions.is_empty());
    }

    #[test]
    fn test_guardrail_from_encoded_string() {
        let g: GuardrailConfig =
            serde_json::from_value(serde_json::json!("{\"type\": \"empty_data_processing\"}"))
                .unwrap();
        assert_eq!(g.guardrail_type, "empty_data_processing");

        let g: GuardrailConfig = serde_json::from_value(serde_json::json!("company_count")).unwrap();
        assert_eq!(g.guardrail_type, "company_count");
        assert!(g.parameters.is_empty());
    }

    #[test]
    fn test_guardrail_requires_type() {
        let err = serde_json::from_value::<GuardrailConfig>(serde_json::json!({"min_value": 3}));
        assert!(err.is_err());
    }

    #[test]
    fn test_guardrail_serializes_flat() {
        let g = GuardrailConfig::new("minimum_number").with_param("min_value", 3.into());
        let json = serde_json::to_value(&g).unwrap();
        assert_eq!(json, serde_json::json!({"type": "minimum_number", "min_value": 3}));
    }

    #[test]
    fn test_request_prompt_appends_feedback() {
        let req = NodeRequest {
            job_id: JobId::from_str("job"),
            node: Node::task("b").with_extra("description", "Count rows".into()),
            inputs: BTreeMap::from([("a".to_string(), serde_json::json!("ten rows"))]),
            state: serde_json::Map::new(),
            attempt: 2,
            feedback: vec!["too few".into(), "still too few".into()],
            progress: ProgressSink::disabled(),
        };
        let prompt = req.prompt();
        assert!(prompt.starts_with("Count rows"));
        assert!(prompt.contains("**a**: ten rows"));
        assert!(prompt.ends_with("still too few"));
    }
}
