use std::time::Duration;

use futures::future::BoxFuture;
use futures::StreamExt;
use reqwest::Client;
use serde::Serialize;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use flowrun_core::config::ExecutorConfig;
use flowrun_core::traits::NodeExecutor;
use flowrun_core::{FlowError, NodeRequest, Result};

use super::sse::{SseEvent, SseStream};

/// Remote agent runtime client.
///
/// POSTs one attempt to `{endpoint}/nodes/execute` and reads the reply as
/// server-sent events: `progress` events are forwarded to the bus as they
/// arrive, a single `output` event carries the result and `error` fails the
/// attempt. A plain JSON reply is accepted as the output directly.
pub struct HttpNodeExecutor {
    http: Client,
    endpoint: String,
    api_key: Option<String>,
}

#[derive(Serialize)]
struct ExecuteRequest<'a> {
    job_id: &'a str,
    node_id: &'a str,
    kind: &'a str,
    label: &'a str,
    prompt: String,
    data: &'a flowrun_core::NodeData,
    inputs: &'a std::collections::BTreeMap<String, Value>,
    state: &'a serde_json::Map<String, Value>,
    attempt: u32,
    feedback: &'a [String],
}

impl HttpNodeExecutor {
    pub fn new(config: &ExecutorConfig) -> Result<Self> {
        let http = Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()
            .map_err(|e| FlowError::Http(e.to_string()))?;
        Ok(Self {
            http,
            endpoint: config.endpoint.trim_end_matches('/').to_string(),
            api_key: config.api_key.clone(),
        })
    }

    fn url(&self) -> String {
        format!("{}/nodes/execute", self.endpoint)
    }

    async fn call(&self, request: &NodeRequest, cancel: &CancellationToken) -> Result<Value> {
        if cancel.is_cancelled() {
            return Err(FlowError::Cancelled);
        }
        let body = ExecuteRequest {
            job_id: request.job_id.as_str(),
            node_id: &request.node.id,
            kind: &request.node.kind,
            label: &request.node.data.label,
            prompt: request.prompt(),
            data: &request.node.data,
            inputs: &request.inputs,
            state: &request.state,
            attempt: request.attempt,
            feedback: &request.feedback,
        };

        let mut req = self
            .http
            .post(self.url())
            .header("Accept", "text/event-stream")
            .json(&body);
        if let Some(api_key) = &self.api_key {
            req = req.header("Authorization", format!("Bearer {}", api_key));
        }

        let response = tokio::select! {
            response = req.send() => response.map_err(|e| FlowError::Http(e.to_string()))?,
            _ = cancel.cancelled() => return Err(FlowError::Cancelled),
        };

        if !response.status().is_success() {
            let status = response.status();
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "unknown".to_string());
            return Err(FlowError::NodeExecution {
                node: request.node.id.clone(),
                message: format!("HTTP {}: {}", status, body),
            });
        }

        let is_stream = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .is_some_and(|ct| ct.starts_with("text/event-stream"));
        if !is_stream {
            let text = tokio::select! {
                text = response.text() => text.map_err(|e| FlowError::Http(e.to_string()))?,
                _ = cancel.cancelled() => return Err(FlowError::Cancelled),
            };
            return Ok(parse_output(&text));
        }

        let mut events = SseStream::new(response.bytes_stream());
        loop {
            let next = tokio::select! {
                next = events.next() => next,
                _ = cancel.cancelled() => return Err(FlowError::Cancelled),
            };
            let event = match next {
                Some(Ok(event)) => event,
                Some(Err(e)) => return Err(FlowError::Http(e.to_string())),
                None => {
                    return Err(FlowError::NodeExecution {
                        node: request.node.id.clone(),
                        message: "stream ended without an output event".to_string(),
                    })
                }
            };
            if let Some(output) = self.handle_event(request, event)? {
                return Ok(output);
            }
        }
    }

    fn handle_event(&self, request: &NodeRequest, event: SseEvent) -> Result<Option<Value>> {
        match event.event_type.as_deref() {
            Some("progress") | None => {
                request.progress.emit(event.data);
                Ok(None)
            }
            Some("output") => Ok(Some(parse_output(&event.data))),
            Some("error") => Err(FlowError::NodeExecution {
                node: request.node.id.clone(),
                message: event.data,
            }),
            Some(other) => {
                debug!(node_id = %request.node.id, event = other, "Ignoring unknown executor event");
                Ok(None)
            }
        }
    }
}

/// JSON when the payload parses, otherwise the raw text.
fn parse_output(data: &str) -> Value {
    serde_json::from_str(data).unwrap_or_else(|_| Value::String(data.to_string()))
}

impl NodeExecutor for HttpNodeExecutor {
    fn name(&self) -> &str {
        "http"
    }

    fn execute(&self, request: NodeRequest, cancel: CancellationToken) -> BoxFuture<'_, Result<Value>> {
        Box::pin(async move {
            debug!(
                job_id = %request.job_id,
                node_id = %request.node.id,
                attempt = request.attempt,
                "Dispatching node to agent runtime"
            );
            let result = self.call(&request, &cancel).await;
            if let Err(e) = &result {
                if e.is_failure() {
                    warn!(node_id = %request.node.id, error = %e, "Agent runtime call failed");
                }
            }
            result
        })
    }
}
