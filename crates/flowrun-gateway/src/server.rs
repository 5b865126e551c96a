use std::sync::Arc;

use axum::routing::{get, post};
use axum::Router;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use tracing::info;

use flowrun_core::config::GatewayConfig;
use flowrun_engine::FlowService;

use crate::routes;
use crate::state::AppState;

/// HTTP + WebSocket gateway over the execution service, built on axum.
pub struct GatewayServer {
    config: GatewayConfig,
    service: Arc<FlowService>,
}

impl GatewayServer {
    pub fn new(config: GatewayConfig, service: Arc<FlowService>) -> Self {
        Self { config, service }
    }

    /// Run the gateway server until the cancellation token is triggered.
    pub async fn run(&self, shutdown: CancellationToken) -> anyhow::Result<()> {
        let state = Arc::new(AppState {
            config: self.config.clone(),
            service: self.service.clone(),
        });
        let app = router(state);

        let listener = TcpListener::bind(&self.config.bind).await?;
        info!(bind = %self.config.bind, "Gateway listening");

        axum::serve(listener, app)
            .with_graceful_shutdown(async move { shutdown.cancelled().await })
            .await?;

        info!("Gateway shut down");
        Ok(())
    }
}

pub(crate) fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/api/health", get(routes::health))
        // Executions
        .route("/api/flow-executions", post(routes::start_execution))
        .route("/api/flow-executions/{id}", get(routes::get_execution))
        .route("/api/flow-executions/by-job/{job_id}", get(routes::get_execution_by_job))
        .route("/api/flow-executions/by-flow/{flow_id}", get(routes::list_by_flow))
        .route("/api/flow-executions/{id}/cancel", post(routes::cancel_execution))
        .route("/api/flow-executions/{id}/logs", get(routes::execution_logs))
        // Logs
        .route("/api/logs/{job_id}/count", get(routes::log_count))
        .route("/api/logs/{job_id}/stream", get(routes::stream_logs))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

#[cfg(test)]
mod tests {
    use super::*;

    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use serde_json::{json, Value};
    use tower::ServiceExt;

    use flowrun_core::config::{EngineConfig, EventsConfig};
    use flowrun_core::EventBus;
    use flowrun_engine::{FlowRunner, GuardrailRegistry};
    use flowrun_test_utils::{linear_flow, memory_store, MockExecutor};

    fn app() -> (Router, Arc<FlowService>, Arc<flowrun_store::SqliteStore>) {
        let store = memory_store();
        let bus = Arc::new(EventBus::new(EventsConfig::default(), store.clone()));
        let runner = FlowRunner::new(
            Arc::new(MockExecutor::new()),
            store.clone(),
            bus,
            Arc::new(GuardrailRegistry::with_builtins(None)),
        );
        let service = Arc::new(FlowService::new(
            runner,
            store.clone(),
            store.clone(),
            EngineConfig::default(),
        ));
        let state = Arc::new(AppState {
            config: GatewayConfig::default(),
            service: service.clone(),
        });
        (router(state), service, store)
    }

    async fn send(app: &Router, method: &str, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
        let request = Request::builder()
            .method(method)
            .uri(uri)
            .header("content-type", "application/json")
            .body(match body {
                Some(b) => Body::from(b.to_string()),
                None => Body::empty(),
            })
            .unwrap();
        let response = app.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let value = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap_or(Value::Null)
        };
        (status, value)
    }

    fn inline_flow() -> Value {
        json!({
            "job_id": "gw-job",
            "config": {
                "nodes": [
                    {"id": "a", "type": "agent", "data": {"label": "A"}},
                    {"id": "b", "type": "task", "data": {"label": "B"}}
                ],
                "edges": [{"source": "a", "target": "b"}]
            }
        })
    }

    #[tokio::test]
    async fn test_health() {
        let (app, _, _) = app();
        let (status, body) = send(&app, "GET", "/api/health", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "ok");
    }

    #[tokio::test]
    async fn test_start_and_get_inline_execution() {
        let (app, service, _) = app();
        let (status, started) = send(&app, "POST", "/api/flow-executions", Some(inline_flow())).await;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(started["status"], "PENDING");
        assert_eq!(started["job_id"], "gw-job");
        let id = started["execution_id"].as_i64().unwrap();

        service.wait(id).await.unwrap();

        let (status, detail) = send(&app, "GET", &format!("/api/flow-executions/{}", id), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(detail["status"], "COMPLETED");
        assert_eq!(detail["nodes"].as_array().unwrap().len(), 2);

        let (status, by_job) = send(&app, "GET", "/api/flow-executions/by-job/gw-job", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(by_job["id"], id);

        let (status, cancelled) =
            send(&app, "POST", &format!("/api/flow-executions/{}/cancel", id), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(cancelled["status"], "COMPLETED");
    }

    #[tokio::test]
    async fn test_logs_pagination_and_limits() {
        let (app, service, _) = app();
        let (_, started) = send(&app, "POST", "/api/flow-executions", Some(inline_flow())).await;
        let id = started["execution_id"].as_i64().unwrap();
        service.wait(id).await.unwrap();

        let (status, all) = send(&app, "GET", &format!("/api/flow-executions/{}/logs", id), None).await;
        assert_eq!(status, StatusCode::OK);
        let total = all["logs"].as_array().unwrap().len();
        assert!(total > 2);

        let (_, page) = send(
            &app,
            "GET",
            &format!("/api/flow-executions/{}/logs?limit=2&offset=1", id),
            None,
        )
        .await;
        let page = page["logs"].as_array().unwrap().clone();
        assert_eq!(page.len(), 2);
        assert_eq!(page[0], all["logs"][1]);

        let (status, body) = send(
            &app,
            "GET",
            &format!("/api/flow-executions/{}/logs?limit=0", id),
            None,
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["kind"], "invalid_input");

        let (status, count) = send(&app, "GET", "/api/logs/gw-job/count", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(count["count"].as_u64().unwrap() as usize, total);
    }

    #[tokio::test]
    async fn test_error_statuses() {
        let (app, _, _) = app();
        let (status, body) = send(&app, "GET", "/api/flow-executions/999", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["kind"], "not_found");

        let (status, _) = send(&app, "POST", "/api/flow-executions", Some(json!({}))).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let missing = json!({ "flow_id": uuid::Uuid::new_v4() });
        let (status, _) = send(&app, "POST", "/api/flow-executions", Some(missing)).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_stored_flow_listing() {
        let (app, service, store) = app();
        let flow = linear_flow();
        store.save_flow(&flow).unwrap();

        let (status, started) = send(
            &app,
            "POST",
            "/api/flow-executions",
            Some(json!({ "flow_id": flow.id })),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);
        service.wait(started["execution_id"].as_i64().unwrap()).await.unwrap();

        let (status, listed) = send(
            &app,
            "GET",
            &format!("/api/flow-executions/by-flow/{}", flow.id),
            None,
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        let executions = listed["executions"].as_array().unwrap();
        assert_eq!(executions.len(), 1);
        assert_eq!(executions[0]["status"], "COMPLETED");
    }
}
