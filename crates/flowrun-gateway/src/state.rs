use std::sync::Arc;

use flowrun_core::config::GatewayConfig;
use flowrun_engine::FlowService;

/// Shared application state for axum handlers.
pub struct AppState {
    pub config: GatewayConfig,
    pub service: Arc<FlowService>,
}
