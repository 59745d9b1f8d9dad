use axum::{routing::get, Router};
use pylon_broker::Broker;
use pylon_core::PylonConfig;
use std::sync::Arc;

/// Central shared state — passed as Arc<AppState> to all Axum handlers.
pub struct AppState {
    pub config: PylonConfig,
    pub broker: Broker,
}

impl AppState {
    pub fn new(config: PylonConfig, broker: Broker) -> Self {
        Self { config, broker }
    }
}

/// Assemble the full Axum router. Both transports share the one broker.
pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(crate::http::health::health_handler))
        .route("/ws", get(crate::ws::connection::client_ws_handler))
        .route("/ws/sender", get(crate::ws::connection::sender_ws_handler))
        .route("/channels/{channels}", get(crate::http::longpoll::poll_handler))
        .with_state(state)
        .layer(tower_http::trace::TraceLayer::new_for_http())
}
