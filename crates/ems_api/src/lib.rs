//! HTTP façade over the coordinator. Handlers enqueue an event on the
//! coordinator's queue and await its reply; nothing here touches the
//! registry directly.

mod session;
mod station;

use std::time::Duration;

use axum::{
    Router,
    routing::{get, post},
};
use ems_engine::EngineHandle;
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;

/// Health check endpoint
pub async fn health_check() -> &'static str {
    "OK"
}

/// Create the application router with all endpoints
pub fn create_app(handle: EngineHandle) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/station/config", get(station::get_station_config))
        .route("/station/status", get(station::get_station_status))
        .route("/sessions", post(session::create_session))
        .route("/sessions/{session_id}/stop", post(session::stop_session))
        .route(
            "/sessions/{session_id}/power-update",
            post(session::power_update),
        )
        .layer(TraceLayer::new_for_http())
        .layer(TimeoutLayer::new(Duration::from_secs(30)))
        .with_state(handle)
}
