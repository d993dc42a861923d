use axum::{Json, extract::State, http::StatusCode, response::IntoResponse};
use ems_core::StationConfig;
use ems_engine::EngineHandle;

/// Get the station topology as loaded at boot
pub async fn get_station_config(State(handle): State<EngineHandle>) -> Json<StationConfig> {
    Json(handle.config().clone())
}

/// Live snapshot of the registry, battery and site totals
pub async fn get_station_status(State(handle): State<EngineHandle>) -> impl IntoResponse {
    match handle.station_status().await {
        Ok(status) => (StatusCode::OK, Json(status)).into_response(),
        Err(_) => StatusCode::SERVICE_UNAVAILABLE.into_response(),
    }
}
