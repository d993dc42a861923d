use axum::{
    Json,
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
};
use chrono::Utc;
use ems_core::SessionError;
use ems_engine::{EngineError, EngineHandle, PowerUpdateRequest, SessionStartRequest};
use serde::{Deserialize, Serialize};

#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateSessionRequest {
    pub charger_id: String,
    pub connector_id: u32,
    pub vehicle_max_power: f64,
    #[serde(default)]
    pub user_id: Option<String>,
    #[serde(default)]
    pub rfid_tag: Option<String>,
}

#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StopSessionRequest {
    pub consumed_energy: f64,
}

#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StopSessionResponse {
    pub success: bool,
}

#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PowerUpdateBody {
    pub consumed_power: f64,
    pub vehicle_max_power: f64,
    #[serde(default)]
    pub total_energy: Option<f64>,
    #[serde(default)]
    pub vehicle_soc: Option<f64>,
}

#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PowerUpdateResponse {
    pub new_allocated_power: f64,
}

#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorResponse {
    pub error: String,
}

fn engine_error_to_response(error: EngineError) -> impl IntoResponse {
    let status = match &error {
        EngineError::Session(SessionError::UnknownCharger { .. })
        | EngineError::Session(SessionError::UnknownConnector { .. })
        | EngineError::Session(SessionError::SessionNotFound { .. }) => StatusCode::NOT_FOUND,
        EngineError::Session(SessionError::ConnectorBusy { .. })
        | EngineError::Session(SessionError::StaleUpdate { .. }) => StatusCode::CONFLICT,
        EngineError::Unavailable => StatusCode::SERVICE_UNAVAILABLE,
    };
    (
        status,
        Json(ErrorResponse {
            error: error.to_string(),
        }),
    )
}

/// Create a new charging session
pub async fn create_session(
    State(handle): State<EngineHandle>,
    Json(payload): Json<CreateSessionRequest>,
) -> impl IntoResponse {
    let request = SessionStartRequest {
        session_id: None,
        charger_id: payload.charger_id,
        connector_id: payload.connector_id,
        vehicle_max_power: payload.vehicle_max_power,
        user_id: payload.user_id,
        rfid_tag: payload.rfid_tag,
        timestamp: Utc::now(),
        announce: true,
    };
    match handle.start_session(request).await {
        Ok(started) => (StatusCode::OK, Json(started)).into_response(),
        Err(error) => engine_error_to_response(error).into_response(),
    }
}

/// Stop an existing charging session
pub async fn stop_session(
    State(handle): State<EngineHandle>,
    Path(session_id): Path<String>,
    Json(payload): Json<StopSessionRequest>,
) -> impl IntoResponse {
    match handle
        .stop_session(session_id, payload.consumed_energy)
        .await
    {
        Ok(()) => (StatusCode::OK, Json(StopSessionResponse { success: true })).into_response(),
        Err(error) => engine_error_to_response(error).into_response(),
    }
}

/// Report consumption for an existing session and get the corrected limit
pub async fn power_update(
    State(handle): State<EngineHandle>,
    Path(session_id): Path<String>,
    Json(payload): Json<PowerUpdateBody>,
) -> impl IntoResponse {
    let request = PowerUpdateRequest {
        session_id,
        consumed_power: payload.consumed_power,
        vehicle_max_power: payload.vehicle_max_power,
        total_energy: payload.total_energy,
        vehicle_soc: payload.vehicle_soc,
        timestamp: Utc::now(),
    };
    match handle.power_update(request).await {
        Ok(new_allocated_power) => (
            StatusCode::OK,
            Json(PowerUpdateResponse {
                new_allocated_power,
            }),
        )
            .into_response(),
        Err(error) => engine_error_to_response(error).into_response(),
    }
}
