use chrono::{DateTime, Utc};
use ems_core::{BessCommand, ChargingSession, PowerAllocation, SessionError};
use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;

/// Inbound request to open a session. REST callers leave `session_id` empty
/// and get a minted UUID back; device-originated starts carry their own id.
#[derive(Debug, Clone)]
pub struct SessionStartRequest {
    pub session_id: Option<String>,
    pub charger_id: String,
    pub connector_id: u32,
    pub vehicle_max_power: f64,
    pub user_id: Option<String>,
    pub rfid_tag: Option<String>,
    pub timestamp: DateTime<Utc>,
    /// Publish a `session/start_command` so the charger learns about a
    /// REST-initiated session. Device-originated starts already know.
    pub announce: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionStarted {
    pub session_id: String,
    pub allocated_power: f64,
}

#[derive(Debug, Clone)]
pub struct PowerUpdateRequest {
    pub session_id: String,
    pub consumed_power: f64,
    pub vehicle_max_power: f64,
    pub total_energy: Option<f64>,
    pub vehicle_soc: Option<f64>,
    pub timestamp: DateTime<Utc>,
}

/// The coordinator's inbound vocabulary. Every adapter speaks this.
pub enum EmsEvent {
    SessionStart {
        request: SessionStartRequest,
        reply: Option<oneshot::Sender<Result<SessionStarted, SessionError>>>,
    },
    SessionStop {
        session_id: String,
        total_energy: f64,
        reply: Option<oneshot::Sender<Result<(), SessionError>>>,
    },
    PowerUpdate {
        request: PowerUpdateRequest,
        reply: Option<oneshot::Sender<Result<f64, SessionError>>>,
    },
    /// Free-running charger telemetry; refreshes a known session's live
    /// fields, never reallocates.
    ChargerTelemetry {
        charger_id: String,
        connector_id: u32,
        session_id: Option<String>,
        power_kw: f64,
        vehicle_soc: Option<f64>,
        timestamp: DateTime<Utc>,
    },
    BatteryTelemetry {
        soc: f64,
        power: f64,
        timestamp: DateTime<Utc>,
    },
    Status {
        reply: oneshot::Sender<StationStatus>,
    },
}

/// Commands the coordinator hands to the fabric publisher.
#[derive(Debug, Clone, PartialEq)]
pub enum OutboundCommand {
    PowerLimit {
        charger_id: String,
        connector_id: u32,
        power_limit: f64,
    },
    StartSession {
        charger_id: String,
        session_id: String,
        connector_id: u32,
        vehicle_max_power: f64,
    },
    Bess(BessCommand),
}

/// Live snapshot of registry, battery and totals.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StationStatus {
    pub station_id: String,
    pub timestamp: DateTime<Utc>,
    pub grid_capacity: f64,
    pub grid_power: f64,
    pub bess_power: f64,
    #[serde(rename = "bessSOC")]
    pub bess_soc: Option<f64>,
    pub total_allocated: f64,
    pub total_consumed: f64,
    pub active_sessions: usize,
    pub available_power: f64,
    pub fabric_connected: bool,
    pub sessions: Vec<ChargingSession>,
    pub power_allocation: Vec<PowerAllocation>,
}
