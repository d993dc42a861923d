//! Wire schemas. Devices speak snake_case JSON with ISO-8601 timestamps;
//! consumers tolerate missing optional fields.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Free-running telemetry from a charger. `power` is in watts on the wire.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChargerTelemetryMessage {
    #[serde(default = "Utc::now")]
    pub timestamp: DateTime<Utc>,
    pub charger_id: String,
    pub connector_id: u32,
    pub voltage: f64,
    pub current: f64,
    /// Instantaneous power in W.
    pub power: f64,
    #[serde(default)]
    pub session_id: Option<String>,
    #[serde(default)]
    pub vehicle_soc: Option<f64>,
    pub status: String,
    #[serde(default)]
    pub temperature: Option<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionStartMessage {
    #[serde(default = "Utc::now")]
    pub timestamp: DateTime<Utc>,
    pub charger_id: String,
    pub connector_id: u32,
    pub session_id: String,
    /// Max power the vehicle accepts, in kW.
    pub vehicle_max_power: f64,
    #[serde(default)]
    pub user_id: Option<String>,
    #[serde(default)]
    pub rfid_tag: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    UserStop,
    VehicleFull,
    Error,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionStopMessage {
    #[serde(default = "Utc::now")]
    pub timestamp: DateTime<Utc>,
    pub charger_id: String,
    pub connector_id: u32,
    pub session_id: String,
    /// Total energy delivered over the session, in kWh.
    pub total_energy: f64,
    pub reason: StopReason,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionUpdateMessage {
    #[serde(default = "Utc::now")]
    pub timestamp: DateTime<Utc>,
    pub charger_id: String,
    pub connector_id: u32,
    pub session_id: String,
    /// kW.
    pub consumed_power: f64,
    /// kW.
    pub vehicle_max_power: f64,
    #[serde(default)]
    pub vehicle_soc: Option<f64>,
    /// kWh since session start.
    pub energy_delivered: f64,
}

/// Battery state report, from `bess/status` or `bess/telemetry`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BessStatusMessage {
    #[serde(default = "Utc::now")]
    pub timestamp: DateTime<Utc>,
    pub soc: f64,
    pub voltage: f64,
    pub current: f64,
    /// kW, positive = discharging.
    pub power: f64,
    pub temperature: f64,
    pub status: String,
    pub available_capacity: f64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    #[default]
    Normal,
    High,
    Low,
}

/// Allocation command for one connector.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PowerLimitCommand {
    pub timestamp: DateTime<Utc>,
    pub charger_id: String,
    pub connector_id: u32,
    /// kW.
    pub power_limit: f64,
    #[serde(default)]
    pub priority: Priority,
}

/// REST-initiated session activation, pushed to the charger.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionStartCommand {
    pub timestamp: DateTime<Utc>,
    pub session_id: String,
    pub connector_id: u32,
    pub vehicle_max_power: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BessCommandMessage {
    pub timestamp: DateTime<Utc>,
    pub command: ems_core::BessCommandKind,
    /// kW, positive magnitude; direction is carried by `command`.
    pub power: f64,
}
