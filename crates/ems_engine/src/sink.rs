use async_trait::async_trait;
use chrono::{DateTime, Utc};
use ems_core::{BessSnapshot, ChargingSession, ConnectorStatus};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// A write to durable storage failed. In-memory state stays authoritative;
/// the coordinator retries on the next event for the same session.
#[derive(Debug, Clone, Error)]
#[error("persistence error: {message}")]
pub struct StoreError {
    message: String,
}

impl StoreError {
    pub fn new(source: impl std::fmt::Display) -> Self {
        StoreError {
            message: source.to_string(),
        }
    }
}

/// Site-level power snapshot, appended after every start/stop and sampled
/// on power updates.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PowerMetrics {
    pub timestamp: DateTime<Utc>,
    pub grid_power: f64,
    pub bess_power: f64,
    pub total_allocated: f64,
    pub total_consumed: f64,
    pub available_power: f64,
    pub active_sessions: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditKind {
    SessionStart,
    SessionStop,
    PowerUpdate,
    BessBoost,
    BessCharge,
    Reallocation,
}

impl AuditKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuditKind::SessionStart => "session_start",
            AuditKind::SessionStop => "session_stop",
            AuditKind::PowerUpdate => "power_update",
            AuditKind::BessBoost => "bess_boost",
            AuditKind::BessCharge => "bess_charge",
            AuditKind::Reallocation => "reallocation",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEvent {
    pub timestamp: DateTime<Utc>,
    pub kind: AuditKind,
    pub description: String,
    pub payload: serde_json::Value,
}

/// Write-only persistence seam. No read path belongs here: queries are the
/// HTTP layer's business, against the same tables.
#[async_trait]
pub trait PersistenceSink: Send + Sync {
    /// Upsert the session row on start (and on repair after a failed write).
    async fn record_session_start(&self, session: &ChargingSession) -> Result<(), StoreError>;

    /// Mutate the session row and append a `session_power_updates` history
    /// row.
    async fn record_session_power(&self, session: &ChargingSession) -> Result<(), StoreError>;

    /// Terminal write: completed state, end time, final energy.
    async fn record_session_complete(&self, session: &ChargingSession) -> Result<(), StoreError>;

    async fn record_connector_status(
        &self,
        charger_id: &str,
        connector_id: u32,
        status: ConnectorStatus,
    ) -> Result<(), StoreError>;

    async fn record_power_metrics(&self, metrics: &PowerMetrics) -> Result<(), StoreError>;

    async fn record_bess_snapshot(&self, snapshot: &BessSnapshot) -> Result<(), StoreError>;

    async fn record_event(&self, event: &AuditEvent) -> Result<(), StoreError>;
}
