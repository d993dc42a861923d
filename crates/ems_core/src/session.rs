use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::SessionError;
use crate::topology::StationConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    Active,
    /// Terminal; a completed session leaves the active registry.
    Completed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectorStatus {
    Available,
    Occupied,
    Reserved,
    Unavailable,
    Faulted,
}

impl ConnectorStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectorStatus::Available => "available",
            ConnectorStatus::Occupied => "occupied",
            ConnectorStatus::Reserved => "reserved",
            ConnectorStatus::Unavailable => "unavailable",
            ConnectorStatus::Faulted => "faulted",
        }
    }
}

/// One active charging session, bound to a single connector.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChargingSession {
    pub session_id: String,
    pub charger_id: String,
    pub connector_id: u32,
    pub status: SessionStatus,
    pub start_time: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_time: Option<DateTime<Utc>>,

    /// Max power the vehicle accepts, refreshed from device reports.
    pub vehicle_max_power: f64,
    /// What the EMS grants; written only by the coordinator.
    pub allocated_power: f64,
    /// Most recent telemetry.
    pub consumed_power: f64,
    /// Limit currently advertised to the connector; mirrors `allocated_power`
    /// after every coordinator transition.
    pub offered_power: f64,
    /// kWh, monotonically non-decreasing.
    pub total_energy: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vehicle_soc: Option<f64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rfid_tag: Option<String>,

    /// Most recent processed device timestamp; older messages are dropped.
    #[serde(skip, default = "Utc::now")]
    pub last_update_at: DateTime<Utc>,
}

impl ChargingSession {
    pub fn new(
        session_id: String,
        charger_id: String,
        connector_id: u32,
        vehicle_max_power: f64,
        start_time: DateTime<Utc>,
    ) -> Self {
        ChargingSession {
            session_id,
            charger_id,
            connector_id,
            status: SessionStatus::Active,
            start_time,
            end_time: None,
            vehicle_max_power,
            allocated_power: 0.0,
            consumed_power: 0.0,
            offered_power: 0.0,
            total_energy: 0.0,
            vehicle_soc: None,
            user_id: None,
            rfid_tag: None,
            last_update_at: start_time,
        }
    }

    pub fn allocation(&self) -> PowerAllocation {
        PowerAllocation {
            session_id: self.session_id.clone(),
            charger_id: self.charger_id.clone(),
            connector_id: self.connector_id,
            allocated_power: self.allocated_power,
            consumed_power: self.consumed_power,
            vehicle_max_power: self.vehicle_max_power,
        }
    }
}

/// One row of the allocator's output vector.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PowerAllocation {
    pub session_id: String,
    pub charger_id: String,
    pub connector_id: u32,
    pub allocated_power: f64,
    pub consumed_power: f64,
    pub vehicle_max_power: f64,
}

/// In-memory map of live sessions plus per-connector occupancy. Written by
/// exactly one owner, the coordinator.
#[derive(Debug)]
pub struct SessionRegistry {
    sessions: HashMap<String, ChargingSession>,
    connector_status: HashMap<(String, u32), ConnectorStatus>,
}

impl SessionRegistry {
    pub fn new(config: &StationConfig) -> Self {
        let connector_status = config
            .chargers
            .iter()
            .flat_map(|charger| {
                charger.connectors.iter().map(|connector| {
                    (
                        (charger.id.clone(), connector.connector_id),
                        ConnectorStatus::Available,
                    )
                })
            })
            .collect();
        SessionRegistry {
            sessions: HashMap::new(),
            connector_status,
        }
    }

    /// Admit a new active session, enforcing connector exclusivity.
    pub fn start(&mut self, session: ChargingSession) -> Result<(), SessionError> {
        let occupied = self.sessions.values().any(|s| {
            s.charger_id == session.charger_id && s.connector_id == session.connector_id
        });
        if occupied {
            return Err(SessionError::ConnectorBusy {
                charger_id: session.charger_id,
                connector_id: session.connector_id,
            });
        }
        self.connector_status.insert(
            (session.charger_id.clone(), session.connector_id),
            ConnectorStatus::Occupied,
        );
        self.sessions.insert(session.session_id.clone(), session);
        Ok(())
    }

    /// Remove a session from the active set and release its connector.
    /// Returns the terminal record.
    pub fn complete(
        &mut self,
        session_id: &str,
        end_time: DateTime<Utc>,
        total_energy: f64,
    ) -> Result<ChargingSession, SessionError> {
        let mut session =
            self.sessions
                .remove(session_id)
                .ok_or_else(|| SessionError::SessionNotFound {
                    session_id: session_id.to_string(),
                })?;
        session.status = SessionStatus::Completed;
        session.end_time = Some(end_time);
        session.total_energy = total_energy;
        self.connector_status.insert(
            (session.charger_id.clone(), session.connector_id),
            ConnectorStatus::Available,
        );
        Ok(session)
    }

    pub fn get(&self, session_id: &str) -> Option<&ChargingSession> {
        self.sessions.get(session_id)
    }

    pub fn get_mut(&mut self, session_id: &str) -> Option<&mut ChargingSession> {
        self.sessions.get_mut(session_id)
    }

    pub fn contains(&self, session_id: &str) -> bool {
        self.sessions.contains_key(session_id)
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    pub fn sessions(&self) -> impl Iterator<Item = &ChargingSession> {
        self.sessions.values()
    }

    /// Sessions in stable `session_id` order, the order the allocator uses.
    pub fn sessions_sorted(&self) -> Vec<&ChargingSession> {
        let mut sessions: Vec<&ChargingSession> = self.sessions.values().collect();
        sessions.sort_by(|a, b| a.session_id.cmp(&b.session_id));
        sessions
    }

    pub fn active_on_charger(&self, charger_id: &str) -> usize {
        self.sessions
            .values()
            .filter(|s| s.charger_id == charger_id)
            .count()
    }

    pub fn connector_status(&self, charger_id: &str, connector_id: u32) -> Option<ConnectorStatus> {
        self.connector_status
            .get(&(charger_id.to_string(), connector_id))
            .copied()
    }

    /// Write the allocator's output back: `allocated` and the advertised
    /// `offered` limit move together.
    pub fn apply_allocations(&mut self, allocations: &[PowerAllocation]) {
        for allocation in allocations {
            if let Some(session) = self.sessions.get_mut(&allocation.session_id) {
                session.allocated_power = allocation.allocated_power;
                session.offered_power = allocation.allocated_power;
            }
        }
    }

    pub fn total_consumed(&self) -> f64 {
        self.sessions.values().map(|s| s.consumed_power).sum()
    }

    pub fn total_allocated(&self) -> f64 {
        self.sessions.values().map(|s| s.allocated_power).sum()
    }
}
