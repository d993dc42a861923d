//! SQLite persistence sink. Write-only from the coordinator's point of
//! view: session lifecycle, power-update history, site metrics, battery
//! snapshots and audit events. Queries over these tables belong to the
//! external HTTP layer.

use std::str::FromStr;

use async_trait::async_trait;
use ems_core::{BessSnapshot, ChargingSession, ConnectorStatus, SessionStatus};
use ems_engine::{AuditEvent, PersistenceSink, PowerMetrics, StoreError};
use sqlx::SqlitePool;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};

/// Schema bootstrap. The sink owns its tables; there is no migration story,
/// only idempotent creation at boot.
const SCHEMA: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS sessions (
        session_id TEXT PRIMARY KEY,
        charger_id TEXT NOT NULL,
        connector_id INTEGER NOT NULL,
        status TEXT NOT NULL,
        start_time TEXT NOT NULL,
        end_time TEXT,
        vehicle_max_power REAL NOT NULL,
        allocated_power REAL NOT NULL DEFAULT 0,
        consumed_power REAL NOT NULL DEFAULT 0,
        offered_power REAL NOT NULL DEFAULT 0,
        total_energy REAL NOT NULL DEFAULT 0,
        vehicle_soc REAL,
        user_id TEXT,
        rfid_tag TEXT
    )",
    "CREATE TABLE IF NOT EXISTS session_power_updates (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        session_id TEXT NOT NULL,
        timestamp TEXT NOT NULL,
        consumed_power REAL NOT NULL,
        allocated_power REAL NOT NULL,
        vehicle_max_power REAL NOT NULL
    )",
    "CREATE INDEX IF NOT EXISTS idx_session_power_updates_session
        ON session_power_updates (session_id, timestamp)",
    "CREATE TABLE IF NOT EXISTS power_metrics (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        timestamp TEXT NOT NULL,
        grid_power REAL NOT NULL,
        bess_power REAL NOT NULL DEFAULT 0,
        total_allocated REAL NOT NULL,
        total_consumed REAL NOT NULL,
        available_power REAL NOT NULL,
        active_sessions INTEGER NOT NULL DEFAULT 0
    )",
    "CREATE TABLE IF NOT EXISTS bess_status_logs (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        timestamp TEXT NOT NULL,
        mode TEXT NOT NULL,
        power REAL NOT NULL,
        soc REAL NOT NULL,
        capacity REAL NOT NULL,
        available_energy REAL NOT NULL,
        available_discharge REAL NOT NULL,
        available_charge REAL NOT NULL
    )",
    "CREATE TABLE IF NOT EXISTS events (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        timestamp TEXT NOT NULL,
        event_type TEXT NOT NULL,
        description TEXT NOT NULL,
        payload TEXT
    )",
    "CREATE TABLE IF NOT EXISTS connector_status (
        charger_id TEXT NOT NULL,
        connector_id INTEGER NOT NULL,
        status TEXT NOT NULL,
        updated_at TEXT NOT NULL,
        PRIMARY KEY (charger_id, connector_id)
    )",
];

pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    /// Open (creating if missing) and bootstrap the schema. The pool holds a
    /// single connection: the coordinator is the only writer and SQLite
    /// serialises writes anyway.
    pub async fn connect(url: &str) -> Result<Self, StoreError> {
        let options = SqliteConnectOptions::from_str(url)
            .map_err(StoreError::new)?
            .create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await
            .map_err(StoreError::new)?;
        let store = SqliteStore { pool };
        store.init_schema().await?;
        Ok(store)
    }

    async fn init_schema(&self) -> Result<(), StoreError> {
        for statement in SCHEMA {
            sqlx::query(statement)
                .execute(&self.pool)
                .await
                .map_err(StoreError::new)?;
        }
        Ok(())
    }

    fn status_str(status: SessionStatus) -> &'static str {
        match status {
            SessionStatus::Active => "active",
            SessionStatus::Completed => "completed",
        }
    }
}

#[async_trait]
impl PersistenceSink for SqliteStore {
    async fn record_session_start(&self, session: &ChargingSession) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO sessions (
                session_id, charger_id, connector_id, status, start_time,
                vehicle_max_power, allocated_power, consumed_power,
                offered_power, total_energy, vehicle_soc, user_id, rfid_tag
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)
            ON CONFLICT (session_id) DO UPDATE SET
                status = excluded.status,
                vehicle_max_power = excluded.vehicle_max_power,
                allocated_power = excluded.allocated_power,
                consumed_power = excluded.consumed_power,
                offered_power = excluded.offered_power,
                total_energy = excluded.total_energy,
                vehicle_soc = excluded.vehicle_soc",
        )
        .bind(&session.session_id)
        .bind(&session.charger_id)
        .bind(session.connector_id as i64)
        .bind(Self::status_str(session.status))
        .bind(session.start_time)
        .bind(session.vehicle_max_power)
        .bind(session.allocated_power)
        .bind(session.consumed_power)
        .bind(session.offered_power)
        .bind(session.total_energy)
        .bind(session.vehicle_soc)
        .bind(&session.user_id)
        .bind(&session.rfid_tag)
        .execute(&self.pool)
        .await
        .map_err(StoreError::new)?;
        Ok(())
    }

    async fn record_session_power(&self, session: &ChargingSession) -> Result<(), StoreError> {
        sqlx::query(
            "UPDATE sessions SET
                consumed_power = ?2,
                allocated_power = ?3,
                offered_power = ?4,
                vehicle_max_power = ?5,
                total_energy = ?6,
                vehicle_soc = ?7
            WHERE session_id = ?1",
        )
        .bind(&session.session_id)
        .bind(session.consumed_power)
        .bind(session.allocated_power)
        .bind(session.offered_power)
        .bind(session.vehicle_max_power)
        .bind(session.total_energy)
        .bind(session.vehicle_soc)
        .execute(&self.pool)
        .await
        .map_err(StoreError::new)?;

        sqlx::query(
            "INSERT INTO session_power_updates (
                session_id, timestamp, consumed_power, allocated_power,
                vehicle_max_power
            ) VALUES (?1, ?2, ?3, ?4, ?5)",
        )
        .bind(&session.session_id)
        .bind(session.last_update_at)
        .bind(session.consumed_power)
        .bind(session.allocated_power)
        .bind(session.vehicle_max_power)
        .execute(&self.pool)
        .await
        .map_err(StoreError::new)?;
        Ok(())
    }

    async fn record_session_complete(&self, session: &ChargingSession) -> Result<(), StoreError> {
        sqlx::query(
            "UPDATE sessions SET
                status = ?2,
                end_time = ?3,
                total_energy = ?4
            WHERE session_id = ?1",
        )
        .bind(&session.session_id)
        .bind(Self::status_str(session.status))
        .bind(session.end_time)
        .bind(session.total_energy)
        .execute(&self.pool)
        .await
        .map_err(StoreError::new)?;
        Ok(())
    }

    async fn record_connector_status(
        &self,
        charger_id: &str,
        connector_id: u32,
        status: ConnectorStatus,
    ) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO connector_status (charger_id, connector_id, status, updated_at)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT (charger_id, connector_id) DO UPDATE SET
                status = excluded.status,
                updated_at = excluded.updated_at",
        )
        .bind(charger_id)
        .bind(connector_id as i64)
        .bind(status.as_str())
        .bind(chrono::Utc::now())
        .execute(&self.pool)
        .await
        .map_err(StoreError::new)?;
        Ok(())
    }

    async fn record_power_metrics(&self, metrics: &PowerMetrics) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO power_metrics (
                timestamp, grid_power, bess_power, total_allocated,
                total_consumed, available_power, active_sessions
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        )
        .bind(metrics.timestamp)
        .bind(metrics.grid_power)
        .bind(metrics.bess_power)
        .bind(metrics.total_allocated)
        .bind(metrics.total_consumed)
        .bind(metrics.available_power)
        .bind(metrics.active_sessions)
        .execute(&self.pool)
        .await
        .map_err(StoreError::new)?;
        Ok(())
    }

    async fn record_bess_snapshot(&self, snapshot: &BessSnapshot) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO bess_status_logs (
                timestamp, mode, power, soc, capacity, available_energy,
                available_discharge, available_charge
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
        )
        .bind(snapshot.timestamp)
        .bind(snapshot.mode.to_string())
        .bind(snapshot.power)
        .bind(snapshot.soc)
        .bind(snapshot.capacity)
        .bind(snapshot.available_energy)
        .bind(snapshot.available_discharge)
        .bind(snapshot.available_charge)
        .execute(&self.pool)
        .await
        .map_err(StoreError::new)?;
        Ok(())
    }

    async fn record_event(&self, event: &AuditEvent) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO events (timestamp, event_type, description, payload)
             VALUES (?1, ?2, ?3, ?4)",
        )
        .bind(event.timestamp)
        .bind(event.kind.as_str())
        .bind(&event.description)
        .bind(event.payload.to_string())
        .execute(&self.pool)
        .await
        .map_err(StoreError::new)?;
        Ok(())
    }
}
