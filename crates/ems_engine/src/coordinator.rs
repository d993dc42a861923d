use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use chrono::Utc;
use ems_core::{
    AllocationPlan, BessCommandKind, BessController, ChargingSession, ConnectorStatus,
    SessionError, SessionRegistry, StationConfig, allocate, session_demand,
};
use serde_json::json;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::events::{
    EmsEvent, OutboundCommand, PowerUpdateRequest, SessionStartRequest, SessionStarted,
    StationStatus,
};
use crate::sink::{AuditEvent, AuditKind, PersistenceSink, PowerMetrics, StoreError};

/// A corrected limit is only republished when it moved by more than this.
pub const REALLOCATION_HYSTERESIS_KW: f64 = 0.5;
/// A BESS command is only republished when its power moved by more than this.
pub const BESS_REPUBLISH_THRESHOLD_KW: f64 = 0.1;
/// Site-level metrics are sampled on every Nth power update.
pub const POWER_METRICS_SAMPLE_EVERY: u64 = 5;

/// Utilisation fraction of the grid headroom below which the battery
/// recaptures spare capacity.
const CHARGE_OPPORTUNITY_UTILISATION: f64 = 0.7;
/// Simulated reservoir integration step per power update, while no real
/// battery reports.
const SIMULATED_BESS_STEP_SECS: f64 = 1.0;

#[derive(Debug, Clone, thiserror::Error)]
pub enum EngineError {
    #[error(transparent)]
    Session(#[from] SessionError),
    #[error("coordinator unavailable")]
    Unavailable,
}

/// Cloneable façade over the coordinator's event queue. Request methods
/// enqueue an event and await its reply; by the time they return, the
/// coordinator has fully processed the event.
#[derive(Clone)]
pub struct EngineHandle {
    tx: mpsc::Sender<EmsEvent>,
    config: Arc<StationConfig>,
}

impl EngineHandle {
    pub fn config(&self) -> &StationConfig {
        &self.config
    }

    pub async fn start_session(
        &self,
        request: SessionStartRequest,
    ) -> Result<SessionStarted, EngineError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(EmsEvent::SessionStart {
                request,
                reply: Some(reply),
            })
            .await
            .map_err(|_| EngineError::Unavailable)?;
        rx.await.map_err(|_| EngineError::Unavailable)?.map_err(EngineError::Session)
    }

    pub async fn stop_session(
        &self,
        session_id: String,
        total_energy: f64,
    ) -> Result<(), EngineError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(EmsEvent::SessionStop {
                session_id,
                total_energy,
                reply: Some(reply),
            })
            .await
            .map_err(|_| EngineError::Unavailable)?;
        rx.await.map_err(|_| EngineError::Unavailable)?.map_err(EngineError::Session)
    }

    pub async fn power_update(&self, request: PowerUpdateRequest) -> Result<f64, EngineError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(EmsEvent::PowerUpdate {
                request,
                reply: Some(reply),
            })
            .await
            .map_err(|_| EngineError::Unavailable)?;
        rx.await.map_err(|_| EngineError::Unavailable)?.map_err(EngineError::Session)
    }

    pub async fn station_status(&self) -> Result<StationStatus, EngineError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(EmsEvent::Status { reply })
            .await
            .map_err(|_| EngineError::Unavailable)?;
        rx.await.map_err(|_| EngineError::Unavailable)
    }

    /// Fire-and-forget enqueue for the fabric adapter.
    pub async fn send(&self, event: EmsEvent) -> bool {
        self.tx.send(event).await.is_ok()
    }
}

/// The single serial actor. At most one event mutates the registry or the
/// battery state at any moment; state is computed here and all I/O happens
/// on this task, so other devices' ingress never waits on a lock.
pub struct Coordinator {
    config: StationConfig,
    registry: SessionRegistry,
    bess: Option<BessController>,
    sink: Arc<dyn PersistenceSink>,
    outbound: mpsc::Sender<OutboundCommand>,
    fabric_connected: Arc<AtomicBool>,
    /// Limit last advertised per session, for the republish hysteresis.
    published_limits: HashMap<String, f64>,
    /// Signed power of the last published BESS command.
    last_bess_command: f64,
    update_count: u64,
    /// Sessions whose last durable write failed; repaired on their next event.
    repair_queue: HashSet<String>,
}

impl Coordinator {
    pub fn new(
        config: StationConfig,
        sink: Arc<dyn PersistenceSink>,
        outbound: mpsc::Sender<OutboundCommand>,
        fabric_connected: Arc<AtomicBool>,
    ) -> Self {
        let registry = SessionRegistry::new(&config);
        let bess = config.battery.clone().map(BessController::new);
        Coordinator {
            config,
            registry,
            bess,
            sink,
            outbound,
            fabric_connected,
            published_limits: HashMap::new(),
            last_bess_command: 0.0,
            update_count: 0,
            repair_queue: HashSet::new(),
        }
    }

    pub async fn run(mut self, mut rx: mpsc::Receiver<EmsEvent>) {
        info!(station_id = %self.config.station_id, "coordinator started");
        while let Some(event) = rx.recv().await {
            self.handle(event).await;
        }
        info!(station_id = %self.config.station_id, "coordinator stopped");
    }

    pub async fn handle(&mut self, event: EmsEvent) {
        match event {
            EmsEvent::SessionStart { request, reply } => {
                let result = self.handle_session_start(request).await;
                if let Some(reply) = reply {
                    let _ = reply.send(result);
                }
            }
            EmsEvent::SessionStop {
                session_id,
                total_energy,
                reply,
            } => {
                let result = self.handle_session_stop(&session_id, total_energy).await;
                if let Some(reply) = reply {
                    let _ = reply.send(result);
                }
            }
            EmsEvent::PowerUpdate { request, reply } => {
                let result = self.handle_power_update(request).await;
                if let Some(reply) = reply {
                    let _ = reply.send(result);
                }
            }
            EmsEvent::ChargerTelemetry {
                charger_id,
                connector_id,
                session_id,
                power_kw,
                vehicle_soc,
                timestamp,
            } => {
                self.handle_charger_telemetry(
                    &charger_id,
                    connector_id,
                    session_id,
                    power_kw,
                    vehicle_soc,
                    timestamp,
                );
            }
            EmsEvent::BatteryTelemetry { soc, power, .. } => {
                self.handle_battery_telemetry(soc, power).await;
            }
            EmsEvent::Status { reply } => {
                let _ = reply.send(self.station_status());
            }
        }
    }

    async fn handle_session_start(
        &mut self,
        request: SessionStartRequest,
    ) -> Result<SessionStarted, SessionError> {
        if self.config.charger(&request.charger_id).is_none() {
            return Err(SessionError::UnknownCharger {
                charger_id: request.charger_id,
            });
        }
        if self
            .config
            .connector(&request.charger_id, request.connector_id)
            .is_none()
        {
            return Err(SessionError::UnknownConnector {
                charger_id: request.charger_id,
                connector_id: request.connector_id,
            });
        }

        let session_id = request
            .session_id
            .clone()
            .unwrap_or_else(|| Uuid::new_v4().to_string());

        // At-least-once delivery: a replayed start for a live session is
        // re-acknowledged with the current allocation.
        if let Some(existing) = self.registry.get(&session_id) {
            debug!(%session_id, "duplicate session start, re-acknowledging");
            return Ok(SessionStarted {
                session_id,
                allocated_power: existing.allocated_power,
            });
        }

        let mut session = ChargingSession::new(
            session_id.clone(),
            request.charger_id.clone(),
            request.connector_id,
            request.vehicle_max_power,
            request.timestamp,
        );
        session.user_id = request.user_id.clone();
        session.rfid_tag = request.rfid_tag.clone();
        self.registry.start(session)?;

        info!(
            %session_id,
            charger_id = %request.charger_id,
            connector_id = request.connector_id,
            vehicle_max_power = request.vehicle_max_power,
            "session started"
        );

        let plan = self.run_allocator();
        self.registry.apply_allocations(&plan.allocations);

        let result = self
            .sink
            .record_connector_status(
                &request.charger_id,
                request.connector_id,
                ConnectorStatus::Occupied,
            )
            .await;
        self.note_write(None, result);

        // the new session's row, then every other affected session
        if let Some(session) = self.registry.get(&session_id).cloned() {
            let result = self.sink.record_session_start(&session).await;
            self.note_write(Some(&session_id), result);
        }
        for allocation in &plan.allocations {
            if allocation.session_id == session_id {
                continue;
            }
            if let Some(session) = self.registry.get(&allocation.session_id).cloned() {
                let result = self.sink.record_session_power(&session).await;
                self.note_write(Some(&allocation.session_id), result);
            }
        }

        let allocated_power = self
            .registry
            .get(&session_id)
            .map(|s| s.allocated_power)
            .unwrap_or(0.0);
        self.audit(
            AuditKind::SessionStart,
            format!(
                "session {session_id} started on {}:{}",
                request.charger_id, request.connector_id
            ),
            json!({
                "session_id": session_id,
                "charger_id": request.charger_id,
                "connector_id": request.connector_id,
                "vehicle_max_power": request.vehicle_max_power,
                "allocated_power": allocated_power,
            }),
        )
        .await;

        self.run_bess_policy(true).await;
        self.publish_all_limits(&plan);
        if request.announce {
            self.publish(OutboundCommand::StartSession {
                charger_id: request.charger_id.clone(),
                session_id: session_id.clone(),
                connector_id: request.connector_id,
                vehicle_max_power: request.vehicle_max_power,
            });
        }
        self.persist_power_metrics().await;

        Ok(SessionStarted {
            session_id,
            allocated_power,
        })
    }

    async fn handle_session_stop(
        &mut self,
        session_id: &str,
        total_energy: f64,
    ) -> Result<(), SessionError> {
        self.repair_if_pending(session_id).await;

        let completed = self.registry.complete(session_id, Utc::now(), total_energy)?;
        info!(%session_id, total_energy, "session stopped");

        let result = self.sink.record_session_complete(&completed).await;
        self.note_write(None, result);
        let result = self
            .sink
            .record_connector_status(
                &completed.charger_id,
                completed.connector_id,
                ConnectorStatus::Available,
            )
            .await;
        self.note_write(None, result);
        self.audit(
            AuditKind::SessionStop,
            format!("session {session_id} stopped"),
            json!({ "session_id": session_id, "total_energy": total_energy }),
        )
        .await;

        // no further limits bear this session's identifier
        self.published_limits.remove(session_id);
        self.repair_queue.remove(session_id);

        let plan = self.run_allocator();
        self.registry.apply_allocations(&plan.allocations);
        if !plan.allocations.is_empty() {
            for allocation in &plan.allocations {
                if let Some(session) = self.registry.get(&allocation.session_id).cloned() {
                    let result = self.sink.record_session_power(&session).await;
                    self.note_write(Some(&allocation.session_id), result);
                }
            }
            self.publish_all_limits(&plan);
            self.audit(
                AuditKind::Reallocation,
                format!(
                    "reallocated {} sessions after {session_id} left",
                    plan.allocations.len()
                ),
                json!({ "sessions": plan.allocations.len(), "total_allocated": plan.total_allocated() }),
            )
            .await;
        }

        self.run_bess_policy(true).await;
        self.persist_power_metrics().await;
        Ok(())
    }

    async fn handle_power_update(
        &mut self,
        request: PowerUpdateRequest,
    ) -> Result<f64, SessionError> {
        self.repair_if_pending(&request.session_id).await;

        let Some(session) = self.registry.get_mut(&request.session_id) else {
            warn!(session_id = %request.session_id, "power update for unknown session");
            return Err(SessionError::SessionNotFound {
                session_id: request.session_id,
            });
        };

        if request.timestamp < session.last_update_at {
            warn!(
                session_id = %request.session_id,
                "power update older than last processed message, dropped"
            );
            return Err(SessionError::StaleUpdate {
                session_id: request.session_id,
                reason: "timestamp older than last processed update".into(),
            });
        }
        if let Some(total_energy) = request.total_energy
            && total_energy + 1e-9 < session.total_energy
        {
            warn!(
                session_id = %request.session_id,
                incoming = total_energy,
                stored = session.total_energy,
                "total energy went backward, update rejected"
            );
            return Err(SessionError::StaleUpdate {
                session_id: request.session_id,
                reason: "total energy decreased".into(),
            });
        }
        if let (Some(incoming), Some(current)) = (request.vehicle_soc, session.vehicle_soc)
            && incoming + 1e-9 < current
        {
            warn!(
                session_id = %request.session_id,
                incoming,
                current,
                "vehicle SOC went backward, update rejected"
            );
            return Err(SessionError::StaleUpdate {
                session_id: request.session_id,
                reason: "vehicle SOC decreased".into(),
            });
        }

        session.consumed_power = request.consumed_power;
        session.vehicle_max_power = request.vehicle_max_power;
        if let Some(total_energy) = request.total_energy {
            session.total_energy = total_energy;
        }
        if let Some(vehicle_soc) = request.vehicle_soc {
            session.vehicle_soc = Some(vehicle_soc);
        }
        session.last_update_at = request.timestamp;

        let plan = self.run_allocator();
        self.registry.apply_allocations(&plan.allocations);
        self.publish_changed_limits(&plan).await;
        self.run_bess_policy(false).await;
        self.step_bess_simulation().await;

        let Some(session) = self.registry.get(&request.session_id).cloned() else {
            return Err(SessionError::SessionNotFound {
                session_id: request.session_id,
            });
        };
        let new_allocated = session.allocated_power;
        let result = self.sink.record_session_power(&session).await;
        self.note_write(Some(&request.session_id), result);

        self.update_count += 1;
        if self.update_count % POWER_METRICS_SAMPLE_EVERY == 0 {
            self.persist_power_metrics().await;
        }

        debug!(
            session_id = %request.session_id,
            consumed = request.consumed_power,
            allocated = new_allocated,
            "power update applied"
        );
        Ok(new_allocated)
    }

    fn handle_charger_telemetry(
        &mut self,
        charger_id: &str,
        connector_id: u32,
        session_id: Option<String>,
        power_kw: f64,
        vehicle_soc: Option<f64>,
        timestamp: chrono::DateTime<Utc>,
    ) {
        let Some(session_id) = session_id else {
            debug!(charger_id, connector_id, "telemetry without a session");
            return;
        };
        let Some(session) = self.registry.get_mut(&session_id) else {
            debug!(%session_id, "telemetry for unknown session");
            return;
        };
        if timestamp < session.last_update_at {
            debug!(%session_id, "stale telemetry dropped");
            return;
        }
        session.consumed_power = power_kw;
        if let Some(soc) = vehicle_soc
            && session.vehicle_soc.is_none_or(|current| soc >= current)
        {
            session.vehicle_soc = Some(soc);
        }
        session.last_update_at = timestamp;
    }

    async fn handle_battery_telemetry(&mut self, soc: f64, power: f64) {
        let snapshot = match self.bess.as_mut() {
            Some(bess) => {
                bess.update_from_telemetry(soc, power);
                Some(bess.snapshot())
            }
            None => {
                debug!("battery telemetry for a station without a battery");
                None
            }
        };
        if let Some(snapshot) = snapshot {
            let result = self.sink.record_bess_snapshot(&snapshot).await;
            self.note_write(None, result);
        }
    }

    fn station_status(&self) -> StationStatus {
        let total_consumed = self.registry.total_consumed() + self.config.static_load;
        let (bess_power, bess_soc) = match &self.bess {
            Some(bess) => (bess.power(), Some(bess.soc())),
            None => (0.0, None),
        };
        let sessions: Vec<ChargingSession> = self
            .registry
            .sessions_sorted()
            .into_iter()
            .cloned()
            .collect();
        let power_allocation = sessions.iter().map(|s| s.allocation()).collect();
        StationStatus {
            station_id: self.config.station_id.clone(),
            timestamp: Utc::now(),
            grid_capacity: self.config.grid_capacity,
            grid_power: total_consumed - bess_power,
            bess_power,
            bess_soc,
            total_allocated: self.registry.total_allocated(),
            total_consumed,
            active_sessions: self.registry.len(),
            available_power: self.config.grid_capacity - total_consumed + bess_power,
            fabric_connected: self.fabric_connected.load(Ordering::Relaxed),
            sessions,
            power_allocation,
        }
    }

    /// The allocator sees the battery snapshot taken here, at event entry;
    /// a mode change later in the same event lands in the next run.
    fn run_allocator(&self) -> AllocationPlan {
        let bess_discharge = self
            .bess
            .as_ref()
            .map(|b| b.available_discharge())
            .unwrap_or(0.0);
        allocate(&self.registry, &self.config, bess_discharge)
    }

    /// Decide charge/discharge/idle and publish when forced or when the
    /// commanded power moved beyond the republish threshold.
    async fn run_bess_policy(&mut self, force_publish: bool) {
        let grid_available = self.config.grid_available();
        let current_load = self.registry.total_consumed() + self.config.static_load;
        let total_demand: f64 = self
            .registry
            .sessions()
            .map(|s| session_demand(&self.config, &self.registry, s))
            .sum();
        let idle_station = self.registry.is_empty();

        let Some(bess) = self.bess.as_mut() else {
            return;
        };
        let command = if idle_station {
            bess.command_idle()
        } else if total_demand > grid_available {
            let boost = bess.boost_power(grid_available, total_demand);
            if boost > 0.0 {
                bess.command_discharge(boost)
            } else {
                bess.command_idle()
            }
        } else if current_load < grid_available * CHARGE_OPPORTUNITY_UTILISATION {
            let charge = bess.charge_opportunity(grid_available, current_load);
            if charge > 0.0 {
                bess.command_charge(charge)
            } else {
                bess.command_idle()
            }
        } else {
            bess.command_idle()
        };
        let signed_power = bess.power();

        if !force_publish
            && (signed_power - self.last_bess_command).abs() <= BESS_REPUBLISH_THRESHOLD_KW
        {
            return;
        }
        self.last_bess_command = signed_power;
        self.publish(OutboundCommand::Bess(command));
        match command.kind {
            BessCommandKind::Discharge => {
                info!(power = command.power, "battery boost engaged");
                self.audit(
                    AuditKind::BessBoost,
                    format!("battery boost {} kW", command.power),
                    json!({ "power": command.power, "reason": "demand_exceeds_grid" }),
                )
                .await;
            }
            BessCommandKind::Charge => {
                info!(power = command.power, "battery charging from spare capacity");
                self.audit(
                    AuditKind::BessCharge,
                    format!("battery charging {} kW", command.power),
                    json!({ "power": command.power, "reason": "spare_capacity" }),
                )
                .await;
            }
            BessCommandKind::Idle => {}
        }
    }

    /// While no real battery reports, advance the simulated reservoir by one
    /// step and log the snapshot.
    async fn step_bess_simulation(&mut self) {
        let snapshot = match self.bess.as_mut() {
            Some(bess) if !bess.has_telemetry() && bess.power() != 0.0 => {
                let power = bess.power();
                bess.apply_power(power, SIMULATED_BESS_STEP_SECS);
                Some(bess.snapshot())
            }
            _ => None,
        };
        if let Some(snapshot) = snapshot {
            let result = self.sink.record_bess_snapshot(&snapshot).await;
            self.note_write(None, result);
        }
    }

    fn publish_all_limits(&mut self, plan: &AllocationPlan) {
        for allocation in &plan.allocations {
            self.published_limits
                .insert(allocation.session_id.clone(), allocation.allocated_power);
            self.publish(OutboundCommand::PowerLimit {
                charger_id: allocation.charger_id.clone(),
                connector_id: allocation.connector_id,
                power_limit: allocation.allocated_power,
            });
        }
    }

    /// Republish only the limits that moved beyond the hysteresis band.
    async fn publish_changed_limits(&mut self, plan: &AllocationPlan) {
        for allocation in &plan.allocations {
            let previous = self.published_limits.get(&allocation.session_id).copied();
            let changed = previous
                .is_none_or(|p| (p - allocation.allocated_power).abs() > REALLOCATION_HYSTERESIS_KW);
            if !changed {
                continue;
            }
            self.published_limits
                .insert(allocation.session_id.clone(), allocation.allocated_power);
            self.publish(OutboundCommand::PowerLimit {
                charger_id: allocation.charger_id.clone(),
                connector_id: allocation.connector_id,
                power_limit: allocation.allocated_power,
            });
            self.audit(
                AuditKind::PowerUpdate,
                format!(
                    "limit for session {} corrected to {} kW",
                    allocation.session_id, allocation.allocated_power
                ),
                json!({
                    "session_id": allocation.session_id,
                    "power_limit": allocation.allocated_power,
                }),
            )
            .await;
        }
    }

    async fn persist_power_metrics(&mut self) {
        let total_consumed = self.registry.total_consumed() + self.config.static_load;
        let bess_power = self.bess.as_ref().map(|b| b.power()).unwrap_or(0.0);
        let metrics = PowerMetrics {
            timestamp: Utc::now(),
            grid_power: total_consumed - bess_power,
            bess_power,
            total_allocated: self.registry.total_allocated(),
            total_consumed,
            available_power: self.config.grid_capacity - total_consumed + bess_power,
            active_sessions: self.registry.len() as i64,
        };
        let result = self.sink.record_power_metrics(&metrics).await;
        self.note_write(None, result);
    }

    async fn audit(&mut self, kind: AuditKind, description: String, payload: serde_json::Value) {
        let event = AuditEvent {
            timestamp: Utc::now(),
            kind,
            description,
            payload,
        };
        let result = self.sink.record_event(&event).await;
        self.note_write(None, result);
    }

    /// A failed write never rolls back in-memory state; device reality is
    /// the source of truth and the row is repaired opportunistically.
    fn note_write(&mut self, session_id: Option<&str>, result: Result<(), StoreError>) {
        if let Err(err) = result {
            error!(error = %err, "persistence write failed, in-memory state stays authoritative");
            if let Some(session_id) = session_id {
                self.repair_queue.insert(session_id.to_string());
            }
        }
    }

    async fn repair_if_pending(&mut self, session_id: &str) {
        if !self.repair_queue.remove(session_id) {
            return;
        }
        let Some(session) = self.registry.get(session_id).cloned() else {
            return;
        };
        debug!(%session_id, "retrying failed persistence write");
        if let Err(err) = self.sink.record_session_start(&session).await {
            warn!(error = %err, %session_id, "persistence repair failed, will retry later");
            self.repair_queue.insert(session_id.to_string());
        }
    }

    fn publish(&mut self, command: OutboundCommand) {
        if let Err(err) = self.outbound.try_send(command) {
            warn!(error = %err, "outbound command queue rejected a command");
        }
    }
}

/// Spawn the coordinator task and hand back its façade.
pub fn spawn_coordinator(
    config: StationConfig,
    sink: Arc<dyn PersistenceSink>,
    outbound: mpsc::Sender<OutboundCommand>,
    fabric_connected: Arc<AtomicBool>,
    queue_capacity: usize,
) -> EngineHandle {
    let (tx, rx) = mpsc::channel(queue_capacity);
    let shared_config = Arc::new(config.clone());
    let coordinator = Coordinator::new(config, sink, outbound, fabric_connected);
    tokio::spawn(coordinator.run(rx));
    EngineHandle {
        tx,
        config: shared_config,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use ems_core::{
        BatteryConfig, BessSnapshot, ChargerConfig, ConnectorConfig, ConnectorType,
    };
    use std::sync::Mutex;

    #[derive(Default)]
    struct MemorySink {
        fail_session_writes: AtomicBool,
        session_rows: Mutex<Vec<String>>,
        power_updates: Mutex<Vec<String>>,
        completed: Mutex<Vec<ChargingSession>>,
        metrics: Mutex<Vec<PowerMetrics>>,
        bess_logs: Mutex<Vec<BessSnapshot>>,
        events: Mutex<Vec<AuditEvent>>,
        connector_states: Mutex<Vec<(String, u32, ConnectorStatus)>>,
    }

    impl MemorySink {
        fn event_kinds(&self) -> Vec<AuditKind> {
            self.events.lock().unwrap().iter().map(|e| e.kind).collect()
        }
    }

    #[async_trait]
    impl PersistenceSink for MemorySink {
        async fn record_session_start(
            &self,
            session: &ChargingSession,
        ) -> Result<(), StoreError> {
            if self.fail_session_writes.load(Ordering::Relaxed) {
                return Err(StoreError::new("database unavailable"));
            }
            self.session_rows
                .lock()
                .unwrap()
                .push(session.session_id.clone());
            Ok(())
        }

        async fn record_session_power(
            &self,
            session: &ChargingSession,
        ) -> Result<(), StoreError> {
            if self.fail_session_writes.load(Ordering::Relaxed) {
                return Err(StoreError::new("database unavailable"));
            }
            self.power_updates
                .lock()
                .unwrap()
                .push(session.session_id.clone());
            Ok(())
        }

        async fn record_session_complete(
            &self,
            session: &ChargingSession,
        ) -> Result<(), StoreError> {
            self.completed.lock().unwrap().push(session.clone());
            Ok(())
        }

        async fn record_connector_status(
            &self,
            charger_id: &str,
            connector_id: u32,
            status: ConnectorStatus,
        ) -> Result<(), StoreError> {
            self.connector_states
                .lock()
                .unwrap()
                .push((charger_id.to_string(), connector_id, status));
            Ok(())
        }

        async fn record_power_metrics(&self, metrics: &PowerMetrics) -> Result<(), StoreError> {
            self.metrics.lock().unwrap().push(metrics.clone());
            Ok(())
        }

        async fn record_bess_snapshot(&self, snapshot: &BessSnapshot) -> Result<(), StoreError> {
            self.bess_logs.lock().unwrap().push(*snapshot);
            Ok(())
        }

        async fn record_event(&self, event: &AuditEvent) -> Result<(), StoreError> {
            self.events.lock().unwrap().push(event.clone());
            Ok(())
        }
    }

    struct Harness {
        handle: EngineHandle,
        commands: mpsc::Receiver<OutboundCommand>,
        sink: Arc<MemorySink>,
    }

    impl Harness {
        fn new(config: StationConfig) -> Self {
            let sink = Arc::new(MemorySink::default());
            let (out_tx, out_rx) = mpsc::channel(256);
            let handle = spawn_coordinator(
                config,
                sink.clone() as Arc<dyn PersistenceSink>,
                out_tx,
                Arc::new(AtomicBool::new(true)),
                32,
            );
            Harness {
                handle,
                commands: out_rx,
                sink,
            }
        }

        fn drain(&mut self) -> Vec<OutboundCommand> {
            let mut commands = Vec::new();
            while let Ok(command) = self.commands.try_recv() {
                commands.push(command);
            }
            commands
        }

        async fn start(&self, id: &str, charger: &str, connector: u32, vmax: f64) -> SessionStarted {
            self.handle
                .start_session(SessionStartRequest {
                    session_id: Some(id.into()),
                    charger_id: charger.into(),
                    connector_id: connector,
                    vehicle_max_power: vmax,
                    user_id: None,
                    rfid_tag: None,
                    timestamp: Utc::now(),
                    announce: false,
                })
                .await
                .expect("start should succeed")
        }

        async fn update(&self, id: &str, consumed: f64, vmax: f64) -> Result<f64, EngineError> {
            self.handle
                .power_update(PowerUpdateRequest {
                    session_id: id.into(),
                    consumed_power: consumed,
                    vehicle_max_power: vmax,
                    total_energy: None,
                    vehicle_soc: None,
                    timestamp: Utc::now(),
                })
                .await
        }
    }

    fn connector(connector_id: u32, max_power: f64) -> ConnectorConfig {
        ConnectorConfig {
            connector_id,
            connector_type: ConnectorType::Ccs2,
            max_power,
        }
    }

    fn charger(id: &str, max_power: f64, connectors: Vec<ConnectorConfig>) -> ChargerConfig {
        ChargerConfig {
            id: id.into(),
            max_power,
            connectors,
            manufacturer: None,
            model: None,
        }
    }

    fn station(chargers: Vec<ChargerConfig>, battery: Option<BatteryConfig>) -> StationConfig {
        StationConfig {
            station_id: "SITE_A".into(),
            grid_capacity: 400.0,
            static_load: 3.0,
            chargers,
            battery,
        }
    }

    fn two_charger_station() -> StationConfig {
        station(
            vec![
                charger(
                    "CP001",
                    200.0,
                    vec![connector(1, 150.0), connector(2, 150.0)],
                ),
                charger(
                    "CP002",
                    200.0,
                    vec![connector(1, 150.0), connector(2, 150.0)],
                ),
            ],
            None,
        )
    }

    fn boost_station(battery: BatteryConfig) -> StationConfig {
        station(
            vec![
                charger("CP001", 200.0, vec![connector(1, 150.0)]),
                charger("CP002", 200.0, vec![connector(1, 150.0)]),
                charger("CP003", 200.0, vec![connector(1, 150.0)]),
                charger("CP004", 200.0, vec![connector(1, 150.0)]),
            ],
            Some(battery),
        )
    }

    fn power_limits(commands: &[OutboundCommand]) -> Vec<(&str, u32, f64)> {
        commands
            .iter()
            .filter_map(|c| match c {
                OutboundCommand::PowerLimit {
                    charger_id,
                    connector_id,
                    power_limit,
                } => Some((charger_id.as_str(), *connector_id, *power_limit)),
                _ => None,
            })
            .collect()
    }

    fn bess_commands(commands: &[OutboundCommand]) -> Vec<ems_core::BessCommand> {
        commands
            .iter()
            .filter_map(|c| match c {
                OutboundCommand::Bess(command) => Some(*command),
                _ => None,
            })
            .collect()
    }

    #[tokio::test]
    async fn test_two_way_share_on_one_charger() {
        let mut harness = Harness::new(two_charger_station());
        let s1 = harness.start("S1", "CP001", 1, 150.0).await;
        assert_eq!(s1.allocated_power, 150.0);

        let s2 = harness.start("S2", "CP001", 2, 150.0).await;
        assert_eq!(s2.allocated_power, 100.0);

        let status = harness.handle.station_status().await.unwrap();
        for session in &status.sessions {
            assert_eq!(session.allocated_power, 100.0);
            assert_eq!(session.offered_power, session.allocated_power);
        }
        assert!(status.total_allocated <= 397.0);

        // limits for both connectors went out with the second start
        let commands = harness.drain();
        let limits = power_limits(&commands);
        assert!(limits.contains(&("CP001", 1, 100.0)));
        assert!(limits.contains(&("CP001", 2, 100.0)));
    }

    #[tokio::test]
    async fn test_grid_constrained_four_way_share() {
        let mut harness = Harness::new(two_charger_station());
        harness.start("S1", "CP001", 1, 150.0).await;
        harness.start("S2", "CP001", 2, 150.0).await;
        harness.start("S3", "CP002", 1, 150.0).await;
        let s4 = harness.start("S4", "CP002", 2, 150.0).await;

        // demand 400 against 397 available
        assert!(s4.allocated_power >= 99.0 && s4.allocated_power <= 99.4);
        let status = harness.handle.station_status().await.unwrap();
        assert!(status.total_allocated <= 397.0 + 1e-9);
        for session in &status.sessions {
            assert!(session.allocated_power >= 99.0);
            assert!(session.allocated_power <= 99.4);
        }
        harness.drain();
    }

    #[tokio::test]
    async fn test_reallocation_on_departure() {
        let mut harness = Harness::new(two_charger_station());
        harness.start("S1", "CP001", 1, 150.0).await;
        harness.start("S2", "CP001", 2, 150.0).await;
        harness.start("S3", "CP002", 1, 150.0).await;
        harness.start("S4", "CP002", 2, 150.0).await;
        harness.drain();

        harness
            .handle
            .stop_session("S1".into(), 12.5)
            .await
            .unwrap();

        let status = harness.handle.station_status().await.unwrap();
        assert_eq!(status.active_sessions, 3);
        // S2 is alone on CP001 again and gets its full vehicle demand; the
        // CP002 pair still splits its charger budget
        let by_id: HashMap<&str, f64> = status
            .sessions
            .iter()
            .map(|s| (s.session_id.as_str(), s.allocated_power))
            .collect();
        assert_eq!(by_id["S2"], 150.0);
        assert_eq!(by_id["S3"], 100.0);
        assert_eq!(by_id["S4"], 100.0);
        assert!(status.total_allocated <= 397.0);

        // the completed session was persisted and no limit mentions it
        let completed = harness.sink.completed.lock().unwrap();
        assert_eq!(completed.len(), 1);
        assert_eq!(completed[0].total_energy, 12.5);
        assert!(completed[0].end_time.is_some());
        drop(completed);
        let commands = harness.drain();
        let limits = power_limits(&commands);
        assert!(limits.iter().all(|(c, n, _)| !(*c == "CP001" && *n == 1)));
        assert!(
            harness
                .sink
                .event_kinds()
                .contains(&AuditKind::Reallocation)
        );
        // the connector was released in the store as well
        let connector_states = harness.sink.connector_states.lock().unwrap();
        assert_eq!(
            connector_states.last(),
            Some(&("CP001".to_string(), 1, ConnectorStatus::Available))
        );
    }

    #[tokio::test]
    async fn test_bess_boost_under_peak_demand() {
        let battery = BatteryConfig {
            initial_capacity: 200.0,
            power: 100.0,
            min_soc: 10.0,
            max_soc: 100.0,
        };
        let mut harness = Harness::new(boost_station(battery));

        // bring the battery to 80% before the rush
        harness
            .handle
            .send(EmsEvent::BatteryTelemetry {
                soc: 80.0,
                power: 0.0,
                timestamp: Utc::now(),
            })
            .await;

        harness.start("S1", "CP001", 1, 150.0).await;
        harness.start("S2", "CP002", 1, 150.0).await;
        harness.start("S3", "CP003", 1, 150.0).await;
        harness.start("S4", "CP004", 1, 150.0).await;

        for id in ["S1", "S2", "S3", "S4"] {
            let allocated = harness.update(id, 150.0, 150.0).await.unwrap();
            assert!(allocated >= 124.0 && allocated <= 124.3, "got {allocated}");
        }

        let status = harness.handle.station_status().await.unwrap();
        // demand 600, grid 397, battery covers 100
        assert!(status.total_allocated <= 497.0 + 1e-9);
        assert!(status.total_allocated > 397.0);
        assert!(status.bess_power > 0.0);

        let commands = harness.drain();
        let discharges: Vec<_> = bess_commands(&commands)
            .into_iter()
            .filter(|c| c.kind == BessCommandKind::Discharge)
            .collect();
        assert_eq!(discharges.last().map(|c| c.power), Some(100.0));
        // the steady 100 kW command came from the starts; the four updates
        // stayed inside the republish threshold
        assert!(discharges.len() <= 2);
        assert!(harness.sink.event_kinds().contains(&AuditKind::BessBoost));
    }

    #[tokio::test]
    async fn test_charge_opportunity_in_trough() {
        // enough headroom that the inverter, not the reservoir, is the bound
        let battery = BatteryConfig {
            initial_capacity: 500.0,
            power: 100.0,
            min_soc: 10.0,
            max_soc: 100.0,
        };
        let config = station(
            vec![charger("CP001", 200.0, vec![connector(1, 150.0), connector(2, 150.0)])],
            Some(battery),
        );
        let mut harness = Harness::new(config);

        harness
            .handle
            .send(EmsEvent::BatteryTelemetry {
                soc: 60.0,
                power: 0.0,
                timestamp: Utc::now(),
            })
            .await;

        harness.start("S1", "CP001", 1, 150.0).await;
        harness.update("S1", 20.0, 150.0).await.unwrap();

        // load 23 kW is under 70% of 397, so the spare capacity is captured
        let commands = harness.drain();
        let charge = bess_commands(&commands)
            .into_iter()
            .find(|c| c.kind == BessCommandKind::Charge);
        assert_eq!(charge.map(|c| c.power), Some(100.0));
        assert!(harness.sink.event_kinds().contains(&AuditKind::BessCharge));

        let status = harness.handle.station_status().await.unwrap();
        assert_eq!(status.bess_power, -100.0);
    }

    #[tokio::test]
    async fn test_stale_energy_update_rejected() {
        let mut harness = Harness::new(two_charger_station());
        harness.start("S1", "CP001", 1, 150.0).await;

        let ok = harness
            .handle
            .power_update(PowerUpdateRequest {
                session_id: "S1".into(),
                consumed_power: 100.0,
                vehicle_max_power: 150.0,
                total_energy: Some(5.0),
                vehicle_soc: None,
                timestamp: Utc::now(),
            })
            .await;
        assert!(ok.is_ok());

        let stale = harness
            .handle
            .power_update(PowerUpdateRequest {
                session_id: "S1".into(),
                consumed_power: 100.0,
                vehicle_max_power: 150.0,
                total_energy: Some(4.8),
                vehicle_soc: None,
                timestamp: Utc::now(),
            })
            .await;
        assert!(matches!(
            stale,
            Err(EngineError::Session(SessionError::StaleUpdate { .. }))
        ));

        let status = harness.handle.station_status().await.unwrap();
        assert_eq!(status.sessions[0].total_energy, 5.0);
        harness.drain();
    }

    #[tokio::test]
    async fn test_reordered_update_dropped() {
        let mut harness = Harness::new(two_charger_station());
        harness.start("S1", "CP001", 1, 150.0).await;

        let now = Utc::now();
        harness
            .handle
            .power_update(PowerUpdateRequest {
                session_id: "S1".into(),
                consumed_power: 90.0,
                vehicle_max_power: 150.0,
                total_energy: None,
                vehicle_soc: None,
                timestamp: now,
            })
            .await
            .unwrap();

        let replay = harness
            .handle
            .power_update(PowerUpdateRequest {
                session_id: "S1".into(),
                consumed_power: 50.0,
                vehicle_max_power: 150.0,
                total_energy: None,
                vehicle_soc: None,
                timestamp: now - chrono::Duration::seconds(30),
            })
            .await;
        assert!(matches!(
            replay,
            Err(EngineError::Session(SessionError::StaleUpdate { .. }))
        ));

        let status = harness.handle.station_status().await.unwrap();
        assert_eq!(status.sessions[0].consumed_power, 90.0);
        harness.drain();
    }

    #[tokio::test]
    async fn test_start_errors() {
        let harness = Harness::new(two_charger_station());

        let unknown_charger = harness
            .handle
            .start_session(SessionStartRequest {
                session_id: None,
                charger_id: "CP999".into(),
                connector_id: 1,
                vehicle_max_power: 150.0,
                user_id: None,
                rfid_tag: None,
                timestamp: Utc::now(),
                announce: false,
            })
            .await;
        assert!(matches!(
            unknown_charger,
            Err(EngineError::Session(SessionError::UnknownCharger { .. }))
        ));

        let unknown_connector = harness
            .handle
            .start_session(SessionStartRequest {
                session_id: None,
                charger_id: "CP001".into(),
                connector_id: 7,
                vehicle_max_power: 150.0,
                user_id: None,
                rfid_tag: None,
                timestamp: Utc::now(),
                announce: false,
            })
            .await;
        assert!(matches!(
            unknown_connector,
            Err(EngineError::Session(SessionError::UnknownConnector { .. }))
        ));

        harness.start("S1", "CP001", 1, 150.0).await;
        let busy = harness
            .handle
            .start_session(SessionStartRequest {
                session_id: Some("S2".into()),
                charger_id: "CP001".into(),
                connector_id: 1,
                vehicle_max_power: 150.0,
                user_id: None,
                rfid_tag: None,
                timestamp: Utc::now(),
                announce: false,
            })
            .await;
        assert!(matches!(
            busy,
            Err(EngineError::Session(SessionError::ConnectorBusy { .. }))
        ));

        let missing = harness.handle.stop_session("S9".into(), 0.0).await;
        assert!(matches!(
            missing,
            Err(EngineError::Session(SessionError::SessionNotFound { .. }))
        ));
    }

    #[tokio::test]
    async fn test_duplicate_start_is_reacknowledged() {
        let harness = Harness::new(two_charger_station());
        let first = harness.start("S1", "CP001", 1, 150.0).await;
        let replay = harness.start("S1", "CP001", 1, 150.0).await;
        assert_eq!(first.allocated_power, replay.allocated_power);
        let status = harness.handle.station_status().await.unwrap();
        assert_eq!(status.active_sessions, 1);
    }

    #[tokio::test]
    async fn test_rest_start_announces_to_charger() {
        let mut harness = Harness::new(two_charger_station());
        let started = harness
            .handle
            .start_session(SessionStartRequest {
                session_id: None,
                charger_id: "CP001".into(),
                connector_id: 1,
                vehicle_max_power: 150.0,
                user_id: Some("alice".into()),
                rfid_tag: None,
                timestamp: Utc::now(),
                announce: true,
            })
            .await
            .unwrap();

        let commands = harness.drain();
        let announced = commands.iter().any(|c| {
            matches!(
                c,
                OutboundCommand::StartSession { session_id, .. }
                    if *session_id == started.session_id
            )
        });
        assert!(announced);
    }

    #[tokio::test]
    async fn test_limit_hysteresis_suppresses_small_moves() {
        let mut harness = Harness::new(two_charger_station());
        harness.start("S1", "CP001", 1, 150.0).await;
        harness.drain();

        // consumption changes but the allocation stays 150: no new limit
        harness.update("S1", 120.0, 150.0).await.unwrap();
        let commands = harness.drain();
        assert!(power_limits(&commands).is_empty());

        // vehicle limit drops: the allocation moves far beyond 0.5 kW
        harness.update("S1", 120.0, 80.0).await.unwrap();
        let commands = harness.drain();
        assert_eq!(power_limits(&commands), vec![("CP001", 1, 80.0)]);
    }

    #[tokio::test]
    async fn test_charger_telemetry_refreshes_session() {
        let harness = Harness::new(two_charger_station());
        harness.start("S1", "CP001", 1, 150.0).await;
        harness
            .handle
            .send(EmsEvent::ChargerTelemetry {
                charger_id: "CP001".into(),
                connector_id: 1,
                session_id: Some("S1".into()),
                power_kw: 42.0,
                vehicle_soc: Some(55.0),
                timestamp: Utc::now(),
            })
            .await;

        let status = harness.handle.station_status().await.unwrap();
        assert_eq!(status.sessions[0].consumed_power, 42.0);
        assert_eq!(status.sessions[0].vehicle_soc, Some(55.0));
    }

    #[tokio::test]
    async fn test_persistence_failure_keeps_state_and_repairs() {
        let harness = Harness::new(two_charger_station());
        harness
            .sink
            .fail_session_writes
            .store(true, Ordering::Relaxed);

        harness.start("S1", "CP001", 1, 150.0).await;
        // memory is authoritative despite the failed write
        let status = harness.handle.station_status().await.unwrap();
        assert_eq!(status.active_sessions, 1);
        assert!(harness.sink.session_rows.lock().unwrap().is_empty());

        // database back: the next event for the session repairs the row
        harness
            .sink
            .fail_session_writes
            .store(false, Ordering::Relaxed);
        harness.update("S1", 50.0, 150.0).await.unwrap();
        assert_eq!(
            harness.sink.session_rows.lock().unwrap().as_slice(),
            ["S1"]
        );
        assert_eq!(
            harness.sink.power_updates.lock().unwrap().as_slice(),
            ["S1"]
        );
    }

    #[tokio::test]
    async fn test_power_metrics_sampling() {
        let harness = Harness::new(two_charger_station());
        harness.start("S1", "CP001", 1, 150.0).await;
        let after_start = harness.sink.metrics.lock().unwrap().len();
        assert_eq!(after_start, 1);

        for _ in 0..POWER_METRICS_SAMPLE_EVERY {
            harness.update("S1", 100.0, 150.0).await.unwrap();
        }
        // exactly one sampled snapshot across the five updates
        assert_eq!(harness.sink.metrics.lock().unwrap().len(), after_start + 1);
    }

    #[tokio::test]
    async fn test_battery_telemetry_logged_without_reallocation() {
        let battery = BatteryConfig {
            initial_capacity: 200.0,
            power: 100.0,
            min_soc: 10.0,
            max_soc: 100.0,
        };
        let mut harness = Harness::new(boost_station(battery));
        harness
            .handle
            .send(EmsEvent::BatteryTelemetry {
                soc: 55.0,
                power: -20.0,
                timestamp: Utc::now(),
            })
            .await;

        let status = harness.handle.station_status().await.unwrap();
        assert_eq!(status.bess_soc, Some(55.0));
        assert_eq!(status.bess_power, -20.0);
        assert_eq!(harness.sink.bess_logs.lock().unwrap().len(), 1);
        // telemetry alone publishes nothing
        assert!(harness.drain().is_empty());
    }

    #[tokio::test]
    async fn test_empty_station_idles_the_battery() {
        let battery = BatteryConfig {
            initial_capacity: 200.0,
            power: 100.0,
            min_soc: 10.0,
            max_soc: 100.0,
        };
        let mut harness = Harness::new(boost_station(battery));
        harness
            .handle
            .send(EmsEvent::BatteryTelemetry {
                soc: 50.0,
                power: 0.0,
                timestamp: Utc::now(),
            })
            .await;

        // a lone light session opens a charge opportunity
        harness.start("S1", "CP001", 1, 150.0).await;
        harness
            .handle
            .stop_session("S1".into(), 0.5)
            .await
            .unwrap();

        // with the station empty again the battery is sent idle
        let commands = harness.drain();
        let last = bess_commands(&commands).last().copied();
        assert_eq!(last.map(|c| c.kind), Some(BessCommandKind::Idle));
        let status = harness.handle.station_status().await.unwrap();
        assert_eq!(status.bess_power, 0.0);
        assert_eq!(status.active_sessions, 0);
    }

    #[tokio::test]
    async fn test_simulated_battery_integrates_soc() {
        // no telemetry ever arrives, so boosting drains the simulated
        // reservoir one second per update
        let battery = BatteryConfig {
            initial_capacity: 200.0,
            power: 100.0,
            min_soc: 10.0,
            max_soc: 100.0,
        };
        let harness = Harness::new(boost_station(battery.clone()));
        for (id, charger) in [("S1", "CP001"), ("S2", "CP002"), ("S3", "CP003"), ("S4", "CP004")] {
            harness.start(id, charger, 1, 150.0).await;
        }
        for _ in 0..30 {
            harness.update("S1", 150.0, 150.0).await.unwrap();
        }
        let status = harness.handle.station_status().await.unwrap();
        let soc = status.bess_soc.unwrap();
        assert!(soc < battery.max_soc, "boosting must drain the reservoir");
        assert!(soc >= battery.min_soc && soc <= battery.max_soc);
        assert!(!harness.sink.bess_logs.lock().unwrap().is_empty());
    }
}
