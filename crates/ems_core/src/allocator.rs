use tracing::warn;

use crate::session::{ChargingSession, PowerAllocation, SessionRegistry};
use crate::topology::StationConfig;

/// Allocator output: the per-session vector plus the aggregates the BESS
/// policy wants to see.
#[derive(Debug, Clone)]
pub struct AllocationPlan {
    /// Ordered by `session_id`.
    pub allocations: Vec<PowerAllocation>,
    pub total_available: f64,
    pub total_demand: f64,
    pub factor: f64,
}

impl AllocationPlan {
    pub fn total_allocated(&self) -> f64 {
        self.allocations.iter().map(|a| a.allocated_power).sum()
    }

    pub fn allocated_to(&self, session_id: &str) -> Option<f64> {
        self.allocations
            .iter()
            .find(|a| a.session_id == session_id)
            .map(|a| a.allocated_power)
    }
}

/// What a session can usefully draw right now: the vehicle's own limit,
/// capped by its even share of the charger budget and by the connector
/// nameplate.
pub fn session_demand(
    config: &StationConfig,
    registry: &SessionRegistry,
    session: &ChargingSession,
) -> f64 {
    let Some(charger) = config.charger(&session.charger_id) else {
        warn!(charger_id = %session.charger_id, "charger not in topology, demand is zero");
        return 0.0;
    };
    let Some(connector) = config.connector(&session.charger_id, session.connector_id) else {
        warn!(
            charger_id = %session.charger_id,
            connector_id = session.connector_id,
            "connector not in topology, demand is zero"
        );
        return 0.0;
    };
    let active = registry.active_on_charger(&session.charger_id).max(1);
    let charger_share = charger.max_power / active as f64;
    session
        .vehicle_max_power
        .min(charger_share)
        .min(connector.max_power)
}

fn round1(value: f64) -> f64 {
    (value * 10.0).round() / 10.0
}

fn tenths(value: f64) -> i64 {
    (value * 10.0).round() as i64
}

/// Compute a fresh allocation for every active session.
///
/// Deterministic single pass: sessions are visited in `session_id` order,
/// each demand is scaled by the common factor and rounded to 0.1 kW, and a
/// correction pass shaves 0.1 kW off the highest-id sessions while the
/// rounded sum still exceeds the available total.
pub fn allocate(
    registry: &SessionRegistry,
    config: &StationConfig,
    bess_discharge_kw: f64,
) -> AllocationPlan {
    let grid_available = config.grid_available();
    let total_available = grid_available + bess_discharge_kw;

    let sessions = registry.sessions_sorted();
    if sessions.is_empty() {
        return AllocationPlan {
            allocations: Vec::new(),
            total_available,
            total_demand: 0.0,
            factor: 1.0,
        };
    }

    let demands: Vec<f64> = sessions
        .iter()
        .map(|session| session_demand(config, registry, session))
        .collect();
    let total_demand: f64 = demands.iter().sum();

    let factor = if total_demand <= total_available {
        1.0
    } else {
        total_available / total_demand
    };

    let mut granted: Vec<i64> = demands
        .iter()
        .map(|demand| tenths(round1(demand * factor)))
        .collect();

    // Rounding can overshoot the budget by up to 0.05 kW per session. Shave
    // tenths off the highest-id sessions until the sum fits again.
    let budget = (total_available * 10.0).floor().max(0.0) as i64;
    let mut sum: i64 = granted.iter().sum();
    let mut idx = granted.len();
    while sum > budget && idx > 0 {
        let i = idx - 1;
        if granted[i] > 0 {
            granted[i] -= 1;
            sum -= 1;
        } else {
            idx -= 1;
        }
    }

    let allocations = sessions
        .iter()
        .zip(granted)
        .map(|(session, tenths)| {
            let mut allocation = session.allocation();
            allocation.allocated_power = tenths as f64 / 10.0;
            allocation
        })
        .collect();

    AllocationPlan {
        allocations,
        total_available,
        total_demand,
        factor,
    }
}
