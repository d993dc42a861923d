use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::topology::BatteryConfig;

/// Below this the battery stays idle rather than cycling for nothing.
pub const MIN_CHARGE_POWER_KW: f64 = 5.0;

/// Band separating idle from active on telemetry and commands.
const IDLE_BAND_KW: f64 = 0.1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BessMode {
    Idle,
    Charging,
    Discharging,
    /// Discharging driven by session demand rather than a manual command.
    /// Updates the reservoir exactly like `Discharging`.
    Boost,
}

impl std::fmt::Display for BessMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BessMode::Idle => write!(f, "idle"),
            BessMode::Charging => write!(f, "charging"),
            BessMode::Discharging => write!(f, "discharging"),
            BessMode::Boost => write!(f, "boost"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BessCommandKind {
    Charge,
    Discharge,
    Idle,
}

impl std::fmt::Display for BessCommandKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BessCommandKind::Charge => write!(f, "charge"),
            BessCommandKind::Discharge => write!(f, "discharge"),
            BessCommandKind::Idle => write!(f, "idle"),
        }
    }
}

/// Device-facing command. `power` is a positive magnitude; the direction is
/// carried by the kind.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BessCommand {
    pub kind: BessCommandKind,
    pub power: f64,
}

/// Point-in-time view of the reservoir, as logged and as handed to the
/// allocator.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BessSnapshot {
    pub timestamp: DateTime<Utc>,
    pub mode: BessMode,
    /// Signed kW: positive = discharging, negative = charging.
    pub power: f64,
    pub soc: f64,
    pub capacity: f64,
    pub available_energy: f64,
    pub available_discharge: f64,
    pub available_charge: f64,
}

/// State of the finite energy reservoir. Cannot fail: with the reservoir
/// exhausted or the state unknown it degrades to idle.
#[derive(Debug)]
pub struct BessController {
    config: BatteryConfig,
    soc: f64,
    /// Signed kW: positive = discharging, negative = charging.
    power: f64,
    mode: BessMode,
    telemetry_seen: bool,
}

impl BessController {
    pub fn new(config: BatteryConfig) -> Self {
        let soc = config.max_soc;
        BessController {
            config,
            soc,
            power: 0.0,
            mode: BessMode::Idle,
            telemetry_seen: false,
        }
    }

    pub fn soc(&self) -> f64 {
        self.soc
    }

    /// Signed power, positive when discharging.
    pub fn power(&self) -> f64 {
        self.power
    }

    pub fn mode(&self) -> BessMode {
        self.mode
    }

    /// True once a real battery has reported; the simulated integration is
    /// then switched off.
    pub fn has_telemetry(&self) -> bool {
        self.telemetry_seen
    }

    pub fn snapshot(&self) -> BessSnapshot {
        BessSnapshot {
            timestamp: Utc::now(),
            mode: self.mode,
            power: self.power,
            soc: self.soc,
            capacity: self.config.initial_capacity,
            available_energy: self.available_energy(),
            available_discharge: self.available_discharge(),
            available_charge: self.available_charge(),
        }
    }

    /// Energy above the SOC floor, in kWh.
    pub fn available_energy(&self) -> f64 {
        let usable_soc = (self.soc - self.config.min_soc).max(0.0);
        usable_soc / 100.0 * self.config.initial_capacity
    }

    /// Discharge power available right now, bounding the drain at one hour.
    pub fn available_discharge(&self) -> f64 {
        if self.soc <= self.config.min_soc {
            return 0.0;
        }
        self.config.power.min(self.available_energy())
    }

    /// Charge power available right now, symmetric against the SOC ceiling.
    pub fn available_charge(&self) -> f64 {
        if self.soc >= self.config.max_soc {
            return 0.0;
        }
        let headroom_kwh =
            (self.config.max_soc - self.soc) / 100.0 * self.config.initial_capacity;
        self.config.power.min(headroom_kwh)
    }

    /// How much the battery can cover of the shortfall between session
    /// demand and grid headroom.
    pub fn boost_power(&self, grid_available: f64, total_demand: f64) -> f64 {
        let shortage = (total_demand - grid_available).max(0.0);
        if shortage == 0.0 {
            return 0.0;
        }
        shortage.min(self.available_discharge())
    }

    /// Charge power worth taking from spare grid capacity, or zero when the
    /// opportunity is below the minimum useful threshold.
    pub fn charge_opportunity(&self, grid_available: f64, current_load: f64) -> f64 {
        if self.soc >= self.config.max_soc {
            return 0.0;
        }
        let spare = grid_available - current_load;
        if spare <= 0.0 {
            return 0.0;
        }
        let charge = spare.min(self.available_charge());
        if charge < MIN_CHARGE_POWER_KW {
            return 0.0;
        }
        charge
    }

    /// Command a demand-driven discharge, clamped to what the reservoir can
    /// deliver.
    pub fn command_discharge(&mut self, power: f64) -> BessCommand {
        let actual = power.min(self.available_discharge());
        if actual < IDLE_BAND_KW {
            return self.command_idle();
        }
        self.mode = BessMode::Boost;
        self.power = actual;
        BessCommand {
            kind: BessCommandKind::Discharge,
            power: actual,
        }
    }

    pub fn command_charge(&mut self, power: f64) -> BessCommand {
        let actual = power.min(self.available_charge());
        if actual < IDLE_BAND_KW {
            return self.command_idle();
        }
        self.mode = BessMode::Charging;
        self.power = -actual;
        BessCommand {
            kind: BessCommandKind::Charge,
            power: actual,
        }
    }

    pub fn command_idle(&mut self) -> BessCommand {
        self.mode = BessMode::Idle;
        self.power = 0.0;
        BessCommand {
            kind: BessCommandKind::Idle,
            power: 0.0,
        }
    }

    /// Integrate `power` (signed, positive = discharge) over `duration_secs`
    /// and move the SOC, clamped to the configured bounds. Used while no real
    /// battery reports.
    pub fn apply_power(&mut self, power: f64, duration_secs: f64) {
        let energy_kwh = power * duration_secs / 3600.0;
        let soc_change = energy_kwh / self.config.initial_capacity * 100.0;
        self.soc = (self.soc - soc_change)
            .clamp(self.config.min_soc, self.config.max_soc);
        self.power = power;
        self.mode = self.mode_for_power(power);
        debug!(
            power_kw = power,
            duration_secs,
            soc = self.soc,
            "applied battery power"
        );
    }

    /// A real report overrides the simulated state. Mode is derived from the
    /// sign and magnitude of the reported power.
    pub fn update_from_telemetry(&mut self, soc: f64, power: f64) {
        self.telemetry_seen = true;
        self.soc = soc.clamp(self.config.min_soc, self.config.max_soc);
        self.power = power;
        self.mode = self.mode_for_power(power);
    }

    fn mode_for_power(&self, power: f64) -> BessMode {
        if power.abs() < IDLE_BAND_KW {
            BessMode::Idle
        } else if power > 0.0 {
            // keep the boost tag while the discharge is demand-driven
            if self.mode == BessMode::Boost {
                BessMode::Boost
            } else {
                BessMode::Discharging
            }
        } else {
            BessMode::Charging
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn battery() -> BatteryConfig {
        BatteryConfig {
            initial_capacity: 200.0,
            power: 100.0,
            min_soc: 10.0,
            max_soc: 100.0,
        }
    }

    fn controller_at(soc: f64) -> BessController {
        let mut controller = BessController::new(battery());
        controller.update_from_telemetry(soc, 0.0);
        controller
    }

    #[test]
    fn test_starts_full_and_idle() {
        let controller = BessController::new(battery());
        assert_eq!(controller.soc(), 100.0);
        assert_eq!(controller.mode(), BessMode::Idle);
        assert!(!controller.has_telemetry());
    }

    #[test]
    fn test_available_discharge_at_80_percent() {
        let controller = controller_at(80.0);
        // 70% usable of 200 kWh is 140 kWh, capped by the 100 kW inverter
        assert_eq!(controller.available_energy(), 140.0);
        assert_eq!(controller.available_discharge(), 100.0);
    }

    #[test]
    fn test_available_discharge_energy_limited() {
        let controller = controller_at(15.0);
        // only 5% above the floor: 10 kWh, one hour of drain
        assert_eq!(controller.available_discharge(), 10.0);
    }

    #[test]
    fn test_no_discharge_at_floor() {
        let controller = controller_at(10.0);
        assert_eq!(controller.available_discharge(), 0.0);
        assert_eq!(controller.boost_power(397.0, 600.0), 0.0);
    }

    #[test]
    fn test_no_charge_at_ceiling() {
        let controller = controller_at(100.0);
        assert_eq!(controller.available_charge(), 0.0);
        assert_eq!(controller.charge_opportunity(397.0, 23.0), 0.0);
    }

    #[test]
    fn test_boost_covers_shortage() {
        let controller = controller_at(80.0);
        assert_eq!(controller.boost_power(397.0, 600.0), 100.0);
        assert_eq!(controller.boost_power(397.0, 420.0), 23.0);
        assert_eq!(controller.boost_power(397.0, 300.0), 0.0);
    }

    #[test]
    fn test_charge_opportunity_bounded_by_headroom() {
        let controller = controller_at(95.0);
        // 5% headroom of 200 kWh is 10 kWh
        assert_eq!(controller.charge_opportunity(397.0, 23.0), 10.0);
    }

    #[test]
    fn test_charge_opportunity_below_threshold_stays_idle() {
        let controller = controller_at(98.0);
        // 4 kWh of headroom is under the 5 kW minimum
        assert_eq!(controller.charge_opportunity(397.0, 23.0), 0.0);
    }

    #[test]
    fn test_command_discharge_clamps_and_tags_boost() {
        let mut controller = controller_at(15.0);
        let command = controller.command_discharge(50.0);
        assert_eq!(command.kind, BessCommandKind::Discharge);
        assert_eq!(command.power, 10.0);
        assert_eq!(controller.mode(), BessMode::Boost);
        assert_eq!(controller.power(), 10.0);
    }

    #[test]
    fn test_command_charge_records_negative_power() {
        let mut controller = controller_at(60.0);
        let command = controller.command_charge(374.0);
        assert_eq!(command.kind, BessCommandKind::Charge);
        assert_eq!(command.power, 80.0); // 40% headroom of 200 kWh
        assert_eq!(controller.power(), -80.0);
        assert_eq!(controller.mode(), BessMode::Charging);
    }

    #[test]
    fn test_command_below_band_degrades_to_idle() {
        let mut controller = controller_at(10.0);
        let command = controller.command_discharge(50.0);
        assert_eq!(command.kind, BessCommandKind::Idle);
        assert_eq!(controller.mode(), BessMode::Idle);
    }

    #[test]
    fn test_apply_power_integrates_soc() {
        let mut controller = controller_at(80.0);
        // 100 kW for an hour out of 200 kWh is 50 SOC points
        controller.apply_power(100.0, 3600.0);
        assert!((controller.soc() - 30.0).abs() < 1e-9);
        assert_eq!(controller.mode(), BessMode::Discharging);

        // charging moves the other way
        controller.apply_power(-100.0, 1800.0);
        assert!((controller.soc() - 55.0).abs() < 1e-9);
        assert_eq!(controller.mode(), BessMode::Charging);
    }

    #[test]
    fn test_apply_power_clamps_at_floor() {
        let mut controller = controller_at(11.0);
        controller.apply_power(100.0, 3600.0);
        assert_eq!(controller.soc(), 10.0);
    }

    #[test]
    fn test_apply_power_keeps_boost_tag() {
        let mut controller = controller_at(80.0);
        controller.command_discharge(100.0);
        controller.apply_power(100.0, 1.0);
        assert_eq!(controller.mode(), BessMode::Boost);
    }

    #[test]
    fn test_telemetry_overrides_simulation() {
        let mut controller = BessController::new(battery());
        controller.update_from_telemetry(42.5, -30.0);
        assert!(controller.has_telemetry());
        assert_eq!(controller.soc(), 42.5);
        assert_eq!(controller.mode(), BessMode::Charging);

        controller.update_from_telemetry(42.6, 0.05);
        assert_eq!(controller.mode(), BessMode::Idle);
    }

    #[test]
    fn test_telemetry_soc_clamped_to_bounds() {
        let mut controller = BessController::new(battery());
        controller.update_from_telemetry(3.0, 0.0);
        assert_eq!(controller.soc(), 10.0);
    }
}
