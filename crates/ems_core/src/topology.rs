use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

fn default_static_load() -> f64 {
    3.0
}

fn default_min_soc() -> f64 {
    10.0
}

fn default_max_soc() -> f64 {
    100.0
}

/// Immutable site description, loaded once at boot.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StationConfig {
    pub station_id: String,
    /// Contractual grid connection limit in kW.
    pub grid_capacity: f64,
    /// Baseline auxiliary consumption (lighting, HVAC) in kW.
    #[serde(default = "default_static_load")]
    pub static_load: f64,
    pub chargers: Vec<ChargerConfig>,
    #[serde(default)]
    pub battery: Option<BatteryConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChargerConfig {
    pub id: String,
    /// Max power in kW, shared between the charger's connectors.
    pub max_power: f64,
    pub connectors: Vec<ConnectorConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub manufacturer: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
}

/// One physical outlet. Connector fields are snake_case on the wire,
/// unlike the rest of the station config.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectorConfig {
    pub connector_id: u32,
    pub connector_type: ConnectorType,
    /// Nameplate maximum of this outlet in kW.
    pub max_power: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConnectorType {
    #[serde(rename = "CCS2")]
    Ccs2,
    #[serde(rename = "CHAdeMO")]
    Chademo,
    #[serde(rename = "Type2")]
    Type2,
    #[serde(rename = "Type1")]
    Type1,
    #[serde(rename = "GB/T")]
    GbT,
    #[serde(rename = "Tesla")]
    Tesla,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatteryConfig {
    /// Reservoir capacity in kWh.
    pub initial_capacity: f64,
    /// Max charge and discharge power in kW.
    pub power: f64,
    #[serde(rename = "minSOC", default = "default_min_soc")]
    pub min_soc: f64,
    #[serde(rename = "maxSOC", default = "default_max_soc")]
    pub max_soc: f64,
}

impl StationConfig {
    /// Validate the boot configuration. Any error here is fatal.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.grid_capacity <= 0.0 {
            return Err(ConfigError::InvalidGridCapacity(self.grid_capacity));
        }
        if self.static_load < 0.0 {
            return Err(ConfigError::InvalidStaticLoad(self.static_load));
        }
        if self.chargers.is_empty() {
            return Err(ConfigError::NoChargers);
        }
        let mut charger_ids = std::collections::HashSet::new();
        for charger in &self.chargers {
            if !charger_ids.insert(charger.id.as_str()) {
                return Err(ConfigError::DuplicateCharger(charger.id.clone()));
            }
            if charger.max_power <= 0.0 {
                return Err(ConfigError::InvalidChargerPower(charger.id.clone()));
            }
            if charger.connectors.is_empty() {
                return Err(ConfigError::NoConnectors {
                    charger_id: charger.id.clone(),
                });
            }
            let mut connector_ids = std::collections::HashSet::new();
            for connector in &charger.connectors {
                if !connector_ids.insert(connector.connector_id) {
                    return Err(ConfigError::DuplicateConnector {
                        charger_id: charger.id.clone(),
                        connector_id: connector.connector_id,
                    });
                }
                if connector.max_power <= 0.0 {
                    return Err(ConfigError::InvalidConnectorPower {
                        charger_id: charger.id.clone(),
                        connector_id: connector.connector_id,
                    });
                }
            }
        }
        if let Some(battery) = &self.battery {
            if battery.initial_capacity <= 0.0 {
                return Err(ConfigError::InvalidBattery(format!(
                    "capacity {} kWh",
                    battery.initial_capacity
                )));
            }
            if battery.power <= 0.0 {
                return Err(ConfigError::InvalidBattery(format!(
                    "power {} kW",
                    battery.power
                )));
            }
            if battery.min_soc < 0.0
                || battery.max_soc > 100.0
                || battery.min_soc >= battery.max_soc
            {
                return Err(ConfigError::InvalidBattery(format!(
                    "SOC bounds {}..{}",
                    battery.min_soc, battery.max_soc
                )));
            }
        }
        Ok(())
    }

    /// Grid power left for charging after the site baseline.
    pub fn grid_available(&self) -> f64 {
        self.grid_capacity - self.static_load
    }

    pub fn charger(&self, charger_id: &str) -> Option<&ChargerConfig> {
        self.chargers.iter().find(|c| c.id == charger_id)
    }

    pub fn connector(&self, charger_id: &str, connector_id: u32) -> Option<&ConnectorConfig> {
        self.charger(charger_id)?
            .connectors
            .iter()
            .find(|c| c.connector_id == connector_id)
    }
}
