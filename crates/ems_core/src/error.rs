use thiserror::Error;

/// Errors surfaced to the caller of a session operation.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum SessionError {
    #[error("charger {charger_id} not found")]
    UnknownCharger { charger_id: String },

    #[error("connector {charger_id}:{connector_id} not found")]
    UnknownConnector { charger_id: String, connector_id: u32 },

    #[error("connector {charger_id}:{connector_id} is already in use")]
    ConnectorBusy { charger_id: String, connector_id: u32 },

    #[error("session {session_id} not found")]
    SessionNotFound { session_id: String },

    #[error("stale update for session {session_id}: {reason}")]
    StaleUpdate { session_id: String, reason: String },
}

/// Fatal topology problems detected at boot. The station never starts with
/// an invalid configuration.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum ConfigError {
    #[error("grid capacity must be positive, got {0} kW")]
    InvalidGridCapacity(f64),

    #[error("static load must not be negative, got {0} kW")]
    InvalidStaticLoad(f64),

    #[error("station has no chargers")]
    NoChargers,

    #[error("duplicate charger id {0}")]
    DuplicateCharger(String),

    #[error("charger {charger_id} has no connectors")]
    NoConnectors { charger_id: String },

    #[error("duplicate connector {connector_id} on charger {charger_id}")]
    DuplicateConnector { charger_id: String, connector_id: u32 },

    #[error("non-positive max power on charger {0}")]
    InvalidChargerPower(String),

    #[error("non-positive max power on connector {charger_id}:{connector_id}")]
    InvalidConnectorPower { charger_id: String, connector_id: u32 },

    #[error("battery parameters invalid: {0}")]
    InvalidBattery(String),
}
