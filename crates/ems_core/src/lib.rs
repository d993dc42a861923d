//! Pure domain model for the site energy management system: the station
//! topology, the live session registry, the fair-share power allocator and
//! the battery (BESS) controller. Everything here is synchronous and
//! side-effect free; the coordinator in `ems_engine` drives it.

mod allocator;
mod bess;
mod error;
mod session;
mod topology;

pub use allocator::{AllocationPlan, allocate, session_demand};
pub use bess::{
    BessCommand, BessCommandKind, BessController, BessMode, BessSnapshot, MIN_CHARGE_POWER_KW,
};
pub use error::{ConfigError, SessionError};
pub use session::{
    ChargingSession, ConnectorStatus, PowerAllocation, SessionRegistry, SessionStatus,
};
pub use topology::{BatteryConfig, ChargerConfig, ConnectorConfig, ConnectorType, StationConfig};
