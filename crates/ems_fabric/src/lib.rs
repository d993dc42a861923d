//! Message fabric adapter: translates inbound MQTT device messages into
//! coordinator events and outbound coordinator commands into MQTT publishes.
//! The broker eventloop task only decodes and enqueues; it never touches the
//! registry.

mod adapter;
mod messages;
mod topics;

pub use adapter::{FabricAdapter, FabricConfig, OUTBOUND_BUFFER};
pub use messages::{
    BessCommandMessage, BessStatusMessage, ChargerTelemetryMessage, Priority, PowerLimitCommand,
    SessionStartCommand, SessionStartMessage, SessionStopMessage, SessionUpdateMessage,
    StopReason,
};
pub use topics::{InboundKind, Topics};
