//! The session coordinator: a single serial actor that owns the session
//! registry and the battery state. REST and the message fabric are two
//! inbound adapters over the same event vocabulary; both only enqueue.

mod coordinator;
mod events;
mod sink;

pub use coordinator::{
    BESS_REPUBLISH_THRESHOLD_KW, Coordinator, EngineError, EngineHandle,
    POWER_METRICS_SAMPLE_EVERY, REALLOCATION_HYSTERESIS_KW, spawn_coordinator,
};
pub use events::{
    EmsEvent, OutboundCommand, PowerUpdateRequest, SessionStartRequest, SessionStarted,
    StationStatus,
};
pub use sink::{AuditEvent, AuditKind, PersistenceSink, PowerMetrics, StoreError};
