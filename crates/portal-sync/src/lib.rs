//! Portal control synchronization.
//!
//! Keeps a live control channel to the portal fleet, reconciles portal
//! presence and sales metrics from the events it carries, dispatches operator
//! commands, and falls back to simulated traffic for good once the channel
//! cannot be reached.

pub mod backoff;
pub mod clock;
pub mod commands;
pub mod config;
pub mod connection;
pub mod controller;
pub mod envelope;
pub mod error;
pub mod health;
pub mod notify;
pub mod reconciler;
pub mod simulation;
pub mod state;
pub mod transport;

pub use backoff::BackoffPolicy;
pub use clock::{Clock, ManualClock, SystemClock, TokioClock};
pub use commands::{
    CommandCategory, CommandDispatcher, CommandKind, CommandLink, CommandRequest, CommandTarget,
    DEFAULT_COMMAND_ACK_TIMEOUT, DEFAULT_MAX_PENDING_COMMANDS, DispatchOutcome, ExecutionPath,
};
pub use config::{Config, ConfigError, DEFAULT_CONTROL_URL};
pub use connection::{
    ConnectionConfig, ConnectionManager, ConnectionPhase, ConnectionSignal, ConnectionSnapshot,
    FailureCause,
};
pub use controller::PortalController;
pub use envelope::{
    AuthResult, CommandAck, CommandAckStatus, EventEnvelope, EventOrigin, InboundMessage,
    MINOR_UNITS_PER_UNIT, OperatorIdentity, OutboundMessage, PortalEvent, format_amount,
    parse_inbound,
};
pub use error::{ControlError, Result};
pub use health::{HealthReport, classify_system_health};
pub use notify::{Notification, NotificationLevel, NotificationSink, RecordingSink, TracingSink};
pub use reconciler::{ReconcilerConfig, StateReconciler};
pub use simulation::{SimulationConfig, SimulationEngine};
pub use state::{
    ACTIVITY_LOG_CAPACITY, ActivityLog, ActivityLogEntry, ControlSnapshot, ControlState,
    ControlledMetrics, PortalId, PortalState, PortalStatus, SystemHealth,
};
pub use transport::{
    ConnectScript, ControlChannel, ControlTransport, MemoryTransport, RemoteEnd,
    TransportEvent, WebSocketTransport,
};
