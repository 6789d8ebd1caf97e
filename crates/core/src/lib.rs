#![forbid(unsafe_code)]
#![deny(unreachable_pub)]
#![deny(missing_docs)]

//! Domain models, events, and error kinds shared by the `drover` worker node.

/// Error kinds surfaced across the worker.
pub mod error;
/// Typed domain event bus.
pub mod events;
/// Protocol-independent data models and wire shapes.
pub mod models;

pub use error::WorkerError;
pub use events::{EventBus, WorkerEvent};
pub use models::{
    ConnectionConfig, ConnectionState, ControlMessage, ControlType, ExecPlan, ExecResult,
    Heartbeat, LogEntry, LogKind, NodeMetrics, OsInfo, Protocol, RunContext, RunStatus,
    RuntimeSpec, StoredArtifact, TaskDispatch, TaskPayload, TaskResult, TaskResultData,
    TaskStatusUpdate, TaskType, ExitReason,
};
