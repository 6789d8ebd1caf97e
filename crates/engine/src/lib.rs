#![deny(unreachable_pub)]

//! Task lifecycle core of the `drover` worker node: scheduler, run-state
//! tracking, log buffering, process execution, and the engine that wires
//! them to the transport.

pub mod engine;
pub mod executor;
pub mod heartbeat;
pub mod interfaces;
pub mod logbuf;
pub mod scheduler;
pub mod security;
pub mod state;

pub use engine::{Engine, EngineBuilder, EngineSettings};
pub use executor::{ExecStats, ExecutorConfig, ProcessExecutor};
pub use heartbeat::HeartbeatService;
pub use interfaces::{
    ArtifactManager, EnvInfo, Executor, FlowController, LogManager, LogManagerFactory, LogSink,
    Plugin, PluginRegistry, ProjectFetcher, RuntimeHandle, RuntimeManager,
};
pub use logbuf::{LogBuffer, LogBufferConfig, LogService};
pub use scheduler::{QueuedItem, Scheduler, SchedulerStats};
pub use state::{RunRecord, RunState, StateManager};
