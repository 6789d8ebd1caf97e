use std::collections::HashMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Kind of work a task carries.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum TaskType {
    /// Plain code execution (also used for file projects).
    Code,
    /// Spider / crawl job.
    Spider,
    /// Page-render job.
    Render,
    /// Anything the built-in mapping does not recognize.
    Custom,
}

/// Terminal status of a run.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    /// Normal completion. Wire messages may spell this `completed`; it is
    /// accepted as an inbound alias.
    #[serde(alias = "completed")]
    Success,
    /// The run failed (non-zero exit, limit kill, or internal error).
    Failed,
    /// The run was cancelled cooperatively.
    Cancelled,
    /// The wall-clock timeout fired.
    Timeout,
}

/// Why the child process ended.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ExitReason {
    /// Clean exit 0.
    Ok,
    /// Non-zero exit or internal failure.
    Error,
    /// Terminated by an engine cancel.
    Cancelled,
    /// Terminated by the wall-clock timeout.
    Timeout,
    /// Killed by the memory limit.
    Oom,
    /// Killed by the CPU-time limit.
    CpuExceeded,
}

/// Transport protocol in use.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    /// No transport connected.
    None,
    /// Long-lived bidirectional streaming driver (preferred).
    Stream,
    /// Request/response driver (fallback).
    Http,
}

/// Connection state of a transport.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    /// Not connected.
    Disconnected,
    /// Connection attempt in flight.
    Connecting,
    /// Connected over the preferred protocol.
    Connected,
    /// Reconnect loop active.
    Reconnecting,
    /// Connected, but over the fallback protocol while streaming is preferred.
    Degraded,
}

/// Task priorities. Lower is more urgent.
pub mod priority {
    /// Highest priority.
    pub const CRITICAL: u8 = 0;
    /// Spider / render work defaults here.
    pub const HIGH: u8 = 1;
    /// Code / file work defaults here.
    pub const NORMAL: u8 = 2;
    /// Background work.
    pub const LOW: u8 = 3;
    /// Lowest priority.
    pub const IDLE: u8 = 4;
}

/// Default priority for a task type.
pub fn default_priority(task_type: TaskType) -> u8 {
    match task_type {
        TaskType::Spider | TaskType::Render => priority::HIGH,
        TaskType::Code | TaskType::Custom => priority::NORMAL,
    }
}

/// Descriptor of the interpreter/environment a run wants prepared.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct RuntimeSpec {
    /// Named environment, when the Master refers to one by name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Interpreter version requested.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    /// Explicit interpreter path, when known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub interpreter_path: Option<String>,
    /// Extra environment variables the runtime injects into the child.
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub env_vars: HashMap<String, String>,
}

/// Worker-local context for one run, created when a task is accepted from
/// the poll loop and destroyed when its result has been reported.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunContext {
    /// Unique per run on this worker.
    pub run_id: String,
    /// Logical job identity assigned by the Master.
    pub task_id: String,
    /// Project the task belongs to.
    pub project_id: String,
    /// Wall-clock budget in seconds (0 = the executor default).
    #[serde(default)]
    pub timeout_seconds: u64,
    /// Memory cap in MiB (0 = unlimited).
    #[serde(default)]
    pub memory_limit_mb: u64,
    /// CPU-time cap in seconds (0 = unlimited).
    #[serde(default)]
    pub cpu_limit_seconds: u64,
    /// Priority 0..=4, 0 highest.
    #[serde(default = "default_normal_priority")]
    pub priority: u8,
    /// Free-form labels (e.g. `runtime_env_name`).
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub labels: HashMap<String, String>,
    /// Opaque claim token from the Master, acknowledged after reporting.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub receipt: Option<String>,
    /// Runtime environment to prepare, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub runtime_spec: Option<RuntimeSpec>,
}

fn default_normal_priority() -> u8 {
    priority::NORMAL
}

/// Normalized view of an incoming task message, consumed by plugins and the
/// fallback plan builder.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskPayload {
    /// Kind of work.
    pub task_type: TaskType,
    /// Local project directory, filled by the fetcher.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub project_path: Option<String>,
    /// Where to download the project archive from.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub download_url: Option<String>,
    /// Hash of the project archive.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_hash: Option<String>,
    /// Whether the archive needs unpacking.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub is_compressed: Option<bool>,
    /// Entry point within the project.
    #[serde(default)]
    pub entry_point: String,
    /// Ordered positional arguments.
    #[serde(default)]
    pub args: Vec<String>,
    /// Keyword parameters.
    #[serde(default)]
    pub kwargs: serde_json::Map<String, serde_json::Value>,
    /// Environment variables for the child.
    #[serde(default)]
    pub env_vars: HashMap<String, String>,
    /// Glob patterns for artifacts to collect.
    #[serde(default)]
    pub artifact_patterns: Vec<String>,
}

/// The concrete recipe the executor runs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecPlan {
    /// Executable path.
    pub command: String,
    /// Ordered arguments.
    #[serde(default)]
    pub args: Vec<String>,
    /// Environment after the runtime-env merge.
    #[serde(default)]
    pub env: HashMap<String, String>,
    /// Working directory.
    pub cwd: String,
    /// Wall-clock budget in seconds (0 = executor default).
    #[serde(default)]
    pub timeout_seconds: u64,
    /// Memory cap in MiB (0 = unlimited).
    #[serde(default)]
    pub memory_limit_mb: u64,
    /// CPU-time cap in seconds (0 = unlimited).
    #[serde(default)]
    pub cpu_limit_seconds: u64,
    /// Disk-write cap in MiB (0 = unlimited).
    #[serde(default)]
    pub disk_limit_mb: u64,
    /// Glob patterns for artifacts to collect after the run.
    #[serde(default)]
    pub artifact_patterns: Vec<String>,
    /// Run this plan belongs to; set by the engine before execution.
    #[serde(default)]
    pub run_id: String,
}

/// An artifact stored by the artifact manager.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct StoredArtifact {
    /// File name relative to the work dir.
    pub name: String,
    /// Location the artifact was stored at.
    pub uri: String,
    /// Size in bytes.
    #[serde(default)]
    pub size_bytes: u64,
}

/// Outcome of one executed run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecResult {
    /// Run this result belongs to.
    pub run_id: String,
    /// Terminal status.
    pub status: RunStatus,
    /// Why the child ended.
    pub exit_reason: ExitReason,
    /// Child exit code, when one was observed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
    /// Human-readable failure message.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    /// When execution started.
    pub started_at: DateTime<Utc>,
    /// When execution finished.
    pub finished_at: DateTime<Utc>,
    /// Total execution time in milliseconds.
    #[serde(default)]
    pub duration_ms: u64,
    /// Lines captured from stdout.
    #[serde(default)]
    pub stdout_lines: u64,
    /// Lines captured from stderr.
    #[serde(default)]
    pub stderr_lines: u64,
    /// Artifacts collected for this run.
    #[serde(default)]
    pub artifacts: Vec<StoredArtifact>,
    /// Whether the run's logs were archived.
    #[serde(default)]
    pub log_archived: bool,
    /// URI of the archived log bundle, when present.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub log_archive_uri: Option<String>,
}

impl ExecResult {
    /// A minimal `CANCELLED` result, used by paths that never reached the
    /// executor (cancel-while-queued, cancel-while-preparing).
    pub fn cancelled(run_id: &str, started_at: DateTime<Utc>, reason: &str) -> Self {
        let finished_at = Utc::now();
        Self {
            run_id: run_id.to_string(),
            status: RunStatus::Cancelled,
            exit_reason: ExitReason::Cancelled,
            exit_code: None,
            error_message: if reason.is_empty() {
                None
            } else {
                Some(reason.to_string())
            },
            started_at,
            finished_at,
            duration_ms: (finished_at - started_at).num_milliseconds().max(0) as u64,
            stdout_lines: 0,
            stderr_lines: 0,
            artifacts: Vec::new(),
            log_archived: false,
            log_archive_uri: None,
        }
    }

    /// A `FAILED` result carrying an internal error message.
    pub fn failed(run_id: &str, started_at: DateTime<Utc>, message: &str) -> Self {
        let finished_at = Utc::now();
        Self {
            run_id: run_id.to_string(),
            status: RunStatus::Failed,
            exit_reason: ExitReason::Error,
            exit_code: None,
            error_message: Some(message.to_string()),
            started_at,
            finished_at,
            duration_ms: (finished_at - started_at).num_milliseconds().max(0) as u64,
            stdout_lines: 0,
            stderr_lines: 0,
            artifacts: Vec::new(),
            log_archived: false,
            log_archive_uri: None,
        }
    }
}

/// Which stream a log line came from.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LogKind {
    /// Child stdout.
    Stdout,
    /// Child stderr.
    Stderr,
}

/// One captured log line, without its trailing newline.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LogEntry {
    /// Run the line belongs to (`execution_id` on the wire for
    /// compatibility with the Master's log endpoints).
    pub execution_id: String,
    /// Originating stream.
    pub log_type: LogKind,
    /// Line content.
    pub content: String,
    /// Capture time.
    pub timestamp: DateTime<Utc>,
}

impl LogEntry {
    /// Build an entry stamped now.
    pub fn new(execution_id: impl Into<String>, log_type: LogKind, content: impl Into<String>) -> Self {
        Self {
            execution_id: execution_id.into(),
            log_type,
            content: content.into(),
            timestamp: Utc::now(),
        }
    }
}

/// A task message as polled from the Master.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct TaskDispatch {
    /// Logical job identity.
    pub task_id: String,
    /// Worker-local run id, when the Master pre-assigned one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run_id: Option<String>,
    /// Project the task belongs to.
    #[serde(default)]
    pub project_id: String,
    /// `spider` | `render` | `code` | `file`, when present.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub project_type: Option<String>,
    /// Wall-clock budget in seconds.
    #[serde(default)]
    pub timeout: u64,
    /// Priority 0..=4, when the Master overrides the default.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub priority: Option<u8>,
    /// Environment variables for the child.
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub environment: HashMap<String, String>,
    /// Free-form parameters; recognized keys are `args`, `kwargs`, and
    /// `artifact_patterns`.
    #[serde(default, skip_serializing_if = "serde_json::Value::is_null")]
    pub params: serde_json::Value,
    /// Where to download the project archive from.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub download_url: Option<String>,
    /// Hash of the project archive.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_hash: Option<String>,
    /// Whether the archive needs unpacking.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub is_compressed: Option<bool>,
    /// Entry point within the project.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub entry_point: Option<String>,
    /// Opaque claim token to acknowledge after reporting.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub receipt: Option<String>,
}

impl TaskDispatch {
    /// Map the wire `project_type` to a [`TaskType`].
    pub fn task_type(&self) -> TaskType {
        match self.project_type.as_deref().unwrap_or("code") {
            "spider" => TaskType::Spider,
            "render" => TaskType::Render,
            // File projects execute through the code path.
            "code" | "file" => TaskType::Code,
            _ => TaskType::Custom,
        }
    }
}

/// Kind of control message.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ControlType {
    /// Cooperative cancel.
    Cancel,
    /// Hard kill (handled like cancel on this worker).
    Kill,
    /// Resource/concurrency configuration change.
    ConfigUpdate,
    /// Runtime-environment management request.
    RuntimeManage,
}

/// A control-channel message from the Master.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ControlMessage {
    /// What to do.
    pub control_type: ControlType,
    /// Target run, when addressed by run id.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run_id: Option<String>,
    /// Target task, when addressed by task id.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_id: Option<String>,
    /// Operator-supplied reason.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    /// Type-specific payload.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<serde_json::Value>,
    /// Opaque receipt to acknowledge after handling.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub receipt: Option<String>,
}

/// The `data` object embedded in a terminal report.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct TaskResultData {
    /// Artifact summaries.
    #[serde(default)]
    pub artifacts: Vec<StoredArtifact>,
    /// URI of the archived log bundle ("" when none).
    #[serde(default)]
    pub log_archive_uri: String,
    /// Lines captured from stdout.
    #[serde(default)]
    pub stdout_lines: u64,
    /// Lines captured from stderr.
    #[serde(default)]
    pub stderr_lines: u64,
}

/// Terminal report sent to the Master; idempotent given a stable `run_id`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TaskResult {
    /// Worker-local run identity.
    pub run_id: String,
    /// Master-side job identity.
    pub task_id: String,
    /// Terminal status (lowercase on the wire).
    pub status: RunStatus,
    /// Child exit code (0 when none was observed).
    #[serde(default)]
    pub exit_code: i32,
    /// Failure message ("" on success).
    #[serde(default)]
    pub error_message: String,
    /// When execution started.
    pub started_at: DateTime<Utc>,
    /// When execution finished.
    pub finished_at: DateTime<Utc>,
    /// Total execution time in milliseconds.
    #[serde(default)]
    pub duration_ms: u64,
    /// Artifact and log-archive details.
    #[serde(default)]
    pub data: TaskResultData,
}

impl TaskResult {
    /// Materialize the terminal report for an [`ExecResult`].
    pub fn from_exec(context: &RunContext, result: &ExecResult) -> Self {
        Self {
            run_id: context.run_id.clone(),
            task_id: context.task_id.clone(),
            status: result.status,
            exit_code: result.exit_code.unwrap_or(0),
            error_message: result.error_message.clone().unwrap_or_default(),
            started_at: result.started_at,
            finished_at: result.finished_at,
            duration_ms: result.duration_ms,
            data: TaskResultData {
                artifacts: result.artifacts.clone(),
                log_archive_uri: result.log_archive_uri.clone().unwrap_or_default(),
                stdout_lines: result.stdout_lines,
                stderr_lines: result.stderr_lines,
            },
        }
    }
}

/// Non-terminal status update for a run (e.g. `running` heartbeats).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TaskStatusUpdate {
    /// Run the update refers to.
    pub execution_id: String,
    /// Status string (`running`, or a terminal status).
    pub status: String,
    /// Exit code for terminal updates.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
    /// Failure message for terminal updates.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    /// When the update was produced.
    pub timestamp: DateTime<Utc>,
}

impl TaskStatusUpdate {
    /// A `running` update stamped now.
    pub fn running(run_id: &str) -> Self {
        Self {
            execution_id: run_id.to_string(),
            status: "running".to_string(),
            exit_code: None,
            error_message: None,
            timestamp: Utc::now(),
        }
    }
}

/// Host OS description reported with heartbeats and registration.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct OsInfo {
    /// Operating system family.
    pub os_type: String,
    /// Kernel / OS version string.
    pub os_version: String,
    /// Worker runtime version.
    pub runtime_version: String,
    /// CPU architecture.
    pub machine_arch: String,
}

impl OsInfo {
    /// Describe the current host.
    pub fn current() -> Self {
        Self {
            os_type: std::env::consts::OS.to_string(),
            os_version: std::env::consts::FAMILY.to_string(),
            runtime_version: env!("CARGO_PKG_VERSION").to_string(),
            machine_arch: std::env::consts::ARCH.to_string(),
        }
    }
}

/// Point-in-time node utilization attached to heartbeats.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct NodeMetrics {
    /// CPU utilization percentage.
    #[serde(default)]
    pub cpu: f32,
    /// Memory utilization percentage.
    #[serde(default)]
    pub memory: f32,
    /// Disk utilization percentage.
    #[serde(default)]
    pub disk: f32,
    /// Runs currently executing.
    #[serde(default)]
    pub running_tasks: u64,
    /// Configured concurrency cap.
    #[serde(default)]
    pub max_concurrent_tasks: u64,
    /// Runs accepted since start.
    #[serde(default)]
    pub task_count: u64,
}

/// Liveness heartbeat; never buffered across disconnects.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Heartbeat {
    /// Reporting node.
    pub node_id: String,
    /// `online` in the steady state.
    pub status: String,
    /// Utilization snapshot.
    pub metrics: NodeMetrics,
    /// Host description.
    pub os_info: OsInfo,
    /// When the heartbeat was produced.
    pub timestamp: DateTime<Utc>,
    /// Free-form capability flags.
    #[serde(default, skip_serializing_if = "serde_json::Map::is_empty")]
    pub capabilities: serde_json::Map<String, serde_json::Value>,
}

impl Heartbeat {
    /// An `online` heartbeat with empty metrics, stamped now.
    pub fn online(node_id: &str) -> Self {
        Self {
            node_id: node_id.to_string(),
            status: "online".to_string(),
            metrics: NodeMetrics::default(),
            os_info: OsInfo::current(),
            timestamp: Utc::now(),
            capabilities: serde_json::Map::new(),
        }
    }
}

/// Connection settings for the Master link.
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// Master base URL for the request/response driver.
    pub master_url: String,
    /// This node's identity.
    pub node_id: String,
    /// API key presented on registration and requests.
    pub api_key: String,
    /// Stable machine identity.
    pub machine_code: String,
    /// HMAC secret for signed requests, when configured.
    pub secret_key: Option<String>,
    /// Port the Master's streaming listener runs on.
    pub stream_port: u16,
    /// Prefer the streaming driver when true.
    pub prefer_stream: bool,
    /// Node-heartbeat cadence.
    pub heartbeat_interval: Duration,
    /// First reconnect delay.
    pub reconnect_base_delay: Duration,
    /// Reconnect delay cap.
    pub reconnect_max_delay: Duration,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            master_url: "http://127.0.0.1:8700".to_string(),
            node_id: String::new(),
            api_key: String::new(),
            machine_code: String::new(),
            secret_key: None,
            stream_port: 8701,
            prefer_stream: true,
            heartbeat_interval: Duration::from_secs(30),
            reconnect_base_delay: Duration::from_secs(5),
            reconnect_max_delay: Duration::from_secs(60),
        }
    }
}
