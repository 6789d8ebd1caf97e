//! The engine: polls tasks, schedules runs, executes them, and reports
//! results back to the Master.
//!
//! Topology after `start()`: one poll loop, one control loop, and
//! `max_concurrent` worker loops, with a 30 s status heartbeat per running
//! task. All public methods are safe for concurrent callers.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use drover_core::events::{EventBus, WorkerEvent};
use drover_core::models::{
    ControlMessage, ControlType, ExecPlan, ExecResult, RunContext, RunStatus, RuntimeSpec,
    TaskDispatch, TaskPayload, TaskResult, TaskStatusUpdate, default_priority,
};
use drover_transport::Transport;

use crate::interfaces::{
    ArtifactManager, Executor, FlowController, LogManager, LogManagerFactory, LogSink,
    PluginRegistry, ProjectFetcher, RuntimeHandle, RuntimeManager,
};
use crate::logbuf::{LogBufferConfig, LogService};
use crate::scheduler::Scheduler;
use crate::state::{RunState, StateManager};

/// Environment key that names a prepared runtime environment; lifted into
/// the run's labels and stripped from the child environment.
const RUNTIME_ENV_KEY: &str = "DROVER_RUNTIME_ENV";

/// Engine tuning; `max_concurrent` and the limits are adjustable at
/// runtime through config-update control messages.
#[derive(Debug, Clone)]
pub struct EngineSettings {
    /// Parallel worker loops.
    pub max_concurrent: usize,
    /// Default memory cap per run, MiB (0 = unlimited).
    pub memory_limit_mb: u64,
    /// Default CPU-time cap per run, seconds (0 = unlimited).
    pub cpu_limit_seconds: u64,
    /// Transport poll timeout.
    pub poll_timeout: Duration,
    /// Cadence of the per-running-task status heartbeat.
    pub task_heartbeat_interval: Duration,
    /// Queue persistence file, when configured.
    pub persist_path: Option<PathBuf>,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            max_concurrent: 5,
            memory_limit_mb: 0,
            cpu_limit_seconds: 0,
            poll_timeout: Duration::from_secs(1),
            task_heartbeat_interval: Duration::from_secs(30),
            persist_path: None,
        }
    }
}

/// What the scheduler holds for each accepted run.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct QueuedRun {
    context: RunContext,
    task: TaskDispatch,
}

struct WorkerSlot {
    stop: Arc<AtomicBool>,
    handle: JoinHandle<()>,
}

struct EngineInner {
    transport: Arc<dyn Transport>,
    executor: Arc<dyn Executor>,
    scheduler: Scheduler<QueuedRun>,
    state: StateManager,
    log_service: Arc<LogService>,
    events: EventBus,
    project_fetcher: Option<Arc<dyn ProjectFetcher>>,
    runtime_manager: Option<Arc<dyn RuntimeManager>>,
    plugin_registry: Option<PluginRegistry>,
    log_manager_factory: Option<Arc<dyn LogManagerFactory>>,
    artifact_manager: Option<Arc<dyn ArtifactManager>>,
    flow_controller: Option<Arc<dyn FlowController>>,
    settings: std::sync::Mutex<EngineSettings>,
    running: AtomicBool,
    polling: AtomicBool,
    accepted_count: AtomicU64,
    runtime_control: Arc<tokio::sync::Semaphore>,
    poll_task: tokio::sync::Mutex<Option<JoinHandle<()>>>,
    control_task: tokio::sync::Mutex<Option<JoinHandle<()>>>,
    workers: tokio::sync::Mutex<Vec<WorkerSlot>>,
}

/// Aborts the wrapped task when dropped; used for per-run heartbeats.
struct AbortOnDrop(JoinHandle<()>);

impl Drop for AbortOnDrop {
    fn drop(&mut self) {
        self.0.abort();
    }
}

impl EngineInner {
    fn poll_timeout(&self) -> Duration {
        self.settings.lock().unwrap().poll_timeout
    }

    fn generate_run_id(task_id: &str) -> String {
        format!("run-{task_id}-{}", Utc::now().format("%Y%m%d%H%M%S%6f"))
    }

    /// Accept one polled task: build its context, track it, enqueue it.
    fn accept_task(&self, task: TaskDispatch) {
        let run_id = task
            .run_id
            .clone()
            .unwrap_or_else(|| Self::generate_run_id(&task.task_id));

        let mut environment = task.environment.clone();
        let runtime_env_name = environment.remove(RUNTIME_ENV_KEY);
        let mut labels = HashMap::new();
        if let Some(name) = &runtime_env_name {
            labels.insert("runtime_env_name".to_string(), name.clone());
        }

        let (memory_limit_mb, cpu_limit_seconds) = {
            let settings = self.settings.lock().unwrap();
            (settings.memory_limit_mb, settings.cpu_limit_seconds)
        };
        let priority = task
            .priority
            .unwrap_or_else(|| default_priority(task.task_type()));

        let context = RunContext {
            run_id: run_id.clone(),
            task_id: task.task_id.clone(),
            project_id: task.project_id.clone(),
            timeout_seconds: task.timeout,
            memory_limit_mb,
            cpu_limit_seconds,
            priority,
            labels,
            receipt: task.receipt.clone(),
            runtime_spec: None,
        };

        if !self.state.add(&run_id, &task.task_id, task.receipt.as_deref()) {
            warn!(run_id = %run_id, "duplicate run id from poll, dropping");
            return;
        }

        let mut stripped = task.clone();
        stripped.environment = environment;
        let project_id = stripped.project_id.clone();
        let project_type = stripped.project_type.clone().unwrap_or_default();
        let enqueued = self.scheduler.enqueue(
            &run_id,
            &project_id,
            &project_type,
            priority,
            QueuedRun {
                context,
                task: stripped,
            },
        );
        if enqueued {
            self.accepted_count.fetch_add(1, Ordering::Relaxed);
            info!(run_id = %run_id, task_id = %task.task_id, priority, "task enqueued");
        } else {
            warn!(run_id = %run_id, "enqueue rejected, dropping task");
            self.state.remove(&run_id);
        }
    }

    async fn poll_loop(self: Arc<Self>) {
        while self.polling.load(Ordering::SeqCst) {
            if !self.transport.is_connected() {
                tokio::time::sleep(Duration::from_millis(500)).await;
                continue;
            }
            if self.scheduler.is_full() {
                tokio::time::sleep(Duration::from_secs(1)).await;
                continue;
            }

            let poll_timeout = self.poll_timeout();
            let mut flow_acquired = false;
            if let Some(flow) = &self.flow_controller {
                if !flow.acquire(poll_timeout).await {
                    tokio::time::sleep(Duration::from_millis(100)).await;
                    continue;
                }
                flow_acquired = true;
            }

            let polled = self.transport.poll_task(poll_timeout).await;
            // An empty poll on a dead link is a failed poll, not an idle one.
            let poll_failed = polled.is_none() && !self.transport.is_connected();
            if let Some(flow) = &self.flow_controller {
                if poll_failed {
                    flow.on_failure();
                } else {
                    flow.on_success();
                }
                if flow_acquired {
                    flow.release().await;
                }
            }

            if let Some(task) = polled {
                self.accept_task(task);
            } else if poll_failed {
                tokio::time::sleep(Duration::from_secs(1)).await;
            }
        }
        debug!("poll loop exited");
    }

    async fn control_loop(self: Arc<Self>) {
        while self.running.load(Ordering::SeqCst) {
            if !self.transport.is_connected() {
                tokio::time::sleep(Duration::from_millis(500)).await;
                continue;
            }

            let Some(control) = self.transport.poll_control(self.poll_timeout()).await else {
                continue;
            };

            match control.control_type {
                ControlType::Cancel | ControlType::Kill => {
                    let reason = control
                        .reason
                        .clone()
                        .unwrap_or_else(|| "cancel".to_string());
                    let target = control.run_id.clone().or_else(|| control.task_id.clone());
                    if let Some(target) = target {
                        self.cancel_target(&target, &reason).await;
                    }
                }
                ControlType::ConfigUpdate => {
                    let payload = control
                        .payload
                        .clone()
                        .unwrap_or_else(|| serde_json::Value::Object(Default::default()));
                    self.apply_config_update(&payload).await;
                }
                ControlType::RuntimeManage => {
                    // Deferred: the handler acks once it finishes.
                    let inner = self.clone();
                    tokio::spawn(async move {
                        inner.handle_runtime_control(control).await;
                    });
                    continue;
                }
            }

            if let Some(receipt) = &control.receipt {
                self.transport.ack_control(receipt).await;
            }
        }
        debug!("control loop exited");
    }

    /// Runtime-management requests run off-loop, serialized by a 1-permit
    /// semaphore, and answer on their reply stream.
    async fn handle_runtime_control(self: Arc<Self>, control: ControlMessage) {
        let payload = control.payload.clone().unwrap_or_default();
        let action = payload
            .get("action")
            .and_then(|v| v.as_str())
            .unwrap_or("")
            .to_string();
        let request_id = payload
            .get("request_id")
            .and_then(|v| v.as_str())
            .unwrap_or("")
            .to_string();
        let reply_stream = payload
            .get("reply_stream")
            .and_then(|v| v.as_str())
            .unwrap_or("")
            .to_string();
        let data = payload
            .get("payload")
            .cloned()
            .unwrap_or_else(|| serde_json::Value::Object(Default::default()));

        let outcome = {
            let _permit = self.runtime_control.acquire().await.ok();
            match &self.runtime_manager {
                Some(manager) => manager.manage(&action, &data).await,
                None => Err(anyhow::anyhow!("no runtime manager configured")),
            }
        };

        if !request_id.is_empty() && !reply_stream.is_empty() {
            let (success, data, error) = match outcome {
                Ok(result) => (true, Some(result), String::new()),
                Err(err) => (false, None, format!("{err:#}")),
            };
            self.transport
                .send_control_result(&request_id, &reply_stream, success, data, &error)
                .await;
        } else if let Err(err) = outcome {
            warn!(action = %action, "runtime action failed with no reply stream: {err:#}");
        }

        if let Some(receipt) = &control.receipt {
            self.transport.ack_control(receipt).await;
        }
    }

    async fn worker_loop(self: Arc<Self>, worker_id: usize, stop: Arc<AtomicBool>) {
        debug!(worker_id, "worker started");
        while self.running.load(Ordering::SeqCst) && !stop.load(Ordering::SeqCst) {
            let Some(item) = self.scheduler.dequeue(Duration::from_secs(1)).await else {
                continue;
            };
            let QueuedRun { context, task } = item.data;
            let result = self.execute_task(&context, &task).await;
            self.report_result(&context, result).await;
        }
        debug!(worker_id, "worker exited");
    }

    /// Normalize the wire task message into a payload.
    fn build_payload(task: &TaskDispatch) -> TaskPayload {
        let mut args = Vec::new();
        let mut kwargs = serde_json::Map::new();
        let mut artifact_patterns = Vec::new();

        match &task.params {
            serde_json::Value::Object(params) => {
                if let Some(list) = params.get("args").and_then(|v| v.as_array()) {
                    args = list
                        .iter()
                        .map(|v| match v {
                            serde_json::Value::String(s) => s.clone(),
                            other => other.to_string(),
                        })
                        .collect();
                }
                match params.get("kwargs").and_then(|v| v.as_object()) {
                    Some(map) => kwargs = map.clone(),
                    None => {
                        kwargs = params.clone();
                        kwargs.remove("args");
                        kwargs.remove("artifact_patterns");
                    }
                }
                if let Some(list) = params.get("artifact_patterns").and_then(|v| v.as_array()) {
                    artifact_patterns = list
                        .iter()
                        .filter_map(|v| v.as_str().map(str::to_string))
                        .collect();
                }
            }
            serde_json::Value::Array(list) => {
                args = list
                    .iter()
                    .map(|v| match v {
                        serde_json::Value::String(s) => s.clone(),
                        other => other.to_string(),
                    })
                    .collect();
            }
            _ => {}
        }

        TaskPayload {
            task_type: task.task_type(),
            project_path: None,
            download_url: task.download_url.clone(),
            file_hash: task.file_hash.clone(),
            is_compressed: task.is_compressed,
            entry_point: task.entry_point.clone().unwrap_or_default(),
            args,
            kwargs,
            env_vars: task.environment.clone(),
            artifact_patterns,
        }
    }

    /// Plan used when no plugin claims the payload: interpreter plus entry
    /// point.
    fn build_fallback_plan(
        context: &RunContext,
        payload: &TaskPayload,
        runtime: &RuntimeHandle,
    ) -> ExecPlan {
        let mut args = Vec::new();
        if !payload.entry_point.is_empty() {
            args.push(payload.entry_point.clone());
        }
        args.extend(payload.args.iter().cloned());

        ExecPlan {
            command: runtime.interpreter.clone(),
            args,
            env: payload.env_vars.clone(),
            cwd: payload
                .project_path
                .clone()
                .unwrap_or_else(|| ".".to_string()),
            timeout_seconds: context.timeout_seconds,
            memory_limit_mb: context.memory_limit_mb,
            cpu_limit_seconds: context.cpu_limit_seconds,
            disk_limit_mb: 0,
            artifact_patterns: payload.artifact_patterns.clone(),
            run_id: String::new(),
        }
    }

    async fn prepare_runtime(
        &self,
        context: &mut RunContext,
    ) -> anyhow::Result<RuntimeHandle> {
        if let Some(env_name) = context.labels.get("runtime_env_name").cloned() {
            let Some(manager) = &self.runtime_manager else {
                anyhow::bail!("runtime environment {env_name} requested but no manager configured");
            };
            let Some(env) = manager.get_env(&env_name).await? else {
                anyhow::bail!("runtime environment not found: {env_name}");
            };
            context.runtime_spec = Some(RuntimeSpec {
                name: Some(env.name.clone()),
                version: env.version.clone(),
                interpreter_path: Some(env.interpreter.clone()),
                env_vars: HashMap::new(),
            });
            return Ok(RuntimeHandle {
                path: env.path,
                runtime_hash: format!("env:{env_name}"),
                interpreter: env.interpreter,
                version: env.version,
                env_vars: HashMap::new(),
            });
        }

        match (&self.runtime_manager, &context.runtime_spec) {
            (Some(manager), Some(spec)) => manager.prepare(spec).await,
            _ => Ok(RuntimeHandle::system()),
        }
    }

    /// The single-run pipeline body. Early cancel checks return a
    /// `CANCELLED` result; errors bubble to `execute_task`, which folds
    /// them into a `FAILED` result. Cleanup happens in `execute_task`.
    #[allow(clippy::too_many_arguments)]
    async fn run_pipeline(
        &self,
        context: &mut RunContext,
        task: &TaskDispatch,
        started_at: chrono::DateTime<Utc>,
        log_manager: &mut Option<Arc<dyn LogManager>>,
        runtime_out: &mut Option<RuntimeHandle>,
        heartbeat: &mut Option<AbortOnDrop>,
    ) -> anyhow::Result<ExecResult> {
        let run_id = context.run_id.clone();

        self.state.transition(&run_id, RunState::Preparing);
        self.publish_state(&run_id, "preparing");

        let mut payload = Self::build_payload(task);

        if let (Some(fetcher), Some(url)) = (&self.project_fetcher, payload.download_url.clone()) {
            let path = fetcher
                .fetch(
                    &context.project_id,
                    &url,
                    payload.file_hash.as_deref(),
                    payload.is_compressed.unwrap_or(false),
                    if payload.entry_point.is_empty() {
                        None
                    } else {
                        Some(payload.entry_point.as_str())
                    },
                )
                .await?;
            payload.project_path = Some(path);
        }

        let runtime = self.prepare_runtime(context).await?;
        *runtime_out = Some(runtime.clone());

        if self.state.cancel_requested(&run_id) {
            return Ok(ExecResult::cancelled(&run_id, started_at, "cancelled"));
        }

        let mut plan = match &self.plugin_registry {
            Some(registry) => match registry.build_plan(context, &payload).await {
                Some(plan) => plan?,
                None => Self::build_fallback_plan(context, &payload, &runtime),
            },
            None => Self::build_fallback_plan(context, &payload, &runtime),
        };
        plan.run_id = run_id.clone();
        if let Some(spec) = &context.runtime_spec {
            plan.env.extend(spec.env_vars.clone());
        }

        if self.state.cancel_requested(&run_id) {
            return Ok(ExecResult::cancelled(&run_id, started_at, "cancelled"));
        }

        self.state.transition(&run_id, RunState::Running);
        self.publish_state(&run_id, "running");
        self.transport
            .send_task_status(TaskStatusUpdate::running(&run_id))
            .await;
        *heartbeat = Some(self.spawn_task_heartbeat(&run_id));

        let sink: Option<Arc<dyn LogSink>> = match &self.log_manager_factory {
            Some(factory) => {
                let manager = factory.create(&run_id);
                manager.start().await?;
                *log_manager = Some(manager.clone());
                Some(manager)
            }
            None => Some(self.log_service.clone() as Arc<dyn LogSink>),
        };

        let mut result = self.executor.run(plan.clone(), &runtime, sink).await;

        if let Some(artifacts) = &self.artifact_manager {
            if !plan.artifact_patterns.is_empty() {
                let work_dir = if plan.cwd.is_empty() {
                    runtime.path.clone()
                } else {
                    plan.cwd.clone()
                };
                match artifacts
                    .collect_artifacts(&work_dir, &plan.artifact_patterns, &run_id)
                    .await
                {
                    Ok(collected) => {
                        for artifact in collected {
                            match artifacts.store_artifact(artifact, &run_id).await {
                                Ok(stored) => result.artifacts.push(stored),
                                Err(err) => warn!(run_id = %run_id, "artifact store failed: {err:#}"),
                            }
                        }
                    }
                    Err(err) => warn!(run_id = %run_id, "artifact collection failed: {err:#}"),
                }
            }
        }

        if let Some(manager) = log_manager {
            match manager.archive_logs().await {
                Ok(archived) if !archived.is_empty() => {
                    result.log_archived = true;
                    result.log_archive_uri = Some(archived[0].uri.clone());
                    result.artifacts.extend(archived);
                }
                Ok(_) => {}
                Err(err) => warn!(run_id = %run_id, "log archive failed: {err:#}"),
            }
        }

        match result.status {
            RunStatus::Success => {
                self.state.transition(&run_id, RunState::Completed);
            }
            RunStatus::Cancelled => {
                if self
                    .state
                    .get(&run_id)
                    .map(|r| r.state != RunState::Cancelled)
                    .unwrap_or(false)
                {
                    self.state.transition(&run_id, RunState::Cancelled);
                }
            }
            _ => {
                self.state.transition(&run_id, RunState::Failed);
            }
        }

        Ok(result)
    }

    async fn execute_task(&self, context: &RunContext, task: &TaskDispatch) -> ExecResult {
        let run_id = context.run_id.clone();
        let started_at = Utc::now();
        let mut context = context.clone();
        let mut log_manager: Option<Arc<dyn LogManager>> = None;
        let mut runtime: Option<RuntimeHandle> = None;
        let mut heartbeat: Option<AbortOnDrop> = None;

        let result = match self
            .run_pipeline(
                &mut context,
                task,
                started_at,
                &mut log_manager,
                &mut runtime,
                &mut heartbeat,
            )
            .await
        {
            Ok(result) => result,
            Err(err) => {
                error!(run_id = %run_id, "execution failed: {err:#}");
                self.state.transition(&run_id, RunState::Failed);
                ExecResult::failed(&run_id, started_at, &format!("{err:#}"))
            }
        };

        // The heartbeat stops before the terminal report goes out.
        drop(heartbeat);
        if let Some(manager) = log_manager {
            manager.stop().await;
        }
        if let (Some(manager), Some(handle)) = (&self.runtime_manager, &runtime) {
            manager.release(handle).await;
        }

        result
    }

    fn spawn_task_heartbeat(&self, run_id: &str) -> AbortOnDrop {
        let transport = self.transport.clone();
        let run_id = run_id.to_string();
        let interval = self.settings.lock().unwrap().task_heartbeat_interval;
        AbortOnDrop(tokio::spawn(async move {
            loop {
                tokio::time::sleep(interval).await;
                if !transport
                    .send_task_status(TaskStatusUpdate::running(&run_id))
                    .await
                {
                    debug!(run_id = %run_id, "task heartbeat send failed");
                }
            }
        }))
    }

    fn publish_state(&self, run_id: &str, state: &str) {
        self.events.publish(WorkerEvent::TaskStatusChanged {
            run_id: run_id.to_string(),
            state: state.to_string(),
        });
    }

    /// Deliver the terminal report. Buffered logs for the run flush first
    /// so the Master observes them before the terminal status.
    async fn report_result(&self, context: &RunContext, result: ExecResult) {
        let run_id = &context.run_id;
        self.log_service.flush_execution(run_id).await;

        let report = TaskResult::from_exec(context, &result);
        let status = report.status;
        if self.transport.report_result(report).await {
            info!(run_id = %run_id, ?status, "result reported");
        } else {
            warn!(run_id = %run_id, "result report failed");
        }
        self.publish_state(
            run_id,
            match status {
                RunStatus::Success => "success",
                RunStatus::Failed => "failed",
                RunStatus::Cancelled => "cancelled",
                RunStatus::Timeout => "timeout",
            },
        );

        if let Some(receipt) = &context.receipt {
            self.transport.ack_task(receipt, true).await;
        }
        self.state.remove(run_id);
    }

    async fn report_by_info(
        &self,
        run_id: &str,
        task_id: &str,
        receipt: Option<String>,
        result: ExecResult,
    ) {
        let context = RunContext {
            run_id: run_id.to_string(),
            task_id: task_id.to_string(),
            project_id: String::new(),
            timeout_seconds: 0,
            memory_limit_mb: 0,
            cpu_limit_seconds: 0,
            priority: drover_core::models::priority::NORMAL,
            labels: HashMap::new(),
            receipt,
            runtime_spec: None,
        };
        self.report_result(&context, result).await;
    }

    /// Cancel by run id; falls back to a task-id lookup.
    async fn cancel_target(&self, target: &str, reason: &str) -> bool {
        if self.cancel(target, reason).await {
            return true;
        }
        let by_task = self
            .state
            .all()
            .into_iter()
            .find(|record| record.task_id == target)
            .map(|record| record.run_id);
        match by_task {
            Some(run_id) => self.cancel(&run_id, reason).await,
            None => false,
        }
    }

    async fn cancel(&self, run_id: &str, reason: &str) -> bool {
        let Some(record) = self.state.get(run_id) else {
            return false;
        };
        if record.state.is_terminal() {
            return false;
        }

        match record.state {
            RunState::Queued => {
                self.scheduler.cancel(run_id);
                self.state.transition(run_id, RunState::Cancelled);
                self.publish_state(run_id, "cancelled");
                let result = ExecResult::cancelled(run_id, record.queued_at, reason);
                self.report_by_info(run_id, &record.task_id, record.receipt.clone(), result)
                    .await;
            }
            RunState::Preparing => {
                self.state.set_cancel_requested(run_id);
                self.state.transition(run_id, RunState::Cancelled);
            }
            RunState::Running => {
                self.state.set_cancel_requested(run_id);
                self.state.transition(run_id, RunState::Cancelling);
                self.executor.cancel(run_id).await;
            }
            RunState::Cancelling => {
                self.state.set_cancel_requested(run_id);
            }
            _ => return false,
        }
        info!(run_id, reason, "run cancelled");
        true
    }

    async fn apply_config_update(self: &Arc<Self>, payload: &serde_json::Value) {
        let recognized = [
            "max_concurrent_tasks",
            "task_memory_limit_mb",
            "task_cpu_time_limit_sec",
        ];
        if let Some(map) = payload.as_object() {
            for key in map.keys() {
                if !recognized.contains(&key.as_str()) {
                    warn!(key = %key, "ignoring unknown config key");
                }
            }
        }

        if let Some(value) = payload.get("max_concurrent_tasks") {
            match value.as_u64() {
                Some(new_max) if new_max > 0 => {
                    let current = self.settings.lock().unwrap().max_concurrent;
                    if new_max as usize != current {
                        self.resize_workers(new_max as usize).await;
                    }
                }
                _ => warn!(?value, "invalid max_concurrent_tasks"),
            }
        }
        if let Some(value) = payload.get("task_memory_limit_mb") {
            match value.as_u64() {
                Some(limit) => self.settings.lock().unwrap().memory_limit_mb = limit,
                None => warn!(?value, "invalid task_memory_limit_mb"),
            }
        }
        if let Some(value) = payload.get("task_cpu_time_limit_sec") {
            match value.as_u64() {
                Some(limit) => self.settings.lock().unwrap().cpu_limit_seconds = limit,
                None => warn!(?value, "invalid task_cpu_time_limit_sec"),
            }
        }
    }

    fn spawn_worker(self: &Arc<Self>, worker_id: usize) -> WorkerSlot {
        let stop = Arc::new(AtomicBool::new(false));
        let handle = tokio::spawn(self.clone().worker_loop(worker_id, stop.clone()));
        WorkerSlot { stop, handle }
    }

    /// Adjust worker concurrency; grows by spawning, shrinks by signalling
    /// surplus workers to exit after their current run.
    async fn resize_workers(self: &Arc<Self>, new_max: usize) {
        {
            let mut settings = self.settings.lock().unwrap();
            settings.max_concurrent = new_max;
        }
        self.scheduler.update_max_size(new_max.saturating_mul(2).max(new_max));

        if !self.running.load(Ordering::SeqCst) {
            return;
        }

        let mut workers = self.workers.lock().await;
        let current = workers.len();
        if new_max > current {
            for worker_id in current..new_max {
                let slot = self.spawn_worker(worker_id);
                workers.push(slot);
            }
            info!(from = current, to = new_max, "grew worker pool");
        } else if new_max < current {
            let surplus: Vec<WorkerSlot> = workers.split_off(new_max);
            drop(workers);
            for slot in &surplus {
                slot.stop.store(true, Ordering::SeqCst);
            }
            for slot in surplus {
                if tokio::time::timeout(Duration::from_secs(5), slot.handle)
                    .await
                    .is_err()
                {
                    debug!("surplus worker still draining its current run");
                }
            }
            info!(from = current, to = new_max, "shrank worker pool");
        }
    }

    async fn force_terminate(&self) {
        for record in self.state.all() {
            if matches!(record.state, RunState::Running | RunState::Cancelling) {
                self.cancel(&record.run_id, "force_terminate").await;
            }
        }
    }
}

/// Public handle to the engine.
#[derive(Clone)]
pub struct Engine {
    inner: Arc<EngineInner>,
}

impl Engine {
    /// Start building an engine around a transport and an executor.
    pub fn builder(transport: Arc<dyn Transport>, executor: Arc<dyn Executor>) -> EngineBuilder {
        EngineBuilder {
            transport,
            executor,
            settings: EngineSettings::default(),
            log_config: LogBufferConfig::default(),
            events: None,
            project_fetcher: None,
            runtime_manager: None,
            plugin_registry: None,
            log_manager_factory: None,
            artifact_manager: None,
            flow_controller: None,
        }
    }

    /// Start the poll, control, and worker loops.
    pub async fn start(&self) {
        if self.inner.running.swap(true, Ordering::SeqCst) {
            return;
        }
        self.inner.polling.store(true, Ordering::SeqCst);

        self.inner.scheduler.start().await;
        self.inner.log_service.start().await;

        *self.inner.poll_task.lock().await = Some(tokio::spawn(self.inner.clone().poll_loop()));
        *self.inner.control_task.lock().await =
            Some(tokio::spawn(self.inner.clone().control_loop()));

        let max_concurrent = self.inner.settings.lock().unwrap().max_concurrent;
        let mut workers = self.inner.workers.lock().await;
        for worker_id in 0..max_concurrent {
            let slot = self.inner.spawn_worker(worker_id);
            workers.push(slot);
        }
        info!(workers = max_concurrent, "engine started");
    }

    /// Stop: quit polling, drain active runs within `grace_period`, force-
    /// terminate the rest, stop workers, persist the queue.
    pub async fn stop(&self, grace_period: Duration) {
        if !self.inner.running.load(Ordering::SeqCst) {
            return;
        }
        info!("stopping engine");
        self.inner.polling.store(false, Ordering::SeqCst);

        if let Some(task) = self.inner.poll_task.lock().await.take() {
            task.abort();
        }
        if let Some(task) = self.inner.control_task.lock().await.take() {
            task.abort();
        }

        let deadline = tokio::time::Instant::now() + grace_period;
        while self.inner.state.count_active() > 0 && tokio::time::Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        if self.inner.state.count_active() > 0 {
            warn!("grace period expired, force-terminating active runs");
            self.inner.force_terminate().await;
            let kill_deadline = tokio::time::Instant::now() + Duration::from_secs(10);
            while self.inner.state.count_active() > 0
                && tokio::time::Instant::now() < kill_deadline
            {
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
        }

        self.inner.running.store(false, Ordering::SeqCst);
        let workers: Vec<WorkerSlot> = {
            let mut slot = self.inner.workers.lock().await;
            slot.drain(..).collect()
        };
        for worker in &workers {
            worker.stop.store(true, Ordering::SeqCst);
        }
        for worker in workers {
            if tokio::time::timeout(Duration::from_secs(5), worker.handle)
                .await
                .is_err()
            {
                debug!("worker did not exit in time");
            }
        }

        self.inner.scheduler.stop().await;
        self.inner.log_service.stop().await;
        info!("engine stopped");
    }

    /// Cancel a run (or, failing that, a task) by id.
    pub async fn cancel(&self, target: &str, reason: &str) -> bool {
        self.inner.cancel_target(target, reason).await
    }

    /// Apply a config-update payload.
    pub async fn apply_config_update(&self, payload: &serde_json::Value) {
        self.inner.apply_config_update(payload).await;
    }

    /// `(running_tasks, max_concurrent, accepted_total)` for heartbeats.
    pub fn task_counts(&self) -> (u64, u64, u64) {
        let running = self
            .inner
            .state
            .all()
            .iter()
            .filter(|r| matches!(r.state, RunState::Running | RunState::Cancelling))
            .count() as u64;
        let max_concurrent = self.inner.settings.lock().unwrap().max_concurrent as u64;
        let accepted = self.inner.accepted_count.load(Ordering::Relaxed);
        (running, max_concurrent, accepted)
    }

    /// Engine status snapshot.
    pub fn stats(&self) -> serde_json::Value {
        let settings = self.inner.settings.lock().unwrap().clone();
        serde_json::json!({
            "running": self.inner.running.load(Ordering::SeqCst),
            "polling": self.inner.polling.load(Ordering::SeqCst),
            "queue_size": self.inner.scheduler.len(),
            "max_concurrent": settings.max_concurrent,
            "active_runs": self.inner.state.count_active(),
            "accepted_total": self.inner.accepted_count.load(Ordering::Relaxed),
            "scheduler": self.inner.scheduler.stats(),
            "log_buffer": self.inner.log_service.stats(),
        })
    }

    #[cfg(test)]
    fn inner(&self) -> &Arc<EngineInner> {
        &self.inner
    }
}

/// Builder for [`Engine`]; collaborators are optional, the transport and
/// executor are not.
pub struct EngineBuilder {
    transport: Arc<dyn Transport>,
    executor: Arc<dyn Executor>,
    settings: EngineSettings,
    log_config: LogBufferConfig,
    events: Option<EventBus>,
    project_fetcher: Option<Arc<dyn ProjectFetcher>>,
    runtime_manager: Option<Arc<dyn RuntimeManager>>,
    plugin_registry: Option<PluginRegistry>,
    log_manager_factory: Option<Arc<dyn LogManagerFactory>>,
    artifact_manager: Option<Arc<dyn ArtifactManager>>,
    flow_controller: Option<Arc<dyn FlowController>>,
}

impl EngineBuilder {
    /// Override the default settings.
    pub fn settings(mut self, settings: EngineSettings) -> Self {
        self.settings = settings;
        self
    }

    /// Override the log buffer configuration.
    pub fn log_config(mut self, config: LogBufferConfig) -> Self {
        self.log_config = config;
        self
    }

    /// Attach an event bus.
    pub fn events(mut self, events: EventBus) -> Self {
        self.events = Some(events);
        self
    }

    /// Attach a project fetcher.
    pub fn project_fetcher(mut self, fetcher: Arc<dyn ProjectFetcher>) -> Self {
        self.project_fetcher = Some(fetcher);
        self
    }

    /// Attach a runtime manager.
    pub fn runtime_manager(mut self, manager: Arc<dyn RuntimeManager>) -> Self {
        self.runtime_manager = Some(manager);
        self
    }

    /// Attach a plugin registry.
    pub fn plugin_registry(mut self, registry: PluginRegistry) -> Self {
        self.plugin_registry = Some(registry);
        self
    }

    /// Attach a per-run log-manager factory.
    pub fn log_manager_factory(mut self, factory: Arc<dyn LogManagerFactory>) -> Self {
        self.log_manager_factory = Some(factory);
        self
    }

    /// Attach an artifact manager.
    pub fn artifact_manager(mut self, manager: Arc<dyn ArtifactManager>) -> Self {
        self.artifact_manager = Some(manager);
        self
    }

    /// Attach a flow controller.
    pub fn flow_controller(mut self, controller: Arc<dyn FlowController>) -> Self {
        self.flow_controller = Some(controller);
        self
    }

    /// Assemble the engine.
    #[must_use]
    pub fn build(self) -> Engine {
        let events = self.events.unwrap_or_default();
        let queue_capacity = self.settings.max_concurrent.saturating_mul(2).max(1);
        let scheduler =
            Scheduler::with_persistence(queue_capacity, self.settings.persist_path.clone());
        let log_service = Arc::new(LogService::new(
            self.transport.clone(),
            self.log_config,
            Some(events.clone()),
        ));

        Engine {
            inner: Arc::new(EngineInner {
                transport: self.transport,
                executor: self.executor,
                scheduler,
                state: StateManager::new(),
                log_service,
                events,
                project_fetcher: self.project_fetcher,
                runtime_manager: self.runtime_manager,
                plugin_registry: self.plugin_registry,
                log_manager_factory: self.log_manager_factory,
                artifact_manager: self.artifact_manager,
                flow_controller: self.flow_controller,
                settings: std::sync::Mutex::new(self.settings),
                running: AtomicBool::new(false),
                polling: AtomicBool::new(false),
                accepted_count: AtomicU64::new(0),
                runtime_control: Arc::new(tokio::sync::Semaphore::new(1)),
                poll_task: tokio::sync::Mutex::new(None),
                control_task: tokio::sync::Mutex::new(None),
                workers: tokio::sync::Mutex::new(Vec::new()),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    use async_trait::async_trait;
    use drover_core::models::{ConnectionConfig, Heartbeat, LogEntry, LogKind};
    use drover_transport::protocol::{
        CancelCallback, DispatchCallback, TransportMetricsSnapshot,
    };

    use crate::executor::{ExecutorConfig, ProcessExecutor};
    use crate::interfaces::Plugin;

    /// In-memory Master double: tasks and controls are fed by the test,
    /// every outbound call is recorded with its global order.
    struct MockTransport {
        connected: AtomicBool,
        tasks: tokio::sync::Mutex<VecDeque<TaskDispatch>>,
        controls: tokio::sync::Mutex<VecDeque<ControlMessage>>,
        statuses: Mutex<Vec<TaskStatusUpdate>>,
        results: Mutex<Vec<TaskResult>>,
        log_batches: Mutex<Vec<Vec<LogEntry>>>,
        receipt_acks: Mutex<Vec<(String, bool)>>,
        sequence: Mutex<Vec<String>>,
    }

    impl MockTransport {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                connected: AtomicBool::new(true),
                tasks: tokio::sync::Mutex::new(VecDeque::new()),
                controls: tokio::sync::Mutex::new(VecDeque::new()),
                statuses: Mutex::new(Vec::new()),
                results: Mutex::new(Vec::new()),
                log_batches: Mutex::new(Vec::new()),
                receipt_acks: Mutex::new(Vec::new()),
                sequence: Mutex::new(Vec::new()),
            })
        }

        async fn push_task(&self, task: TaskDispatch) {
            self.tasks.lock().await.push_back(task);
        }

        fn results(&self) -> Vec<TaskResult> {
            self.results.lock().unwrap().clone()
        }

        fn statuses(&self) -> Vec<TaskStatusUpdate> {
            self.statuses.lock().unwrap().clone()
        }

        fn sequence(&self) -> Vec<String> {
            self.sequence.lock().unwrap().clone()
        }

        fn mark(&self, entry: String) {
            self.sequence.lock().unwrap().push(entry);
        }
    }

    #[async_trait]
    impl Transport for MockTransport {
        async fn connect(&self, _config: &ConnectionConfig) -> bool {
            self.connected.store(true, Ordering::SeqCst);
            true
        }
        async fn disconnect(&self) {
            self.connected.store(false, Ordering::SeqCst);
        }
        fn is_connected(&self) -> bool {
            self.connected.load(Ordering::SeqCst)
        }
        fn metrics(&self) -> TransportMetricsSnapshot {
            TransportMetricsSnapshot::default()
        }
        async fn send_heartbeat(&self, _heartbeat: Heartbeat) -> bool {
            true
        }
        async fn send_logs(&self, logs: Vec<LogEntry>) -> bool {
            self.mark(format!("logs:{}", logs.len()));
            self.log_batches.lock().unwrap().push(logs);
            true
        }
        async fn send_task_status(&self, status: TaskStatusUpdate) -> bool {
            self.mark(format!("status:{}:{}", status.execution_id, status.status));
            self.statuses.lock().unwrap().push(status);
            true
        }
        async fn send_task_ack(&self, _task_id: &str, _accepted: bool, _reason: Option<&str>) -> bool {
            true
        }
        async fn send_cancel_ack(&self, _task_id: &str, _ok: bool, _reason: Option<&str>) -> bool {
            true
        }
        async fn poll_task(&self, timeout: Duration) -> Option<TaskDispatch> {
            let deadline = tokio::time::Instant::now() + timeout;
            loop {
                if let Some(task) = self.tasks.lock().await.pop_front() {
                    return Some(task);
                }
                if tokio::time::Instant::now() >= deadline {
                    return None;
                }
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        }
        async fn poll_control(&self, timeout: Duration) -> Option<ControlMessage> {
            let deadline = tokio::time::Instant::now() + timeout;
            loop {
                if let Some(msg) = self.controls.lock().await.pop_front() {
                    return Some(msg);
                }
                if tokio::time::Instant::now() >= deadline {
                    return None;
                }
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        }
        async fn report_result(&self, result: TaskResult) -> bool {
            self.mark(format!("result:{}", result.run_id));
            self.results.lock().unwrap().push(result);
            true
        }
        async fn ack_task(&self, receipt: &str, accepted: bool) -> bool {
            self.receipt_acks
                .lock()
                .unwrap()
                .push((receipt.to_string(), accepted));
            true
        }
        async fn ack_control(&self, _receipt: &str) -> bool {
            true
        }
        async fn send_control_result(
            &self,
            _request_id: &str,
            _reply_stream: &str,
            _success: bool,
            _data: Option<serde_json::Value>,
            _error: &str,
        ) -> bool {
            true
        }
        fn on_task_dispatch(&self, _callback: DispatchCallback) {}
        fn on_task_cancel(&self, _callback: CancelCallback) {}
    }

    /// Plans every payload as `/bin/sh -c <kwargs.script>`.
    struct ShellPlugin;

    #[async_trait]
    impl Plugin for ShellPlugin {
        fn matches(&self, _payload: &TaskPayload) -> bool {
            true
        }
        fn priority(&self) -> i32 {
            10
        }
        async fn build_plan(
            &self,
            context: &RunContext,
            payload: &TaskPayload,
        ) -> anyhow::Result<ExecPlan> {
            let script = payload
                .kwargs
                .get("script")
                .and_then(|v| v.as_str())
                .unwrap_or("true")
                .to_string();
            Ok(ExecPlan {
                command: "/bin/sh".to_string(),
                args: vec!["-c".to_string(), script],
                env: payload.env_vars.clone(),
                cwd: String::new(),
                timeout_seconds: context.timeout_seconds,
                memory_limit_mb: context.memory_limit_mb,
                cpu_limit_seconds: context.cpu_limit_seconds,
                disk_limit_mb: 0,
                artifact_patterns: payload.artifact_patterns.clone(),
                run_id: String::new(),
            })
        }
    }

    fn shell_task(run_id: &str, script: &str, timeout: u64) -> TaskDispatch {
        TaskDispatch {
            task_id: format!("task-{run_id}"),
            run_id: Some(run_id.to_string()),
            project_id: "proj-1".to_string(),
            project_type: Some("code".to_string()),
            timeout,
            priority: None,
            environment: HashMap::new(),
            params: serde_json::json!({ "kwargs": { "script": script } }),
            download_url: None,
            file_hash: None,
            is_compressed: None,
            entry_point: None,
            receipt: Some(format!("rcpt-{run_id}")),
        }
    }

    fn test_engine(max_concurrent: usize) -> (Engine, Arc<MockTransport>) {
        let transport = MockTransport::new();
        let mut registry = PluginRegistry::new();
        registry.register(Arc::new(ShellPlugin));
        let engine = Engine::builder(
            transport.clone(),
            Arc::new(ProcessExecutor::new(ExecutorConfig::default())),
        )
        .settings(EngineSettings {
            max_concurrent,
            poll_timeout: Duration::from_millis(200),
            ..Default::default()
        })
        .plugin_registry(registry)
        .build();
        (engine, transport)
    }

    async fn wait_until(deadline: Duration, mut condition: impl FnMut() -> bool) -> bool {
        let stop_at = tokio::time::Instant::now() + deadline;
        while tokio::time::Instant::now() < stop_at {
            if condition() {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
        condition()
    }

    #[tokio::test]
    async fn happy_path_reports_logs_then_success() {
        let (engine, transport) = test_engine(2);
        engine.start().await;

        transport
            .push_task(shell_task("r1", "printf 'hello\\nhello\\nhello\\n'", 60))
            .await;

        assert!(
            wait_until(Duration::from_secs(10), || !transport.results().is_empty()).await,
            "run never reported"
        );

        let results = transport.results();
        assert_eq!(results.len(), 1);
        let result = &results[0];
        assert_eq!(result.run_id, "r1");
        assert_eq!(result.status, RunStatus::Success);
        assert_eq!(result.exit_code, 0);
        assert_eq!(result.data.stdout_lines, 3);
        assert!(result.duration_ms > 0);

        let statuses = transport.statuses();
        assert!(
            statuses
                .iter()
                .any(|s| s.execution_id == "r1" && s.status == "running")
        );

        // Flush-before-terminal: the log batch precedes the report.
        let sequence = transport.sequence();
        let logs_at = sequence.iter().position(|s| s.starts_with("logs:"));
        let result_at = sequence.iter().position(|s| s == "result:r1");
        assert!(logs_at.is_some() && logs_at < result_at, "{sequence:?}");

        let batch = transport.log_batches.lock().unwrap().clone();
        let lines: Vec<String> = batch
            .iter()
            .flatten()
            .map(|e| e.content.clone())
            .collect();
        assert_eq!(lines, vec!["hello", "hello", "hello"]);
        assert!(
            batch
                .iter()
                .flatten()
                .all(|e| e.execution_id == "r1" && e.log_type == LogKind::Stdout)
        );

        let acks = transport.receipt_acks.lock().unwrap().clone();
        assert!(acks.contains(&("rcpt-r1".to_string(), true)));
        assert!(engine.inner().state.is_empty());

        engine.stop(Duration::from_secs(2)).await;
    }

    #[tokio::test]
    async fn cancel_while_queued_reports_cancelled() {
        let (engine, transport) = test_engine(1);
        engine.start().await;

        // Occupy the only worker, then queue a second run.
        transport.push_task(shell_task("rb", "sleep 5", 60)).await;
        assert!(
            wait_until(Duration::from_secs(10), || {
                transport
                    .statuses()
                    .iter()
                    .any(|s| s.execution_id == "rb" && s.status == "running")
            })
            .await
        );
        transport.push_task(shell_task("r2", "echo never", 60)).await;
        assert!(
            wait_until(Duration::from_secs(5), || {
                engine.inner().scheduler.contains("r2")
            })
            .await
        );

        assert!(engine.cancel("r2", "user").await);
        assert!(!engine.inner().scheduler.contains("r2"));

        assert!(
            wait_until(Duration::from_secs(5), || {
                transport.results().iter().any(|r| r.run_id == "r2")
            })
            .await
        );
        let results = transport.results();
        let cancelled = results.iter().find(|r| r.run_id == "r2").unwrap();
        assert_eq!(cancelled.status, RunStatus::Cancelled);
        assert_eq!(cancelled.error_message, "user");

        // A second cancel on a reported run finds nothing.
        assert!(!engine.cancel("r2", "again").await);

        engine.cancel("rb", "cleanup").await;
        engine.stop(Duration::from_secs(5)).await;
    }

    #[tokio::test]
    async fn cancel_while_running_beats_the_child() {
        let (engine, transport) = test_engine(1);
        engine.start().await;

        let started = std::time::Instant::now();
        transport.push_task(shell_task("r3", "sleep 30", 60)).await;
        assert!(
            wait_until(Duration::from_secs(10), || {
                transport
                    .statuses()
                    .iter()
                    .any(|s| s.execution_id == "r3" && s.status == "running")
            })
            .await
        );

        assert!(engine.cancel("r3", "kill").await);
        assert!(
            wait_until(Duration::from_secs(10), || {
                transport.results().iter().any(|r| r.run_id == "r3")
            })
            .await
        );
        assert!(started.elapsed() < Duration::from_secs(10));

        let results = transport.results();
        let result = results.iter().find(|r| r.run_id == "r3").unwrap();
        assert_eq!(result.status, RunStatus::Cancelled);
        assert!(engine.inner().state.is_empty());

        engine.stop(Duration::from_secs(2)).await;
    }

    #[tokio::test]
    async fn wall_clock_timeout_reports_124() {
        let (engine, transport) = test_engine(1);
        engine.start().await;

        transport.push_task(shell_task("r4", "sleep 10", 1)).await;
        assert!(
            wait_until(Duration::from_secs(10), || {
                transport.results().iter().any(|r| r.run_id == "r4")
            })
            .await
        );

        let results = transport.results();
        let result = results.iter().find(|r| r.run_id == "r4").unwrap();
        assert_eq!(result.status, RunStatus::Timeout);
        assert_eq!(result.exit_code, 124);

        engine.stop(Duration::from_secs(2)).await;
    }

    #[tokio::test]
    async fn config_update_resizes_worker_pool() {
        let (engine, _transport) = test_engine(1);
        engine.start().await;

        engine
            .apply_config_update(&serde_json::json!({
                "max_concurrent_tasks": 3,
                "task_memory_limit_mb": 256,
                "unknown_knob": true,
            }))
            .await;

        assert_eq!(engine.stats()["max_concurrent"], 3);
        assert_eq!(engine.inner().workers.lock().await.len(), 3);

        // Zero is rejected by config updates.
        engine
            .apply_config_update(&serde_json::json!({ "max_concurrent_tasks": 0 }))
            .await;
        assert_eq!(engine.stats()["max_concurrent"], 3);

        engine.stop(Duration::from_secs(2)).await;
    }

    #[tokio::test]
    async fn resize_to_zero_parks_queued_work() {
        let (engine, transport) = test_engine(1);
        engine.start().await;

        // Occupy the only worker, then queue a second run behind it.
        transport.push_task(shell_task("rb", "sleep 2", 60)).await;
        assert!(
            wait_until(Duration::from_secs(10), || {
                transport
                    .statuses()
                    .iter()
                    .any(|s| s.execution_id == "rb" && s.status == "running")
            })
            .await
        );
        transport.push_task(shell_task("r6", "echo parked", 30)).await;
        assert!(
            wait_until(Duration::from_secs(5), || {
                engine.inner().scheduler.contains("r6")
            })
            .await
        );

        // With zero workers the in-flight run completes but nothing new
        // is dequeued.
        engine.inner().resize_workers(0).await;
        assert!(
            wait_until(Duration::from_secs(10), || {
                transport.results().iter().any(|r| r.run_id == "rb")
            })
            .await
        );
        tokio::time::sleep(Duration::from_millis(500)).await;
        assert!(!transport.results().iter().any(|r| r.run_id == "r6"));
        assert!(engine.inner().scheduler.contains("r6"));

        engine.inner().resize_workers(1).await;
        assert!(
            wait_until(Duration::from_secs(10), || {
                transport.results().iter().any(|r| r.run_id == "r6")
            })
            .await
        );

        engine.stop(Duration::from_secs(2)).await;
    }

    #[tokio::test]
    async fn control_loop_routes_cancel_by_task_id() {
        let (engine, transport) = test_engine(1);
        engine.start().await;

        transport.push_task(shell_task("r7", "sleep 30", 60)).await;
        assert!(
            wait_until(Duration::from_secs(10), || {
                transport
                    .statuses()
                    .iter()
                    .any(|s| s.execution_id == "r7" && s.status == "running")
            })
            .await
        );

        transport.controls.lock().await.push_back(ControlMessage {
            control_type: ControlType::Cancel,
            run_id: None,
            task_id: Some("task-r7".to_string()),
            reason: Some("from master".to_string()),
            payload: None,
            receipt: Some("ctl-1".to_string()),
        });

        assert!(
            wait_until(Duration::from_secs(10), || {
                transport
                    .results()
                    .iter()
                    .any(|r| r.run_id == "r7" && r.status == RunStatus::Cancelled)
            })
            .await
        );

        engine.stop(Duration::from_secs(2)).await;
    }

    #[test]
    fn empty_params_fall_back_to_interpreter_plus_entry_point() {
        let task = TaskDispatch {
            task_id: "t1".to_string(),
            entry_point: Some("main.py".to_string()),
            ..Default::default()
        };
        let payload = EngineInner::build_payload(&task);
        assert!(payload.args.is_empty());
        assert!(payload.kwargs.is_empty());

        let context = RunContext {
            run_id: "r1".to_string(),
            task_id: "t1".to_string(),
            project_id: "p".to_string(),
            timeout_seconds: 60,
            memory_limit_mb: 0,
            cpu_limit_seconds: 0,
            priority: 2,
            labels: HashMap::new(),
            receipt: None,
            runtime_spec: None,
        };
        let runtime = RuntimeHandle {
            interpreter: "/usr/bin/python3".to_string(),
            ..Default::default()
        };
        let plan = EngineInner::build_fallback_plan(&context, &payload, &runtime);
        assert_eq!(plan.command, "/usr/bin/python3");
        assert_eq!(plan.args, vec!["main.py"]);
        assert_eq!(plan.cwd, ".");
        assert_eq!(plan.timeout_seconds, 60);
    }

    #[test]
    fn params_args_and_patterns_are_recognized() {
        let task = TaskDispatch {
            task_id: "t1".to_string(),
            params: serde_json::json!({
                "args": ["--n", 3],
                "kwargs": { "mode": "fast" },
                "artifact_patterns": ["out/*.csv"],
            }),
            ..Default::default()
        };
        let payload = EngineInner::build_payload(&task);
        assert_eq!(payload.args, vec!["--n", "3"]);
        assert_eq!(payload.kwargs.get("mode").unwrap(), "fast");
        assert_eq!(payload.artifact_patterns, vec!["out/*.csv"]);
    }

    #[test]
    fn run_ids_are_synthesized_from_task_id_and_time() {
        let run_id = EngineInner::generate_run_id("t42");
        assert!(run_id.starts_with("run-t42-"));
        assert!(run_id.len() > "run-t42-".len() + 14);
    }
}
