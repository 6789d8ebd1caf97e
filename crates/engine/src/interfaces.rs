//! Collaborator interfaces the engine consumes.
//!
//! Runtime provisioning, project fetching, artifact storage, and per-run
//! log management are external concerns; the engine only sees these traits.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use drover_core::models::{
    ExecPlan, ExecResult, LogKind, RunContext, RuntimeSpec, StoredArtifact, TaskPayload,
};

/// Receives captured child-process output, one line at a time.
#[async_trait]
pub trait LogSink: Send + Sync {
    /// Append one line for `run_id`.
    async fn add(&self, run_id: &str, kind: LogKind, content: &str);
}

/// Runs an [`ExecPlan`] and reports the outcome.
///
/// Errors never escape `run`; they are folded into the returned
/// [`ExecResult`].
#[async_trait]
pub trait Executor: Send + Sync {
    /// Execute the plan to completion (or cancellation/limit kill).
    async fn run(
        &self,
        plan: ExecPlan,
        runtime: &RuntimeHandle,
        sink: Option<Arc<dyn LogSink>>,
    ) -> ExecResult;

    /// Kill the child for `run_id`, if one is alive. Idempotent.
    async fn cancel(&self, run_id: &str) -> bool;
}

/// Handle to a prepared runtime environment.
#[derive(Debug, Clone, Default)]
pub struct RuntimeHandle {
    /// Environment root directory.
    pub path: String,
    /// Stable identity of the environment contents.
    pub runtime_hash: String,
    /// Interpreter executable to invoke.
    pub interpreter: String,
    /// Interpreter version, when known.
    pub version: Option<String>,
    /// Extra environment variables the runtime injects.
    pub env_vars: std::collections::HashMap<String, String>,
}

impl RuntimeHandle {
    /// The process's own interpreter-free "system" runtime.
    pub fn system() -> Self {
        Self {
            path: std::env::var("VIRTUAL_ENV").unwrap_or_else(|_| "/usr".to_string()),
            runtime_hash: "system".to_string(),
            interpreter: std::env::var("DROVER_INTERPRETER")
                .unwrap_or_else(|_| "python3".to_string()),
            version: None,
            env_vars: std::collections::HashMap::new(),
        }
    }
}

/// Description of a named runtime environment.
#[derive(Debug, Clone, Default)]
pub struct EnvInfo {
    /// Environment name.
    pub name: String,
    /// Environment root directory.
    pub path: String,
    /// Interpreter executable.
    pub interpreter: String,
    /// Interpreter version.
    pub version: Option<String>,
}

/// Prepares and releases runtime environments.
#[async_trait]
pub trait RuntimeManager: Send + Sync {
    /// Materialize an environment for `spec`.
    async fn prepare(&self, spec: &RuntimeSpec) -> anyhow::Result<RuntimeHandle>;

    /// Release a handle returned by [`RuntimeManager::prepare`].
    async fn release(&self, handle: &RuntimeHandle);

    /// Look a named environment up.
    async fn get_env(&self, name: &str) -> anyhow::Result<Option<EnvInfo>>;

    /// Execute a runtime-management action (`list_envs`, `create_env`,
    /// `install_packages`, ...) and return its result document.
    async fn manage(&self, action: &str, payload: &serde_json::Value)
    -> anyhow::Result<serde_json::Value>;
}

/// Downloads and unpacks project archives.
#[async_trait]
pub trait ProjectFetcher: Send + Sync {
    /// Fetch (or reuse a cached copy of) the project; returns its local path.
    async fn fetch(
        &self,
        project_id: &str,
        download_url: &str,
        file_hash: Option<&str>,
        is_compressed: bool,
        entry_point: Option<&str>,
    ) -> anyhow::Result<String>;
}

/// Builds execution plans for payloads it recognizes.
#[async_trait]
pub trait Plugin: Send + Sync {
    /// Whether this plugin can plan `payload`.
    fn matches(&self, payload: &TaskPayload) -> bool;

    /// Selection precedence among matching plugins; higher wins.
    fn priority(&self) -> i32;

    /// Produce the plan.
    async fn build_plan(&self, context: &RunContext, payload: &TaskPayload)
    -> anyhow::Result<ExecPlan>;
}

/// Plugins registered at construction time; no runtime discovery.
#[derive(Default)]
pub struct PluginRegistry {
    plugins: Vec<Arc<dyn Plugin>>,
}

impl PluginRegistry {
    /// An empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a plugin.
    pub fn register(&mut self, plugin: Arc<dyn Plugin>) {
        self.plugins.push(plugin);
    }

    /// Registered plugin count.
    pub fn len(&self) -> usize {
        self.plugins.len()
    }

    /// Whether no plugins are registered.
    pub fn is_empty(&self) -> bool {
        self.plugins.is_empty()
    }

    /// Build a plan with the highest-priority matching plugin.
    pub async fn build_plan(
        &self,
        context: &RunContext,
        payload: &TaskPayload,
    ) -> Option<anyhow::Result<ExecPlan>> {
        let plugin = self
            .plugins
            .iter()
            .filter(|p| p.matches(payload))
            .max_by_key(|p| p.priority())?;
        Some(plugin.build_plan(context, payload).await)
    }
}

/// Collects and stores run artifacts.
#[async_trait]
pub trait ArtifactManager: Send + Sync {
    /// Find artifacts under `work_dir` matching `patterns`.
    async fn collect_artifacts(
        &self,
        work_dir: &str,
        patterns: &[String],
        run_id: &str,
    ) -> anyhow::Result<Vec<StoredArtifact>>;

    /// Persist one collected artifact.
    async fn store_artifact(
        &self,
        artifact: StoredArtifact,
        run_id: &str,
    ) -> anyhow::Result<StoredArtifact>;
}

/// Per-run log manager: a [`LogSink`] that can archive what it captured.
#[async_trait]
pub trait LogManager: LogSink {
    /// Start capturing.
    async fn start(&self) -> anyhow::Result<()>;

    /// Stop capturing and release resources.
    async fn stop(&self);

    /// Archive captured logs; returns the stored archive artifacts.
    async fn archive_logs(&self) -> anyhow::Result<Vec<StoredArtifact>>;
}

/// Creates per-run log managers.
pub trait LogManagerFactory: Send + Sync {
    /// Manager for one run.
    fn create(&self, run_id: &str) -> Arc<dyn LogManager>;
}

/// Optional poll-rate governor.
#[async_trait]
pub trait FlowController: Send + Sync {
    /// Acquire a poll token; `false` when none became available in time.
    async fn acquire(&self, timeout: Duration) -> bool;

    /// Return the token.
    async fn release(&self);

    /// Signal a successful poll.
    fn on_success(&self);

    /// Signal a failed poll.
    fn on_failure(&self);
}
