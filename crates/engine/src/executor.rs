//! Process executor: runs an [`ExecPlan`] as a child process under resource
//! limits, streams its output to a [`LogSink`], and maps the outcome.

use std::collections::HashMap;
use std::process::Stdio;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::Notify;
use tracing::{debug, info, warn};

use drover_core::models::{ExecPlan, ExecResult, ExitReason, LogKind, RunStatus};

use crate::interfaces::{Executor, LogSink, RuntimeHandle};
use crate::security::{SecurityPolicy, screen_work_dir};

/// Exit code reported for wall-clock timeouts.
const TIMEOUT_EXIT_CODE: i32 = 124;
/// Grace between terminate and kill.
const KILL_GRACE: Duration = Duration::from_secs(5);

/// Executor tuning.
#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    /// Wall-clock budget when the plan does not set one.
    pub default_timeout: Duration,
    /// Per-stream line cap; lines past it are discarded and counted.
    pub max_output_lines: u64,
    /// Sampling cadence of the portable resource monitor.
    pub monitor_interval: Duration,
    /// Apply `setrlimit` caps before exec (Unix).
    pub use_rlimits: bool,
    /// Give each run a scoped temp dir as `HOME`/`TMPDIR`.
    pub scoped_tmp: bool,
    /// Pre-spawn screening policy.
    pub security: SecurityPolicy,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            default_timeout: Duration::from_secs(3600),
            max_output_lines: 100_000,
            monitor_interval: Duration::from_secs(1),
            use_rlimits: cfg!(unix),
            scoped_tmp: false,
            security: SecurityPolicy::default(),
        }
    }
}

/// Why the supervisor killed the child, when it did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum KillCause {
    Cancelled,
    MemoryLimit,
    CpuLimit,
    DiskLimit,
}

struct ChildSlot {
    pid: u32,
    kill_signal: Notify,
    kill_cause: Mutex<Option<KillCause>>,
}

impl ChildSlot {
    fn request_kill(&self, cause: KillCause) {
        let mut slot = self.kill_cause.lock().unwrap();
        if slot.is_none() {
            *slot = Some(cause);
        }
        drop(slot);
        // notify_one stores a permit, so a kill requested before the
        // supervisor starts waiting is not lost.
        self.kill_signal.notify_one();
    }
}

/// Outcome counters across all runs this executor handled.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ExecStats {
    /// Runs executed.
    pub total: u64,
    /// Runs that exited 0.
    pub succeeded: u64,
    /// Runs that failed (exit code, limit, or internal error).
    pub failed: u64,
    /// Runs cancelled by the engine.
    pub cancelled: u64,
    /// Runs that hit the wall-clock timeout.
    pub timed_out: u64,
}

/// The default [`Executor`]: one OS child process per run.
pub struct ProcessExecutor {
    config: ExecutorConfig,
    running: Mutex<HashMap<String, Arc<ChildSlot>>>,
    stats: Mutex<ExecStats>,
}

impl ProcessExecutor {
    /// Executor with the given configuration.
    pub fn new(config: ExecutorConfig) -> Self {
        Self {
            config,
            running: Mutex::new(HashMap::new()),
            stats: Mutex::new(ExecStats::default()),
        }
    }

    /// Runs currently holding a live child.
    pub fn running_count(&self) -> usize {
        self.running.lock().unwrap().len()
    }

    /// Outcome counter snapshot.
    pub fn stats(&self) -> ExecStats {
        self.stats.lock().unwrap().clone()
    }

    fn build_command(&self, plan: &ExecPlan, runtime: &RuntimeHandle) -> (Command, Option<tempfile::TempDir>) {
        let program = if plan.command.is_empty() {
            runtime.interpreter.clone()
        } else {
            plan.command.clone()
        };
        let mut cmd = Command::new(program);
        cmd.args(&plan.args);

        // Worker environment first, runtime env next, plan env last.
        let mut env: HashMap<String, String> = std::env::vars().collect();
        env.extend(runtime.env_vars.clone());
        env.extend(plan.env.clone());

        let scratch = if self.config.scoped_tmp {
            match tempfile::TempDir::new() {
                Ok(dir) => {
                    let path = dir.path().display().to_string();
                    env.insert("HOME".to_string(), path.clone());
                    env.insert("TMPDIR".to_string(), path);
                    Some(dir)
                }
                Err(err) => {
                    warn!("scoped temp dir unavailable: {err}");
                    None
                }
            }
        } else {
            None
        };

        cmd.env_clear();
        cmd.envs(env);
        if !plan.cwd.is_empty() {
            cmd.current_dir(&plan.cwd);
        }
        cmd.stdin(Stdio::null());
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());
        cmd.kill_on_drop(true);

        #[cfg(unix)]
        if self.config.use_rlimits {
            apply_rlimits(&mut cmd, plan);
        }

        (cmd, scratch)
    }

    fn spawn_reader(
        &self,
        run_id: &str,
        kind: LogKind,
        stream: impl tokio::io::AsyncRead + Unpin + Send + 'static,
        sink: Option<Arc<dyn LogSink>>,
    ) -> tokio::task::JoinHandle<u64> {
        let run_id = run_id.to_string();
        let max_lines = self.config.max_output_lines;
        tokio::spawn(async move {
            let mut lines = BufReader::new(stream).lines();
            let mut count = 0_u64;
            let mut capped = false;
            while let Ok(Some(line)) = lines.next_line().await {
                count += 1;
                if count > max_lines {
                    if !capped {
                        warn!(run_id = %run_id, max_lines, "output line limit reached, discarding the rest");
                        capped = true;
                    }
                    continue;
                }
                if let Some(sink) = &sink {
                    sink.add(&run_id, kind, line.trim_end_matches('\r')).await;
                }
            }
            count
        })
    }

    fn record_outcome(&self, status: RunStatus) {
        let mut stats = self.stats.lock().unwrap();
        stats.total += 1;
        match status {
            RunStatus::Success => stats.succeeded += 1,
            RunStatus::Failed => stats.failed += 1,
            RunStatus::Cancelled => stats.cancelled += 1,
            RunStatus::Timeout => stats.timed_out += 1,
        }
    }
}

#[cfg(unix)]
fn apply_rlimits(cmd: &mut Command, plan: &ExecPlan) {
    let cpu_limit = plan.cpu_limit_seconds;
    let memory_bytes = plan.memory_limit_mb.saturating_mul(1024 * 1024);
    let disk_bytes = plan.disk_limit_mb.saturating_mul(1024 * 1024);

    // Safety: only async-signal-safe calls run between fork and exec.
    unsafe {
        cmd.pre_exec(move || {
            if cpu_limit > 0 {
                let limit = libc::rlimit {
                    rlim_cur: cpu_limit,
                    rlim_max: cpu_limit + 5,
                };
                libc::setrlimit(libc::RLIMIT_CPU, &limit);
            }
            if memory_bytes > 0 {
                let limit = libc::rlimit {
                    rlim_cur: memory_bytes,
                    rlim_max: memory_bytes,
                };
                libc::setrlimit(libc::RLIMIT_AS, &limit);
            }
            if disk_bytes > 0 {
                let limit = libc::rlimit {
                    rlim_cur: disk_bytes,
                    rlim_max: disk_bytes,
                };
                libc::setrlimit(libc::RLIMIT_FSIZE, &limit);
            }
            let no_core = libc::rlimit {
                rlim_cur: 0,
                rlim_max: 0,
            };
            libc::setrlimit(libc::RLIMIT_CORE, &no_core);
            Ok(())
        });
    }
}

/// Terminate politely, then kill after the grace period.
async fn graceful_kill(child: &mut Child, pid: u32) {
    eprintln!("DEBUG graceful_kill entered pid={pid}");
    #[cfg(unix)]
    {
        // Safety: plain kill(2) on a pid we spawned.
        let rc = unsafe {
            libc::kill(pid as i32, libc::SIGTERM)
        };
        eprintln!("DEBUG sigterm rc={rc} errno={}", std::io::Error::last_os_error());
        if tokio::time::timeout(KILL_GRACE, child.wait()).await.is_ok() {
            eprintln!("DEBUG child exited within grace");
            return;
        }
        debug!(pid, "terminate grace expired, killing");
        eprintln!("DEBUG grace expired");
    }
    #[cfg(not(unix))]
    let _ = pid;
    let kr = child.kill().await;
    eprintln!("DEBUG child.kill() result={kr:?}");
}

/// Watch a child's resource usage and kill the tree on overrun.
async fn monitor_limits(pid: u32, plan: ExecPlan, slot: Arc<ChildSlot>, interval: Duration) {
    use sysinfo::{Pid, ProcessesToUpdate, System};

    let memory_bytes = plan.memory_limit_mb.saturating_mul(1024 * 1024);
    let cpu_ms = plan.cpu_limit_seconds.saturating_mul(1000);
    let disk_bytes = plan.disk_limit_mb.saturating_mul(1024 * 1024);

    let mut sys = System::new();
    let target = Pid::from_u32(pid);
    loop {
        tokio::time::sleep(interval).await;
        sys.refresh_processes(ProcessesToUpdate::All, true);
        let Some(process) = sys.process(target) else {
            return;
        };

        let cause = if memory_bytes > 0 && process.memory() > memory_bytes {
            Some(KillCause::MemoryLimit)
        } else if cpu_ms > 0 && process.accumulated_cpu_time() > cpu_ms {
            Some(KillCause::CpuLimit)
        } else if disk_bytes > 0 && process.disk_usage().total_written_bytes > disk_bytes {
            Some(KillCause::DiskLimit)
        } else {
            None
        };

        if let Some(cause) = cause {
            warn!(pid, ?cause, "resource limit exceeded, killing process tree");
            // Children first so the parent cannot respawn them.
            for (child_pid, child) in sys.processes() {
                if *child_pid != target && child.parent() == Some(target) {
                    child.kill();
                }
            }
            process.kill();
            slot.request_kill(cause);
            return;
        }
    }
}

#[async_trait]
impl Executor for ProcessExecutor {
    async fn run(
        &self,
        plan: ExecPlan,
        runtime: &RuntimeHandle,
        sink: Option<Arc<dyn LogSink>>,
    ) -> ExecResult {
        let run_id = plan.run_id.clone();
        let started_at = Utc::now();

        if self.config.security.is_active() && !plan.cwd.is_empty() {
            if let Err(err) = screen_work_dir(std::path::Path::new(&plan.cwd), &self.config.security)
            {
                self.record_outcome(RunStatus::Failed);
                return ExecResult::failed(&run_id, started_at, &format!("security screening: {err:#}"));
            }
        }

        let (mut cmd, scratch) = self.build_command(&plan, runtime);
        let mut child = match cmd.spawn() {
            Ok(child) => child,
            Err(err) => {
                self.record_outcome(RunStatus::Failed);
                return ExecResult::failed(
                    &run_id,
                    started_at,
                    &format!("spawn {}: {err}", plan.command),
                );
            }
        };
        let pid = child.id().unwrap_or(0);
        info!(run_id = %run_id, pid, command = %plan.command, "child started");

        let slot = Arc::new(ChildSlot {
            pid,
            kill_signal: Notify::new(),
            kill_cause: Mutex::new(None),
        });
        self.running
            .lock()
            .unwrap()
            .insert(run_id.clone(), slot.clone());

        let stdout_task = child
            .stdout
            .take()
            .map(|s| self.spawn_reader(&run_id, LogKind::Stdout, s, sink.clone()));
        let stderr_task = child
            .stderr
            .take()
            .map(|s| self.spawn_reader(&run_id, LogKind::Stderr, s, sink.clone()));

        let needs_monitor = (!cfg!(unix) || !self.config.use_rlimits)
            && (plan.memory_limit_mb > 0 || plan.cpu_limit_seconds > 0 || plan.disk_limit_mb > 0);
        let monitor = needs_monitor.then(|| {
            tokio::spawn(monitor_limits(
                pid,
                plan.clone(),
                slot.clone(),
                self.config.monitor_interval,
            ))
        });

        let timeout = if plan.timeout_seconds > 0 {
            Duration::from_secs(plan.timeout_seconds)
        } else {
            self.config.default_timeout
        };

        enum WaitOutcome {
            Exited(Option<std::process::ExitStatus>),
            TimedOut,
            KillRequested,
        }

        let outcome = tokio::select! {
            status = child.wait() => WaitOutcome::Exited(status.ok()),
            _ = tokio::time::sleep(timeout) => WaitOutcome::TimedOut,
            _ = slot.kill_signal.notified() => WaitOutcome::KillRequested,
        };

        let mut timed_out = false;
        let mut exit_status = None;
        match outcome {
            WaitOutcome::Exited(status) => exit_status = status,
            WaitOutcome::TimedOut => {
                timed_out = true;
                debug!(run_id = %run_id, "wall-clock timeout fired");
                graceful_kill(&mut child, pid).await;
            }
            WaitOutcome::KillRequested => {
                graceful_kill(&mut child, pid).await;
            }
        }
        eprintln!("DEBUG before second wait");
        if exit_status.is_none() {
            exit_status = child.wait().await.ok();
        }
        eprintln!("DEBUG after second wait exit_status={exit_status:?}");

        if let Some(task) = monitor {
            task.abort();
        }

        eprintln!("DEBUG awaiting stdout_task");
        let stdout_lines = match stdout_task {
            Some(task) => task.await.unwrap_or(0),
            None => 0,
        };
        eprintln!("DEBUG stdout done, awaiting stderr_task");
        let stderr_lines = match stderr_task {
            Some(task) => task.await.unwrap_or(0),
            None => 0,
        };
        eprintln!("DEBUG stderr done");

        self.running.lock().unwrap().remove(&run_id);
        drop(scratch);

        let kill_cause = *slot.kill_cause.lock().unwrap();
        let exit_code = exit_status.and_then(|s| s.code());
        // The cancel flag wins over every other classification, including a
        // timeout that fired in the same instant.
        let (status, exit_reason, exit_code, error_message) = match kill_cause {
            Some(KillCause::Cancelled) => (
                RunStatus::Cancelled,
                ExitReason::Cancelled,
                exit_code,
                Some("cancelled".to_string()),
            ),
            Some(KillCause::MemoryLimit) => (
                RunStatus::Failed,
                ExitReason::Oom,
                exit_code,
                Some(format!("memory limit exceeded ({} MiB)", plan.memory_limit_mb)),
            ),
            Some(KillCause::CpuLimit) => (
                RunStatus::Failed,
                ExitReason::CpuExceeded,
                exit_code,
                Some(format!("cpu limit exceeded ({} s)", plan.cpu_limit_seconds)),
            ),
            Some(KillCause::DiskLimit) => (
                RunStatus::Failed,
                ExitReason::Error,
                exit_code,
                Some(format!("disk write limit exceeded ({} MiB)", plan.disk_limit_mb)),
            ),
            None if timed_out => (
                RunStatus::Timeout,
                ExitReason::Timeout,
                Some(TIMEOUT_EXIT_CODE),
                Some(format!("timed out after {} s", timeout.as_secs())),
            ),
            None => classify_exit(exit_status, exit_code),
        };

        self.record_outcome(status);
        let finished_at = Utc::now();
        info!(run_id = %run_id, ?status, ?exit_reason, exit_code, "child finished");
        ExecResult {
            run_id,
            status,
            exit_reason,
            exit_code,
            error_message,
            started_at,
            finished_at,
            duration_ms: (finished_at - started_at).num_milliseconds().max(0) as u64,
            stdout_lines,
            stderr_lines,
            artifacts: Vec::new(),
            log_archived: false,
            log_archive_uri: None,
        }
    }

    async fn cancel(&self, run_id: &str) -> bool {
        let slot = self.running.lock().unwrap().get(run_id).cloned();
        match slot {
            Some(slot) => {
                info!(run_id, pid = slot.pid, "cancelling child");
                slot.request_kill(KillCause::Cancelled);
                true
            }
            None => false,
        }
    }
}

fn classify_exit(
    exit_status: Option<std::process::ExitStatus>,
    exit_code: Option<i32>,
) -> (RunStatus, ExitReason, Option<i32>, Option<String>) {
    match exit_code {
        Some(0) => (RunStatus::Success, ExitReason::Ok, Some(0), None),
        Some(code) => (
            RunStatus::Failed,
            ExitReason::Error,
            Some(code),
            Some(format!("exit code {code}")),
        ),
        None => {
            #[cfg(unix)]
            {
                use std::os::unix::process::ExitStatusExt;
                if let Some(signal) = exit_status.and_then(|s| s.signal()) {
                    if signal == libc::SIGXCPU {
                        return (
                            RunStatus::Failed,
                            ExitReason::CpuExceeded,
                            None,
                            Some("cpu time limit exceeded".to_string()),
                        );
                    }
                    return (
                        RunStatus::Failed,
                        ExitReason::Error,
                        None,
                        Some(format!("killed by signal {signal}")),
                    );
                }
            }
            #[cfg(not(unix))]
            let _ = exit_status;
            (
                RunStatus::Failed,
                ExitReason::Error,
                None,
                Some("process ended without an exit code".to_string()),
            )
        }
    }
}
