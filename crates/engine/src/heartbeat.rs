//! Node heartbeat loop: periodic liveness + utilization reports.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use chrono::Utc;
use sysinfo::{Disks, System};
use tokio::task::JoinHandle;
use tracing::{debug, info};

use drover_core::models::{Heartbeat, NodeMetrics, OsInfo};
use drover_transport::Transport;

/// Supplies `(running_tasks, max_concurrent_tasks, task_count)` for the
/// heartbeat metrics block.
pub type TaskCountsFn = Arc<dyn Fn() -> (u64, u64, u64) + Send + Sync>;

/// Sends a node heartbeat every `interval` while the transport is
/// connected. Heartbeats are fire-and-forget; a missed one is simply
/// missed.
pub struct HeartbeatService {
    transport: Arc<dyn Transport>,
    node_id: String,
    interval: Duration,
    task_counts: TaskCountsFn,
    running: Arc<AtomicBool>,
    task: tokio::sync::Mutex<Option<JoinHandle<()>>>,
}

impl HeartbeatService {
    /// Service reporting through `transport` as `node_id`.
    pub fn new(
        transport: Arc<dyn Transport>,
        node_id: &str,
        interval: Duration,
        task_counts: TaskCountsFn,
    ) -> Self {
        Self {
            transport,
            node_id: node_id.to_string(),
            interval,
            task_counts,
            running: Arc::new(AtomicBool::new(false)),
            task: tokio::sync::Mutex::new(None),
        }
    }

    /// Build one heartbeat from current host utilization.
    fn build_heartbeat(node_id: &str, sys: &mut System, task_counts: &TaskCountsFn) -> Heartbeat {
        sys.refresh_cpu_usage();
        sys.refresh_memory();

        let memory_pct = if sys.total_memory() > 0 {
            sys.used_memory() as f32 / sys.total_memory() as f32 * 100.0
        } else {
            0.0
        };
        let disks = Disks::new_with_refreshed_list();
        let (disk_total, disk_free) = disks
            .iter()
            .fold((0_u64, 0_u64), |(total, free), disk| {
                (total + disk.total_space(), free + disk.available_space())
            });
        let disk_pct = if disk_total > 0 {
            (disk_total - disk_free) as f32 / disk_total as f32 * 100.0
        } else {
            0.0
        };

        let (running_tasks, max_concurrent_tasks, task_count) = task_counts();
        Heartbeat {
            node_id: node_id.to_string(),
            status: "online".to_string(),
            metrics: NodeMetrics {
                cpu: sys.global_cpu_usage(),
                memory: memory_pct,
                disk: disk_pct,
                running_tasks,
                max_concurrent_tasks,
                task_count,
            },
            os_info: OsInfo::current(),
            timestamp: Utc::now(),
            capabilities: serde_json::Map::new(),
        }
    }

    /// Start the loop.
    pub async fn start(&self) {
        if self.running.swap(true, Ordering::SeqCst) {
            return;
        }

        let transport = self.transport.clone();
        let node_id = self.node_id.clone();
        let interval = self.interval;
        let task_counts = self.task_counts.clone();
        let running = self.running.clone();

        let handle = tokio::spawn(async move {
            let mut sys = System::new();
            while running.load(Ordering::SeqCst) {
                tokio::time::sleep(interval).await;
                if !running.load(Ordering::SeqCst) {
                    break;
                }
                if !transport.is_connected() {
                    debug!("transport disconnected, skipping heartbeat");
                    continue;
                }
                let heartbeat = Self::build_heartbeat(&node_id, &mut sys, &task_counts);
                if !transport.send_heartbeat(heartbeat).await {
                    debug!("heartbeat send failed");
                }
            }
        });
        *self.task.lock().await = Some(handle);
        info!(interval_secs = self.interval.as_secs(), "heartbeat service started");
    }

    /// Stop the loop.
    pub async fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
        if let Some(task) = self.task.lock().await.take() {
            task.abort();
        }
        info!("heartbeat service stopped");
    }
}
