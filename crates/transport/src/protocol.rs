//! The uniform messaging surface every driver implements.

use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use drover_core::models::{
    ConnectionConfig, ControlMessage, Heartbeat, LogEntry, TaskDispatch, TaskResult,
    TaskStatusUpdate,
};

/// Callback invoked when a driver receives a task dispatch.
pub type DispatchCallback = std::sync::Arc<dyn Fn(TaskDispatch) + Send + Sync>;
/// Callback invoked when a driver receives a cancel.
pub type CancelCallback = std::sync::Arc<dyn Fn(ControlMessage) + Send + Sync>;

/// Uniform transport surface to the Master.
///
/// Send methods return `false` on failure; transport-internal errors never
/// escape as panics or typed errors. `report_result` must be idempotent on
/// the Master side given a stable `run_id`.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Establish the connection. Returns `false` when the peer is
    /// unreachable; drivers may keep retrying internally afterwards.
    async fn connect(&self, config: &ConnectionConfig) -> bool;

    /// Tear the connection down and stop internal tasks.
    async fn disconnect(&self);

    /// Whether the driver currently has a live connection.
    fn is_connected(&self) -> bool;

    /// Counters and latency statistics for this driver.
    fn metrics(&self) -> TransportMetricsSnapshot;

    /// Send a liveness heartbeat. Never buffered while disconnected.
    async fn send_heartbeat(&self, heartbeat: Heartbeat) -> bool;

    /// Send a batch of log lines.
    async fn send_logs(&self, logs: Vec<LogEntry>) -> bool;

    /// Send a run status update.
    async fn send_task_status(&self, status: TaskStatusUpdate) -> bool;

    /// Acknowledge a dispatched task.
    async fn send_task_ack(&self, task_id: &str, accepted: bool, reason: Option<&str>) -> bool;

    /// Acknowledge a cancel request.
    async fn send_cancel_ack(&self, task_id: &str, ok: bool, reason: Option<&str>) -> bool;

    /// Wait up to `timeout` for the next task dispatch.
    async fn poll_task(&self, timeout: Duration) -> Option<TaskDispatch>;

    /// Wait up to `timeout` for the next control message.
    async fn poll_control(&self, timeout: Duration) -> Option<ControlMessage>;

    /// Deliver a terminal report.
    async fn report_result(&self, result: TaskResult) -> bool;

    /// Mark a polled task as claimed/consumed on the Master.
    async fn ack_task(&self, receipt: &str, accepted: bool) -> bool;

    /// Mark a control message as consumed on the Master.
    async fn ack_control(&self, receipt: &str) -> bool;

    /// Answer a runtime-manage request on its reply stream.
    async fn send_control_result(
        &self,
        request_id: &str,
        reply_stream: &str,
        success: bool,
        data: Option<serde_json::Value>,
        error: &str,
    ) -> bool;

    /// Register a callback fired on every inbound task dispatch, in
    /// addition to the dispatch being queued for [`Transport::poll_task`].
    fn on_task_dispatch(&self, callback: DispatchCallback);

    /// Register a callback fired on every inbound cancel.
    fn on_task_cancel(&self, callback: CancelCallback);
}

const MAX_LATENCY_SAMPLES: usize = 100;

#[derive(Debug, Default)]
struct MetricsInner {
    messages_sent: u64,
    messages_received: u64,
    bytes_sent: u64,
    bytes_received: u64,
    reconnect_count: u64,
    error_count: u64,
    last_error: Option<String>,
    last_error_code: Option<String>,
    connected_at: Option<DateTime<Utc>>,
    latency_samples: VecDeque<f64>,
}

/// Shared counters and a sliding latency window for one driver.
#[derive(Debug, Default)]
pub struct TransportMetrics {
    inner: Mutex<MetricsInner>,
}

impl TransportMetrics {
    /// Fresh metrics.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one outbound message of `bytes` size.
    pub fn record_sent(&self, bytes: usize) {
        let mut inner = self.inner.lock().unwrap();
        inner.messages_sent += 1;
        inner.bytes_sent += bytes as u64;
    }

    /// Record one inbound message of `bytes` size.
    pub fn record_received(&self, bytes: usize) {
        let mut inner = self.inner.lock().unwrap();
        inner.messages_received += 1;
        inner.bytes_received += bytes as u64;
    }

    /// Record a request round-trip latency sample.
    pub fn record_latency(&self, latency_ms: f64) {
        let mut inner = self.inner.lock().unwrap();
        inner.latency_samples.push_back(latency_ms);
        while inner.latency_samples.len() > MAX_LATENCY_SAMPLES {
            inner.latency_samples.pop_front();
        }
    }

    /// Record a connection being established.
    pub fn record_connection(&self) {
        self.inner.lock().unwrap().connected_at = Some(Utc::now());
    }

    /// Record a successful reconnection.
    pub fn record_reconnection(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.reconnect_count += 1;
        inner.connected_at = Some(Utc::now());
    }

    /// Record an error with an optional status code.
    pub fn record_error(&self, message: &str, code: Option<&str>) {
        let mut inner = self.inner.lock().unwrap();
        inner.error_count += 1;
        inner.last_error = Some(message.to_string());
        inner.last_error_code = code.map(str::to_string);
    }

    /// Current snapshot.
    pub fn snapshot(&self) -> TransportMetricsSnapshot {
        let inner = self.inner.lock().unwrap();
        let mut sorted: Vec<f64> = inner.latency_samples.iter().copied().collect();
        sorted.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
        let percentile = |p: f64| -> f64 {
            if sorted.is_empty() {
                return 0.0;
            }
            let idx = ((sorted.len() as f64) * p) as usize;
            sorted[idx.min(sorted.len() - 1)]
        };
        let avg = if sorted.is_empty() {
            0.0
        } else {
            sorted.iter().sum::<f64>() / sorted.len() as f64
        };

        TransportMetricsSnapshot {
            messages_sent: inner.messages_sent,
            messages_received: inner.messages_received,
            bytes_sent: inner.bytes_sent,
            bytes_received: inner.bytes_received,
            reconnect_count: inner.reconnect_count,
            error_count: inner.error_count,
            last_error: inner.last_error.clone(),
            last_error_code: inner.last_error_code.clone(),
            connected_at: inner.connected_at,
            latency_sample_count: sorted.len() as u64,
            avg_latency_ms: avg,
            p95_latency_ms: percentile(0.95),
            p99_latency_ms: percentile(0.99),
        }
    }
}

/// Point-in-time view of a driver's metrics.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct TransportMetricsSnapshot {
    /// Messages sent.
    pub messages_sent: u64,
    /// Messages received.
    pub messages_received: u64,
    /// Bytes sent.
    pub bytes_sent: u64,
    /// Bytes received.
    pub bytes_received: u64,
    /// Successful reconnections.
    pub reconnect_count: u64,
    /// Errors observed.
    pub error_count: u64,
    /// Last error message.
    pub last_error: Option<String>,
    /// Last error status code.
    pub last_error_code: Option<String>,
    /// When the current connection was established.
    pub connected_at: Option<DateTime<Utc>>,
    /// Latency samples currently in the window.
    pub latency_sample_count: u64,
    /// Average latency over the window, in milliseconds.
    pub avg_latency_ms: f64,
    /// 95th-percentile latency, in milliseconds.
    pub p95_latency_ms: f64,
    /// 99th-percentile latency, in milliseconds.
    pub p99_latency_ms: f64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn latency_window_keeps_last_100_samples() {
        let metrics = TransportMetrics::new();
        for i in 0..150 {
            metrics.record_latency(i as f64);
        }
        let snap = metrics.snapshot();
        assert_eq!(snap.latency_sample_count, 100);
        // Samples 0..49 were evicted.
        assert!(snap.avg_latency_ms > 99.0);
        assert!(snap.p99_latency_ms >= 148.0);
    }

    #[test]
    fn counters_accumulate() {
        let metrics = TransportMetrics::new();
        metrics.record_sent(10);
        metrics.record_sent(20);
        metrics.record_received(5);
        metrics.record_error("boom", Some("unavailable"));

        let snap = metrics.snapshot();
        assert_eq!(snap.messages_sent, 2);
        assert_eq!(snap.bytes_sent, 30);
        assert_eq!(snap.messages_received, 1);
        assert_eq!(snap.error_count, 1);
        assert_eq!(snap.last_error_code.as_deref(), Some("unavailable"));
    }
}
