//! Scriptable fake driver shared by the wrapper/manager unit tests.

use std::collections::VecDeque;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;

use drover_core::models::{
    ConnectionConfig, ControlMessage, Heartbeat, LogEntry, TaskDispatch, TaskResult,
    TaskStatusUpdate,
};

use crate::protocol::{
    CancelCallback, DispatchCallback, Transport, TransportMetricsSnapshot,
};

/// Fake driver with a scripted `connect` outcome sequence and a transcript
/// of everything sent through it.
pub(crate) struct FakeDriver {
    connected: AtomicBool,
    connect_results: Mutex<VecDeque<bool>>,
    sent: Mutex<Vec<String>>,
}

impl FakeDriver {
    pub(crate) fn new() -> Self {
        Self {
            connected: AtomicBool::new(false),
            connect_results: Mutex::new(VecDeque::new()),
            sent: Mutex::new(Vec::new()),
        }
    }

    /// Outcomes for successive `connect` calls; exhausted entries fail.
    pub(crate) fn script_connects(&self, results: &[bool]) {
        self.connect_results
            .lock()
            .unwrap()
            .extend(results.iter().copied());
    }

    pub(crate) fn sent(&self) -> Vec<String> {
        self.sent.lock().unwrap().clone()
    }

    pub(crate) fn force_disconnected(&self) {
        self.connected.store(false, Ordering::SeqCst);
    }
}

#[async_trait]
impl Transport for FakeDriver {
    async fn connect(&self, _config: &ConnectionConfig) -> bool {
        let ok = self
            .connect_results
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(false);
        self.connected.store(ok, Ordering::SeqCst);
        ok
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

    async fn send_heartbeat(&self, hb: Heartbeat) -> bool {
        if !self.is_connected() {
            return false;
        }
        self.sent
            .lock()
            .unwrap()
            .push(format!("heartbeat:{}", hb.node_id));
        true
    }

    async fn send_logs(&self, logs: Vec<LogEntry>) -> bool {
        if !self.is_connected() {
            return false;
        }
        self.sent.lock().unwrap().push(format!("logs:{}", logs.len()));
        true
    }

    async fn send_task_status(&self, status: TaskStatusUpdate) -> bool {
        if !self.is_connected() {
            return false;
        }
        self.sent
            .lock()
            .unwrap()
            .push(format!("status:{}", status.execution_id));
        true
    }

    async fn send_task_ack(&self, task_id: &str, _accepted: bool, _reason: Option<&str>) -> bool {
        self.sent.lock().unwrap().push(format!("task_ack:{task_id}"));
        self.is_connected()
    }

    async fn send_cancel_ack(&self, task_id: &str, _ok: bool, _reason: Option<&str>) -> bool {
        self.sent.lock().unwrap().push(format!("cancel_ack:{task_id}"));
        self.is_connected()
    }

    async fn poll_task(&self, _timeout: Duration) -> Option<TaskDispatch> {
        None
    }

    async fn poll_control(&self, _timeout: Duration) -> Option<ControlMessage> {
        None
    }

    async fn report_result(&self, result: TaskResult) -> bool {
        if !self.is_connected() {
            return false;
        }
        self.sent
            .lock()
            .unwrap()
            .push(format!("result:{}", result.run_id));
        true
    }

    async fn ack_task(&self, receipt: &str, _accepted: bool) -> bool {
        self.sent.lock().unwrap().push(format!("receipt_ack:{receipt}"));
        self.is_connected()
    }

    async fn ack_control(&self, receipt: &str) -> bool {
        self.sent
            .lock()
            .unwrap()
            .push(format!("control_ack:{receipt}"));
        self.is_connected()
    }

    async fn send_control_result(
        &self,
        request_id: &str,
        _reply_stream: &str,
        _success: bool,
        _data: Option<serde_json::Value>,
        _error: &str,
    ) -> bool {
        self.sent
            .lock()
            .unwrap()
            .push(format!("control_result:{request_id}"));
        self.is_connected()
    }

    fn on_task_dispatch(&self, _callback: DispatchCallback) {}

    fn on_task_cancel(&self, _callback: CancelCallback) {}
}
