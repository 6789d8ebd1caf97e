//! Request/response driver: the fallback when streaming is unavailable.
//!
//! Every send is a POST against the Master's node API; task dispatches
//! arrive via a long-poll endpoint and cancels via a control endpoint.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use hmac::{Hmac, Mac};
use sha2::Sha256;
use tracing::{debug, info, warn};

use drover_core::models::{
    ConnectionConfig, ControlMessage, ControlType, Heartbeat, LogEntry, TaskDispatch, TaskResult,
    TaskStatusUpdate,
};

use crate::protocol::{
    CancelCallback, DispatchCallback, Transport, TransportMetrics, TransportMetricsSnapshot,
};

type HmacSha256 = Hmac<Sha256>;

/// Retries per request.
const MAX_RETRY_COUNT: u32 = 3;
/// First retry delay; doubles per attempt.
const RETRY_BASE_DELAY: Duration = Duration::from_secs(1);
const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Compute the request signature over `timestamp.nonce.canonical_payload`.
///
/// The canonical payload is the JSON encoding with sorted keys; callers pass
/// the payload as a `serde_json::Value`, whose object representation is
/// already key-ordered.
pub fn sign_payload(secret: &str, timestamp: i64, nonce: &str, payload: &serde_json::Value) -> String {
    let canonical = serde_json::to_string(payload).unwrap_or_default();
    let message = format!("{timestamp}.{nonce}.{canonical}");
    // HMAC accepts keys of any length; this cannot fail in practice.
    let Ok(mut mac) = HmacSha256::new_from_slice(secret.as_bytes()) else {
        return String::new();
    };
    mac.update(message.as_bytes());
    hex::encode(mac.finalize().into_bytes())
}

/// HTTP fallback driver.
pub struct HttpClient {
    client: reqwest::Client,
    config: std::sync::Mutex<Option<ConnectionConfig>>,
    connected: AtomicBool,
    metrics: TransportMetrics,
    pending_tasks: tokio::sync::Mutex<VecDeque<TaskDispatch>>,
    pending_control: tokio::sync::Mutex<VecDeque<ControlMessage>>,
    on_dispatch: std::sync::Mutex<Option<DispatchCallback>>,
    on_cancel: std::sync::Mutex<Option<CancelCallback>>,
}

impl HttpClient {
    /// A disconnected client; call [`Transport::connect`] to probe the peer.
    pub fn new() -> Self {
        let client = reqwest::Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .timeout(REQUEST_TIMEOUT)
            .build()
            .unwrap_or_default();
        Self {
            client,
            config: std::sync::Mutex::new(None),
            connected: AtomicBool::new(false),
            metrics: TransportMetrics::new(),
            pending_tasks: tokio::sync::Mutex::new(VecDeque::new()),
            pending_control: tokio::sync::Mutex::new(VecDeque::new()),
            on_dispatch: std::sync::Mutex::new(None),
            on_cancel: std::sync::Mutex::new(None),
        }
    }

    fn config(&self) -> Option<ConnectionConfig> {
        self.config.lock().unwrap().clone()
    }

    fn url(&self, path: &str) -> Option<String> {
        let config = self.config()?;
        Some(format!("{}/{}", config.master_url.trim_end_matches('/'), path))
    }

    fn headers(
        &self,
        config: &ConnectionConfig,
        payload: Option<&serde_json::Value>,
    ) -> Vec<(&'static str, String)> {
        let timestamp = chrono::Utc::now().timestamp();
        let nonce = uuid::Uuid::new_v4().simple().to_string()[..16].to_string();

        let mut headers = vec![
            ("Authorization", format!("Bearer {}", config.api_key)),
            ("X-Timestamp", timestamp.to_string()),
            ("X-Nonce", nonce.clone()),
            ("X-Node-ID", config.node_id.clone()),
            ("X-Machine-Code", config.machine_code.clone()),
        ];

        if let (Some(secret), Some(payload)) = (config.secret_key.as_deref(), payload) {
            headers.push(("X-Signature", sign_payload(secret, timestamp, &nonce, payload)));
        }
        headers
    }

    async fn request_with_retry(
        &self,
        method: reqwest::Method,
        url: &str,
        payload: Option<serde_json::Value>,
        max_retries: u32,
        timeout: Option<Duration>,
    ) -> Option<reqwest::Response> {
        let config = self.config()?;

        for attempt in 0..max_retries {
            let started = Instant::now();
            let mut request = self.client.request(method.clone(), url);
            if let Some(timeout) = timeout {
                request = request.timeout(timeout);
            }
            for (name, value) in self.headers(&config, payload.as_ref()) {
                request = request.header(name, value);
            }
            if let Some(payload) = &payload {
                request = request.json(payload);
            }

            match request.send().await {
                Ok(response) => {
                    self.metrics
                        .record_latency(started.elapsed().as_secs_f64() * 1000.0);
                    return Some(response);
                }
                Err(err) if err.is_connect() || err.is_timeout() => {
                    if attempt + 1 < max_retries {
                        let delay = RETRY_BASE_DELAY * 2_u32.pow(attempt);
                        debug!("retry {}/{} in {:?}: {err}", attempt + 1, max_retries, delay);
                        tokio::time::sleep(delay).await;
                    } else {
                        warn!("request failed after {max_retries} attempts: {err}");
                        self.metrics
                            .record_error(&err.to_string(), Some("unavailable"));
                        return None;
                    }
                }
                Err(err) => {
                    self.metrics.record_error(&err.to_string(), None);
                    return None;
                }
            }
        }
        None
    }

    async fn post_ok(&self, path: &str, payload: serde_json::Value, max_retries: u32) -> bool {
        let Some(url) = self.url(path) else {
            return false;
        };
        if !self.is_connected() {
            return false;
        }
        match self
            .request_with_retry(reqwest::Method::POST, &url, Some(payload), max_retries, None)
            .await
        {
            Some(response) if response.status().is_success() => {
                self.metrics.record_sent(0);
                true
            }
            Some(response) => {
                self.metrics.record_error(
                    &format!("http {}", response.status()),
                    Some(response.status().as_str()),
                );
                false
            }
            None => false,
        }
    }

    async fn send_single_log(&self, log: &LogEntry) -> bool {
        let Some(config) = self.config() else {
            return false;
        };
        let payload = serde_json::json!({
            "execution_id": log.execution_id,
            "log_type": log.log_type,
            "content": log.content,
            "timestamp": log.timestamp,
            "machine_code": config.machine_code,
        });
        self.post_ok("api/v1/nodes/report-log", payload, 1).await
    }

    async fn fetch_queue(
        &self,
        path: &str,
        key: &str,
        timeout: Duration,
    ) -> Option<Vec<serde_json::Value>> {
        let config = self.config()?;
        let url = format!(
            "{}?machine_code={}&wait={}",
            self.url(path)?,
            config.machine_code,
            timeout.as_secs().max(1)
        );
        let response = self
            .request_with_retry(
                reqwest::Method::GET,
                &url,
                None,
                1,
                Some(timeout + Duration::from_secs(5)),
            )
            .await?;
        if !response.status().is_success() {
            return None;
        }
        let body: serde_json::Value = response.json().await.ok()?;
        self.metrics.record_received(0);
        body.get("data")
            .and_then(|d| d.get(key))
            .and_then(|t| t.as_array())
            .cloned()
    }
}

impl Default for HttpClient {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Transport for HttpClient {
    async fn connect(&self, config: &ConnectionConfig) -> bool {
        *self.config.lock().unwrap() = Some(config.clone());

        let Some(url) = self.url("api/v1/health") else {
            return false;
        };
        match self
            .request_with_retry(reqwest::Method::GET, &url, None, 1, None)
            .await
        {
            Some(response) if response.status().is_success() => {
                self.connected.store(true, Ordering::SeqCst);
                self.metrics.record_connection();
                info!(master = %config.master_url, "http driver connected");
                true
            }
            Some(response) => {
                self.metrics.record_error(
                    &format!("health probe: http {}", response.status()),
                    Some(response.status().as_str()),
                );
                false
            }
            None => false,
        }
    }

    async fn disconnect(&self) {
        self.connected.store(false, Ordering::SeqCst);
        *self.config.lock().unwrap() = None;
        info!("http driver disconnected");
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst) && self.config.lock().unwrap().is_some()
    }

    fn metrics(&self) -> TransportMetricsSnapshot {
        self.metrics.snapshot()
    }

    async fn send_heartbeat(&self, heartbeat: Heartbeat) -> bool {
        let Ok(payload) = serde_json::to_value(&heartbeat) else {
            return false;
        };
        self.post_ok("api/v1/nodes/heartbeat", payload, 1).await
    }

    async fn send_logs(&self, logs: Vec<LogEntry>) -> bool {
        if logs.is_empty() {
            return true;
        }
        let Some(config) = self.config() else {
            return false;
        };
        let payload = serde_json::json!({
            "logs": logs,
            "machine_code": config.machine_code,
        });
        if self
            .post_ok("api/v1/nodes/report-logs-batch", payload, 2)
            .await
        {
            return true;
        }

        // Batch failed; degrade to per-line delivery.
        warn!("batch log send failed, falling back to single-line sends");
        let mut all_ok = true;
        for log in &logs {
            all_ok &= self.send_single_log(log).await;
        }
        all_ok
    }

    async fn send_task_status(&self, status: TaskStatusUpdate) -> bool {
        let Some(config) = self.config() else {
            return false;
        };
        let mut payload = match serde_json::to_value(&status) {
            Ok(v) => v,
            Err(_) => return false,
        };
        if let Some(map) = payload.as_object_mut() {
            map.insert(
                "machine_code".to_string(),
                serde_json::Value::String(config.machine_code.clone()),
            );
        }
        self.post_ok("api/v1/nodes/report-task", payload, MAX_RETRY_COUNT)
            .await
    }

    async fn send_task_ack(&self, task_id: &str, accepted: bool, reason: Option<&str>) -> bool {
        self.post_ok(
            "api/v1/nodes/task-ack",
            serde_json::json!({
                "task_id": task_id,
                "accepted": accepted,
                "reason": reason,
            }),
            1,
        )
        .await
    }

    async fn send_cancel_ack(&self, task_id: &str, ok: bool, reason: Option<&str>) -> bool {
        self.post_ok(
            "api/v1/nodes/cancel-ack",
            serde_json::json!({
                "task_id": task_id,
                "ok": ok,
                "reason": reason,
            }),
            1,
        )
        .await
    }

    async fn poll_task(&self, timeout: Duration) -> Option<TaskDispatch> {
        {
            let mut pending = self.pending_tasks.lock().await;
            if let Some(task) = pending.pop_front() {
                return Some(task);
            }
        }
        if !self.is_connected() {
            return None;
        }

        let raw = self
            .fetch_queue("api/v1/nodes/pending-tasks", "tasks", timeout)
            .await?;
        let mut tasks: VecDeque<TaskDispatch> = raw
            .into_iter()
            .filter_map(|v| serde_json::from_value(v).ok())
            .collect();

        if let Some(cb) = self.on_dispatch.lock().unwrap().clone() {
            for task in &tasks {
                cb(task.clone());
            }
        }

        let first = tasks.pop_front();
        if !tasks.is_empty() {
            self.pending_tasks.lock().await.extend(tasks);
        }
        first
    }

    async fn poll_control(&self, timeout: Duration) -> Option<ControlMessage> {
        {
            let mut pending = self.pending_control.lock().await;
            if let Some(msg) = pending.pop_front() {
                return Some(msg);
            }
        }
        if !self.is_connected() {
            return None;
        }

        let raw = self
            .fetch_queue("api/v1/nodes/control-messages", "messages", timeout)
            .await?;
        let mut messages: VecDeque<ControlMessage> = raw
            .into_iter()
            .filter_map(|v| serde_json::from_value(v).ok())
            .collect();

        if let Some(cb) = self.on_cancel.lock().unwrap().clone() {
            for msg in messages
                .iter()
                .filter(|m| matches!(m.control_type, ControlType::Cancel | ControlType::Kill))
            {
                cb(msg.clone());
            }
        }

        let first = messages.pop_front();
        if !messages.is_empty() {
            self.pending_control.lock().await.extend(messages);
        }
        first
    }

    async fn report_result(&self, result: TaskResult) -> bool {
        let Ok(payload) = serde_json::to_value(&result) else {
            return false;
        };
        self.post_ok("api/v1/nodes/report-result", payload, MAX_RETRY_COUNT)
            .await
    }

    async fn ack_task(&self, receipt: &str, accepted: bool) -> bool {
        self.post_ok(
            "api/v1/nodes/receipts/ack",
            serde_json::json!({ "receipt": receipt, "accepted": accepted }),
            MAX_RETRY_COUNT,
        )
        .await
    }

    async fn ack_control(&self, receipt: &str) -> bool {
        self.post_ok(
            "api/v1/nodes/control-ack",
            serde_json::json!({ "receipt": receipt }),
            1,
        )
        .await
    }

    async fn send_control_result(
        &self,
        request_id: &str,
        reply_stream: &str,
        success: bool,
        data: Option<serde_json::Value>,
        error: &str,
    ) -> bool {
        self.post_ok(
            "api/v1/nodes/control-result",
            serde_json::json!({
                "request_id": request_id,
                "reply_stream": reply_stream,
                "success": success,
                "data": data,
                "error": error,
            }),
            1,
        )
        .await
    }

    fn on_task_dispatch(&self, callback: DispatchCallback) {
        *self.on_dispatch.lock().unwrap() = Some(callback);
    }

    fn on_task_cancel(&self, callback: CancelCallback) {
        *self.on_cancel.lock().unwrap() = Some(callback);
    }
}
