//! Resilience wrapper around the streaming driver: exponential-backoff
//! reconnect, outbound buffering while disconnected, FIFO replay after
//! reconnecting.

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rand::Rng;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use drover_core::events::{EventBus, WorkerEvent};
use drover_core::models::{
    ConnectionConfig, ConnectionState, ControlMessage, Heartbeat, LogEntry, TaskDispatch,
    TaskResult, TaskStatusUpdate,
};

use crate::protocol::{
    CancelCallback, DispatchCallback, Transport, TransportMetricsSnapshot,
};

/// Reconnect delay calculator: `min(base × multiplier^attempt, max)` with
/// symmetric jitter.
#[derive(Debug, Clone)]
pub struct ExponentialBackoff {
    base: Duration,
    max: Duration,
    multiplier: f64,
    jitter: f64,
    attempt: u32,
}

impl ExponentialBackoff {
    /// Backoff with the given base and cap, ×2 growth, ±10 % jitter.
    pub fn new(base: Duration, max: Duration) -> Self {
        Self {
            base,
            max,
            multiplier: 2.0,
            jitter: 0.1,
            attempt: 0,
        }
    }

    /// Backoff without jitter, for deterministic callers.
    pub fn without_jitter(base: Duration, max: Duration) -> Self {
        Self {
            jitter: 0.0,
            ..Self::new(base, max)
        }
    }

    /// Attempts consumed so far.
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    /// Delay for a given attempt, without advancing state.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let raw = self.base.as_secs_f64() * self.multiplier.powi(attempt as i32);
        Duration::from_secs_f64(raw.min(self.max.as_secs_f64()))
    }

    /// Next delay; advances the attempt counter.
    pub fn next_delay(&mut self) -> Duration {
        let mut delay = self.delay_for_attempt(self.attempt).as_secs_f64();
        if self.jitter > 0.0 {
            let spread = delay * self.jitter;
            delay = (delay + rand::thread_rng().gen_range(-spread..=spread)).max(0.0);
        }
        self.attempt = self.attempt.saturating_add(1);
        Duration::from_secs_f64(delay)
    }

    /// Reset after a successful connection.
    pub fn reset(&mut self) {
        self.attempt = 0;
    }
}

/// What a buffered message carries.
#[derive(Debug, Clone)]
pub enum BufferedPayload {
    /// A batch of log lines.
    LogBatch(Vec<LogEntry>),
    /// A run status update.
    TaskStatus(TaskStatusUpdate),
    /// A terminal report.
    TaskResult(TaskResult),
}

impl BufferedPayload {
    fn kind(&self) -> &'static str {
        match self {
            BufferedPayload::LogBatch(_) => "log_batch",
            BufferedPayload::TaskStatus(_) => "task_status",
            BufferedPayload::TaskResult(_) => "task_status",
        }
    }
}

/// One message waiting for the link to come back.
#[derive(Debug, Clone)]
pub struct BufferedMessage {
    /// The payload to replay.
    pub payload: BufferedPayload,
    /// When it was buffered.
    pub timestamp: DateTime<Utc>,
    /// Replay attempts so far.
    pub retry_count: u32,
}

/// Bounded FIFO of messages awaiting reconnection; drop-oldest when full.
pub struct MessageBuffer {
    inner: std::sync::Mutex<VecDeque<BufferedMessage>>,
    max_size: usize,
    dropped: AtomicU64,
}

impl MessageBuffer {
    /// Buffer holding at most `max_size` messages.
    pub fn new(max_size: usize) -> Self {
        Self {
            inner: std::sync::Mutex::new(VecDeque::new()),
            max_size,
            dropped: AtomicU64::new(0),
        }
    }

    /// Queue a message, evicting the oldest when full. Returns the evicted
    /// message's kind when an eviction happened.
    pub fn add(&self, message: BufferedMessage) -> Option<&'static str> {
        let mut inner = self.inner.lock().unwrap();
        let mut evicted = None;
        if inner.len() >= self.max_size {
            if let Some(old) = inner.pop_front() {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                evicted = Some(old.payload.kind());
            }
        }
        inner.push_back(message);
        evicted
    }

    /// Drain every buffered message in FIFO order.
    pub fn take_all(&self) -> Vec<BufferedMessage> {
        self.inner.lock().unwrap().drain(..).collect()
    }

    /// Messages currently buffered.
    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().len()
    }

    /// Whether the buffer is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Messages evicted so far.
    pub fn dropped_count(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

struct ResilientShared {
    transport: Arc<dyn Transport>,
    buffer: MessageBuffer,
    backoff: std::sync::Mutex<ExponentialBackoff>,
    state: std::sync::Mutex<ConnectionState>,
    running: AtomicBool,
    reconnects: AtomicU64,
    config: std::sync::Mutex<Option<ConnectionConfig>>,
    events: EventBus,
}

impl ResilientShared {
    fn set_state(&self, new_state: ConnectionState) {
        let old_state = {
            let mut state = self.state.lock().unwrap();
            let old = *state;
            *state = new_state;
            old
        };
        if old_state != new_state {
            self.events.publish(WorkerEvent::ConnectionStateChanged {
                old_state,
                new_state,
            });
        }
    }

    fn buffer_message(&self, payload: BufferedPayload) {
        let kind = payload.kind();
        let evicted = self.buffer.add(BufferedMessage {
            payload,
            timestamp: Utc::now(),
            retry_count: 0,
        });
        if let Some(evicted_kind) = evicted {
            warn!("message buffer full, dropped oldest {evicted_kind}");
            self.events.publish(WorkerEvent::MessageDropped {
                message_type: evicted_kind.to_string(),
                reason: "buffer_full".to_string(),
                dropped_count: 1,
            });
        }
        debug!(kind, buffered = self.buffer.len(), "buffered message while disconnected");
    }

    /// Replay buffered messages in FIFO order, re-buffering failures.
    async fn replay(&self) -> u64 {
        let messages = self.buffer.take_all();
        let mut sent = 0_u64;
        for mut message in messages {
            let ok = match &message.payload {
                BufferedPayload::LogBatch(logs) => self.transport.send_logs(logs.clone()).await,
                BufferedPayload::TaskStatus(status) => {
                    self.transport.send_task_status(status.clone()).await
                }
                BufferedPayload::TaskResult(result) => {
                    self.transport.report_result(result.clone()).await
                }
            };
            if ok {
                sent += 1;
            } else {
                message.retry_count += 1;
                self.buffer.add(message);
            }
        }
        sent
    }

    async fn immediate_heartbeat(&self) {
        let node_id = self
            .config
            .lock()
            .unwrap()
            .as_ref()
            .map(|c| c.node_id.clone())
            .unwrap_or_default();
        if !self.transport.send_heartbeat(Heartbeat::online(&node_id)).await {
            debug!("post-reconnect heartbeat failed");
        }
    }

    async fn reconnect_loop(self: Arc<Self>) {
        let mut attempt = 0_u64;
        while self.running.load(Ordering::SeqCst) && !self.transport.is_connected() {
            let delay = self.backoff.lock().unwrap().next_delay();
            self.events.publish(WorkerEvent::ReconnectionAttempt {
                attempt: attempt + 1,
                delay_secs: delay.as_secs_f64(),
            });
            info!(attempt = attempt + 1, delay_secs = delay.as_secs_f64(), "reconnecting");
            tokio::time::sleep(delay).await;
            if !self.running.load(Ordering::SeqCst) {
                break;
            }

            self.set_state(ConnectionState::Reconnecting);
            let config = self.config.lock().unwrap().clone();
            let Some(config) = config else { break };

            if self.transport.connect(&config).await {
                self.set_state(ConnectionState::Connected);
                self.backoff.lock().unwrap().reset();
                self.reconnects.fetch_add(1, Ordering::Relaxed);

                let replayed = self.replay().await;
                self.immediate_heartbeat().await;

                self.events.publish(WorkerEvent::ReconnectionSuccess {
                    attempt: attempt + 1,
                    replayed,
                });
                info!(replayed, "reconnected");
                break;
            }

            self.events.publish(WorkerEvent::ReconnectionFailed {
                attempt: attempt + 1,
                error: "connect returned false".to_string(),
            });
            attempt += 1;
        }
    }
}

/// Wrapper that keeps the streaming driver usable across disconnects.
pub struct ResilientClient {
    shared: Arc<ResilientShared>,
    reconnect_task: tokio::sync::Mutex<Option<JoinHandle<()>>>,
}

impl ResilientClient {
    /// Default capacity of the disconnect buffer.
    pub const DEFAULT_BUFFER_SIZE: usize = 1000;

    /// Wrap `transport` (normally a [`crate::stream::StreamClient`]).
    pub fn new(transport: Arc<dyn Transport>, events: EventBus) -> Self {
        Self::with_buffer_size(transport, events, Self::DEFAULT_BUFFER_SIZE)
    }

    /// Wrap with an explicit buffer capacity.
    pub fn with_buffer_size(
        transport: Arc<dyn Transport>,
        events: EventBus,
        buffer_size: usize,
    ) -> Self {
        Self {
            shared: Arc::new(ResilientShared {
                transport,
                buffer: MessageBuffer::new(buffer_size),
                backoff: std::sync::Mutex::new(ExponentialBackoff::new(
                    Duration::from_secs(5),
                    Duration::from_secs(60),
                )),
                state: std::sync::Mutex::new(ConnectionState::Disconnected),
                running: AtomicBool::new(false),
                reconnects: AtomicU64::new(0),
                config: std::sync::Mutex::new(None),
                events,
            }),
            reconnect_task: tokio::sync::Mutex::new(None),
        }
    }

    /// Current wrapper state.
    pub fn state(&self) -> ConnectionState {
        *self.shared.state.lock().unwrap()
    }

    /// Messages currently buffered for replay.
    pub fn buffered_message_count(&self) -> usize {
        self.shared.buffer.len()
    }

    /// Messages evicted from the buffer so far.
    pub fn dropped_message_count(&self) -> u64 {
        self.shared.buffer.dropped_count()
    }

    /// Successful reconnections so far.
    pub fn reconnect_count(&self) -> u64 {
        self.shared.reconnects.load(Ordering::Relaxed)
    }

    async fn ensure_reconnect_loop(&self) {
        let mut slot = self.reconnect_task.lock().await;
        let needs_spawn = slot.as_ref().map(|t| t.is_finished()).unwrap_or(true);
        if needs_spawn {
            let shared = self.shared.clone();
            *slot = Some(tokio::spawn(shared.reconnect_loop()));
        }
    }

    /// Mark the link as lost and start reconnecting. Also invoked
    /// internally when a send fails while connected.
    pub async fn notify_disconnection(&self) {
        if !self.shared.running.load(Ordering::SeqCst) {
            return;
        }
        self.shared.set_state(ConnectionState::Disconnected);
        self.ensure_reconnect_loop().await;
    }
}

#[async_trait]
impl Transport for ResilientClient {
    async fn connect(&self, config: &ConnectionConfig) -> bool {
        *self.shared.config.lock().unwrap() = Some(config.clone());
        self.shared.running.store(true, Ordering::SeqCst);
        *self.shared.backoff.lock().unwrap() =
            ExponentialBackoff::new(config.reconnect_base_delay, config.reconnect_max_delay);

        self.shared.set_state(ConnectionState::Connecting);
        if self.shared.transport.connect(config).await {
            self.shared.set_state(ConnectionState::Connected);
            self.shared.backoff.lock().unwrap().reset();
            true
        } else {
            self.shared.set_state(ConnectionState::Disconnected);
            self.ensure_reconnect_loop().await;
            false
        }
    }

    async fn disconnect(&self) {
        self.shared.running.store(false, Ordering::SeqCst);
        if let Some(task) = self.reconnect_task.lock().await.take() {
            task.abort();
        }
        self.shared.transport.disconnect().await;
        self.shared.set_state(ConnectionState::Disconnected);
    }

    fn is_connected(&self) -> bool {
        self.shared.transport.is_connected()
    }

    fn metrics(&self) -> TransportMetricsSnapshot {
        let mut snapshot = self.shared.transport.metrics();
        snapshot.reconnect_count = self.reconnect_count();
        snapshot
    }

    async fn send_heartbeat(&self, heartbeat: Heartbeat) -> bool {
        if !self.is_connected() {
            // Heartbeats represent instantaneous liveness; stale ones are
            // worthless, so they are never buffered.
            debug!("disconnected, discarding heartbeat");
            return false;
        }
        self.shared.transport.send_heartbeat(heartbeat).await
    }

    async fn send_logs(&self, logs: Vec<LogEntry>) -> bool {
        if self.is_connected() {
            if self.shared.transport.send_logs(logs.clone()).await {
                return true;
            }
            self.shared.buffer_message(BufferedPayload::LogBatch(logs));
            self.notify_disconnection().await;
            false
        } else {
            self.shared.buffer_message(BufferedPayload::LogBatch(logs));
            self.ensure_reconnect_loop().await;
            false
        }
    }

    async fn send_task_status(&self, status: TaskStatusUpdate) -> bool {
        if self.is_connected() {
            if self.shared.transport.send_task_status(status.clone()).await {
                return true;
            }
            self.shared.buffer_message(BufferedPayload::TaskStatus(status));
            self.notify_disconnection().await;
            false
        } else {
            self.shared.buffer_message(BufferedPayload::TaskStatus(status));
            self.ensure_reconnect_loop().await;
            false
        }
    }

    async fn send_task_ack(&self, task_id: &str, accepted: bool, reason: Option<&str>) -> bool {
        if !self.is_connected() {
            return false;
        }
        self.shared
            .transport
            .send_task_ack(task_id, accepted, reason)
            .await
    }

    async fn send_cancel_ack(&self, task_id: &str, ok: bool, reason: Option<&str>) -> bool {
        if !self.is_connected() {
            return false;
        }
        self.shared
            .transport
            .send_cancel_ack(task_id, ok, reason)
            .await
    }

    async fn poll_task(&self, timeout: Duration) -> Option<TaskDispatch> {
        self.shared.transport.poll_task(timeout).await
    }

    async fn poll_control(&self, timeout: Duration) -> Option<ControlMessage> {
        self.shared.transport.poll_control(timeout).await
    }

    async fn report_result(&self, result: TaskResult) -> bool {
        if self.is_connected() {
            if self.shared.transport.report_result(result.clone()).await {
                return true;
            }
            self.shared.buffer_message(BufferedPayload::TaskResult(result));
            self.notify_disconnection().await;
            false
        } else {
            self.shared.buffer_message(BufferedPayload::TaskResult(result));
            self.ensure_reconnect_loop().await;
            false
        }
    }

    async fn ack_task(&self, receipt: &str, accepted: bool) -> bool {
        if !self.is_connected() {
            return false;
        }
        self.shared.transport.ack_task(receipt, accepted).await
    }

    async fn ack_control(&self, receipt: &str) -> bool {
        if !self.is_connected() {
            return false;
        }
        self.shared.transport.ack_control(receipt).await
    }

    async fn send_control_result(
        &self,
        request_id: &str,
        reply_stream: &str,
        success: bool,
        data: Option<serde_json::Value>,
        error: &str,
    ) -> bool {
        if !self.is_connected() {
            return false;
        }
        self.shared
            .transport
            .send_control_result(request_id, reply_stream, success, data, error)
            .await
    }

    fn on_task_dispatch(&self, callback: DispatchCallback) {
        self.shared.transport.on_task_dispatch(callback);
    }

    fn on_task_cancel(&self, callback: CancelCallback) {
        self.shared.transport.on_task_cancel(callback);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use drover_core::models::LogKind;

    #[test]
    fn backoff_grows_and_caps() {
        let backoff = ExponentialBackoff::without_jitter(
            Duration::from_secs(5),
            Duration::from_secs(60),
        );
        assert_eq!(backoff.delay_for_attempt(0), Duration::from_secs(5));
        assert_eq!(backoff.delay_for_attempt(1), Duration::from_secs(10));
        assert_eq!(backoff.delay_for_attempt(2), Duration::from_secs(20));
        assert_eq!(backoff.delay_for_attempt(10), Duration::from_secs(60));
    }

    #[test]
    fn backoff_jitter_stays_within_ten_percent() {
        let mut backoff =
            ExponentialBackoff::new(Duration::from_secs(5), Duration::from_secs(60));
        for attempt in 0..4 {
            let nominal = backoff.delay_for_attempt(attempt).as_secs_f64();
            let actual = backoff.next_delay().as_secs_f64();
            assert!(actual >= nominal * 0.9 - f64::EPSILON, "{actual} vs {nominal}");
            assert!(actual <= nominal * 1.1 + f64::EPSILON, "{actual} vs {nominal}");
        }
        backoff.reset();
        assert_eq!(backoff.attempt(), 0);
    }

    #[test]
    fn message_buffer_drops_oldest_when_full() {
        let buffer = MessageBuffer::new(2);
        for i in 0..3 {
            buffer.add(BufferedMessage {
                payload: BufferedPayload::TaskStatus(TaskStatusUpdate::running(&format!("r{i}"))),
                timestamp: Utc::now(),
                retry_count: 0,
            });
        }
        assert_eq!(buffer.len(), 2);
        assert_eq!(buffer.dropped_count(), 1);

        let drained = buffer.take_all();
        let ids: Vec<String> = drained
            .iter()
            .map(|m| match &m.payload {
                BufferedPayload::TaskStatus(s) => s.execution_id.clone(),
                _ => unreachable!(),
            })
            .collect();
        assert_eq!(ids, vec!["r1", "r2"]);
        assert!(buffer.is_empty());
    }

    use crate::testutil::FakeDriver;

    fn fast_config() -> ConnectionConfig {
        // Long enough for a test to buffer sends before the first retry,
        // short enough to keep the suite fast.
        ConnectionConfig {
            node_id: "n1".to_string(),
            reconnect_base_delay: Duration::from_millis(200),
            reconnect_max_delay: Duration::from_millis(400),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn disconnected_sends_buffer_and_heartbeats_do_not() {
        let driver = Arc::new(FakeDriver::new());
        driver.script_connects(&[false]);
        let client = ResilientClient::new(driver.clone(), EventBus::new());

        assert!(!client.connect(&fast_config()).await);
        // Stop the background loop so the buffer stays observable.
        client.disconnect().await;

        assert!(!client.send_logs(vec![LogEntry::new("r1", LogKind::Stdout, "x")]).await);
        assert!(!client.send_task_status(TaskStatusUpdate::running("r1")).await);
        assert!(!client.send_heartbeat(Heartbeat::online("n1")).await);

        assert_eq!(client.buffered_message_count(), 2);
        assert!(driver.sent().is_empty());
    }

    #[tokio::test]
    async fn reconnect_replays_fifo_then_sends_immediate_heartbeat() {
        let driver = Arc::new(FakeDriver::new());
        // Initial connect fails, first retry succeeds.
        driver.script_connects(&[false, true]);
        let events = EventBus::new();
        let mut event_rx = events.subscribe();
        let client = ResilientClient::new(driver.clone(), events);

        assert!(!client.connect(&fast_config()).await);
        assert!(!client.send_logs(vec![LogEntry::new("r5", LogKind::Stdout, "a")]).await);
        assert!(!client.send_task_status(TaskStatusUpdate::running("r5")).await);

        // Wait for the reconnect loop to succeed.
        let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
        while !client.is_connected() && tokio::time::Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert!(client.is_connected());
        tokio::time::sleep(Duration::from_millis(50)).await;

        let sent = driver.sent();
        assert_eq!(sent[0], "logs:1");
        assert_eq!(sent[1], "status:r5");
        assert_eq!(sent[2], "heartbeat:n1");
        assert_eq!(client.buffered_message_count(), 0);
        assert_eq!(client.reconnect_count(), 1);

        let mut saw_attempt = false;
        let mut saw_success = false;
        while let Ok(ev) = event_rx.try_recv() {
            match ev {
                WorkerEvent::ReconnectionAttempt { .. } => saw_attempt = true,
                WorkerEvent::ReconnectionSuccess { replayed, .. } => {
                    saw_success = true;
                    assert_eq!(replayed, 2);
                }
                _ => {}
            }
        }
        assert!(saw_attempt);
        assert!(saw_success);
    }
}
