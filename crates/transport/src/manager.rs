//! Protocol selection and failover: prefer the streaming driver, fall back
//! to request/response, and periodically try to upgrade back.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use drover_core::events::{EventBus, WorkerEvent};
use drover_core::models::{
    ConnectionConfig, ConnectionState, ControlMessage, Heartbeat, LogEntry, Protocol,
    TaskDispatch, TaskResult, TaskStatusUpdate,
};

use crate::protocol::{
    CancelCallback, DispatchCallback, Transport, TransportMetricsSnapshot,
};
use crate::resilient::ResilientClient;
use crate::stream::StreamClient;

/// How often a degraded manager retries the preferred protocol.
pub const DEFAULT_UPGRADE_CHECK_INTERVAL: Duration = Duration::from_secs(60);

struct ManagerShared {
    stream: Arc<dyn Transport>,
    http: Arc<dyn Transport>,
    active: std::sync::Mutex<Protocol>,
    preferred: std::sync::Mutex<Protocol>,
    state: std::sync::Mutex<ConnectionState>,
    config: std::sync::Mutex<Option<ConnectionConfig>>,
    running: AtomicBool,
    upgrade_task: tokio::sync::Mutex<Option<JoinHandle<()>>>,
    upgrade_interval: Duration,
    fallback_count: AtomicU64,
    upgrade_count: AtomicU64,
    events: EventBus,
}

impl ManagerShared {
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

    fn active_protocol(&self) -> Protocol {
        *self.active.lock().unwrap()
    }

    fn active_driver(&self) -> Option<(Arc<dyn Transport>, Protocol)> {
        match self.active_protocol() {
            Protocol::Stream => Some((self.stream.clone(), Protocol::Stream)),
            Protocol::Http => Some((self.http.clone(), Protocol::Http)),
            Protocol::None => None,
        }
    }

    async fn try_connect_stream(&self) -> bool {
        let config = self.config.lock().unwrap().clone();
        let Some(config) = config else { return false };

        info!("trying streaming connection");
        if self.stream.connect(&config).await {
            *self.active.lock().unwrap() = Protocol::Stream;
            self.set_state(ConnectionState::Connected);
            info!("streaming connection established");
            true
        } else {
            false
        }
    }

    async fn try_connect_http(&self) -> bool {
        let config = self.config.lock().unwrap().clone();
        let Some(config) = config else { return false };

        info!("trying request/response connection");
        if self.http.connect(&config).await {
            *self.active.lock().unwrap() = Protocol::Http;
            info!("request/response connection established");
            true
        } else {
            false
        }
    }

    /// Switch to the request/response driver after a streaming failure.
    async fn fallback_to_http(&self, reason: &str) -> bool {
        if self.stream.is_connected() {
            self.stream.disconnect().await;
        }

        if !self.try_connect_http().await {
            return false;
        }

        self.fallback_count.fetch_add(1, Ordering::Relaxed);
        let degraded = *self.preferred.lock().unwrap() == Protocol::Stream;
        self.set_state(if degraded {
            ConnectionState::Degraded
        } else {
            ConnectionState::Connected
        });
        self.events.publish(WorkerEvent::ProtocolFallback {
            from: Protocol::Stream,
            to: Protocol::Http,
            reason: reason.to_string(),
        });
        warn!(reason, "fell back to request/response transport");
        true
    }

    /// While degraded, try switching back to the streaming driver.
    async fn try_upgrade_to_stream(&self) -> bool {
        if self.active_protocol() != Protocol::Http {
            return false;
        }
        debug!("attempting protocol upgrade");
        if !self.try_connect_stream().await {
            return false;
        }

        self.http.disconnect().await;
        self.upgrade_count.fetch_add(1, Ordering::Relaxed);
        self.events.publish(WorkerEvent::ProtocolUpgrade {
            from: Protocol::Http,
            to: Protocol::Stream,
        });
        info!("upgraded to streaming transport");
        true
    }

    async fn upgrade_loop(self: Arc<Self>) {
        while self.running.load(Ordering::SeqCst) && self.active_protocol() == Protocol::Http {
            tokio::time::sleep(self.upgrade_interval).await;
            if !self.running.load(Ordering::SeqCst) {
                break;
            }
            if self.active_protocol() != Protocol::Http {
                break;
            }
            if self.try_upgrade_to_stream().await {
                break;
            }
        }
    }

    async fn start_upgrade_loop(self: &Arc<Self>) {
        let mut slot = self.upgrade_task.lock().await;
        let needs_spawn = slot.as_ref().map(|t| t.is_finished()).unwrap_or(true);
        if needs_spawn {
            let shared = self.clone();
            *slot = Some(tokio::spawn(shared.upgrade_loop()));
        }
    }

    /// A send came back `false`; if the streaming driver is down, degrade.
    async fn handle_send_failure(self: &Arc<Self>) {
        if self.active_protocol() != Protocol::Stream || self.stream.is_connected() {
            return;
        }
        warn!("streaming link lost, attempting fallback");
        if self.fallback_to_http("stream send failed while disconnected").await {
            self.start_upgrade_loop().await;
        } else {
            warn!("fallback connect failed, transport unavailable");
            self.set_state(ConnectionState::Disconnected);
        }
    }
}

/// The outward-facing transport seen by the engine.
pub struct CommunicationManager {
    shared: Arc<ManagerShared>,
}

impl CommunicationManager {
    /// Manager over the default drivers: a resilient streaming client and a
    /// request/response client.
    pub fn new(events: EventBus) -> Self {
        let stream: Arc<dyn Transport> = Arc::new(ResilientClient::new(
            Arc::new(StreamClient::new()),
            events.clone(),
        ));
        let http: Arc<dyn Transport> = Arc::new(crate::http::HttpClient::new());
        Self::with_drivers(stream, http, events, DEFAULT_UPGRADE_CHECK_INTERVAL)
    }

    /// Manager over explicit drivers; used by tests and custom wiring.
    pub fn with_drivers(
        stream: Arc<dyn Transport>,
        http: Arc<dyn Transport>,
        events: EventBus,
        upgrade_interval: Duration,
    ) -> Self {
        Self {
            shared: Arc::new(ManagerShared {
                stream,
                http,
                active: std::sync::Mutex::new(Protocol::None),
                preferred: std::sync::Mutex::new(Protocol::Stream),
                state: std::sync::Mutex::new(ConnectionState::Disconnected),
                config: std::sync::Mutex::new(None),
                running: AtomicBool::new(false),
                upgrade_task: tokio::sync::Mutex::new(None),
                upgrade_interval,
                fallback_count: AtomicU64::new(0),
                upgrade_count: AtomicU64::new(0),
                events,
            }),
        }
    }

    /// Protocol currently carrying traffic.
    pub fn current_protocol(&self) -> Protocol {
        self.shared.active_protocol()
    }

    /// Protocol the configuration prefers.
    pub fn preferred_protocol(&self) -> Protocol {
        *self.shared.preferred.lock().unwrap()
    }

    /// Connection state of the manager.
    pub fn state(&self) -> ConnectionState {
        *self.shared.state.lock().unwrap()
    }

    /// Whether traffic runs over the fallback while streaming is preferred.
    pub fn is_degraded(&self) -> bool {
        self.preferred_protocol() == Protocol::Stream
            && self.current_protocol() == Protocol::Http
    }

    /// Fallbacks taken since start.
    pub fn fallback_count(&self) -> u64 {
        self.shared.fallback_count.load(Ordering::Relaxed)
    }

    /// Upgrades taken since start.
    pub fn upgrade_count(&self) -> u64 {
        self.shared.upgrade_count.load(Ordering::Relaxed)
    }

    /// Operator override: force traffic onto `protocol`.
    pub async fn force_protocol(&self, protocol: Protocol) -> bool {
        if protocol == self.current_protocol() {
            return true;
        }
        match protocol {
            Protocol::Stream => self.shared.try_upgrade_to_stream().await,
            Protocol::Http => self.shared.fallback_to_http("operator override").await,
            Protocol::None => false,
        }
    }
}

macro_rules! delegate_send {
    ($self:ident, $driver:ident, $call:expr) => {{
        let Some(($driver, protocol)) = $self.shared.active_driver() else {
            return false;
        };
        let ok = $call;
        if !ok && protocol == Protocol::Stream {
            $self.shared.handle_send_failure().await;
        }
        ok
    }};
}

#[async_trait]
impl Transport for CommunicationManager {
    async fn connect(&self, config: &ConnectionConfig) -> bool {
        *self.shared.config.lock().unwrap() = Some(config.clone());
        self.shared.running.store(true, Ordering::SeqCst);
        let preferred = if config.prefer_stream {
            Protocol::Stream
        } else {
            Protocol::Http
        };
        *self.shared.preferred.lock().unwrap() = preferred;
        self.shared.set_state(ConnectionState::Connecting);

        if preferred == Protocol::Stream {
            if self.shared.try_connect_stream().await {
                return true;
            }
            warn!("streaming connect failed, degrading to request/response");
            if self.shared.fallback_to_http("stream connect failed").await {
                self.shared.start_upgrade_loop().await;
                return true;
            }
            self.shared.set_state(ConnectionState::Disconnected);
            false
        } else {
            if self.shared.try_connect_http().await {
                self.shared.set_state(ConnectionState::Connected);
                return true;
            }
            self.shared.set_state(ConnectionState::Disconnected);
            false
        }
    }

    async fn disconnect(&self) {
        self.shared.running.store(false, Ordering::SeqCst);
        if let Some(task) = self.shared.upgrade_task.lock().await.take() {
            task.abort();
        }
        self.shared.stream.disconnect().await;
        self.shared.http.disconnect().await;
        *self.shared.active.lock().unwrap() = Protocol::None;
        self.shared.set_state(ConnectionState::Disconnected);
        info!("communication manager disconnected");
    }

    fn is_connected(&self) -> bool {
        self.shared
            .active_driver()
            .map(|(driver, _)| driver.is_connected())
            .unwrap_or(false)
    }

    fn metrics(&self) -> TransportMetricsSnapshot {
        self.shared
            .active_driver()
            .map(|(driver, _)| driver.metrics())
            .unwrap_or_default()
    }

    async fn send_heartbeat(&self, heartbeat: Heartbeat) -> bool {
        delegate_send!(self, driver, driver.send_heartbeat(heartbeat).await)
    }

    async fn send_logs(&self, logs: Vec<LogEntry>) -> bool {
        delegate_send!(self, driver, driver.send_logs(logs).await)
    }

    async fn send_task_status(&self, status: TaskStatusUpdate) -> bool {
        delegate_send!(self, driver, driver.send_task_status(status).await)
    }

    async fn send_task_ack(&self, task_id: &str, accepted: bool, reason: Option<&str>) -> bool {
        let Some((driver, _)) = self.shared.active_driver() else {
            return false;
        };
        driver.send_task_ack(task_id, accepted, reason).await
    }

    async fn send_cancel_ack(&self, task_id: &str, ok: bool, reason: Option<&str>) -> bool {
        let Some((driver, _)) = self.shared.active_driver() else {
            return false;
        };
        driver.send_cancel_ack(task_id, ok, reason).await
    }

    async fn poll_task(&self, timeout: Duration) -> Option<TaskDispatch> {
        let (driver, _) = self.shared.active_driver()?;
        driver.poll_task(timeout).await
    }

    async fn poll_control(&self, timeout: Duration) -> Option<ControlMessage> {
        let (driver, _) = self.shared.active_driver()?;
        driver.poll_control(timeout).await
    }

    async fn report_result(&self, result: TaskResult) -> bool {
        delegate_send!(self, driver, driver.report_result(result).await)
    }

    async fn ack_task(&self, receipt: &str, accepted: bool) -> bool {
        let Some((driver, _)) = self.shared.active_driver() else {
            return false;
        };
        driver.ack_task(receipt, accepted).await
    }

    async fn ack_control(&self, receipt: &str) -> bool {
        let Some((driver, _)) = self.shared.active_driver() else {
            return false;
        };
        driver.ack_control(receipt).await
    }

    async fn send_control_result(
        &self,
        request_id: &str,
        reply_stream: &str,
        success: bool,
        data: Option<serde_json::Value>,
        error: &str,
    ) -> bool {
        let Some((driver, _)) = self.shared.active_driver() else {
            return false;
        };
        driver
            .send_control_result(request_id, reply_stream, success, data, error)
            .await
    }

    fn on_task_dispatch(&self, callback: DispatchCallback) {
        self.shared.stream.on_task_dispatch(callback.clone());
        self.shared.http.on_task_dispatch(callback);
    }

    fn on_task_cancel(&self, callback: CancelCallback) {
        self.shared.stream.on_task_cancel(callback.clone());
        self.shared.http.on_task_cancel(callback);
    }
}
