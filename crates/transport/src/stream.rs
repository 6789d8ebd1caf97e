//! Streaming driver: a long-lived bidirectional channel to the Master.
//!
//! One TCP connection carries length-delimited JSON frames. Outbound frames
//! go through an internal queue drained by a writer task (the sole producer
//! to the socket); inbound frames are dispatched by their type tag into the
//! task and control queues backing `poll_task` / `poll_control`.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::codec::{FramedRead, FramedWrite, LengthDelimitedCodec};
use tracing::{debug, info, warn};

use drover_core::models::{
    ConnectionConfig, ControlMessage, ControlType, Heartbeat, LogEntry, OsInfo, TaskDispatch,
    TaskResult, TaskStatusUpdate,
};

use crate::envelope::{
    DecodedFrame, MasterFrame, NodeFrame, decode_master_frame, encode_node_frame, log_batch_frame,
};
use crate::protocol::{
    CancelCallback, DispatchCallback, Transport, TransportMetrics, TransportMetricsSnapshot,
};

/// Largest frame either side may send.
const MAX_FRAME_BYTES: usize = 50 * 1024 * 1024;
/// How long to wait for the registration acknowledgement.
const REGISTER_TIMEOUT: Duration = Duration::from_secs(10);
/// Outbound queue depth; the writer task is the only consumer.
const OUTBOUND_QUEUE: usize = 64;
/// Inbound dispatch/control queue depth.
const INBOUND_QUEUE: usize = 256;

fn codec() -> LengthDelimitedCodec {
    LengthDelimitedCodec::builder()
        .max_frame_length(MAX_FRAME_BYTES)
        .new_codec()
}

struct Conn {
    outbound: mpsc::Sender<NodeFrame>,
    writer: JoinHandle<()>,
    reader: JoinHandle<()>,
}

struct StreamInner {
    connected: AtomicBool,
    metrics: TransportMetrics,
    task_tx: mpsc::Sender<TaskDispatch>,
    control_tx: mpsc::Sender<ControlMessage>,
    on_dispatch: std::sync::Mutex<Option<DispatchCallback>>,
    on_cancel: std::sync::Mutex<Option<CancelCallback>>,
}

impl StreamInner {
    fn dispatch_task(&self, task: TaskDispatch) {
        if let Some(cb) = self.on_dispatch.lock().unwrap().clone() {
            cb(task.clone());
        }
        if self.task_tx.try_send(task).is_err() {
            warn!("stream inbound task queue full, dropping dispatch");
        }
    }

    fn dispatch_control(&self, control: ControlMessage) {
        if matches!(control.control_type, ControlType::Cancel | ControlType::Kill) {
            if let Some(cb) = self.on_cancel.lock().unwrap().clone() {
                cb(control.clone());
            }
        }
        if self.control_tx.try_send(control).is_err() {
            warn!("stream inbound control queue full, dropping message");
        }
    }

    fn handle_frame(&self, frame: MasterFrame, outbound: &mpsc::Sender<NodeFrame>) {
        match frame {
            MasterFrame::TaskDispatch { task } => self.dispatch_task(task),
            MasterFrame::TaskCancel {
                task_id,
                run_id,
                reason,
            } => self.dispatch_control(ControlMessage {
                control_type: ControlType::Cancel,
                run_id,
                task_id: Some(task_id),
                reason,
                payload: None,
                receipt: None,
            }),
            MasterFrame::ConfigUpdate { payload } => self.dispatch_control(ControlMessage {
                control_type: ControlType::ConfigUpdate,
                run_id: None,
                task_id: None,
                reason: None,
                payload: Some(payload),
                receipt: None,
            }),
            MasterFrame::Control { control } => self.dispatch_control(control),
            MasterFrame::Ping => {
                let _ = outbound.try_send(NodeFrame::Pong);
            }
            MasterFrame::RegisterAck { .. } => {
                debug!("ignoring register_ack outside the handshake");
            }
        }
    }
}

/// The preferred driver: one bidirectional stream to the Master.
pub struct StreamClient {
    inner: Arc<StreamInner>,
    conn: tokio::sync::Mutex<Option<Conn>>,
    task_rx: tokio::sync::Mutex<mpsc::Receiver<TaskDispatch>>,
    control_rx: tokio::sync::Mutex<mpsc::Receiver<ControlMessage>>,
}

impl StreamClient {
    /// A disconnected client; call [`Transport::connect`] to go live.
    pub fn new() -> Self {
        let (task_tx, task_rx) = mpsc::channel(INBOUND_QUEUE);
        let (control_tx, control_rx) = mpsc::channel(INBOUND_QUEUE);
        Self {
            inner: Arc::new(StreamInner {
                connected: AtomicBool::new(false),
                metrics: TransportMetrics::new(),
                task_tx,
                control_tx,
                on_dispatch: std::sync::Mutex::new(None),
                on_cancel: std::sync::Mutex::new(None),
            }),
            conn: tokio::sync::Mutex::new(None),
            task_rx: tokio::sync::Mutex::new(task_rx),
            control_rx: tokio::sync::Mutex::new(control_rx),
        }
    }

    fn stream_target(config: &ConnectionConfig) -> Option<String> {
        let url = reqwest::Url::parse(&config.master_url).ok()?;
        let host = url.host_str()?;
        Some(format!("{host}:{}", config.stream_port))
    }

    async fn enqueue(&self, frame: NodeFrame) -> bool {
        if !self.inner.connected.load(Ordering::SeqCst) {
            return false;
        }
        let conn = self.conn.lock().await;
        let Some(conn) = conn.as_ref() else {
            return false;
        };
        match conn.outbound.try_send(frame) {
            Ok(()) => true,
            Err(err) => {
                self.inner
                    .metrics
                    .record_error("outbound queue rejected frame", Some("resource_exhausted"));
                debug!("stream enqueue failed: {err}");
                false
            }
        }
    }

    async fn teardown(&self) {
        let mut conn = self.conn.lock().await;
        if let Some(conn) = conn.take() {
            conn.writer.abort();
            conn.reader.abort();
        }
        self.inner.connected.store(false, Ordering::SeqCst);
    }
}

impl Default for StreamClient {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Transport for StreamClient {
    async fn connect(&self, config: &ConnectionConfig) -> bool {
        self.teardown().await;

        let Some(target) = Self::stream_target(config) else {
            self.inner
                .metrics
                .record_error("invalid master url", Some("invalid_argument"));
            return false;
        };

        info!(target = %target, "connecting stream driver");
        let socket = match TcpStream::connect(&target).await {
            Ok(s) => s,
            Err(err) => {
                self.inner
                    .metrics
                    .record_error(&format!("connect {target}: {err}"), Some("unavailable"));
                return false;
            }
        };
        let _ = socket.set_nodelay(true);

        let (read_half, write_half) = socket.into_split();
        let mut framed_write: FramedWrite<OwnedWriteHalf, LengthDelimitedCodec> =
            FramedWrite::new(write_half, codec());
        let mut framed_read: FramedRead<OwnedReadHalf, LengthDelimitedCodec> =
            FramedRead::new(read_half, codec());

        // Register before anything else flows.
        let register = NodeFrame::Register {
            node_id: config.node_id.clone(),
            api_key: config.api_key.clone(),
            machine_code: config.machine_code.clone(),
            os_info: OsInfo::current(),
        };
        let register_started = Instant::now();
        let bytes = encode_node_frame(&register);
        if let Err(err) = framed_write.send(bytes.into()).await {
            self.inner
                .metrics
                .record_error(&format!("register send: {err}"), Some("unavailable"));
            return false;
        }

        let ack = tokio::time::timeout(REGISTER_TIMEOUT, framed_read.next()).await;
        match ack {
            Ok(Some(Ok(frame))) => match decode_master_frame(&frame) {
                Ok(DecodedFrame::Frame(MasterFrame::RegisterAck { ok: true, .. })) => {
                    self.inner
                        .metrics
                        .record_latency(register_started.elapsed().as_secs_f64() * 1000.0);
                }
                Ok(DecodedFrame::Frame(MasterFrame::RegisterAck { reason, .. })) => {
                    self.inner.metrics.record_error(
                        &format!("registration rejected: {}", reason.unwrap_or_default()),
                        Some("permission_denied"),
                    );
                    return false;
                }
                _ => {
                    self.inner
                        .metrics
                        .record_error("unexpected frame during handshake", Some("internal"));
                    return false;
                }
            },
            _ => {
                self.inner
                    .metrics
                    .record_error("no register_ack from master", Some("deadline_exceeded"));
                return false;
            }
        }

        let (outbound_tx, mut outbound_rx) = mpsc::channel::<NodeFrame>(OUTBOUND_QUEUE);

        let writer_inner = self.inner.clone();
        let writer = tokio::spawn(async move {
            while let Some(frame) = outbound_rx.recv().await {
                let bytes = encode_node_frame(&frame);
                let len = bytes.len();
                if let Err(err) = framed_write.send(bytes.into()).await {
                    writer_inner
                        .metrics
                        .record_error(&format!("stream write: {err}"), Some("unavailable"));
                    writer_inner.connected.store(false, Ordering::SeqCst);
                    break;
                }
                writer_inner.metrics.record_sent(len);
            }
        });

        let reader_inner = self.inner.clone();
        let reader_outbound = outbound_tx.clone();
        let reader = tokio::spawn(async move {
            while let Some(next) = framed_read.next().await {
                let bytes = match next {
                    Ok(b) => b,
                    Err(err) => {
                        reader_inner
                            .metrics
                            .record_error(&format!("stream read: {err}"), Some("unavailable"));
                        break;
                    }
                };
                reader_inner.metrics.record_received(bytes.len());
                match decode_master_frame(&bytes) {
                    Ok(DecodedFrame::Frame(frame)) => {
                        reader_inner.handle_frame(frame, &reader_outbound)
                    }
                    Ok(DecodedFrame::Unknown(kind)) => {
                        warn!(kind = %kind, "dropping unknown frame type");
                        reader_inner
                            .metrics
                            .record_error(&format!("unknown frame type {kind}"), Some("unimplemented"));
                    }
                    Err(err) => {
                        warn!("dropping undecodable frame: {err}");
                        reader_inner
                            .metrics
                            .record_error(&format!("bad frame: {err}"), Some("invalid_argument"));
                    }
                }
            }
            reader_inner.connected.store(false, Ordering::SeqCst);
        });

        *self.conn.lock().await = Some(Conn {
            outbound: outbound_tx,
            writer,
            reader,
        });
        self.inner.connected.store(true, Ordering::SeqCst);
        self.inner.metrics.record_connection();
        info!("stream driver connected");
        true
    }

    async fn disconnect(&self) {
        self.teardown().await;
        info!("stream driver disconnected");
    }

    fn is_connected(&self) -> bool {
        self.inner.connected.load(Ordering::SeqCst)
    }

    fn metrics(&self) -> TransportMetricsSnapshot {
        self.inner.metrics.snapshot()
    }

    async fn send_heartbeat(&self, heartbeat: Heartbeat) -> bool {
        self.enqueue(NodeFrame::Heartbeat { heartbeat }).await
    }

    async fn send_logs(&self, logs: Vec<LogEntry>) -> bool {
        if logs.is_empty() {
            return true;
        }
        self.enqueue(log_batch_frame(logs)).await
    }

    async fn send_task_status(&self, status: TaskStatusUpdate) -> bool {
        self.enqueue(NodeFrame::TaskStatus { status }).await
    }

    async fn send_task_ack(&self, task_id: &str, accepted: bool, reason: Option<&str>) -> bool {
        self.enqueue(NodeFrame::TaskAck {
            task_id: task_id.to_string(),
            accepted,
            reason: reason.map(str::to_string),
        })
        .await
    }

    async fn send_cancel_ack(&self, task_id: &str, ok: bool, reason: Option<&str>) -> bool {
        self.enqueue(NodeFrame::CancelAck {
            task_id: task_id.to_string(),
            ok,
            reason: reason.map(str::to_string),
        })
        .await
    }

    async fn poll_task(&self, timeout: Duration) -> Option<TaskDispatch> {
        let mut rx = self.task_rx.lock().await;
        tokio::time::timeout(timeout, rx.recv()).await.ok().flatten()
    }

    async fn poll_control(&self, timeout: Duration) -> Option<ControlMessage> {
        let mut rx = self.control_rx.lock().await;
        tokio::time::timeout(timeout, rx.recv()).await.ok().flatten()
    }

    async fn report_result(&self, result: TaskResult) -> bool {
        self.enqueue(NodeFrame::TaskResult { result }).await
    }

    async fn ack_task(&self, receipt: &str, accepted: bool) -> bool {
        self.enqueue(NodeFrame::ReceiptAck {
            receipt: receipt.to_string(),
            accepted,
        })
        .await
    }

    async fn ack_control(&self, receipt: &str) -> bool {
        self.enqueue(NodeFrame::ControlAck {
            receipt: receipt.to_string(),
        })
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
        self.enqueue(NodeFrame::ControlResult {
            request_id: request_id.to_string(),
            reply_stream: reply_stream.to_string(),
            success,
            data,
            error: error.to_string(),
        })
        .await
    }

    fn on_task_dispatch(&self, callback: DispatchCallback) {
        *self.inner.on_dispatch.lock().unwrap() = Some(callback);
    }

    fn on_task_cancel(&self, callback: CancelCallback) {
        *self.inner.on_cancel.lock().unwrap() = Some(callback);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use drover_core::models::LogKind;
    use tokio::net::TcpListener;

    /// Minimal in-process Master: accepts one connection, acks registration,
    /// then records inbound frames and can push frames to the node.
    struct StubMaster {
        addr: std::net::SocketAddr,
        accepted: tokio::sync::oneshot::Receiver<StubPeer>,
    }

    struct StubPeer {
        write: FramedWrite<OwnedWriteHalf, LengthDelimitedCodec>,
        read: FramedRead<OwnedReadHalf, LengthDelimitedCodec>,
    }

    impl StubPeer {
        async fn push(&mut self, frame: &MasterFrame) {
            let bytes = serde_json::to_vec(frame).unwrap();
            self.write.send(bytes.into()).await.unwrap();
        }

        async fn next_node_frame(&mut self) -> NodeFrame {
            let bytes = self.read.next().await.unwrap().unwrap();
            serde_json::from_slice(&bytes).unwrap()
        }
    }

    async fn start_stub() -> StubMaster {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (tx, rx) = tokio::sync::oneshot::channel();

        tokio::spawn(async move {
            let (socket, _) = listener.accept().await.unwrap();
            let (read_half, write_half) = socket.into_split();
            let mut read = FramedRead::new(read_half, codec());
            let mut write = FramedWrite::new(write_half, codec());

            // Expect the register frame first.
            let bytes = read.next().await.unwrap().unwrap();
            let frame: NodeFrame = serde_json::from_slice(&bytes).unwrap();
            assert!(matches!(frame, NodeFrame::Register { .. }));

            let ack = serde_json::to_vec(&MasterFrame::RegisterAck {
                ok: true,
                heartbeat_interval: Some(30),
                reason: None,
            })
            .unwrap();
            write.send(ack.into()).await.unwrap();

            let _ = tx.send(StubPeer { write, read });
        });

        StubMaster { addr, accepted: rx }
    }

    fn config_for(addr: std::net::SocketAddr) -> ConnectionConfig {
        ConnectionConfig {
            master_url: format!("http://{}:{}", addr.ip(), addr.port()),
            node_id: "node-1".to_string(),
            api_key: "key".to_string(),
            machine_code: "mc-1".to_string(),
            stream_port: addr.port(),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn connect_registers_and_sends_frames() {
        let stub = start_stub().await;
        let client = StreamClient::new();
        assert!(client.connect(&config_for(stub.addr)).await);
        assert!(client.is_connected());

        let mut peer = stub.accepted.await.unwrap();

        assert!(
            client
                .send_logs(vec![LogEntry::new("r1", LogKind::Stdout, "hello")])
                .await
        );
        let frame = peer.next_node_frame().await;
        assert!(matches!(frame, NodeFrame::LogBatch { .. }));

        assert!(client.send_task_ack("t1", true, None).await);
        let frame = peer.next_node_frame().await;
        assert!(matches!(frame, NodeFrame::TaskAck { accepted: true, .. }));

        client.disconnect().await;
        assert!(!client.is_connected());
    }

    #[tokio::test]
    async fn inbound_dispatch_reaches_poll_task() {
        let stub = start_stub().await;
        let client = StreamClient::new();
        assert!(client.connect(&config_for(stub.addr)).await);

        let mut peer = stub.accepted.await.unwrap();
        peer.push(&MasterFrame::TaskDispatch {
            task: TaskDispatch {
                task_id: "t9".to_string(),
                ..Default::default()
            },
        })
        .await;

        let task = client.poll_task(Duration::from_secs(2)).await.unwrap();
        assert_eq!(task.task_id, "t9");

        // Cancel frames surface on the control channel.
        peer.push(&MasterFrame::TaskCancel {
            task_id: "t9".to_string(),
            run_id: Some("r9".to_string()),
            reason: Some("user".to_string()),
        })
        .await;
        let control = client.poll_control(Duration::from_secs(2)).await.unwrap();
        assert_eq!(control.control_type, ControlType::Cancel);
        assert_eq!(control.run_id.as_deref(), Some("r9"));
    }

    #[tokio::test]
    async fn unknown_frames_are_dropped_without_killing_the_stream() {
        let stub = start_stub().await;
        let client = StreamClient::new();
        assert!(client.connect(&config_for(stub.addr)).await);

        let mut peer = stub.accepted.await.unwrap();
        let junk = serde_json::to_vec(&serde_json::json!({"type": "future_thing"})).unwrap();
        peer.write.send(junk.into()).await.unwrap();
        peer.push(&MasterFrame::TaskDispatch {
            task: TaskDispatch {
                task_id: "after-junk".to_string(),
                ..Default::default()
            },
        })
        .await;

        let task = client.poll_task(Duration::from_secs(2)).await.unwrap();
        assert_eq!(task.task_id, "after-junk");
        assert!(client.metrics().error_count >= 1);
    }

    #[tokio::test]
    async fn connect_fails_fast_when_no_peer_listens() {
        let client = StreamClient::new();
        let config = ConnectionConfig {
            master_url: "http://127.0.0.1:1".to_string(),
            stream_port: 1,
            ..Default::default()
        };
        assert!(!client.connect(&config).await);
        assert!(!client.is_connected());
    }

    #[tokio::test]
    async fn poll_task_times_out_when_idle() {
        let client = StreamClient::new();
        let started = Instant::now();
        assert!(client.poll_task(Duration::from_millis(50)).await.is_none());
        assert!(started.elapsed() >= Duration::from_millis(50));
    }
}
