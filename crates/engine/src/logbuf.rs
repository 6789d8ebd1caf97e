//! Per-execution log buffering with batched, optionally compressed
//! delivery.
//!
//! Lines coalesce per run and flush on a size threshold, a timer, or an
//! explicit flush. Overflow drops the globally oldest line; delivery
//! failures restore the batch to the front of its queues so ordering holds
//! across retries.

use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::io::Write as _;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use flate2::Compression;
use flate2::write::GzEncoder;
use serde::Serialize;
use tracing::{debug, warn};

use drover_core::events::{EventBus, WorkerEvent};
use drover_core::models::{LogEntry, LogKind};
use drover_transport::Transport;

use crate::interfaces::LogSink;

/// Future returned by a delivery closure.
pub type SendFuture = Pin<Box<dyn Future<Output = bool> + Send>>;
/// Delivery closure: `(batch, compressed) -> delivered`.
pub type LogSendFn = Arc<dyn Fn(Vec<LogEntry>, bool) -> SendFuture + Send + Sync>;

/// Buffer tuning knobs.
#[derive(Debug, Clone)]
pub struct LogBufferConfig {
    /// Global line cap across all executions.
    pub max_buffer_lines: usize,
    /// Per-execution line count that triggers an async flush.
    pub batch_size: usize,
    /// Cadence of the background flush loop.
    pub flush_interval: Duration,
    /// Serialized-batch size above which delivery is marked compressed.
    pub compress_threshold: usize,
}

impl Default for LogBufferConfig {
    fn default() -> Self {
        Self {
            max_buffer_lines: 2000,
            batch_size: 50,
            flush_interval: Duration::from_secs(1),
            compress_threshold: 1024,
        }
    }
}

/// Counters exposed by the buffer.
#[derive(Debug, Clone, Default, Serialize, PartialEq)]
pub struct LogBufferStats {
    /// Lines accepted.
    pub total_added: u64,
    /// Lines delivered.
    pub total_flushed: u64,
    /// Lines dropped under backpressure.
    pub total_dropped: u64,
    /// Successful flushes.
    pub flush_count: u64,
    /// Failed flushes.
    pub failed_flush_count: u64,
    /// gzip size over plain size of the last compressed batch.
    pub compression_ratio: f64,
}

struct BufState {
    buffers: HashMap<String, VecDeque<LogEntry>>,
    total_lines: usize,
    max_capacity: usize,
    stats: LogBufferStats,
}

impl BufState {
    /// Drop the globally oldest buffered line. Status integrity trumps log
    /// completeness, so producers are never blocked.
    fn drop_oldest(&mut self, events: &Option<EventBus>) -> bool {
        let oldest_id = self
            .buffers
            .iter()
            .filter_map(|(id, buffer)| buffer.front().map(|entry| (id, entry.timestamp)))
            .min_by_key(|(_, timestamp)| *timestamp)
            .map(|(id, _)| id.clone());

        let Some(id) = oldest_id else {
            return false;
        };
        let Some(buffer) = self.buffers.get_mut(&id) else {
            return false;
        };
        buffer.pop_front();
        if buffer.is_empty() {
            self.buffers.remove(&id);
        }
        self.total_lines -= 1;
        self.stats.total_dropped += 1;
        if let Some(events) = events {
            events.publish(WorkerEvent::MessageDropped {
                message_type: "log".to_string(),
                reason: "buffer_full".to_string(),
                dropped_count: 1,
            });
        }
        true
    }

    /// Put an undelivered batch back at the front of its queues, keeping
    /// order within each execution.
    fn restore(&mut self, batch: Vec<LogEntry>, events: &Option<EventBus>) {
        for entry in batch.into_iter().rev() {
            self.buffers
                .entry(entry.execution_id.clone())
                .or_default()
                .push_front(entry);
            self.total_lines += 1;
        }
        while self.total_lines > self.max_capacity {
            if !self.drop_oldest(events) {
                break;
            }
        }
    }

    fn drain_execution(&mut self, execution_id: &str) -> Vec<LogEntry> {
        let Some(buffer) = self.buffers.remove(execution_id) else {
            return Vec::new();
        };
        self.total_lines -= buffer.len();
        buffer.into()
    }

    fn drain_all(&mut self) -> Vec<LogEntry> {
        let mut all = Vec::with_capacity(self.total_lines);
        let mut ids: Vec<String> = self.buffers.keys().cloned().collect();
        ids.sort();
        for id in ids {
            if let Some(buffer) = self.buffers.remove(&id) {
                all.extend(buffer);
            }
        }
        self.total_lines = 0;
        all
    }
}

/// The buffer. Owners hold it in an `Arc` so threshold flushes can run as
/// background tasks.
pub struct LogBuffer {
    config: LogBufferConfig,
    state: Mutex<BufState>,
    send_fn: Mutex<Option<LogSendFn>>,
    events: Option<EventBus>,
    running: AtomicBool,
    flush_task: tokio::sync::Mutex<Option<tokio::task::JoinHandle<()>>>,
    last_flush: Mutex<Instant>,
}

impl LogBuffer {
    /// Buffer with no event bus attached.
    pub fn new(config: LogBufferConfig) -> Self {
        Self::with_events(config, None)
    }

    /// Buffer publishing drop/delivery events to `events`.
    pub fn with_events(config: LogBufferConfig, events: Option<EventBus>) -> Self {
        Self {
            state: Mutex::new(BufState {
                buffers: HashMap::new(),
                total_lines: 0,
                max_capacity: config.max_buffer_lines,
                stats: LogBufferStats::default(),
            }),
            config,
            send_fn: Mutex::new(None),
            events,
            running: AtomicBool::new(false),
            flush_task: tokio::sync::Mutex::new(None),
            last_flush: Mutex::new(Instant::now()),
        }
    }

    /// Install the delivery closure. Must be set before any flush.
    pub fn set_send_fn(&self, send_fn: LogSendFn) {
        *self.send_fn.lock().unwrap() = Some(send_fn);
    }

    /// Lines currently buffered across all executions.
    pub fn total_lines(&self) -> usize {
        self.state.lock().unwrap().total_lines
    }

    /// Counter snapshot.
    pub fn stats(&self) -> LogBufferStats {
        self.state.lock().unwrap().stats.clone()
    }

    /// Append one line; may schedule an async flush of its execution.
    pub async fn add(self: &Arc<Self>, execution_id: &str, log_type: LogKind, content: &str) {
        let entry = LogEntry::new(execution_id, log_type, content);

        let should_flush = {
            let mut state = self.state.lock().unwrap();
            if self.config.max_buffer_lines == 0 {
                // Degenerate configuration: every line drops on arrival.
                state.stats.total_dropped += 1;
                if let Some(events) = &self.events {
                    events.publish(WorkerEvent::MessageDropped {
                        message_type: "log".to_string(),
                        reason: "buffer_full".to_string(),
                        dropped_count: 1,
                    });
                }
                return;
            }

            while state.total_lines >= self.config.max_buffer_lines {
                if !state.drop_oldest(&self.events) {
                    break;
                }
            }

            let buffer = state.buffers.entry(execution_id.to_string()).or_default();
            buffer.push_back(entry);
            let buffered = buffer.len();
            state.total_lines += 1;
            state.stats.total_added += 1;
            buffered >= self.config.batch_size
        };

        if should_flush {
            let this = self.clone();
            let id = execution_id.to_string();
            tokio::spawn(async move {
                this.flush_execution(&id).await;
            });
        }
    }

    /// Flush one execution, or everything when `execution_id` is `None`.
    pub async fn flush(self: &Arc<Self>, execution_id: Option<&str>) {
        match execution_id {
            Some(id) => self.flush_execution(id).await,
            None => self.flush_all().await,
        }
    }

    /// Drain and deliver one execution's lines.
    pub async fn flush_execution(self: &Arc<Self>, execution_id: &str) {
        let batch = self.state.lock().unwrap().drain_execution(execution_id);
        self.deliver(batch).await;
    }

    /// Drain and deliver everything.
    pub async fn flush_all(self: &Arc<Self>) {
        let batch = self.state.lock().unwrap().drain_all();
        self.deliver(batch).await;
    }

    async fn deliver(self: &Arc<Self>, batch: Vec<LogEntry>) -> bool {
        if batch.is_empty() {
            return true;
        }

        let send_fn = self.send_fn.lock().unwrap().clone();
        let Some(send_fn) = send_fn else {
            warn!("log buffer has no delivery function; restoring batch");
            let mut state = self.state.lock().unwrap();
            state.restore(batch, &self.events);
            state.stats.failed_flush_count += 1;
            return false;
        };

        let serialized_len = serde_json::to_vec(&batch).map(|v| v.len()).unwrap_or(0);
        let compressed = serialized_len > self.config.compress_threshold;
        if compressed {
            if let Some(ratio) = compression_ratio(&batch, serialized_len) {
                self.state.lock().unwrap().stats.compression_ratio = ratio;
            }
        }

        let count = batch.len() as u64;
        let execution_id = batch
            .first()
            .map(|e| e.execution_id.clone())
            .unwrap_or_default();
        let ok = send_fn(batch.clone(), compressed).await;

        let mut state = self.state.lock().unwrap();
        if ok {
            state.stats.total_flushed += count;
            state.stats.flush_count += 1;
            *self.last_flush.lock().unwrap() = Instant::now();
            if let Some(events) = &self.events {
                events.publish(WorkerEvent::LogBatchSent {
                    execution_id,
                    log_count: count,
                    compressed,
                });
            }
            true
        } else {
            debug!(count, "log batch delivery failed, restoring");
            state.restore(batch, &self.events);
            state.stats.failed_flush_count += 1;
            false
        }
    }

    /// Start the timed flush loop.
    pub async fn start(self: &Arc<Self>) {
        if self.running.swap(true, Ordering::SeqCst) {
            return;
        }
        let this = self.clone();
        let interval = self.config.flush_interval;
        let task = tokio::spawn(async move {
            loop {
                tokio::time::sleep(interval).await;
                if !this.running.load(Ordering::SeqCst) {
                    break;
                }
                let due = this.last_flush.lock().unwrap().elapsed() >= interval;
                if due {
                    this.flush_all().await;
                }
            }
        });
        *self.flush_task.lock().await = Some(task);
    }

    /// Stop the flush loop and deliver everything still buffered.
    pub async fn stop(self: &Arc<Self>) {
        self.running.store(false, Ordering::SeqCst);
        if let Some(task) = self.flush_task.lock().await.take() {
            task.abort();
        }
        self.flush_all().await;
    }
}

fn compression_ratio(batch: &[LogEntry], plain_len: usize) -> Option<f64> {
    if plain_len == 0 {
        return None;
    }
    let json = serde_json::to_vec(batch).ok()?;
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(&json).ok()?;
    let packed = encoder.finish().ok()?;
    Some(packed.len() as f64 / plain_len as f64)
}

/// Buffer wired to a transport: the engine-facing log service.
pub struct LogService {
    buffer: Arc<LogBuffer>,
}

impl LogService {
    /// Service delivering through `transport.send_logs`.
    pub fn new(
        transport: Arc<dyn Transport>,
        config: LogBufferConfig,
        events: Option<EventBus>,
    ) -> Self {
        let buffer = Arc::new(LogBuffer::with_events(config, events));
        let send_transport = transport.clone();
        buffer.set_send_fn(Arc::new(move |batch, _compressed| {
            let transport = send_transport.clone();
            Box::pin(async move { transport.send_logs(batch).await })
        }));
        Self { buffer }
    }

    /// The underlying buffer.
    pub fn buffer(&self) -> &Arc<LogBuffer> {
        &self.buffer
    }

    /// Start the background flush loop.
    pub async fn start(&self) {
        self.buffer.start().await;
    }

    /// Stop and flush what remains.
    pub async fn stop(&self) {
        self.buffer.stop().await;
    }

    /// Deliver a run's buffered lines before its terminal status goes out.
    pub async fn flush_execution(&self, run_id: &str) {
        self.buffer.flush_execution(run_id).await;
    }

    /// Counter snapshot.
    pub fn stats(&self) -> LogBufferStats {
        self.buffer.stats()
    }
}

#[async_trait]
impl LogSink for LogService {
    async fn add(&self, run_id: &str, kind: LogKind, content: &str) {
        self.buffer.add(run_id, kind, content).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    type Recorded = Arc<Mutex<Vec<(Vec<LogEntry>, bool)>>>;

    fn recording_send(outcomes: Vec<bool>) -> (LogSendFn, Recorded) {
        let recorded: Recorded = Arc::new(Mutex::new(Vec::new()));
        let outcomes = Arc::new(Mutex::new(VecDeque::from(outcomes)));
        let recorded_clone = recorded.clone();
        let send: LogSendFn = Arc::new(move |batch, compressed| {
            let recorded = recorded_clone.clone();
            let outcomes = outcomes.clone();
            Box::pin(async move {
                let ok = outcomes.lock().unwrap().pop_front().unwrap_or(true);
                if ok {
                    recorded.lock().unwrap().push((batch, compressed));
                }
                ok
            })
        });
        (send, recorded)
    }

    fn buffer_with(config: LogBufferConfig, outcomes: Vec<bool>) -> (Arc<LogBuffer>, Recorded) {
        let buffer = Arc::new(LogBuffer::new(config));
        let (send, recorded) = recording_send(outcomes);
        buffer.set_send_fn(send);
        (buffer, recorded)
    }

    #[tokio::test]
    async fn batch_threshold_triggers_flush() {
        let (buffer, recorded) = buffer_with(
            LogBufferConfig {
                batch_size: 3,
                ..Default::default()
            },
            vec![],
        );

        for i in 0..3 {
            buffer.add("r1", LogKind::Stdout, &format!("line-{i}")).await;
        }
        // The threshold flush runs as a spawned task.
        tokio::time::sleep(Duration::from_millis(50)).await;

        let batches = recorded.lock().unwrap().clone();
        assert_eq!(batches.len(), 1);
        let contents: Vec<&str> = batches[0].0.iter().map(|e| e.content.as_str()).collect();
        assert_eq!(contents, vec!["line-0", "line-1", "line-2"]);
        assert_eq!(buffer.total_lines(), 0);
    }

    #[tokio::test]
    async fn overflow_drops_globally_oldest_line() {
        let (buffer, recorded) = buffer_with(
            LogBufferConfig {
                max_buffer_lines: 3,
                batch_size: 100,
                ..Default::default()
            },
            vec![],
        );

        buffer.add("a", LogKind::Stdout, "a-0").await;
        buffer.add("b", LogKind::Stdout, "b-0").await;
        buffer.add("a", LogKind::Stdout, "a-1").await;
        // Cap reached: the oldest line overall (a-0) is evicted.
        buffer.add("b", LogKind::Stdout, "b-1").await;

        assert_eq!(buffer.total_lines(), 3);
        assert_eq!(buffer.stats().total_dropped, 1);

        buffer.flush_all().await;
        let batches = recorded.lock().unwrap().clone();
        let contents: Vec<&str> = batches[0].0.iter().map(|e| e.content.as_str()).collect();
        // Order within each execution is intact and a-0 is gone.
        assert_eq!(contents, vec!["a-1", "b-0", "b-1"]);
    }

    #[tokio::test]
    async fn failed_delivery_restores_in_order_and_retries_once() {
        let (buffer, recorded) = buffer_with(
            LogBufferConfig {
                batch_size: 100,
                ..Default::default()
            },
            vec![false, true],
        );

        for i in 0..4 {
            buffer.add("r1", LogKind::Stdout, &format!("line-{i}")).await;
        }

        buffer.flush_execution("r1").await;
        assert_eq!(buffer.total_lines(), 4);
        assert_eq!(buffer.stats().failed_flush_count, 1);
        assert!(recorded.lock().unwrap().is_empty());

        buffer.flush_execution("r1").await;
        assert_eq!(buffer.total_lines(), 0);
        let batches = recorded.lock().unwrap().clone();
        assert_eq!(batches.len(), 1);
        let contents: Vec<&str> = batches[0].0.iter().map(|e| e.content.as_str()).collect();
        assert_eq!(contents, vec!["line-0", "line-1", "line-2", "line-3"]);
        assert_eq!(buffer.stats().total_flushed, 4);
    }

    #[tokio::test]
    async fn flush_execution_leaves_other_runs_buffered() {
        let (buffer, recorded) = buffer_with(
            LogBufferConfig {
                batch_size: 100,
                ..Default::default()
            },
            vec![],
        );

        buffer.add("r1", LogKind::Stdout, "one").await;
        buffer.add("r2", LogKind::Stderr, "two").await;

        buffer.flush_execution("r1").await;
        assert_eq!(buffer.total_lines(), 1);

        let batches = recorded.lock().unwrap().clone();
        assert_eq!(batches.len(), 1);
        assert_eq!(batches[0].0[0].execution_id, "r1");
    }

    #[tokio::test]
    async fn zero_capacity_drops_every_line() {
        let (buffer, recorded) = buffer_with(
            LogBufferConfig {
                max_buffer_lines: 0,
                batch_size: 1,
                ..Default::default()
            },
            vec![],
        );

        buffer.add("r1", LogKind::Stdout, "gone").await;
        buffer.add("r1", LogKind::Stdout, "also gone").await;
        tokio::time::sleep(Duration::from_millis(20)).await;

        assert_eq!(buffer.total_lines(), 0);
        assert_eq!(buffer.stats().total_dropped, 2);
        buffer.flush_all().await;
        assert!(recorded.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn large_batches_are_flagged_compressed() {
        let (buffer, recorded) = buffer_with(
            LogBufferConfig {
                batch_size: 1000,
                compress_threshold: 256,
                ..Default::default()
            },
            vec![],
        );

        for _ in 0..10 {
            buffer.add("r1", LogKind::Stdout, &"x".repeat(100)).await;
        }
        buffer.flush_all().await;

        let batches = recorded.lock().unwrap().clone();
        assert_eq!(batches.len(), 1);
        assert!(batches[0].1, "batch above threshold must be marked compressed");
        let ratio = buffer.stats().compression_ratio;
        assert!(ratio > 0.0 && ratio < 1.0, "ratio was {ratio}");
    }

    #[tokio::test]
    async fn background_loop_flushes_idle_lines() {
        let (buffer, recorded) = buffer_with(
            LogBufferConfig {
                batch_size: 100,
                flush_interval: Duration::from_millis(50),
                ..Default::default()
            },
            vec![],
        );

        buffer.start().await;
        buffer.add("r1", LogKind::Stdout, "idle line").await;

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(buffer.total_lines(), 0);
        assert_eq!(recorded.lock().unwrap().len(), 1);

        buffer.stop().await;
    }

    #[tokio::test]
    async fn missing_send_fn_keeps_the_batch() {
        let buffer = Arc::new(LogBuffer::new(LogBufferConfig::default()));
        buffer.add("r1", LogKind::Stdout, "x").await;
        buffer.flush_all().await;
        assert_eq!(buffer.total_lines(), 1);
        assert_eq!(buffer.stats().failed_flush_count, 1);
    }
}
