//! Bounded priority queue of pending runs.
//!
//! Ordering is `(priority ASC, enqueue_time ASC)` with an insertion
//! sequence as the final tiebreaker, so FIFO holds within a priority class.
//! Dequeue blocks on a notifier; enqueue rejects duplicates and overflow.

use std::collections::{BinaryHeap, HashSet};
use std::path::PathBuf;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering as AtomicOrdering};
use std::time::Duration;

use chrono::Utc;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::sync::Notify;
use tracing::{error, info, warn};

/// One queued run.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct QueuedItem<T> {
    /// Run identity; unique within the queue.
    pub run_id: String,
    /// Priority 0..=4, 0 highest.
    pub priority: u8,
    /// Acceptance time, unix milliseconds.
    pub enqueue_time: i64,
    /// Insertion sequence; preserves FIFO among equal timestamps.
    #[serde(default)]
    pub seq: u64,
    /// Project the run belongs to.
    #[serde(default)]
    pub project_id: String,
    /// Wire project type.
    #[serde(default)]
    pub project_type: String,
    /// Opaque payload the owner stored.
    pub data: T,
}

impl<T> QueuedItem<T> {
    fn key(&self) -> (u8, i64, u64) {
        (self.priority, self.enqueue_time, self.seq)
    }
}

struct HeapEntry<T>(QueuedItem<T>);

impl<T> PartialEq for HeapEntry<T> {
    fn eq(&self, other: &Self) -> bool {
        self.0.key() == other.0.key()
    }
}
impl<T> Eq for HeapEntry<T> {}
impl<T> PartialOrd for HeapEntry<T> {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}
impl<T> Ord for HeapEntry<T> {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        // Reversed: BinaryHeap pops the smallest key first.
        other.0.key().cmp(&self.0.key())
    }
}

/// Aggregate queue counters.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct SchedulerStats {
    /// Successful enqueues.
    pub enqueue_count: u64,
    /// Successful dequeues.
    pub dequeue_count: u64,
    /// Enqueues rejected because the queue was full.
    pub dropped_count: u64,
    /// Sum of queue-wait time across dequeues, milliseconds.
    pub total_wait_time_ms: f64,
}

impl SchedulerStats {
    /// Mean queue-wait per dequeued item.
    pub fn avg_wait_time_ms(&self) -> f64 {
        if self.dequeue_count == 0 {
            0.0
        } else {
            self.total_wait_time_ms / self.dequeue_count as f64
        }
    }
}

struct Inner<T> {
    heap: BinaryHeap<HeapEntry<T>>,
    ids: HashSet<String>,
    max_queue_size: usize,
    stats: SchedulerStats,
    seq: u64,
}

#[derive(Serialize, Deserialize)]
struct PersistedQueue<T> {
    version: u32,
    saved_at: String,
    tasks: Vec<QueuedItem<T>>,
    stats: SchedulerStats,
}

/// Priority-aware bounded scheduler.
pub struct Scheduler<T> {
    inner: Mutex<Inner<T>>,
    not_empty: Notify,
    running: AtomicBool,
    persist_path: Option<PathBuf>,
}

impl<T> Scheduler<T> {
    /// Scheduler with no persistence.
    pub fn new(max_queue_size: usize) -> Self {
        Self::with_persistence(max_queue_size, None)
    }

    /// Scheduler that saves its queue to `persist_path` on stop and reloads
    /// it on start.
    pub fn with_persistence(max_queue_size: usize, persist_path: Option<PathBuf>) -> Self {
        Self {
            inner: Mutex::new(Inner {
                heap: BinaryHeap::new(),
                ids: HashSet::new(),
                max_queue_size,
                stats: SchedulerStats::default(),
                seq: 0,
            }),
            not_empty: Notify::new(),
            running: AtomicBool::new(false),
            persist_path,
        }
    }

    /// Queued item count.
    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().heap.len()
    }

    /// Whether nothing is queued.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether the queue is at capacity.
    pub fn is_full(&self) -> bool {
        let inner = self.inner.lock().unwrap();
        inner.heap.len() >= inner.max_queue_size
    }

    /// Whether `run_id` is queued.
    pub fn contains(&self, run_id: &str) -> bool {
        self.inner.lock().unwrap().ids.contains(run_id)
    }

    /// Counter snapshot.
    pub fn stats(&self) -> SchedulerStats {
        self.inner.lock().unwrap().stats.clone()
    }

    /// Capacity snapshot.
    pub fn max_queue_size(&self) -> usize {
        self.inner.lock().unwrap().max_queue_size
    }

    /// Resize the queue bound (used by dynamic concurrency updates).
    pub fn update_max_size(&self, new_max: usize) {
        self.inner.lock().unwrap().max_queue_size = new_max;
    }

    /// Add a run. Fails when `run_id` is already queued or the queue is
    /// full; overflow increments `dropped_count`.
    pub fn enqueue(
        &self,
        run_id: &str,
        project_id: &str,
        project_type: &str,
        priority: u8,
        data: T,
    ) -> bool {
        {
            let mut inner = self.inner.lock().unwrap();
            if inner.ids.contains(run_id) {
                return false;
            }
            if inner.heap.len() >= inner.max_queue_size {
                inner.stats.dropped_count += 1;
                return false;
            }
            let seq = inner.seq;
            inner.seq += 1;
            inner.heap.push(HeapEntry(QueuedItem {
                run_id: run_id.to_string(),
                priority,
                enqueue_time: Utc::now().timestamp_millis(),
                seq,
                project_id: project_id.to_string(),
                project_type: project_type.to_string(),
                data,
            }));
            inner.ids.insert(run_id.to_string());
            inner.stats.enqueue_count += 1;
        }
        self.not_empty.notify_one();
        true
    }

    /// Pop the front item, waiting up to `timeout` for one to arrive.
    pub async fn dequeue(&self, timeout: Duration) -> Option<QueuedItem<T>> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let notified = self.not_empty.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut inner = self.inner.lock().unwrap();
                if let Some(HeapEntry(item)) = inner.heap.pop() {
                    inner.ids.remove(&item.run_id);
                    inner.stats.dequeue_count += 1;
                    let waited = (Utc::now().timestamp_millis() - item.enqueue_time).max(0);
                    inner.stats.total_wait_time_ms += waited as f64;
                    return Some(item);
                }
                if !self.running.load(AtomicOrdering::SeqCst) {
                    return None;
                }
            }

            let now = tokio::time::Instant::now();
            if now >= deadline {
                return None;
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                // One more pass in case an enqueue raced the deadline.
                let mut inner = self.inner.lock().unwrap();
                if let Some(HeapEntry(item)) = inner.heap.pop() {
                    inner.ids.remove(&item.run_id);
                    inner.stats.dequeue_count += 1;
                    let waited = (Utc::now().timestamp_millis() - item.enqueue_time).max(0);
                    inner.stats.total_wait_time_ms += waited as f64;
                    return Some(item);
                }
                return None;
            }
        }
    }

    /// Remove a queued run; used by the cancel path.
    pub fn cancel(&self, run_id: &str) -> bool {
        let mut inner = self.inner.lock().unwrap();
        if !inner.ids.remove(run_id) {
            return false;
        }
        let entries = std::mem::take(&mut inner.heap).into_vec();
        inner.heap = entries
            .into_iter()
            .filter(|HeapEntry(item)| item.run_id != run_id)
            .collect();
        true
    }

    /// Move a queued run to `new_priority`, keeping its original enqueue
    /// time so FIFO holds within the new class. Returns the item's new
    /// 0-based position, or `None` when it is not queued.
    pub fn update_priority(&self, run_id: &str, new_priority: u8) -> Option<usize> {
        let mut inner = self.inner.lock().unwrap();
        if !inner.ids.contains(run_id) {
            return None;
        }
        let mut entries = std::mem::take(&mut inner.heap).into_vec();
        let mut target_key = None;
        for HeapEntry(item) in entries.iter_mut() {
            if item.run_id == run_id {
                item.priority = new_priority;
                target_key = Some(item.key());
            }
        }
        let position = target_key.map(|key| {
            entries
                .iter()
                .filter(|HeapEntry(item)| item.key() < key)
                .count()
        });
        inner.heap = entries.into_iter().collect();
        position
    }

    /// Mark the scheduler as accepting dequeues.
    fn mark_running(&self) {
        self.running.store(true, AtomicOrdering::SeqCst);
    }

    /// Stop dequeues; blocked callers return once their timeout lapses.
    fn mark_stopped(&self) {
        self.running.store(false, AtomicOrdering::SeqCst);
        self.not_empty.notify_waiters();
    }
}

impl<T: Clone + Serialize + DeserializeOwned + Send> Scheduler<T> {
    /// Start the scheduler, restoring a persisted queue when configured.
    pub async fn start(&self) {
        self.mark_running();
        if self.persist_path.is_some() {
            let restored = self.restore().await;
            if restored > 0 {
                info!(restored, "scheduler queue restored");
            }
        }
    }

    /// Stop the scheduler, persisting the queue when configured.
    pub async fn stop(&self) {
        self.mark_stopped();
        if self.persist_path.is_some() {
            if let Err(err) = self.persist().await {
                error!("scheduler persist failed: {err:#}");
            }
        }
    }

    /// Write the queue and counters to the persistence file. Items are
    /// saved in dequeue order.
    pub async fn persist(&self) -> anyhow::Result<()> {
        let Some(path) = self.persist_path.clone() else {
            return Ok(());
        };

        let document = {
            let inner = self.inner.lock().unwrap();
            let mut tasks: Vec<QueuedItem<T>> =
                inner.heap.iter().map(|HeapEntry(item)| item.clone()).collect();
            tasks.sort_by_key(|item| item.key());
            PersistedQueue {
                version: 1,
                saved_at: Utc::now().to_rfc3339(),
                tasks,
                stats: inner.stats.clone(),
            }
        };

        let json = serde_json::to_string_pretty(&document)?;
        tokio::task::spawn_blocking(move || -> anyhow::Result<()> {
            if let Some(dir) = path.parent() {
                std::fs::create_dir_all(dir)?;
            }
            let tmp = path.with_extension("json.tmp");
            std::fs::write(&tmp, json)?;
            std::fs::rename(tmp, path)?;
            Ok(())
        })
        .await
        .map_err(|err| anyhow::anyhow!("persist task join: {err}"))??;
        Ok(())
    }

    /// Load a persisted queue, skipping run ids already present. Returns
    /// the number of restored items.
    pub async fn restore(&self) -> usize {
        let Some(path) = self.persist_path.clone() else {
            return 0;
        };
        if !path.exists() {
            return 0;
        }

        let raw = match tokio::task::spawn_blocking(move || std::fs::read_to_string(path)).await {
            Ok(Ok(raw)) => raw,
            Ok(Err(err)) => {
                warn!("scheduler restore read failed: {err}");
                return 0;
            }
            Err(err) => {
                warn!("scheduler restore join failed: {err}");
                return 0;
            }
        };
        let document: PersistedQueue<T> = match serde_json::from_str(&raw) {
            Ok(doc) => doc,
            Err(err) => {
                warn!("scheduler restore parse failed: {err}");
                return 0;
            }
        };

        let mut restored = 0;
        {
            let mut inner = self.inner.lock().unwrap();
            for mut item in document.tasks {
                if inner.ids.contains(&item.run_id) {
                    continue;
                }
                // Items arrive in dequeue order; fresh sequence numbers
                // keep that order among equal timestamps.
                item.seq = inner.seq;
                inner.seq += 1;
                inner.ids.insert(item.run_id.clone());
                inner.heap.push(HeapEntry(item));
                restored += 1;
            }
            inner.stats = document.stats;
        }
        for _ in 0..restored {
            self.not_empty.notify_one();
        }
        restored
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scheduler(capacity: usize) -> Scheduler<String> {
        let scheduler = Scheduler::new(capacity);
        scheduler.mark_running();
        scheduler
    }

    #[tokio::test]
    async fn dequeue_order_is_priority_then_fifo() {
        let queue = scheduler(10);
        assert!(queue.enqueue("a", "p", "code", 2, "a".into()));
        assert!(queue.enqueue("b", "p", "code", 0, "b".into()));
        assert!(queue.enqueue("c", "p", "code", 2, "c".into()));
        assert!(queue.enqueue("d", "p", "spider", 1, "d".into()));

        let mut order = Vec::new();
        while let Some(item) = queue.dequeue(Duration::from_millis(10)).await {
            order.push(item.run_id);
        }
        assert_eq!(order, vec!["b", "d", "a", "c"]);
    }

    #[tokio::test]
    async fn duplicate_and_overflow_enqueues_fail() {
        let queue = scheduler(2);
        assert!(queue.enqueue("a", "p", "code", 2, "a".into()));
        assert!(!queue.enqueue("a", "p", "code", 2, "again".into()));
        assert!(queue.enqueue("b", "p", "code", 2, "b".into()));
        assert!(!queue.enqueue("c", "p", "code", 2, "c".into()));

        let stats = queue.stats();
        assert_eq!(stats.enqueue_count, 2);
        assert_eq!(stats.dropped_count, 1);
        assert!(queue.is_full());
    }

    #[tokio::test]
    async fn dequeue_blocks_until_enqueue() {
        let queue = std::sync::Arc::new(scheduler(4));
        let waiter = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.dequeue(Duration::from_secs(5)).await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(queue.enqueue("late", "p", "code", 2, "x".into()));

        let item = waiter.await.unwrap().unwrap();
        assert_eq!(item.run_id, "late");
    }

    #[tokio::test]
    async fn dequeue_times_out_on_empty_queue() {
        let queue = scheduler(4);
        let started = std::time::Instant::now();
        assert!(queue.dequeue(Duration::from_millis(50)).await.is_none());
        assert!(started.elapsed() >= Duration::from_millis(50));
    }

    #[tokio::test]
    async fn cancel_removes_only_the_target() {
        let queue = scheduler(10);
        queue.enqueue("a", "p", "code", 2, "a".to_string());
        queue.enqueue("b", "p", "code", 2, "b".to_string());

        assert!(queue.cancel("a"));
        assert!(!queue.cancel("a"));
        assert!(!queue.contains("a"));
        assert!(queue.contains("b"));
        assert_eq!(queue.len(), 1);
    }

    #[tokio::test]
    async fn update_priority_keeps_fifo_within_new_class() {
        let queue = scheduler(10);
        queue.enqueue("first", "p", "code", 2, "1".to_string());
        tokio::time::sleep(Duration::from_millis(5)).await;
        queue.enqueue("second", "p", "code", 2, "2".to_string());
        tokio::time::sleep(Duration::from_millis(5)).await;
        queue.enqueue("third", "p", "code", 3, "3".to_string());

        // Demote "first" into class 3: its enqueue time is older than
        // "third"'s, so it must come out before it.
        assert_eq!(queue.update_priority("first", 3), Some(1));
        assert_eq!(queue.update_priority("missing", 1), None);

        let mut order = Vec::new();
        while let Some(item) = queue.dequeue(Duration::from_millis(10)).await {
            order.push(item.run_id);
        }
        assert_eq!(order, vec!["second", "first", "third"]);
    }

    #[tokio::test]
    async fn persist_restore_round_trips_dequeue_order() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state").join("queue.json");

        let queue: Scheduler<String> =
            Scheduler::with_persistence(10, Some(path.clone()));
        queue.start().await;
        queue.enqueue("a", "p1", "code", 2, "a".to_string());
        queue.enqueue("b", "p1", "spider", 1, "b".to_string());
        queue.enqueue("c", "p2", "code", 2, "c".to_string());
        let stats_before = queue.stats();
        queue.stop().await;
        assert!(path.exists());

        let restored: Scheduler<String> =
            Scheduler::with_persistence(10, Some(path.clone()));
        restored.start().await;
        assert_eq!(restored.len(), 3);
        assert_eq!(restored.stats(), stats_before);

        let mut order = Vec::new();
        while let Some(item) = restored.dequeue(Duration::from_millis(10)).await {
            order.push(item.run_id);
        }
        assert_eq!(order, vec!["b", "a", "c"]);
    }

    #[tokio::test]
    async fn restore_skips_duplicate_run_ids() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("queue.json");

        let queue: Scheduler<String> =
            Scheduler::with_persistence(10, Some(path.clone()));
        queue.start().await;
        queue.enqueue("a", "p", "code", 2, "old".to_string());
        queue.persist().await.unwrap();

        let other: Scheduler<String> =
            Scheduler::with_persistence(10, Some(path.clone()));
        other.mark_running();
        other.enqueue("a", "p", "code", 2, "new".to_string());
        assert_eq!(other.restore().await, 0);
        assert_eq!(other.len(), 1);

        let item = other.dequeue(Duration::from_millis(10)).await.unwrap();
        assert_eq!(item.data, "new");
    }

    #[tokio::test]
    async fn resize_affects_capacity() {
        let queue = scheduler(1);
        assert!(queue.enqueue("a", "p", "code", 2, "a".to_string()));
        assert!(!queue.enqueue("b", "p", "code", 2, "b".to_string()));
        queue.update_max_size(2);
        assert!(queue.enqueue("b", "p", "code", 2, "b".to_string()));
        assert_eq!(queue.max_queue_size(), 2);
    }
}
