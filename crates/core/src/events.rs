use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::models::{ConnectionState, Protocol};

/// Domain event stream payload.
///
/// Replaces the dynamic signal registry of older workers with a typed bus:
/// subscribers receive every variant and match on what they care about.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type")]
pub enum WorkerEvent {
    /// A transport changed connection state.
    ConnectionStateChanged {
        /// Previous state.
        old_state: ConnectionState,
        /// New state.
        new_state: ConnectionState,
    },
    /// A reconnect attempt is about to run after a backoff delay.
    ReconnectionAttempt {
        /// 1-based attempt number.
        attempt: u64,
        /// Delay that preceded the attempt, in seconds.
        delay_secs: f64,
    },
    /// A reconnect attempt succeeded.
    ReconnectionSuccess {
        /// 1-based attempt number.
        attempt: u64,
        /// Buffered messages replayed after reconnecting.
        replayed: u64,
    },
    /// A reconnect attempt failed.
    ReconnectionFailed {
        /// 1-based attempt number.
        attempt: u64,
        /// Failure description.
        error: String,
    },
    /// The manager fell back from the preferred protocol.
    ProtocolFallback {
        /// Protocol that failed.
        from: Protocol,
        /// Protocol now in use.
        to: Protocol,
        /// Why the fallback happened.
        reason: String,
    },
    /// The manager upgraded back to the preferred protocol.
    ProtocolUpgrade {
        /// Protocol that was in use.
        from: Protocol,
        /// Protocol now in use.
        to: Protocol,
    },
    /// A run moved to a new lifecycle state.
    TaskStatusChanged {
        /// Run that changed.
        run_id: String,
        /// New state name.
        state: String,
    },
    /// A message was dropped under backpressure.
    MessageDropped {
        /// What kind of message (`log`, `log_batch`, `task_status`).
        message_type: String,
        /// Why it was dropped.
        reason: String,
        /// How many were dropped.
        dropped_count: u64,
    },
    /// A log batch was delivered to the Master.
    LogBatchSent {
        /// Run the batch belonged to.
        execution_id: String,
        /// Lines in the batch.
        log_count: u64,
        /// Whether the batch was gzip-packed.
        compressed: bool,
    },
}

/// Broadcast-backed event bus.
///
/// Cloning is cheap; every clone publishes into the same stream. Events are
/// fire-and-forget: publishing with no live subscriber is not an error.
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<WorkerEvent>,
}

impl EventBus {
    /// Bus with the default channel capacity.
    pub fn new() -> Self {
        Self::with_capacity(1024)
    }

    /// Bus with an explicit channel capacity.
    pub fn with_capacity(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    /// Publish an event to all current subscribers.
    pub fn publish(&self, event: WorkerEvent) {
        let _ = self.tx.send(event);
    }

    /// Subscribe to the event stream.
    pub fn subscribe(&self) -> broadcast::Receiver<WorkerEvent> {
        self.tx.subscribe()
    }

    /// Number of live subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn publish_reaches_all_subscribers() {
        let bus = EventBus::new();
        let mut a = bus.subscribe();
        let mut b = bus.subscribe();

        bus.publish(WorkerEvent::TaskStatusChanged {
            run_id: "r1".to_string(),
            state: "running".to_string(),
        });

        let ev = a.recv().await.unwrap();
        assert_eq!(ev, b.recv().await.unwrap());
        assert!(matches!(ev, WorkerEvent::TaskStatusChanged { .. }));
    }

    #[test]
    fn publish_without_subscribers_is_a_noop() {
        let bus = EventBus::new();
        bus.publish(WorkerEvent::ProtocolUpgrade {
            from: Protocol::Http,
            to: Protocol::Stream,
        });
        assert_eq!(bus.subscriber_count(), 0);
    }

    #[test]
    fn events_serialize_with_type_tag() {
        let ev = WorkerEvent::MessageDropped {
            message_type: "log".to_string(),
            reason: "buffer_full".to_string(),
            dropped_count: 1,
        };
        let json = serde_json::to_value(&ev).unwrap();
        assert_eq!(json["type"], "MessageDropped");
    }
}
