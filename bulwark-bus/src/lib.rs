//! Event-driven communication backbone.
//!
//! Two delivery disciplines coexist on one bus. Critical topics are
//! written to the write-ahead log (flushed and fsync'd) before `publish`
//! returns and ride an unbounded priority lane; they are never dropped.
//! Everything else shares a bounded lane that sheds its oldest entry under
//! backpressure. A single dispatcher task fans events out to subscriber
//! channels in sequence order, isolating subscribers that have gone away.

use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bulwark_core::Event;
use bulwark_journal::{JournalError, WalWriter};
use chrono::Utc;
use serde_json::Value;
use thiserror::Error;
use tokio::sync::{mpsc, Mutex as AsyncMutex, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

/// Result alias for bus operations.
pub type BusResult<T> = Result<T, BusError>;

/// Errors surfaced when publishing.
#[derive(Debug, Error)]
pub enum BusError {
    /// The WAL refused the critical event; it was not published.
    #[error("write-ahead log failure: {0}")]
    Wal(#[from] JournalError),
    /// The bus is shutting down and no longer accepts events.
    #[error("event bus is closed")]
    Closed,
}

/// Topics that are durable before acknowledgement and never dropped.
pub const DEFAULT_CRITICAL_TOPICS: [&str; 5] = [
    "risk:circuit_breaker",
    "risk:position_mismatch",
    "risk:alert",
    "system:critical",
    "system:error",
];

/// Tuning knobs for the bus.
#[derive(Clone, Debug)]
pub struct EventBusConfig {
    /// Capacity of the non-critical lane before the oldest entry is shed.
    pub max_queue_size: usize,
    pub critical_topics: HashSet<String>,
}

impl Default for EventBusConfig {
    fn default() -> Self {
        Self {
            max_queue_size: 10_000,
            critical_topics: DEFAULT_CRITICAL_TOPICS
                .iter()
                .map(|topic| topic.to_string())
                .collect(),
        }
    }
}

struct Subscriber {
    topic: String,
    sender: mpsc::UnboundedSender<Event>,
}

struct Lanes {
    critical: VecDeque<Event>,
    normal: VecDeque<Event>,
    subscribers: Vec<Subscriber>,
    accepting: bool,
}

/// The bus itself. Constructed once and shared by reference.
pub struct EventBus {
    config: EventBusConfig,
    lanes: AsyncMutex<Lanes>,
    wal: Option<AsyncMutex<WalWriter>>,
    sequence: AtomicU64,
    dropped: AtomicU64,
    notify: Notify,
}

impl EventBus {
    /// Build a bus. Passing a WAL writer enables the durability guarantee
    /// for critical topics; omitting it is only appropriate in tests.
    #[must_use]
    pub fn new(config: EventBusConfig, wal: Option<WalWriter>) -> Arc<Self> {
        Arc::new(Self {
            config,
            lanes: AsyncMutex::new(Lanes {
                critical: VecDeque::new(),
                normal: VecDeque::new(),
                subscribers: Vec::new(),
                accepting: true,
            }),
            wal: wal.map(AsyncMutex::new),
            sequence: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
            notify: Notify::new(),
        })
    }

    #[must_use]
    pub fn is_critical(&self, topic: &str) -> bool {
        self.config.critical_topics.contains(topic)
    }

    /// Publish an event. For critical topics the WAL append happens before
    /// this returns; a WAL failure means the event was not published.
    pub async fn publish(&self, topic: &str, payload: Value, source: &str) -> BusResult<Event> {
        let critical = self.is_critical(topic);
        let event = Event {
            sequence: self.sequence.fetch_add(1, Ordering::SeqCst),
            topic: topic.to_string(),
            payload,
            source: source.to_string(),
            timestamp: Utc::now(),
            critical,
        };

        if critical {
            if let Some(wal) = &self.wal {
                let bytes = serde_json::to_vec(&event).map_err(JournalError::from)?;
                let mut writer = wal.lock().await;
                writer.append(&event.topic, &bytes)?;
            }
        }

        let mut lanes = self.lanes.lock().await;
        if !lanes.accepting {
            return Err(BusError::Closed);
        }
        if critical {
            lanes.critical.push_back(event.clone());
        } else {
            if lanes.normal.len() >= self.config.max_queue_size {
                lanes.normal.pop_front();
                let dropped = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                if dropped % 100 == 0 {
                    warn!(dropped, topic, "event queue full, shedding oldest events");
                }
            }
            lanes.normal.push_back(event.clone());
        }
        drop(lanes);
        self.notify.notify_one();
        Ok(event)
    }

    /// Subscribe to a topic. `"*"` receives everything.
    pub async fn subscribe(&self, topic: &str) -> EventStream {
        let (sender, receiver) = mpsc::unbounded_channel();
        let mut lanes = self.lanes.lock().await;
        lanes.subscribers.push(Subscriber {
            topic: topic.to_string(),
            sender,
        });
        debug!(topic, "subscriber attached");
        EventStream { receiver }
    }

    /// Total number of non-critical events shed under backpressure.
    #[must_use]
    pub fn dropped_count(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Events currently waiting for dispatch.
    pub async fn queue_depth(&self) -> usize {
        let lanes = self.lanes.lock().await;
        lanes.critical.len() + lanes.normal.len()
    }

    /// Launch the dispatcher task that drains the lanes into subscriber
    /// channels. The critical lane always drains first.
    pub fn start(self: &Arc<Self>) -> JoinHandle<()> {
        let bus = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                let event = {
                    let mut lanes = bus.lanes.lock().await;
                    let next = match lanes.critical.pop_front() {
                        Some(event) => Some(event),
                        None => lanes.normal.pop_front(),
                    };
                    match next {
                        Some(event) => Some(event),
                        None if !lanes.accepting => break,
                        None => None,
                    }
                };
                match event {
                    Some(event) => bus.deliver(event).await,
                    None => bus.notify.notified().await,
                }
            }
            debug!("event bus dispatcher stopped");
        })
    }

    async fn deliver(&self, event: Event) {
        let mut lanes = self.lanes.lock().await;
        let mut stale = Vec::new();
        for (idx, subscriber) in lanes.subscribers.iter().enumerate() {
            if subscriber.topic != "*" && subscriber.topic != event.topic {
                continue;
            }
            if subscriber.sender.send(event.clone()).is_err() {
                stale.push(idx);
            }
        }
        // Misbehaving (gone) subscribers are detached; delivery continues
        // for everyone else.
        for idx in stale.into_iter().rev() {
            let subscriber = lanes.subscribers.remove(idx);
            error!(
                topic = %subscriber.topic,
                event_topic = %event.topic,
                "subscriber dropped its channel, detaching"
            );
        }
    }

    /// Two-phase drain: stop accepting, flush what is queued until the
    /// deadline, then stop the dispatcher.
    pub async fn shutdown(&self, deadline: Duration) {
        {
            let mut lanes = self.lanes.lock().await;
            lanes.accepting = false;
        }
        self.notify.notify_one();
        let drained = tokio::time::timeout(deadline, async {
            loop {
                if self.queue_depth().await == 0 {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await;
        if drained.is_err() {
            warn!(
                remaining = self.queue_depth().await,
                "shutdown deadline elapsed with events still queued"
            );
        }
        self.notify.notify_one();
    }
}

/// Receiving half of a subscription.
pub struct EventStream {
    receiver: mpsc::UnboundedReceiver<Event>,
}

impl EventStream {
    /// Await the next event on this subscription.
    pub async fn recv(&mut self) -> Option<Event> {
        self.receiver.recv().await
    }

    /// Non-blocking poll used by tests and the drain path.
    pub fn try_recv(&mut self) -> Option<Event> {
        self.receiver.try_recv().ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bulwark_journal::{WalReader, WalWriterConfig};
    use serde_json::json;
    use tempfile::TempDir;

    #[tokio::test]
    async fn per_topic_delivery_is_in_sequence_order() {
        let bus = EventBus::new(EventBusConfig::default(), None);
        let mut stream = bus.subscribe("order:submitted").await;
        bus.start();

        for idx in 0..5 {
            bus.publish("order:submitted", json!({ "idx": idx }), "test")
                .await
                .unwrap();
        }
        let mut last = None;
        for _ in 0..5 {
            let event = stream.recv().await.unwrap();
            if let Some(prev) = last {
                assert!(event.sequence > prev);
            }
            last = Some(event.sequence);
        }
    }

    #[tokio::test]
    async fn bounded_lane_sheds_oldest_non_critical() {
        let config = EventBusConfig {
            max_queue_size: 2,
            ..EventBusConfig::default()
        };
        let bus = EventBus::new(config, None);
        // No dispatcher running: the lane fills up.
        for idx in 0..4 {
            bus.publish("order:submitted", json!({ "idx": idx }), "test")
                .await
                .unwrap();
        }
        assert_eq!(bus.dropped_count(), 2);
        assert_eq!(bus.queue_depth().await, 2);
    }

    #[tokio::test]
    async fn critical_events_hit_the_wal_before_ack() {
        let dir = TempDir::new().unwrap();
        let wal = WalWriter::open(WalWriterConfig::new(dir.path())).unwrap();
        let bus = EventBus::new(EventBusConfig::default(), Some(wal));

        // No dispatcher yet: the WAL record must exist as soon as publish
        // returns, before any subscriber could have observed the event.
        bus.publish("risk:alert", json!({ "reason": "test" }), "test")
            .await
            .unwrap();
        let records = WalReader::replay_dir(dir.path()).unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].topic, "risk:alert");
    }

    #[tokio::test]
    async fn critical_lane_is_never_shed() {
        let config = EventBusConfig {
            max_queue_size: 1,
            ..EventBusConfig::default()
        };
        let bus = EventBus::new(config, None);
        for _ in 0..5 {
            bus.publish("risk:alert", json!({}), "test").await.unwrap();
        }
        assert_eq!(bus.dropped_count(), 0);
        assert_eq!(bus.queue_depth().await, 5);
    }

    #[tokio::test]
    async fn wildcard_subscription_sees_everything() {
        let bus = EventBus::new(EventBusConfig::default(), None);
        let mut all = bus.subscribe("*").await;
        bus.start();

        bus.publish("order:submitted", json!({}), "test")
            .await
            .unwrap();
        bus.publish("balance:changed", json!({}), "test")
            .await
            .unwrap();
        assert_eq!(all.recv().await.unwrap().topic, "order:submitted");
        assert_eq!(all.recv().await.unwrap().topic, "balance:changed");
    }

    #[tokio::test]
    async fn shutdown_flushes_queued_events() {
        let bus = EventBus::new(EventBusConfig::default(), None);
        let mut stream = bus.subscribe("order:terminal").await;
        bus.publish("order:terminal", json!({}), "test")
            .await
            .unwrap();
        bus.start();
        bus.shutdown(Duration::from_secs(1)).await;
        assert!(stream.recv().await.is_some());
        assert!(matches!(
            bus.publish("order:terminal", json!({}), "test").await,
            Err(BusError::Closed)
        ));
    }
}
