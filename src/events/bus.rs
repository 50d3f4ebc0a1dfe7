//! Event bus — bounded ring buffer with per-subscriber filters and replay.
//!
//! Unlike a `broadcast` channel, each subscription carries its own filter,
//! so fan-out goes through per-subscriber unbounded channels: a slow SSE
//! client buffers in its own channel instead of blocking `publish`.
//!
//! Replay ordering: `subscribe` seeds the subscriber's channel from the
//! ring and registers it under the same lock `publish` takes, so the
//! replayed IDs and subsequent live IDs form one ascending sequence.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};

use chrono::Utc;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use super::model::{Event, EventFilter, EventKind, EventPayload};

struct Subscriber {
    filter: EventFilter,
    tx: mpsc::UnboundedSender<Event>,
}

struct Inner {
    buffer: VecDeque<Event>,
    next_id: u64,
    next_sub_id: u64,
    subscribers: HashMap<u64, Subscriber>,
}

/// In-memory publish/subscribe bus for lifecycle events.
pub struct EventBus {
    capacity: usize,
    inner: Mutex<Inner>,
}

/// Live subscription handle. Dropping it unsubscribes; keep it alive for
/// the lifetime of the owning connection or events will stop flowing.
pub struct Subscription {
    bus: Arc<EventBus>,
    id: u64,
    rx: mpsc::UnboundedReceiver<Event>,
}

impl Subscription {
    /// Receive the next event (replayed first, then live), or `None` once
    /// the bus is gone.
    pub async fn recv(&mut self) -> Option<Event> {
        self.rx.recv().await
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.bus.unsubscribe(self.id);
    }
}

impl EventBus {
    /// Create a bus whose ring buffer holds at most `capacity` events.
    pub fn new(capacity: usize) -> Arc<Self> {
        Arc::new(Self {
            capacity: capacity.max(1),
            inner: Mutex::new(Inner {
                buffer: VecDeque::new(),
                next_id: 1,
                next_sub_id: 1,
                subscribers: HashMap::new(),
            }),
        })
    }

    /// Publish an event: assign the next ID, append to the ring (dropping
    /// the oldest entry at capacity), and fan out to matching subscribers.
    /// One synchronous pass under the lock — no await point splits the
    /// append from the fan-out.
    pub fn publish(&self, kind: EventKind, payload: EventPayload) -> Event {
        let mut inner = self.inner.lock().expect("event bus lock poisoned");

        let event = Event {
            id: inner.next_id,
            kind,
            at: Utc::now(),
            payload,
        };
        inner.next_id += 1;

        if inner.buffer.len() == self.capacity {
            inner.buffer.pop_front();
        }
        inner.buffer.push_back(event.clone());

        let mut dead: Vec<u64> = Vec::new();
        for (sub_id, sub) in &inner.subscribers {
            if !sub.filter.matches(&event) {
                continue;
            }
            if sub.tx.send(event.clone()).is_err() {
                dead.push(*sub_id);
            }
        }
        for sub_id in dead {
            inner.subscribers.remove(&sub_id);
            debug!(sub_id, "Dropped dead subscriber during publish");
        }

        debug!(event_id = event.id, kind = %event.kind, "Event published");
        event
    }

    /// Subscribe with a filter and an optional last-seen event ID.
    ///
    /// With `last_event_id`, every buffered event with a strictly greater
    /// ID (that matches the filter) is replayed before live delivery; with
    /// none, the whole buffer is. IDs older than the ring's oldest entry
    /// replay whatever remains — bounded replay is the contract.
    pub fn subscribe(
        self: &Arc<Self>,
        filter: EventFilter,
        last_event_id: Option<u64>,
    ) -> Subscription {
        let (tx, rx) = mpsc::unbounded_channel();

        let mut inner = self.inner.lock().expect("event bus lock poisoned");

        let since = last_event_id.unwrap_or(0);
        for event in inner.buffer.iter().filter(|e| e.id > since) {
            if filter.matches(event) {
                // Channel is fresh and unbounded; send cannot fail here.
                let _ = tx.send(event.clone());
            }
        }

        let id = inner.next_sub_id;
        inner.next_sub_id += 1;
        inner.subscribers.insert(id, Subscriber { filter, tx });

        let live = inner.subscribers.len();
        drop(inner);
        debug!(sub_id = id, live, "Subscriber attached");

        Subscription {
            bus: Arc::clone(self),
            id,
            rx,
        }
    }

    fn unsubscribe(&self, sub_id: u64) {
        let mut inner = self.inner.lock().expect("event bus lock poisoned");
        if inner.subscribers.remove(&sub_id).is_some() {
            debug!(sub_id, live = inner.subscribers.len(), "Subscriber detached");
        } else {
            warn!(sub_id, "Unsubscribe for unknown subscriber");
        }
    }

    /// Number of live subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.inner
            .lock()
            .expect("event bus lock poisoned")
            .subscribers
            .len()
    }

    /// Highest ID assigned so far (0 when nothing was published).
    pub fn last_event_id(&self) -> u64 {
        self.inner.lock().expect("event bus lock poisoned").next_id - 1
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tasks::{StatusBucket, Task, TaskState};

    fn task_payload(state: TaskState) -> EventPayload {
        let mut task = Task::new("T", "cli");
        task.state = state;
        EventPayload::Task { task }
    }

    #[tokio::test]
    async fn publish_assigns_increasing_ids() {
        let bus = EventBus::new(16);
        let a = bus.publish(EventKind::TaskCreated, task_payload(TaskState::Submitted));
        let b = bus.publish(EventKind::TaskClaimed, task_payload(TaskState::Working));
        assert!(b.id > a.id);
        assert_eq!(bus.last_event_id(), b.id);
    }

    #[tokio::test]
    async fn live_delivery_in_order() {
        let bus = EventBus::new(16);
        let mut sub = bus.subscribe(EventFilter::default(), None);

        for _ in 0..3 {
            bus.publish(EventKind::TaskCreated, task_payload(TaskState::Submitted));
        }

        let a = sub.recv().await.unwrap();
        let b = sub.recv().await.unwrap();
        let c = sub.recv().await.unwrap();
        assert!(a.id < b.id && b.id < c.id);
    }

    #[tokio::test]
    async fn replay_after_last_event_id() {
        let bus = EventBus::new(16);
        let ids: Vec<u64> = (0..3)
            .map(|_| {
                bus.publish(EventKind::TaskCreated, task_payload(TaskState::Submitted))
                    .id
            })
            .collect();

        // Reconnect having seen the second event.
        let mut sub = bus.subscribe(EventFilter::default(), Some(ids[1]));
        let replayed = sub.recv().await.unwrap();
        assert_eq!(replayed.id, ids[2]);

        // Nothing else buffered; next recv would block, so publish live.
        let live = bus.publish(EventKind::TaskClaimed, task_payload(TaskState::Working));
        assert_eq!(sub.recv().await.unwrap().id, live.id);
    }

    #[tokio::test]
    async fn replay_without_last_id_sends_full_buffer() {
        let bus = EventBus::new(16);
        for _ in 0..2 {
            bus.publish(EventKind::TaskCreated, task_payload(TaskState::Submitted));
        }
        let mut sub = bus.subscribe(EventFilter::default(), None);
        assert_eq!(sub.recv().await.unwrap().id, 1);
        assert_eq!(sub.recv().await.unwrap().id, 2);
    }

    #[tokio::test]
    async fn ring_drops_oldest_at_capacity() {
        let bus = EventBus::new(2);
        for _ in 0..5 {
            bus.publish(EventKind::TaskCreated, task_payload(TaskState::Submitted));
        }
        // Only events 4 and 5 remain for replay.
        let mut sub = bus.subscribe(EventFilter::default(), None);
        assert_eq!(sub.recv().await.unwrap().id, 4);
        assert_eq!(sub.recv().await.unwrap().id, 5);
    }

    #[tokio::test]
    async fn filter_limits_delivery() {
        let bus = EventBus::new(16);
        let mut sub = bus.subscribe(
            EventFilter {
                status: Some(StatusBucket::Pending),
                ..Default::default()
            },
            None,
        );

        bus.publish(EventKind::TaskClaimed, task_payload(TaskState::Working));
        let delivered = bus.publish(EventKind::TaskCreated, task_payload(TaskState::Submitted));

        assert_eq!(sub.recv().await.unwrap().id, delivered.id);
    }

    #[tokio::test]
    async fn drop_unsubscribes() {
        let bus = EventBus::new(16);
        let sub = bus.subscribe(EventFilter::default(), None);
        assert_eq!(bus.subscriber_count(), 1);
        drop(sub);
        assert_eq!(bus.subscriber_count(), 0);
    }
}
