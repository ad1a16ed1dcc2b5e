//! Event Bus (§4.3): fans runtime state out to WebSocket subscribers.
//!
//! Grounded on `backend/services/event_bus.py`: one bounded, drop-oldest
//! queue per subscriber, `publish` never blocks or awaits a slow reader.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use serde_json::Value;
use tokio::sync::Notify;
use uuid::Uuid;

/// Queue depth per subscriber. A reader more than this far behind loses its
/// oldest unread messages rather than stalling the publisher.
const QUEUE_CAPACITY: usize = 200;

struct Queue {
    messages: Mutex<VecDeque<Value>>,
    notify: Notify,
    closed: AtomicBool,
}

/// A subscriber's read handle. Dropping it (or calling `unsubscribe`) frees
/// its slot on the bus.
pub struct Subscription {
    pub id: Uuid,
    queue: Arc<Queue>,
}

impl Subscription {
    /// Awaits the next message, or `None` once the bus has closed this
    /// subscription (e.g. via `EventBus::unsubscribe`).
    pub async fn recv(&mut self) -> Option<Value> {
        loop {
            if let Some(msg) = self.queue.messages.lock().unwrap().pop_front() {
                return Some(msg);
            }
            if self.queue.closed.load(Ordering::Acquire) {
                return None;
            }
            self.queue.notify.notified().await;
        }
    }
}

/// Bounded fan-out bus. `publish` is synchronous and infallible: a full
/// subscriber queue drops its oldest entry to make room, matching the
/// Python original's `deque(maxlen=200)` per subscriber.
#[derive(Default)]
pub struct EventBus {
    subscribers: Mutex<HashMap<Uuid, Arc<Queue>>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self {
            subscribers: Mutex::new(HashMap::new()),
        }
    }

    pub fn subscribe(&self) -> Subscription {
        let id = Uuid::new_v4();
        let queue = Arc::new(Queue {
            messages: Mutex::new(VecDeque::with_capacity(QUEUE_CAPACITY)),
            notify: Notify::new(),
            closed: AtomicBool::new(false),
        });
        self.subscribers.lock().unwrap().insert(id, queue.clone());
        Subscription { id, queue }
    }

    pub fn unsubscribe(&self, id: Uuid) {
        if let Some(queue) = self.subscribers.lock().unwrap().remove(&id) {
            queue.closed.store(true, Ordering::Release);
            queue.notify.notify_waiters();
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.lock().unwrap().len()
    }

    /// Never blocks: a subscriber whose queue is at capacity has its oldest
    /// message dropped to make room for the new one.
    pub fn publish(&self, message: Value) {
        let subscribers = self.subscribers.lock().unwrap();
        for queue in subscribers.values() {
            let mut messages = queue.messages.lock().unwrap();
            if messages.len() >= QUEUE_CAPACITY {
                messages.pop_front();
            }
            messages.push_back(message.clone());
            drop(messages);
            queue.notify.notify_one();
        }
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
        bus.publish(serde_json::json!({"type": "weight_update", "weight": 1.0}));
        assert_eq!(a.recv().await.unwrap()["weight"], serde_json::json!(1.0));
        assert_eq!(b.recv().await.unwrap()["weight"], serde_json::json!(1.0));
    }

    #[tokio::test]
    async fn unsubscribe_ends_the_subscription() {
        let bus = EventBus::new();
        let mut sub = bus.subscribe();
        assert_eq!(bus.subscriber_count(), 1);
        bus.unsubscribe(sub.id);
        assert_eq!(bus.subscriber_count(), 0);
        assert_eq!(sub.recv().await, None);
    }

    #[tokio::test]
    async fn publish_drops_oldest_once_a_subscriber_queue_is_full() {
        let bus = EventBus::new();
        let mut sub = bus.subscribe();
        for i in 0..(QUEUE_CAPACITY + 10) {
            bus.publish(serde_json::json!({"i": i}));
        }
        // The first 10 messages were evicted; the oldest surviving is i=10.
        let first = sub.recv().await.unwrap();
        assert_eq!(first["i"], serde_json::json!(10));
    }
}
