//! In-process bus with consumer groups and redelivery.
//!
//! Each topic keeps its full log, so a group created after messages were
//! published still sees them. Each group keeps a queue of deliverable
//! messages and the set currently in flight.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::Utc;
use parking_lot::Mutex;
use tokio::sync::Notify;

use super::{BusMessage, Delivery, EventBus, Subscription};
use crate::error::{FerryError, Result};

#[derive(Default)]
struct Group {
    /// (message, attempts so far)
    queue: VecDeque<(BusMessage, u32)>,
    in_flight: HashMap<u64, (BusMessage, u32)>,
    notify: Arc<Notify>,
}

#[derive(Default)]
struct Topic {
    log: Vec<BusMessage>,
    groups: HashMap<String, Group>,
}

#[derive(Default)]
struct Inner {
    topics: HashMap<String, Topic>,
    next_delivery_id: u64,
    unavailable: bool,
    failing_publishes: HashMap<String, usize>,
}

impl Inner {
    fn group_mut(&mut self, topic: &str, group: &str) -> Option<&mut Group> {
        self.topics.get_mut(topic)?.groups.get_mut(group)
    }
}

/// Bus held entirely in process memory.
///
/// Cloning shares the same topics, so a producer, a worker and a test can
/// each hold a handle.
#[derive(Clone, Default)]
pub struct InMemoryBus {
    inner: Arc<Mutex<Inner>>,
}

impl InMemoryBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every message ever accepted on `topic`, in publish order.
    pub fn published(&self, topic: &str) -> Vec<BusMessage> {
        self.inner
            .lock()
            .topics
            .get(topic)
            .map(|t| t.log.clone())
            .unwrap_or_default()
    }

    /// Reject the next `n` publishes to `topic`.
    pub fn fail_next_publishes(&self, topic: &str, n: usize) {
        self.inner
            .lock()
            .failing_publishes
            .insert(topic.to_string(), n);
    }

    /// Reject every publish and subscribe until reset.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.inner.lock().unavailable = unavailable;
    }

    /// Messages queued or in flight for `group` on `topic`.
    pub fn pending(&self, topic: &str, group: &str) -> usize {
        self.inner
            .lock()
            .group_mut(topic, group)
            .map(|g| g.queue.len() + g.in_flight.len())
            .unwrap_or(0)
    }
}

#[async_trait]
impl EventBus for InMemoryBus {
    async fn publish(&self, topic: &str, key: &str, payload: Bytes) -> Result<()> {
        let mut inner = self.inner.lock();
        if inner.unavailable {
            return Err(FerryError::Bus("broker unavailable".to_string()));
        }
        if let Some(remaining) = inner.failing_publishes.get_mut(topic)
            && *remaining > 0
        {
            *remaining -= 1;
            return Err(FerryError::Bus(format!("publish to '{topic}' rejected")));
        }

        let message = BusMessage {
            topic: topic.to_string(),
            key: key.to_string(),
            payload,
            published_at: Utc::now(),
        };
        let topic = inner.topics.entry(topic.to_string()).or_default();
        topic.log.push(message.clone());
        for group in topic.groups.values_mut() {
            group.queue.push_back((message.clone(), 0));
            group.notify.notify_one();
        }
        Ok(())
    }

    async fn subscribe(&self, topic: &str, group: &str) -> Result<Box<dyn Subscription>> {
        let mut inner = self.inner.lock();
        if inner.unavailable {
            return Err(FerryError::Bus("broker unavailable".to_string()));
        }
        let entry = inner.topics.entry(topic.to_string()).or_default();
        let log = entry.log.clone();
        let group_state = entry.groups.entry(group.to_string()).or_insert_with(|| Group {
            queue: log.into_iter().map(|m| (m, 0)).collect(),
            ..Default::default()
        });
        let notify = group_state.notify.clone();
        if !group_state.queue.is_empty() {
            notify.notify_one();
        }

        tracing::debug!(topic, group, "Joined consumer group");
        Ok(Box::new(InMemorySubscription {
            inner: self.inner.clone(),
            topic: topic.to_string(),
            group: group.to_string(),
            notify,
            held: HashSet::new(),
        }))
    }
}

/// Membership in one group of an [`InMemoryBus`] topic.
pub struct InMemorySubscription {
    inner: Arc<Mutex<Inner>>,
    topic: String,
    group: String,
    notify: Arc<Notify>,
    /// Deliveries this member holds, returned to the group on drop
    held: HashSet<u64>,
}

impl InMemorySubscription {
    fn requeue(&self, inner: &mut Inner, delivery_id: u64) {
        if let Some(group) = inner.group_mut(&self.topic, &self.group)
            && let Some(entry) = group.in_flight.remove(&delivery_id)
        {
            group.queue.push_back(entry);
            group.notify.notify_one();
        }
    }
}

#[async_trait]
impl Subscription for InMemorySubscription {
    async fn recv(&mut self) -> Result<Delivery> {
        loop {
            {
                let mut inner = self.inner.lock();
                let next = inner
                    .group_mut(&self.topic, &self.group)
                    .and_then(|group| group.queue.pop_front());
                if let Some((message, attempts)) = next {
                    let delivery_id = inner.next_delivery_id;
                    inner.next_delivery_id += 1;
                    let attempt = attempts + 1;
                    if let Some(group) = inner.group_mut(&self.topic, &self.group) {
                        group
                            .in_flight
                            .insert(delivery_id, (message.clone(), attempt));
                    }
                    self.held.insert(delivery_id);
                    return Ok(Delivery {
                        delivery_id,
                        message,
                        attempt,
                    });
                }
            }
            self.notify.notified().await;
        }
    }

    async fn ack(&mut self, delivery: &Delivery) -> Result<()> {
        let mut inner = self.inner.lock();
        if let Some(group) = inner.group_mut(&self.topic, &self.group) {
            group.in_flight.remove(&delivery.delivery_id);
        }
        self.held.remove(&delivery.delivery_id);
        Ok(())
    }

    async fn nack(&mut self, delivery: Delivery) -> Result<()> {
        let mut inner = self.inner.lock();
        self.requeue(&mut inner, delivery.delivery_id);
        self.held.remove(&delivery.delivery_id);
        Ok(())
    }
}

impl Drop for InMemorySubscription {
    fn drop(&mut self) {
        let held: Vec<u64> = self.held.drain().collect();
        let mut inner = self.inner.lock();
        for delivery_id in held {
            self.requeue(&mut inner, delivery_id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::time::timeout;

    const RECV_TIMEOUT: Duration = Duration::from_secs(1);

    #[tokio::test]
    async fn test_new_group_sees_earlier_messages() {
        let bus = InMemoryBus::new();
        bus.publish("t", "k", Bytes::from_static(b"one")).await.unwrap();

        let mut sub = bus.subscribe("t", "g").await.unwrap();
        let delivery = timeout(RECV_TIMEOUT, sub.recv()).await.unwrap().unwrap();
        assert_eq!(delivery.message.payload, Bytes::from_static(b"one"));
        assert_eq!(delivery.attempt, 1);
    }

    #[tokio::test]
    async fn test_nack_redelivers_with_higher_attempt() {
        let bus = InMemoryBus::new();
        let mut sub = bus.subscribe("t", "g").await.unwrap();
        bus.publish("t", "k", Bytes::from_static(b"x")).await.unwrap();

        let first = timeout(RECV_TIMEOUT, sub.recv()).await.unwrap().unwrap();
        sub.nack(first.clone()).await.unwrap();
        let second = timeout(RECV_TIMEOUT, sub.recv()).await.unwrap().unwrap();

        assert_ne!(first.delivery_id, second.delivery_id);
        assert_eq!(second.attempt, 2);
        sub.ack(&second).await.unwrap();
        assert_eq!(bus.pending("t", "g"), 0);
    }

    #[tokio::test]
    async fn test_dropped_member_returns_unacked_deliveries() {
        let bus = InMemoryBus::new();
        bus.publish("t", "k", Bytes::from_static(b"x")).await.unwrap();

        let mut first = bus.subscribe("t", "g").await.unwrap();
        let _held = timeout(RECV_TIMEOUT, first.recv()).await.unwrap().unwrap();
        drop(first);

        let mut second = bus.subscribe("t", "g").await.unwrap();
        let again = timeout(RECV_TIMEOUT, second.recv()).await.unwrap().unwrap();
        assert_eq!(again.attempt, 2);
    }

    #[tokio::test]
    async fn test_groups_each_get_every_message() {
        let bus = InMemoryBus::new();
        let mut a = bus.subscribe("t", "a").await.unwrap();
        let mut b = bus.subscribe("t", "b").await.unwrap();
        bus.publish("t", "k", Bytes::from_static(b"x")).await.unwrap();

        assert!(timeout(RECV_TIMEOUT, a.recv()).await.is_ok());
        assert!(timeout(RECV_TIMEOUT, b.recv()).await.is_ok());
    }

    #[tokio::test]
    async fn test_injected_publish_failures() {
        let bus = InMemoryBus::new();
        bus.fail_next_publishes("t", 1);
        assert!(bus.publish("t", "k", Bytes::new()).await.is_err());
        assert!(bus.publish("t", "k", Bytes::new()).await.is_ok());
        assert_eq!(bus.published("t").len(), 1);
    }
}
