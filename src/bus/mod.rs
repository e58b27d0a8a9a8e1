//! Durable topic bus abstraction.
//!
//! Delivery is at-least-once within a consumer group: a message handed to a
//! subscriber stays in flight until it is acked. A nack, or the subscriber
//! going away, makes it deliverable again. Ordering across messages is not
//! relied on anywhere in the core.

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};

use crate::error::Result;

pub mod memory;

pub use memory::InMemoryBus;

/// A message as stored on a topic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BusMessage {
    pub topic: String,
    /// Partition key; the core always keys by batch id
    pub key: String,
    pub payload: Bytes,
    pub published_at: DateTime<Utc>,
}

/// One delivery of a message to a consumer group member.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    /// Unique per delivery, not per message
    pub delivery_id: u64,
    pub message: BusMessage,
    /// 1 on first delivery, incremented on each redelivery
    pub attempt: u32,
}

/// Publishing and group subscription.
#[async_trait]
pub trait EventBus: Send + Sync {
    /// Append a message to `topic`. Resolves once the broker has accepted it.
    async fn publish(&self, topic: &str, key: &str, payload: Bytes) -> Result<()>;

    /// Join `group` on `topic`. Members of one group share its messages; a
    /// group seeing the topic for the first time starts from the earliest
    /// retained message.
    async fn subscribe(&self, topic: &str, group: &str) -> Result<Box<dyn Subscription>>;
}

/// A consumer group membership.
#[async_trait]
pub trait Subscription: Send {
    /// Wait for the next delivery.
    async fn recv(&mut self) -> Result<Delivery>;

    /// Mark a delivery processed. Acking an unknown delivery is a no-op.
    async fn ack(&mut self, delivery: &Delivery) -> Result<()>;

    /// Return a delivery to the group for redelivery.
    async fn nack(&mut self, delivery: Delivery) -> Result<()>;
}
