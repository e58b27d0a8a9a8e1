//! Consumer loop for the ready topic.
//!
//! Takes one delivery at a time from the consumer group, decodes the
//! envelope and dispatches it. Acks on success and on permanent failures;
//! nacks on transient failures and pauses before the next delivery.

use std::sync::Arc;
use std::time::Duration;

use metrics::counter;
use tokio_util::sync::CancellationToken;

use crate::bus::{Delivery, EventBus, Subscription};
use crate::envelope::{DispatchTable, Envelope};
use crate::error::{FerryError, Result};

/// What happened to one delivery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeliveryOutcome {
    /// Handler succeeded; acked.
    Handled,
    /// Transient failure; nacked for redelivery.
    Retrying,
    /// Malformed or permanently failing; acked so it is not redelivered.
    Discarded,
}

/// Pulls ready events and feeds them to a [`DispatchTable`].
pub struct Consumer {
    bus: Arc<dyn EventBus>,
    dispatch: DispatchTable,
    topic: String,
    group: String,
    redelivery_backoff: Duration,
}

impl Consumer {
    pub fn new(
        bus: Arc<dyn EventBus>,
        dispatch: DispatchTable,
        topic: impl Into<String>,
        group: impl Into<String>,
    ) -> Self {
        Self {
            bus,
            dispatch,
            topic: topic.into(),
            group: group.into(),
            redelivery_backoff: Duration::from_millis(1000),
        }
    }

    pub fn with_redelivery_backoff(mut self, backoff: Duration) -> Self {
        self.redelivery_backoff = backoff;
        self
    }

    /// Consume until `shutdown` fires.
    ///
    /// Returns `LeaseLost` as soon as a handler reports it: the delivery is
    /// handed back to the group and nothing more is processed here. Transient
    /// broker failures (subscribe, recv, ack, nack) are logged and retried
    /// after the redelivery backoff; an unsettled delivery comes back from
    /// the broker on its own.
    #[tracing::instrument(skip(self, shutdown), fields(topic = %self.topic, group = %self.group))]
    pub async fn run(&self, shutdown: CancellationToken) -> Result<()> {
        let mut subscription = loop {
            let subscribed = tokio::select! {
                biased;
                _ = shutdown.cancelled() => return Ok(()),
                subscribed = self.bus.subscribe(&self.topic, &self.group) => subscribed,
            };
            match subscribed {
                Ok(subscription) => break subscription,
                Err(e) if e.is_transient() => {
                    self.broker_failure("subscribe", &e);
                    if !self.back_off(&shutdown).await {
                        return Ok(());
                    }
                }
                Err(e) => return Err(e),
            }
        };
        tracing::info!("Consumer started");

        loop {
            let received = tokio::select! {
                biased;
                _ = shutdown.cancelled() => {
                    tracing::info!("Consumer shutting down");
                    return Ok(());
                }
                received = subscription.recv() => received,
            };

            let delivery = match received {
                Ok(delivery) => delivery,
                Err(e) if e.is_transient() => {
                    self.broker_failure("recv", &e);
                    if !self.back_off(&shutdown).await {
                        return Ok(());
                    }
                    continue;
                }
                Err(e) => return Err(e),
            };

            let pause = match self.handle_delivery(subscription.as_mut(), delivery).await {
                Ok(outcome) => outcome == DeliveryOutcome::Retrying,
                Err(e @ FerryError::LeaseLost { .. }) => return Err(e),
                Err(e) if e.is_transient() => {
                    self.broker_failure("settle", &e);
                    true
                }
                Err(e) => return Err(e),
            };
            if pause && !self.back_off(&shutdown).await {
                tracing::info!("Consumer shutting down");
                return Ok(());
            }
        }
    }

    fn broker_failure(&self, operation: &'static str, error: &FerryError) {
        counter!("ferry_consumer_broker_errors_total", "operation" => operation).increment(1);
        tracing::warn!(operation, error = %error, "Broker call failed, retrying after backoff");
    }

    /// Sleep for the redelivery backoff. Returns `false` if shutdown fired.
    async fn back_off(&self, shutdown: &CancellationToken) -> bool {
        tokio::select! {
            _ = shutdown.cancelled() => false,
            _ = tokio::time::sleep(self.redelivery_backoff) => true,
        }
    }

    /// Decode, dispatch and settle one delivery.
    pub async fn handle_delivery(
        &self,
        subscription: &mut dyn Subscription,
        delivery: Delivery,
    ) -> Result<DeliveryOutcome> {
        let envelope = match Envelope::decode(&delivery.message.payload) {
            Ok(envelope) => envelope,
            Err(e) => {
                counter!("ferry_deliveries_total", "outcome" => "malformed").increment(1);
                tracing::warn!(
                    delivery_id = delivery.delivery_id,
                    error = %e,
                    "Discarding malformed event"
                );
                subscription.ack(&delivery).await?;
                return Ok(DeliveryOutcome::Discarded);
            }
        };

        match self.dispatch.dispatch(&envelope).await {
            Ok(()) => {
                counter!("ferry_deliveries_total", "outcome" => "handled").increment(1);
                subscription.ack(&delivery).await?;
                Ok(DeliveryOutcome::Handled)
            }
            Err(e @ FerryError::LeaseLost { .. }) => {
                if let Err(nack_error) = subscription.nack(delivery).await {
                    tracing::warn!(
                        error = %nack_error,
                        "Failed to hand delivery back after lease loss"
                    );
                }
                Err(e)
            }
            Err(e) if e.is_transient() => {
                counter!("ferry_deliveries_total", "outcome" => "retrying").increment(1);
                tracing::error!(
                    key = %delivery.message.key,
                    attempt = delivery.attempt,
                    error = %e,
                    "Failed to handle event, will be redelivered"
                );
                subscription.nack(delivery).await?;
                Ok(DeliveryOutcome::Retrying)
            }
            Err(e) => {
                counter!("ferry_deliveries_total", "outcome" => "discarded").increment(1);
                tracing::warn!(
                    key = %delivery.message.key,
                    kind = %envelope.kind,
                    version = envelope.version,
                    error = %e,
                    "Discarding event that cannot be handled"
                );
                subscription.ack(&delivery).await?;
                Ok(DeliveryOutcome::Discarded)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::InMemoryBus;
    use crate::envelope::{BATCH_READY, EventHandler};
    use async_trait::async_trait;
    use bytes::Bytes;
    use parking_lot::Mutex;
    use tokio::time::timeout;

    /// Fails with the queued errors in order, then succeeds.
    #[derive(Default)]
    struct Scripted {
        errors: Mutex<Vec<FerryError>>,
        calls: Mutex<usize>,
    }

    #[async_trait]
    impl EventHandler for Scripted {
        fn supported_version(&self) -> u32 {
            1
        }

        async fn handle(&self, _envelope: &Envelope) -> Result<()> {
            *self.calls.lock() += 1;
            let mut errors = self.errors.lock();
            if errors.is_empty() {
                Ok(())
            } else {
                Err(errors.remove(0))
            }
        }
    }

    fn ready_event() -> Bytes {
        Envelope::new(BATCH_READY, 1, &serde_json::json!({"id": "B1"}))
            .unwrap()
            .encode()
            .unwrap()
    }

    async fn next(sub: &mut Box<dyn Subscription>) -> Delivery {
        timeout(Duration::from_secs(1), sub.recv())
            .await
            .unwrap()
            .unwrap()
    }

    #[test_log::test(tokio::test)]
    async fn test_transient_failure_is_redelivered() {
        let bus = InMemoryBus::new();
        let handler = Arc::new(Scripted::default());
        handler
            .errors
            .lock()
            .push(FerryError::Store("blip".to_string()));
        let consumer = Consumer::new(
            Arc::new(bus.clone()),
            DispatchTable::new().register(BATCH_READY, handler.clone()),
            "ready",
            "g",
        );
        let mut sub = bus.subscribe("ready", "g").await.unwrap();
        bus.publish("ready", "B1", ready_event()).await.unwrap();

        let first = next(&mut sub).await;
        assert_eq!(
            consumer.handle_delivery(sub.as_mut(), first).await.unwrap(),
            DeliveryOutcome::Retrying
        );
        let second = next(&mut sub).await;
        assert_eq!(second.attempt, 2);
        assert_eq!(
            consumer.handle_delivery(sub.as_mut(), second).await.unwrap(),
            DeliveryOutcome::Handled
        );
        assert_eq!(*handler.calls.lock(), 2);
        assert_eq!(bus.pending("ready", "g"), 0);
    }

    #[test_log::test(tokio::test)]
    async fn test_malformed_and_unknown_events_are_acked() {
        let bus = InMemoryBus::new();
        let consumer = Consumer::new(
            Arc::new(bus.clone()),
            DispatchTable::new().register(BATCH_READY, Arc::new(Scripted::default())),
            "ready",
            "g",
        );
        let mut sub = bus.subscribe("ready", "g").await.unwrap();

        bus.publish("ready", "k", Bytes::from_static(b"{not json"))
            .await
            .unwrap();
        let unknown = Envelope::new("batch.archived", 1, &serde_json::json!({}))
            .unwrap()
            .encode()
            .unwrap();
        bus.publish("ready", "k", unknown).await.unwrap();
        let future = Envelope::new(BATCH_READY, 7, &serde_json::json!({}))
            .unwrap()
            .encode()
            .unwrap();
        bus.publish("ready", "k", future).await.unwrap();

        for _ in 0..3 {
            let delivery = next(&mut sub).await;
            assert_eq!(
                consumer.handle_delivery(sub.as_mut(), delivery).await.unwrap(),
                DeliveryOutcome::Discarded
            );
        }
        assert_eq!(bus.pending("ready", "g"), 0);
    }

    #[test_log::test(tokio::test)]
    async fn test_lease_loss_hands_delivery_back_and_stops() {
        let bus = InMemoryBus::new();
        let handler = Arc::new(Scripted::default());
        handler.errors.lock().push(FerryError::LeaseLost {
            slot_id: crate::domain::SlotId(0),
        });
        let consumer = Consumer::new(
            Arc::new(bus.clone()),
            DispatchTable::new().register(BATCH_READY, handler),
            "ready",
            "g",
        );
        bus.publish("ready", "B1", ready_event()).await.unwrap();

        let result = timeout(Duration::from_secs(1), consumer.run(CancellationToken::new()))
            .await
            .unwrap();
        assert!(matches!(result, Err(FerryError::LeaseLost { .. })));
        assert_eq!(bus.pending("ready", "g"), 1);
    }

    /// Wraps the in-memory bus; the first `failing_acks` acks on any of its
    /// subscriptions fail with a broker error.
    struct FlakyAckBus {
        inner: InMemoryBus,
        failing_acks: Arc<Mutex<usize>>,
    }

    struct FlakyAckSubscription {
        inner: Box<dyn Subscription>,
        failing_acks: Arc<Mutex<usize>>,
    }

    #[async_trait]
    impl EventBus for FlakyAckBus {
        async fn publish(&self, topic: &str, key: &str, payload: Bytes) -> Result<()> {
            self.inner.publish(topic, key, payload).await
        }

        async fn subscribe(&self, topic: &str, group: &str) -> Result<Box<dyn Subscription>> {
            Ok(Box::new(FlakyAckSubscription {
                inner: self.inner.subscribe(topic, group).await?,
                failing_acks: self.failing_acks.clone(),
            }))
        }
    }

    #[async_trait]
    impl Subscription for FlakyAckSubscription {
        async fn recv(&mut self) -> Result<Delivery> {
            self.inner.recv().await
        }

        async fn ack(&mut self, delivery: &Delivery) -> Result<()> {
            {
                let mut failing = self.failing_acks.lock();
                if *failing > 0 {
                    *failing -= 1;
                    return Err(FerryError::Bus("connection reset".to_string()));
                }
            }
            self.inner.ack(delivery).await
        }

        async fn nack(&mut self, delivery: Delivery) -> Result<()> {
            self.inner.nack(delivery).await
        }
    }

    #[test_log::test(tokio::test)]
    async fn test_failed_ack_does_not_stop_the_consumer() {
        let inner = InMemoryBus::new();
        let bus = Arc::new(FlakyAckBus {
            inner: inner.clone(),
            failing_acks: Arc::new(Mutex::new(1)),
        });
        let handler = Arc::new(Scripted::default());
        let consumer = Consumer::new(
            bus,
            DispatchTable::new().register(BATCH_READY, handler.clone()),
            "ready",
            "g",
        )
        .with_redelivery_backoff(Duration::from_millis(10));
        inner.publish("ready", "B1", ready_event()).await.unwrap();
        inner.publish("ready", "B2", ready_event()).await.unwrap();

        let shutdown = CancellationToken::new();
        let token = shutdown.clone();
        let running = tokio::spawn(async move { consumer.run(token).await });

        timeout(Duration::from_secs(1), async {
            while *handler.calls.lock() < 2 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
        assert!(!running.is_finished());

        shutdown.cancel();
        let result = timeout(Duration::from_secs(1), running).await.unwrap().unwrap();
        assert!(result.is_ok());
    }

    #[test_log::test(tokio::test)]
    async fn test_unavailable_broker_on_subscribe_is_retried_until_shutdown() {
        let bus = InMemoryBus::new();
        bus.set_unavailable(true);
        let consumer = Consumer::new(
            Arc::new(bus.clone()),
            DispatchTable::new().register(BATCH_READY, Arc::new(Scripted::default())),
            "ready",
            "g",
        )
        .with_redelivery_backoff(Duration::from_millis(10));

        let shutdown = CancellationToken::new();
        let token = shutdown.clone();
        let running = tokio::spawn(async move { consumer.run(token).await });
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!running.is_finished());

        shutdown.cancel();
        let result = timeout(Duration::from_secs(1), running).await.unwrap().unwrap();
        assert!(result.is_ok());
    }
}
