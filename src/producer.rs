//! Producer side of the batch contract.
//!
//! An upstream ingestion path stages files, records the batch as STAGED,
//! flips it to READY with everything the worker needs, and announces it on
//! the ready topic. The announce step is best effort: a failure is logged
//! and left to the recovery scanner, because the READY record is already
//! durable.

use std::sync::Arc;

use metrics::counter;

use crate::bus::EventBus;
use crate::clock::{Clock, SystemClock};
use crate::domain::{
    Batch, BatchContents, BatchData, BatchId, BatchRecord, Ready, SlotId, Staged,
};
use crate::envelope::Envelope;
use crate::error::Result;
use crate::storage::BatchStorage;

/// A batch that reached READY, and whether its ready event went out.
#[derive(Debug, Clone)]
pub struct Submission {
    pub batch: Batch<Ready>,
    pub announced: bool,
}

/// Creates batches and announces them.
pub struct BatchProducer<S: BatchStorage> {
    storage: Arc<S>,
    bus: Arc<dyn EventBus>,
    ready_topic: String,
    slot_id: Option<SlotId>,
    clock: Arc<dyn Clock>,
}

impl<S: BatchStorage> BatchProducer<S> {
    pub fn new(storage: Arc<S>, bus: Arc<dyn EventBus>, ready_topic: impl Into<String>) -> Self {
        Self {
            storage,
            bus,
            ready_topic: ready_topic.into(),
            slot_id: None,
            clock: Arc::new(SystemClock),
        }
    }

    /// Stamp batches with the slot this instance holds.
    pub fn with_slot(mut self, slot_id: SlotId) -> Self {
        self.slot_id = Some(slot_id);
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Record a new batch in STAGED.
    pub async fn stage(&self, submitted_by: Option<String>) -> Result<Batch<Staged>> {
        let data = BatchData {
            id: BatchId::generate(),
            created_at: self.clock.now(),
            submitted_by,
            slot_id: self.slot_id,
        };
        let batch = Batch::<Staged>::create(data, self.storage.as_ref()).await?;
        tracing::debug!(batch_id = %batch.data.id, "Staged batch");
        Ok(batch)
    }

    /// STAGED → READY with the transfer requests and both metadata groups.
    pub async fn mark_ready(
        &self,
        batch: Batch<Staged>,
        contents: BatchContents,
    ) -> Result<Batch<Ready>> {
        batch
            .mark_ready(contents, self.clock.now(), self.storage.as_ref())
            .await
    }

    /// Publish the ready event. Returns whether the broker accepted it.
    pub async fn announce(&self, batch: &Batch<Ready>) -> bool {
        let publish = async {
            let payload = Envelope::batch_ready(&BatchRecord::from(batch))?.encode()?;
            self.bus
                .publish(&self.ready_topic, batch.data.id.as_str(), payload)
                .await
        };

        match publish.await {
            Ok(()) => {
                tracing::info!(batch_id = %batch.data.id, "Announced ready batch");
                true
            }
            Err(e) => {
                counter!("ferry_announce_failures_total").increment(1);
                tracing::warn!(
                    batch_id = %batch.data.id,
                    error = %e,
                    "Failed to announce ready batch, recovery scan will re-emit it"
                );
                false
            }
        }
    }

    /// Stage, mark ready and announce in one go.
    pub async fn submit(
        &self,
        submitted_by: Option<String>,
        contents: BatchContents,
    ) -> Result<Submission> {
        let staged = self.stage(submitted_by).await?;
        let batch = self.mark_ready(staged, contents).await?;
        let announced = self.announce(&batch).await;
        Ok(Submission { batch, announced })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::InMemoryBus;
    use crate::domain::{BatchStatus, TransferRequest};
    use crate::storage::memory::InMemoryStore;

    #[tokio::test]
    async fn test_submit_persists_ready_and_announces() {
        let store = Arc::new(InMemoryStore::new());
        let bus = InMemoryBus::new();
        let producer = BatchProducer::new(store.clone(), Arc::new(bus.clone()), "ready")
            .with_slot(SlotId(4));

        let submission = producer
            .submit(
                Some("alice".to_string()),
                BatchContents {
                    transfer_requests: vec![TransferRequest::new("24/05/01/h", "u1", "a.txt")],
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        assert!(submission.announced);
        let record = store.record(&submission.batch.data.id).unwrap();
        assert_eq!(record.status, BatchStatus::Ready);
        assert_eq!(record.slot_id, Some(SlotId(4)));
        assert_eq!(record.submitted_by.as_deref(), Some("alice"));

        let published = bus.published("ready");
        assert_eq!(published.len(), 1);
        assert_eq!(published[0].key, submission.batch.data.id.as_str());
        let envelope = Envelope::decode(&published[0].payload).unwrap();
        let payload: BatchRecord = envelope.payload_as().unwrap();
        assert_eq!(payload.transfer_requests.len(), 1);
    }

    #[tokio::test]
    async fn test_failed_announce_leaves_batch_ready() {
        let store = Arc::new(InMemoryStore::new());
        let bus = InMemoryBus::new();
        bus.set_unavailable(true);
        let producer = BatchProducer::new(store.clone(), Arc::new(bus.clone()), "ready");

        let submission = producer
            .submit(None, BatchContents::default())
            .await
            .unwrap();

        assert!(!submission.announced);
        assert_eq!(
            store.record(&submission.batch.data.id).unwrap().status,
            BatchStatus::Ready
        );
    }
}
