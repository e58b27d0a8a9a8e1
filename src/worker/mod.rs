//! Batch lifecycle worker: READY → DONE.
//!
//! For each ready event the worker reloads the batch, and if it is still
//! READY:
//!
//! 1. copies every transfer request's staged object to production, in order
//!    (any failure aborts the batch and leaves it READY);
//! 2. publishes every group-A metadata item to topic A, then every group-B
//!    item to topic B, keyed by batch id (per-item failures are recorded and
//!    do not abort);
//! 3. commits DONE with a conditional write.
//!
//! Event delivery is at-least-once, so the same batch may arrive many times.
//! A batch already DONE is skipped without side effects. A batch that fails
//! before step 3 stays READY and is retried from step 1; moves overwrite and
//! metadata may be published more than once.

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use metrics::counter;
use serde::Deserialize;

use crate::bus::EventBus;
use crate::clock::{Clock, SystemClock};
use crate::config::WorkerConfig;
use crate::domain::{
    AnyBatch, Batch, BatchId, BatchStatus, Fence, FileMetadata, Ready,
    batch::transitions::CommitResult,
};
use crate::envelope::{BATCH_READY_VERSION, Envelope, EventHandler};
use crate::error::{FerryError, Result};
use crate::objects::ObjectMover;
use crate::storage::{BatchStorage, LeaseStorage};

pub mod consumer;

pub use consumer::{Consumer, DeliveryOutcome};

/// Result of processing one ready event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessOutcome {
    /// Files moved, metadata fanned out, record now DONE.
    Committed(CommitSummary),
    /// The record was already DONE; nothing was done.
    AlreadyDone,
    /// The record exists but has not reached READY.
    NotReady(BatchStatus),
    /// No record with this id.
    NotFound,
}

/// What a committing run did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommitSummary {
    /// Production keys written, in transfer request order
    pub moved: Vec<String>,
    pub fan_out: FanOutReport,
}

/// Outcome of publishing a batch's metadata.
///
/// Failed items are not retried by this run: every metadata item is
/// delivered at least once, or zero times if the broker rejected it here.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FanOutReport {
    pub published: usize,
    pub failed: Vec<FailedPublish>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FailedPublish {
    pub topic: String,
    pub filename: String,
    pub error: String,
}

/// Processes ready batches.
pub struct BatchWorker<S: BatchStorage + LeaseStorage> {
    storage: Arc<S>,
    bus: Arc<dyn EventBus>,
    mover: Arc<dyn ObjectMover>,
    config: WorkerConfig,
    fence: Option<Fence>,
    clock: Arc<dyn Clock>,
}

impl<S: BatchStorage + LeaseStorage> BatchWorker<S> {
    pub fn new(
        storage: Arc<S>,
        bus: Arc<dyn EventBus>,
        mover: Arc<dyn ObjectMover>,
        config: WorkerConfig,
    ) -> Self {
        Self {
            storage,
            bus,
            mover,
            config,
            fence: None,
            clock: Arc::new(SystemClock),
        }
    }

    /// Gate every batch on this lease: checked before side effects start and
    /// atomically with the DONE write.
    pub fn with_fence(mut self, fence: Fence) -> Self {
        self.fence = Some(fence);
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn config(&self) -> &WorkerConfig {
        &self.config
    }

    /// Drive one batch towards DONE.
    #[tracing::instrument(skip(self), fields(batch_id = %batch_id))]
    pub async fn process_batch(&self, batch_id: &BatchId) -> Result<ProcessOutcome> {
        let batch = match self.storage.get_batch(batch_id).await? {
            None => {
                tracing::warn!("Ready event for unknown batch, skipping");
                return Ok(ProcessOutcome::NotFound);
            }
            Some(AnyBatch::Done(_)) => {
                counter!("ferry_batches_duplicate_total").increment(1);
                tracing::info!("Batch already DONE, skipping duplicate event");
                return Ok(ProcessOutcome::AlreadyDone);
            }
            Some(AnyBatch::Staged(_)) => {
                tracing::warn!("Ready event for batch that is still STAGED, skipping");
                return Ok(ProcessOutcome::NotReady(BatchStatus::Staged));
            }
            Some(AnyBatch::Ready(batch)) => batch,
        };

        if let Some(fence) = &self.fence
            && !self.storage.check_fence(fence).await?
        {
            tracing::warn!(slot_id = %fence.slot_id, "Lease lost before processing batch");
            return Err(FerryError::LeaseLost {
                slot_id: fence.slot_id,
            });
        }

        let moved = self.move_files(&batch).await?;
        let fan_out = self.fan_out(&batch).await;

        match batch
            .commit(self.fence.as_ref(), self.clock.now(), self.storage.as_ref())
            .await?
        {
            CommitResult::Committed(_) => {
                tracing::info!(
                    moved = moved.len(),
                    published = fan_out.published,
                    publish_failures = fan_out.failed.len(),
                    "Batch committed"
                );
                Ok(ProcessOutcome::Committed(CommitSummary { moved, fan_out }))
            }
            CommitResult::AlreadyDone(_) => {
                counter!("ferry_batches_duplicate_total").increment(1);
                tracing::info!("Batch committed concurrently by another delivery");
                Ok(ProcessOutcome::AlreadyDone)
            }
        }
    }

    async fn move_files(&self, batch: &Batch<Ready>) -> Result<Vec<String>> {
        let mut moved = Vec::with_capacity(batch.contents().transfer_requests.len());
        for request in &batch.contents().transfer_requests {
            let key = self
                .mover
                .copy_to_production(request)
                .await
                .map_err(|e| {
                    counter!("ferry_transfer_failures_total").increment(1);
                    tracing::error!(
                        staging_key = %request.staging_key,
                        error = %e,
                        "Failed to move file to production"
                    );
                    FerryError::Transfer {
                        batch_id: batch.data.id.clone(),
                        staging_key: request.staging_key.clone(),
                        source: Box::new(e),
                    }
                })?;
            moved.push(key);
        }
        Ok(moved)
    }

    async fn fan_out(&self, batch: &Batch<Ready>) -> FanOutReport {
        let mut report = FanOutReport::default();
        let key = batch.data.id.as_str();
        let contents = batch.contents();

        for (topic, items) in [
            (&self.config.metadata_topic_a, &contents.metadata_a),
            (&self.config.metadata_topic_b, &contents.metadata_b),
        ] {
            for item in items {
                match self.publish_metadata(topic, key, item).await {
                    Ok(()) => report.published += 1,
                    Err(e) => {
                        counter!("ferry_publish_failures_total", "topic" => topic.clone())
                            .increment(1);
                        tracing::warn!(
                            topic = %topic,
                            filename = %item.filename,
                            error = %e,
                            "Failed to publish file metadata"
                        );
                        report.failed.push(FailedPublish {
                            topic: topic.clone(),
                            filename: item.filename.clone(),
                            error: e.to_string(),
                        });
                    }
                }
            }
        }
        report
    }

    async fn publish_metadata(&self, topic: &str, key: &str, item: &FileMetadata) -> Result<()> {
        let payload = Bytes::from(serde_json::to_vec(item)?);
        self.bus.publish(topic, key, payload).await
    }
}

#[async_trait]
impl<S: BatchStorage + LeaseStorage> EventHandler for BatchWorker<S> {
    fn supported_version(&self) -> u32 {
        BATCH_READY_VERSION
    }

    /// Only the id is taken from the payload; the stored record is authoritative.
    async fn handle(&self, envelope: &Envelope) -> Result<()> {
        let ready: ReadyRef = envelope.payload_as()?;
        self.process_batch(&ready.id).await.map(|_| ())
    }
}

/// The part of a ready event the worker trusts.
#[derive(Deserialize)]
struct ReadyRef {
    id: BatchId,
}
