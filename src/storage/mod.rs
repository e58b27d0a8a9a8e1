//! Storage traits for the slot registry and the batch document store.
//!
//! Both traits are narrow on purpose: every method is a single atomic,
//! conditional write or a read. The lease manager, worker and scanner never
//! read-then-write across two calls when a single call can carry the guard.

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::domain::{
    AnyBatch, Batch, BatchId, Fence, HolderId, LeaseRecord, Ready, SlotId, Staged,
};
use crate::error::Result;

pub mod memory;
#[cfg(feature = "postgres")]
pub mod postgres;

/// Atomic operations on the shared slot registry.
#[async_trait]
pub trait LeaseStorage: Send + Sync {
    /// Claim `slot_id` for `holder_id` if it is vacant, has never been
    /// written, or its last heartbeat is older than `stale_before`.
    ///
    /// The check and the write are one atomic step. On success the slot's
    /// epoch is incremented and the new record is returned; `None` means a
    /// live holder owns the slot.
    async fn try_claim_slot(
        &self,
        slot_id: SlotId,
        holder_id: HolderId,
        now: DateTime<Utc>,
        stale_before: DateTime<Utc>,
    ) -> Result<Option<LeaseRecord>>;

    /// Refresh the heartbeat, only if the registry still matches `fence`.
    async fn renew_slot(&self, fence: &Fence, now: DateTime<Utc>) -> Result<bool>;

    /// Vacate the slot, only if the registry still matches `fence`. The epoch is kept.
    async fn release_slot(&self, fence: &Fence) -> Result<bool>;

    /// Whether the registry still matches `fence`.
    async fn check_fence(&self, fence: &Fence) -> Result<bool>;

    /// Every slot row that has ever been written, ordered by slot id.
    async fn list_slots(&self) -> Result<Vec<LeaseRecord>>;
}

/// Document store for batch records.
#[async_trait]
pub trait BatchStorage: Send + Sync {
    /// Insert a new STAGED record. Fails if the id already exists.
    async fn create_batch(&self, batch: &Batch<Staged>) -> Result<()>;

    /// STAGED → READY with the contents, in one conditional update.
    ///
    /// Fails with `BatchNotFound` for an unknown id and `InvalidState` for a
    /// record that is not STAGED.
    async fn mark_ready(&self, batch: &Batch<Ready>) -> Result<()>;

    /// Load a batch by id. Reads are strongly consistent with prior writes.
    async fn get_batch(&self, id: &BatchId) -> Result<Option<AnyBatch>>;

    /// READY → DONE, conditional on the record still being READY.
    ///
    /// Returns `false` when the record was already DONE. With a fence, the
    /// update also requires the registry to match it and fails with
    /// `LeaseLost` otherwise.
    async fn commit_batch(
        &self,
        id: &BatchId,
        done_at: DateTime<Utc>,
        fence: Option<&Fence>,
    ) -> Result<bool>;

    /// READY batches whose `ready_at` is strictly before `cutoff`, oldest first.
    async fn list_ready_before(&self, cutoff: DateTime<Utc>) -> Result<Vec<Batch<Ready>>>;
}
