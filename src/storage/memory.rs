//! In-memory implementation of both storage traits.
//!
//! One mutex guards the slot registry and the batch documents together, so
//! a fenced commit checks the registry and flips the record in one critical
//! section, the same guarantee the PostgreSQL store gets from a single
//! statement.
//!
//! Used by the test suite and for embedding the core without a database.
//! Fault injection hooks let tests simulate an unavailable store and
//! failed commits.

use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;

use super::{BatchStorage, LeaseStorage};
use crate::domain::{
    AnyBatch, Batch, BatchId, BatchRecord, BatchStatus, Fence, HolderId, LeaseRecord, Ready,
    SlotId, Staged,
};
use crate::error::{FerryError, Result};

#[derive(Default)]
struct State {
    slots: BTreeMap<SlotId, LeaseRecord>,
    batches: HashMap<BatchId, BatchRecord>,
    unavailable: bool,
    failing_commits: usize,
}

impl State {
    fn check_available(&self) -> Result<()> {
        if self.unavailable {
            return Err(FerryError::Store("store unavailable".to_string()));
        }
        Ok(())
    }

    fn fence_holds(&self, fence: &Fence) -> bool {
        self.slots
            .get(&fence.slot_id)
            .is_some_and(|record| record.matches(fence))
    }
}

/// Storage backed by process memory.
#[derive(Default)]
pub struct InMemoryStore {
    state: Mutex<State>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent call fail with a store error until reset.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.state.lock().unavailable = unavailable;
    }

    /// Fail the next `n` calls to `commit_batch` with a store error.
    pub fn fail_next_commits(&self, n: usize) {
        self.state.lock().failing_commits = n;
    }

    /// Overwrite a slot row directly, bypassing the claim protocol.
    pub fn put_slot(&self, record: LeaseRecord) {
        self.state.lock().slots.insert(record.slot_id, record);
    }

    /// The raw record for a batch, as a reader of the document store sees it.
    pub fn record(&self, id: &BatchId) -> Option<BatchRecord> {
        self.state.lock().batches.get(id).cloned()
    }
}

#[async_trait]
impl LeaseStorage for InMemoryStore {
    async fn try_claim_slot(
        &self,
        slot_id: SlotId,
        holder_id: HolderId,
        now: DateTime<Utc>,
        stale_before: DateTime<Utc>,
    ) -> Result<Option<LeaseRecord>> {
        let mut state = self.state.lock();
        state.check_available()?;

        let current = state
            .slots
            .get(&slot_id)
            .cloned()
            .unwrap_or_else(|| LeaseRecord::vacant(slot_id));

        let claimable = current.holder_id.is_none()
            || current
                .last_heartbeat_at
                .is_none_or(|last| last < stale_before);
        if !claimable {
            return Ok(None);
        }

        let claimed = LeaseRecord {
            slot_id,
            holder_id: Some(holder_id),
            last_heartbeat_at: Some(now),
            epoch: current.epoch + 1,
        };
        state.slots.insert(slot_id, claimed.clone());
        Ok(Some(claimed))
    }

    async fn renew_slot(&self, fence: &Fence, now: DateTime<Utc>) -> Result<bool> {
        let mut state = self.state.lock();
        state.check_available()?;

        match state.slots.get_mut(&fence.slot_id) {
            Some(record) if record.matches(fence) => {
                record.last_heartbeat_at = Some(now);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn release_slot(&self, fence: &Fence) -> Result<bool> {
        let mut state = self.state.lock();
        state.check_available()?;

        match state.slots.get_mut(&fence.slot_id) {
            Some(record) if record.matches(fence) => {
                record.holder_id = None;
                record.last_heartbeat_at = None;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn check_fence(&self, fence: &Fence) -> Result<bool> {
        let state = self.state.lock();
        state.check_available()?;
        Ok(state.fence_holds(fence))
    }

    async fn list_slots(&self) -> Result<Vec<LeaseRecord>> {
        let state = self.state.lock();
        state.check_available()?;
        Ok(state.slots.values().cloned().collect())
    }
}

#[async_trait]
impl BatchStorage for InMemoryStore {
    async fn create_batch(&self, batch: &Batch<Staged>) -> Result<()> {
        let mut state = self.state.lock();
        state.check_available()?;

        if state.batches.contains_key(&batch.data.id) {
            return Err(FerryError::DuplicateBatch(batch.data.id.clone()));
        }
        let record = BatchRecord::from(&AnyBatch::Staged(batch.clone()));
        state.batches.insert(batch.data.id.clone(), record);
        Ok(())
    }

    async fn mark_ready(&self, batch: &Batch<Ready>) -> Result<()> {
        let mut state = self.state.lock();
        state.check_available()?;

        let id = &batch.data.id;
        let record = state
            .batches
            .get_mut(id)
            .ok_or_else(|| FerryError::BatchNotFound(id.clone()))?;
        if record.status != BatchStatus::Staged {
            return Err(FerryError::InvalidState(
                id.clone(),
                record.status.to_string(),
                BatchStatus::Staged.to_string(),
            ));
        }
        *record = BatchRecord::from(batch);
        Ok(())
    }

    async fn get_batch(&self, id: &BatchId) -> Result<Option<AnyBatch>> {
        let state = self.state.lock();
        state.check_available()?;

        state
            .batches
            .get(id)
            .cloned()
            .map(AnyBatch::try_from)
            .transpose()
    }

    async fn commit_batch(
        &self,
        id: &BatchId,
        done_at: DateTime<Utc>,
        fence: Option<&Fence>,
    ) -> Result<bool> {
        let mut state = self.state.lock();
        state.check_available()?;

        if state.failing_commits > 0 {
            state.failing_commits -= 1;
            return Err(FerryError::Store(format!("injected commit failure for {id}")));
        }

        let status = state
            .batches
            .get(id)
            .map(|record| record.status)
            .ok_or_else(|| FerryError::BatchNotFound(id.clone()))?;
        match status {
            BatchStatus::Done => return Ok(false),
            BatchStatus::Staged => {
                return Err(FerryError::InvalidState(
                    id.clone(),
                    status.to_string(),
                    BatchStatus::Ready.to_string(),
                ));
            }
            BatchStatus::Ready => {}
        }

        if let Some(fence) = fence
            && !state.fence_holds(fence)
        {
            return Err(FerryError::LeaseLost {
                slot_id: fence.slot_id,
            });
        }

        if let Some(record) = state.batches.get_mut(id) {
            record.status = BatchStatus::Done;
            record.done_at = Some(done_at);
        }
        Ok(true)
    }

    async fn list_ready_before(&self, cutoff: DateTime<Utc>) -> Result<Vec<Batch<Ready>>> {
        let state = self.state.lock();
        state.check_available()?;

        let mut ready = state
            .batches
            .values()
            .filter(|record| record.status == BatchStatus::Ready)
            .filter(|record| record.ready_at.is_some_and(|at| at < cutoff))
            .cloned()
            .filter_map(|record| {
                let id = record.id.clone();
                match AnyBatch::try_from(record) {
                    Ok(AnyBatch::Ready(b)) => Some(b),
                    Ok(_) => None,
                    Err(e) => {
                        tracing::warn!(batch_id = %id, error = %e, "Skipping undecodable batch");
                        None
                    }
                }
            })
            .collect::<Vec<_>>();
        ready.sort_by_key(|b| b.state.ready_at);
        Ok(ready)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[tokio::test]
    async fn test_claim_increments_epoch_and_blocks_live_holder() {
        let store = InMemoryStore::new();
        let now = Utc::now();
        let stale_before = now - Duration::seconds(30);
        let a = HolderId::generate();
        let b = HolderId::generate();

        let first = store
            .try_claim_slot(SlotId(0), a, now, stale_before)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(first.epoch, 1);

        let blocked = store
            .try_claim_slot(SlotId(0), b, now, stale_before)
            .await
            .unwrap();
        assert!(blocked.is_none());

        let later = now + Duration::seconds(31);
        let second = store
            .try_claim_slot(SlotId(0), b, later, later - Duration::seconds(30))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(second.holder_id, Some(b));
        assert_eq!(second.epoch, 2);
    }

    #[tokio::test]
    async fn test_release_keeps_epoch_and_requires_matching_fence() {
        let store = InMemoryStore::new();
        let now = Utc::now();
        let holder = HolderId::generate();
        let record = store
            .try_claim_slot(SlotId(1), holder, now, now)
            .await
            .unwrap()
            .unwrap();
        let fence = Fence {
            slot_id: SlotId(1),
            holder_id: holder,
            epoch: record.epoch,
        };

        let wrong = Fence {
            holder_id: HolderId::generate(),
            ..fence
        };
        assert!(!store.release_slot(&wrong).await.unwrap());
        assert!(store.release_slot(&fence).await.unwrap());
        assert!(!store.release_slot(&fence).await.unwrap());

        let slots = store.list_slots().await.unwrap();
        assert_eq!(slots[0].holder_id, None);
        assert_eq!(slots[0].epoch, 1);
    }

    #[tokio::test]
    async fn test_unavailable_store_fails_every_call() {
        let store = InMemoryStore::new();
        store.set_unavailable(true);
        assert!(matches!(
            store.get_batch(&BatchId::from("x")).await,
            Err(FerryError::Store(_))
        ));
        store.set_unavailable(false);
        assert!(store.get_batch(&BatchId::from("x")).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_duplicate_create_is_a_permanent_error() {
        let store = InMemoryStore::new();
        let batch = Batch {
            state: Staged {},
            data: crate::domain::BatchData {
                id: BatchId::from("B1"),
                created_at: Utc::now(),
                submitted_by: None,
                slot_id: None,
            },
        };
        store.create_batch(&batch).await.unwrap();

        let err = store.create_batch(&batch).await.unwrap_err();
        assert!(matches!(err, FerryError::DuplicateBatch(_)));
        assert!(!err.is_transient());
    }
}
