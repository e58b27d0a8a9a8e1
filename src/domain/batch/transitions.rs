//! Persisted batch transitions.
//!
//! ```text
//! Batch<Staged> ──mark_ready()──> Batch<Ready> ──commit()──> Batch<Done>
//! ```
//!
//! Every transition takes the instant it happens at instead of reading the
//! wall clock, so callers drive time (and tests can pin it).

use chrono::{DateTime, Utc};
use metrics::counter;

use crate::{
    domain::lease::Fence,
    error::Result,
    storage::BatchStorage,
};

use super::{Batch, BatchContents, BatchData, BatchId, Done, Ready, Staged};

/// Result of committing a READY batch.
#[derive(Debug, Clone, PartialEq)]
pub enum CommitResult {
    /// This call moved the record to DONE.
    Committed(Batch<Done>),
    /// Another delivery got there first; nothing was written.
    AlreadyDone(BatchId),
}

impl Batch<Staged> {
    /// Persist a new batch in STAGED.
    pub async fn create<S: BatchStorage + ?Sized>(data: BatchData, storage: &S) -> Result<Self> {
        let batch = Batch {
            state: Staged {},
            data,
        };
        storage.create_batch(&batch).await?;
        Ok(batch)
    }

    /// STAGED → READY. Transfer requests and both metadata groups are written
    /// in the same update as the status.
    pub async fn mark_ready<S: BatchStorage + ?Sized>(
        self,
        contents: BatchContents,
        now: DateTime<Utc>,
        storage: &S,
    ) -> Result<Batch<Ready>> {
        let batch = Batch {
            data: self.data,
            state: Ready {
                ready_at: now,
                contents,
            },
        };
        storage.mark_ready(&batch).await?;
        counter!("ferry_batches_ready_total").increment(1);
        Ok(batch)
    }
}

impl Batch<Ready> {
    pub fn contents(&self) -> &BatchContents {
        &self.state.contents
    }

    /// READY → DONE.
    ///
    /// With a fence, the write only lands if the registry still names the
    /// fence's holder and epoch; otherwise it fails with `LeaseLost`.
    pub async fn commit<S: BatchStorage + ?Sized>(
        self,
        fence: Option<&Fence>,
        now: DateTime<Utc>,
        storage: &S,
    ) -> Result<CommitResult> {
        if !storage.commit_batch(&self.data.id, now, fence).await? {
            tracing::debug!(batch_id = %self.data.id, "Batch already committed, skipping");
            return Ok(CommitResult::AlreadyDone(self.data.id));
        }

        counter!("ferry_batches_done_total").increment(1);
        Ok(CommitResult::Committed(Batch {
            data: self.data,
            state: Done {
                ready_at: self.state.ready_at,
                done_at: now,
                contents: self.state.contents,
            },
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{AnyBatch, BatchStatus, TransferRequest};
    use crate::storage::memory::InMemoryStore;

    fn data(id: &str) -> BatchData {
        BatchData {
            id: BatchId::from(id),
            created_at: Utc::now(),
            submitted_by: None,
            slot_id: None,
        }
    }

    #[tokio::test]
    async fn test_ready_then_commit_then_commit_again() {
        let store = InMemoryStore::new();
        let staged = Batch::<Staged>::create(data("B1"), &store).await.unwrap();
        let contents = BatchContents {
            transfer_requests: vec![TransferRequest::new("24/05/01/h", "u1", "a.txt")],
            ..Default::default()
        };
        let ready = staged.mark_ready(contents, Utc::now(), &store).await.unwrap();

        let first = ready.clone().commit(None, Utc::now(), &store).await.unwrap();
        assert!(matches!(first, CommitResult::Committed(_)));

        let second = ready.commit(None, Utc::now(), &store).await.unwrap();
        assert_eq!(second, CommitResult::AlreadyDone(BatchId::from("B1")));

        let stored = store.get_batch(&BatchId::from("B1")).await.unwrap().unwrap();
        assert_eq!(stored.status(), BatchStatus::Done);
        assert!(matches!(stored, AnyBatch::Done(_)));
    }

    #[tokio::test]
    async fn test_mark_ready_twice_is_rejected() {
        let store = InMemoryStore::new();
        let staged = Batch::<Staged>::create(data("B2"), &store).await.unwrap();
        staged
            .clone()
            .mark_ready(BatchContents::default(), Utc::now(), &store)
            .await
            .unwrap();
        assert!(
            staged
                .mark_ready(BatchContents::default(), Utc::now(), &store)
                .await
                .is_err()
        );
    }
}
