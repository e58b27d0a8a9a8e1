//! PostgreSQL implementation of the slot registry and batch document store.
//!
//! Every lease-gated operation is one conditional statement, or a short
//! transaction that locks the slot row first. The claim is an upsert whose
//! `WHERE` clause carries the vacancy/staleness guard, so two instances racing
//! for the same slot serialize on the row and at most one sees a returned row.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use metrics::counter;
use sqlx::Row;
use sqlx::postgres::PgRow;
use sqlx::types::Json;
use uuid::Uuid;

use super::{BatchStorage, LeaseStorage};
use crate::domain::{
    AnyBatch, Batch, BatchId, BatchRecord, BatchStatus, Fence, FileMetadata, HolderId,
    LeaseRecord, Ready, SlotId, Staged, TransferRequest,
};
use crate::error::{FerryError, Result};

pub mod pool_provider;

pub use pool_provider::{PoolProvider, TestDbPools};

/// Storage backed by PostgreSQL.
///
/// # Example
/// ```ignore
/// let pool = PgPool::connect(&database_url).await?;
/// ferry::migrator().run(&pool).await?;
/// let store = Arc::new(PostgresStore::new(pool));
/// ```
#[derive(Clone)]
pub struct PostgresStore<P: PoolProvider = sqlx::PgPool> {
    pools: P,
}

impl<P: PoolProvider> PostgresStore<P> {
    pub fn new(pools: P) -> Self {
        Self { pools }
    }

    pub fn pools(&self) -> &P {
        &self.pools
    }
}

fn slot_from_row(row: &PgRow) -> Result<LeaseRecord> {
    let slot_id: i32 = row.try_get("slot_id")?;
    let holder_id: Option<Uuid> = row.try_get("holder_id")?;
    let epoch: i64 = row.try_get("epoch")?;
    Ok(LeaseRecord {
        slot_id: SlotId(slot_id as u32),
        holder_id: holder_id.map(HolderId),
        last_heartbeat_at: row.try_get("last_heartbeat_at")?,
        epoch: epoch as u64,
    })
}

fn batch_from_row(row: &PgRow) -> Result<AnyBatch> {
    let id = BatchId(row.try_get("id")?);
    let corrupt = |reason: String| FerryError::CorruptRecord {
        batch_id: id.clone(),
        reason,
    };

    let status: String = row.try_get("status")?;
    let status = status
        .parse::<BatchStatus>()
        .map_err(|e| corrupt(e.to_string()))?;
    let slot_id: Option<i32> = row.try_get("slot_id")?;
    let Json(transfer_requests): Json<Vec<TransferRequest>> = row
        .try_get("transfer_requests")
        .map_err(|e| corrupt(e.to_string()))?;
    let Json(metadata_group_a): Json<Vec<FileMetadata>> = row
        .try_get("metadata_group_a")
        .map_err(|e| corrupt(e.to_string()))?;
    let Json(metadata_group_b): Json<Vec<FileMetadata>> = row
        .try_get("metadata_group_b")
        .map_err(|e| corrupt(e.to_string()))?;

    AnyBatch::try_from(BatchRecord {
        id: id.clone(),
        status,
        created_at: row.try_get("created_at")?,
        ready_at: row.try_get("ready_at")?,
        done_at: row.try_get("done_at")?,
        submitted_by: row.try_get("submitted_by")?,
        slot_id: slot_id.map(|s| SlotId(s as u32)),
        transfer_requests,
        metadata_group_a,
        metadata_group_b,
    })
}

const BATCH_COLUMNS: &str = "id, status, submitted_by, slot_id, created_at, ready_at, done_at, \
     transfer_requests, metadata_group_a, metadata_group_b";

#[async_trait]
impl<P: PoolProvider> LeaseStorage for PostgresStore<P> {
    async fn try_claim_slot(
        &self,
        slot_id: SlotId,
        holder_id: HolderId,
        now: DateTime<Utc>,
        stale_before: DateTime<Utc>,
    ) -> Result<Option<LeaseRecord>> {
        let row = sqlx::query(
            r#"
            INSERT INTO slot_registry (slot_id, holder_id, last_heartbeat_at, epoch)
            VALUES ($1, $2, $3, 1)
            ON CONFLICT (slot_id) DO UPDATE SET
                holder_id = EXCLUDED.holder_id,
                last_heartbeat_at = EXCLUDED.last_heartbeat_at,
                epoch = slot_registry.epoch + 1
            WHERE slot_registry.holder_id IS NULL
               OR slot_registry.last_heartbeat_at IS NULL
               OR slot_registry.last_heartbeat_at < $4
            RETURNING slot_id, holder_id, last_heartbeat_at, epoch
            "#,
        )
        .bind(slot_id.0 as i32)
        .bind(*holder_id)
        .bind(now)
        .bind(stale_before)
        .fetch_optional(self.pools.write())
        .await?;

        row.as_ref().map(slot_from_row).transpose()
    }

    async fn renew_slot(&self, fence: &Fence, now: DateTime<Utc>) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE slot_registry SET last_heartbeat_at = $4
            WHERE slot_id = $1 AND holder_id = $2 AND epoch = $3
            "#,
        )
        .bind(fence.slot_id.0 as i32)
        .bind(*fence.holder_id)
        .bind(fence.epoch as i64)
        .bind(now)
        .execute(self.pools.write())
        .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn release_slot(&self, fence: &Fence) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE slot_registry SET holder_id = NULL, last_heartbeat_at = NULL
            WHERE slot_id = $1 AND holder_id = $2 AND epoch = $3
            "#,
        )
        .bind(fence.slot_id.0 as i32)
        .bind(*fence.holder_id)
        .bind(fence.epoch as i64)
        .execute(self.pools.write())
        .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn check_fence(&self, fence: &Fence) -> Result<bool> {
        let row = sqlx::query(
            "SELECT 1 AS held FROM slot_registry WHERE slot_id = $1 AND holder_id = $2 AND epoch = $3",
        )
        .bind(fence.slot_id.0 as i32)
        .bind(*fence.holder_id)
        .bind(fence.epoch as i64)
        .fetch_optional(self.pools.write())
        .await?;

        Ok(row.is_some())
    }

    async fn list_slots(&self) -> Result<Vec<LeaseRecord>> {
        let rows = sqlx::query(
            "SELECT slot_id, holder_id, last_heartbeat_at, epoch FROM slot_registry ORDER BY slot_id",
        )
        .fetch_all(self.pools.read())
        .await?;

        rows.iter().map(slot_from_row).collect()
    }
}

#[async_trait]
impl<P: PoolProvider> BatchStorage for PostgresStore<P> {
    async fn create_batch(&self, batch: &Batch<Staged>) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO batches (id, status, submitted_by, slot_id, created_at)
            VALUES ($1, 'STAGED', $2, $3, $4)
            "#,
        )
        .bind(batch.data.id.as_str())
        .bind(batch.data.submitted_by.as_deref())
        .bind(batch.data.slot_id.map(|s| s.0 as i32))
        .bind(batch.data.created_at)
        .execute(self.pools.write())
        .await
        .map_err(|e| {
            if let sqlx::Error::Database(db_err) = &e
                && db_err.code().as_deref() == Some("23505")
            {
                return FerryError::DuplicateBatch(batch.data.id.clone());
            }
            FerryError::Database(e)
        })?;

        Ok(())
    }

    async fn mark_ready(&self, batch: &Batch<Ready>) -> Result<()> {
        let contents = &batch.state.contents;
        let result = sqlx::query(
            r#"
            UPDATE batches SET
                status = 'READY',
                ready_at = $2,
                transfer_requests = $3,
                metadata_group_a = $4,
                metadata_group_b = $5
            WHERE id = $1 AND status = 'STAGED'
            "#,
        )
        .bind(batch.data.id.as_str())
        .bind(batch.state.ready_at)
        .bind(Json(&contents.transfer_requests))
        .bind(Json(&contents.metadata_a))
        .bind(Json(&contents.metadata_b))
        .execute(self.pools.write())
        .await?;

        if result.rows_affected() == 1 {
            return Ok(());
        }

        match self.get_batch(&batch.data.id).await? {
            None => Err(FerryError::BatchNotFound(batch.data.id.clone())),
            Some(existing) => Err(FerryError::InvalidState(
                batch.data.id.clone(),
                existing.status().to_string(),
                BatchStatus::Staged.to_string(),
            )),
        }
    }

    async fn get_batch(&self, id: &BatchId) -> Result<Option<AnyBatch>> {
        let row = sqlx::query(&format!("SELECT {BATCH_COLUMNS} FROM batches WHERE id = $1"))
            .bind(id.as_str())
            .fetch_optional(self.pools.write())
            .await?;

        row.as_ref().map(batch_from_row).transpose()
    }

    async fn commit_batch(
        &self,
        id: &BatchId,
        done_at: DateTime<Utc>,
        fence: Option<&Fence>,
    ) -> Result<bool> {
        let mut tx = self.pools.write().begin().await?;

        // Lock the batch row so the status check and the update see the same state.
        let status: Option<String> =
            sqlx::query_scalar("SELECT status FROM batches WHERE id = $1 FOR UPDATE")
                .bind(id.as_str())
                .fetch_optional(&mut *tx)
                .await?;
        let status = status
            .ok_or_else(|| FerryError::BatchNotFound(id.clone()))?
            .parse::<BatchStatus>()
            .map_err(|e| FerryError::Store(format!("Corrupt batch row: {}", e)))?;

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

        if let Some(fence) = fence {
            // FOR SHARE blocks a concurrent reclaim of the slot until we commit.
            let held = sqlx::query(
                r#"
                SELECT 1 AS held FROM slot_registry
                WHERE slot_id = $1 AND holder_id = $2 AND epoch = $3
                FOR SHARE
                "#,
            )
            .bind(fence.slot_id.0 as i32)
            .bind(*fence.holder_id)
            .bind(fence.epoch as i64)
            .fetch_optional(&mut *tx)
            .await?;

            if held.is_none() {
                return Err(FerryError::LeaseLost {
                    slot_id: fence.slot_id,
                });
            }
        }

        sqlx::query("UPDATE batches SET status = 'DONE', done_at = $2 WHERE id = $1")
            .bind(id.as_str())
            .bind(done_at)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;

        Ok(true)
    }

    async fn list_ready_before(&self, cutoff: DateTime<Utc>) -> Result<Vec<Batch<Ready>>> {
        let rows = sqlx::query(&format!(
            "SELECT {BATCH_COLUMNS} FROM batches WHERE status = 'READY' AND ready_at < $1 ORDER BY ready_at"
        ))
        .bind(cutoff)
        .fetch_all(self.pools.read())
        .await?;

        // One undecodable document must not hold back the rest of the pass.
        Ok(rows
            .iter()
            .filter_map(|row| match batch_from_row(row) {
                Ok(AnyBatch::Ready(b)) => Some(b),
                Ok(_) => None,
                Err(e) => {
                    counter!("ferry_corrupt_batches_total").increment(1);
                    tracing::warn!(error = %e, "Skipping undecodable batch in recovery scan");
                    None
                }
            })
            .collect())
    }
}

#[cfg(all(test, feature = "pg-tests"))]
mod tests {
    use super::*;
    use crate::domain::{BatchContents, BatchData};
    use chrono::Duration;
    use sqlx::PgPool;

    fn staged(id: &str) -> Batch<Staged> {
        Batch {
            state: Staged {},
            data: BatchData {
                id: BatchId::from(id),
                created_at: Utc::now(),
                submitted_by: Some("alice".to_string()),
                slot_id: Some(SlotId(2)),
            },
        }
    }

    #[sqlx::test]
    async fn test_claim_is_exclusive_until_stale(pool: PgPool) {
        let store = PostgresStore::new(TestDbPools::new(pool).await.unwrap());
        let now = Utc::now();
        let timeout = Duration::seconds(30);
        let a = HolderId::generate();
        let b = HolderId::generate();

        let first = store
            .try_claim_slot(SlotId(0), a, now, now - timeout)
            .await
            .unwrap()
            .expect("vacant slot should be claimable");
        assert_eq!(first.epoch, 1);

        assert!(
            store
                .try_claim_slot(SlotId(0), b, now, now - timeout)
                .await
                .unwrap()
                .is_none()
        );

        let later = now + Duration::seconds(31);
        let second = store
            .try_claim_slot(SlotId(0), b, later, later - timeout)
            .await
            .unwrap()
            .expect("stale slot should be reclaimable");
        assert_eq!(second.holder_id, Some(b));
        assert_eq!(second.epoch, 2);

        let old_fence = Fence {
            slot_id: SlotId(0),
            holder_id: a,
            epoch: 1,
        };
        assert!(!store.renew_slot(&old_fence, later).await.unwrap());
        assert!(!store.release_slot(&old_fence).await.unwrap());
    }

    #[sqlx::test]
    async fn test_batch_lifecycle_and_fenced_commit(pool: PgPool) {
        let store = PostgresStore::new(TestDbPools::new(pool).await.unwrap());
        let now = Utc::now();
        let holder = HolderId::generate();
        let record = store
            .try_claim_slot(SlotId(2), holder, now, now)
            .await
            .unwrap()
            .unwrap();
        let fence = Fence {
            slot_id: SlotId(2),
            holder_id: holder,
            epoch: record.epoch,
        };

        let batch = staged("B1");
        store.create_batch(&batch).await.unwrap();
        let ready = Batch {
            data: batch.data.clone(),
            state: Ready {
                ready_at: now - Duration::minutes(10),
                contents: BatchContents {
                    transfer_requests: vec![TransferRequest::new("24/05/01/hash1", "u1", "a.txt")],
                    metadata_a: vec![FileMetadata::new("a.txt", BatchId::from("B1"), 3)],
                    metadata_b: vec![],
                },
            },
        };
        store.mark_ready(&ready).await.unwrap();
        assert!(matches!(
            store.mark_ready(&ready).await,
            Err(FerryError::InvalidState(..))
        ));

        let stuck = store.list_ready_before(now).await.unwrap();
        assert_eq!(stuck.len(), 1);
        assert_eq!(stuck[0].state.contents, ready.state.contents);

        let stale_fence = Fence { epoch: 99, ..fence };
        assert!(matches!(
            store.commit_batch(&ready.data.id, now, Some(&stale_fence)).await,
            Err(FerryError::LeaseLost { .. })
        ));

        assert!(store.commit_batch(&ready.data.id, now, Some(&fence)).await.unwrap());
        assert!(!store.commit_batch(&ready.data.id, now, Some(&fence)).await.unwrap());

        let done = store.get_batch(&ready.data.id).await.unwrap().unwrap();
        assert_eq!(done.status(), BatchStatus::Done);
        assert!(store.list_ready_before(now).await.unwrap().is_empty());
    }

    #[sqlx::test]
    async fn test_undecodable_row_is_skipped_by_scan(pool: PgPool) {
        let store = PostgresStore::new(TestDbPools::new(pool.clone()).await.unwrap());
        let now = Utc::now();

        sqlx::query(
            r#"
            INSERT INTO batches (id, status, ready_at, metadata_group_a)
            VALUES ('BAD', 'READY', $1, '{"not": "a list"}'::jsonb)
            "#,
        )
        .bind(now - Duration::minutes(20))
        .execute(&pool)
        .await
        .unwrap();

        let batch = staged("B1");
        store.create_batch(&batch).await.unwrap();
        let ready = Batch {
            data: batch.data.clone(),
            state: Ready {
                ready_at: now - Duration::minutes(10),
                contents: BatchContents::default(),
            },
        };
        store.mark_ready(&ready).await.unwrap();

        let stuck = store.list_ready_before(now).await.unwrap();
        assert_eq!(stuck.len(), 1);
        assert_eq!(stuck[0].data.id, BatchId::from("B1"));

        let err = store.get_batch(&BatchId::from("BAD")).await.unwrap_err();
        assert!(matches!(err, FerryError::CorruptRecord { .. }));
        assert!(!err.is_transient());
    }

    #[sqlx::test]
    async fn test_duplicate_create_is_a_permanent_error(pool: PgPool) {
        let store = PostgresStore::new(TestDbPools::new(pool).await.unwrap());
        let batch = staged("B1");
        store.create_batch(&batch).await.unwrap();

        let err = store.create_batch(&batch).await.unwrap_err();
        assert!(matches!(err, FerryError::DuplicateBatch(_)));
        assert!(!err.is_transient());
    }
}
