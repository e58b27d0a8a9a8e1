//! Lease manager: gives each live instance a distinct slot from a fixed pool.
//!
//! # Protocol
//!
//! - `acquire` walks slots `0..pool_size` in ascending order and claims the
//!   first one that is vacant or whose holder stopped heartbeating more than
//!   `lease_timeout` ago. The check-and-claim is one atomic storage call.
//! - `heartbeat` refreshes the claim only while the registry still names this
//!   holder at this epoch; otherwise it reports [`HeartbeatOutcome::Lost`].
//! - `release` vacates the slot only if this holder still owns it.
//!
//! Every successful claim bumps the slot's epoch, so a [`LeaseHandle`] doubles
//! as a fencing token for lease-gated writes.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use metrics::counter;

use crate::clock::{Clock, SystemClock};
use crate::config::{LeaseConfig, RetryConfig};
use crate::domain::{HeartbeatOutcome, HolderId, LeaseHandle, LeaseRecord, SlotId};
use crate::error::{FerryError, Result};
use crate::storage::LeaseStorage;

/// What the heartbeat task should do on this tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeartbeatAction {
    /// Refresh the lease.
    Renew,
    /// The last successful renewal is older than the lease timeout: another
    /// instance may already hold the slot, so stop acting under it.
    Halt,
}

/// Decide what the heartbeat task does at `now`, given when the lease was
/// last confirmed.
pub fn plan_heartbeat(
    now: DateTime<Utc>,
    last_renewed: DateTime<Utc>,
    lease_timeout: Duration,
) -> HeartbeatAction {
    if now - last_renewed > lease_timeout {
        HeartbeatAction::Halt
    } else {
        HeartbeatAction::Renew
    }
}

/// Slot leasing for one process.
pub struct LeaseManager<S: LeaseStorage> {
    storage: Arc<S>,
    holder_id: HolderId,
    pool_size: u32,
    lease_timeout: Duration,
    clock: Arc<dyn Clock>,
}

impl<S: LeaseStorage> LeaseManager<S> {
    /// A manager with a fresh holder id and the system clock.
    pub fn new(storage: Arc<S>, config: &LeaseConfig) -> Self {
        Self {
            storage,
            holder_id: HolderId::generate(),
            pool_size: config.pool_size,
            lease_timeout: config.lease_timeout(),
            clock: Arc::new(SystemClock),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_holder_id(mut self, holder_id: HolderId) -> Self {
        self.holder_id = holder_id;
        self
    }

    pub fn holder_id(&self) -> HolderId {
        self.holder_id
    }

    pub fn pool_size(&self) -> u32 {
        self.pool_size
    }

    pub fn lease_timeout(&self) -> Duration {
        self.lease_timeout
    }

    /// One pass over the pool. Fails with `ResourceExhausted` when every slot
    /// is held by a live instance.
    #[tracing::instrument(skip(self), fields(holder_id = %self.holder_id))]
    pub async fn acquire(&self) -> Result<LeaseHandle> {
        let now = self.clock.now();
        let stale_before = now - self.lease_timeout;
        let mut last_error = None;
        let mut errors = 0;

        for slot in 0..self.pool_size {
            let slot_id = SlotId(slot);
            match self
                .storage
                .try_claim_slot(slot_id, self.holder_id, now, stale_before)
                .await
            {
                Ok(Some(record)) => {
                    counter!("ferry_lease_acquired_total").increment(1);
                    tracing::info!(
                        slot_id = %slot_id,
                        epoch = record.epoch,
                        "Acquired lease"
                    );
                    return Ok(LeaseHandle::new(slot_id, self.holder_id, record.epoch, now));
                }
                Ok(None) => {
                    tracing::trace!(slot_id = %slot_id, "Slot held by a live instance");
                }
                Err(e) => {
                    tracing::warn!(slot_id = %slot_id, error = %e, "Failed to claim slot");
                    errors += 1;
                    last_error = Some(e);
                }
            }
        }

        // If the store failed on every slot, that is the real cause.
        if let Some(e) = last_error
            && errors == self.pool_size
        {
            return Err(e);
        }

        counter!("ferry_lease_exhausted_total").increment(1);
        Err(FerryError::ResourceExhausted {
            pool_size: self.pool_size,
        })
    }

    /// Repeat [`acquire`](Self::acquire) up to `retry.max_attempts` passes with
    /// exponential backoff between them.
    pub async fn acquire_with_retry(&self, retry: &RetryConfig) -> Result<LeaseHandle> {
        let attempts = retry.max_attempts.max(1);
        let mut attempt = 0;
        loop {
            match self.acquire().await {
                Ok(handle) => return Ok(handle),
                Err(e) if attempt + 1 < attempts => {
                    let delay = retry.backoff_for(attempt);
                    tracing::info!(
                        attempt = attempt + 1,
                        max_attempts = attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Lease acquisition failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Refresh the heartbeat on `handle`'s slot.
    pub async fn heartbeat(&self, handle: &LeaseHandle) -> Result<HeartbeatOutcome> {
        let now = self.clock.now();
        if self.storage.renew_slot(&handle.fence(), now).await? {
            tracing::trace!(slot_id = %handle.slot_id(), "Heartbeat renewed");
            return Ok(HeartbeatOutcome::Renewed { at: now });
        }

        counter!("ferry_lease_lost_total").increment(1);
        tracing::warn!(
            slot_id = %handle.slot_id(),
            epoch = handle.epoch(),
            "Lease lost: slot is held by another instance"
        );
        Ok(HeartbeatOutcome::Lost)
    }

    /// Give the slot back. Returns `false` if this holder no longer owned it,
    /// in which case nothing was changed.
    pub async fn release(&self, handle: LeaseHandle) -> Result<bool> {
        let released = self.storage.release_slot(&handle.fence()).await?;
        if released {
            tracing::info!(slot_id = %handle.slot_id(), "Released lease");
        } else {
            tracing::warn!(
                slot_id = %handle.slot_id(),
                "Lease already taken over, nothing to release"
            );
        }
        Ok(released)
    }

    /// Whether the registry still names `handle` as the holder of its slot.
    pub async fn is_current(&self, handle: &LeaseHandle) -> Result<bool> {
        self.storage.check_fence(&handle.fence()).await
    }

    /// Snapshot of the slot registry.
    pub async fn slots(&self) -> Result<Vec<LeaseRecord>> {
        self.storage.list_slots().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_plan_heartbeat_halts_only_past_timeout() {
        let now = Utc::now();
        let timeout = Duration::seconds(30);
        assert_eq!(
            plan_heartbeat(now, now - Duration::seconds(10), timeout),
            HeartbeatAction::Renew
        );
        assert_eq!(plan_heartbeat(now, now - timeout, timeout), HeartbeatAction::Renew);
        assert_eq!(
            plan_heartbeat(now, now - Duration::seconds(31), timeout),
            HeartbeatAction::Halt
        );
    }
}
