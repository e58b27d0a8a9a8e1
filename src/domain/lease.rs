//! Slot lease types.
//!
//! A lease is a time-bounded, renewable claim on one slot of a fixed pool.
//! The registry row ([`LeaseRecord`]) is what every instance sees; the
//! [`LeaseHandle`] is what the winning instance holds and threads through
//! `heartbeat` and `release` calls.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Index of a slot in the pool, in `[0, pool_size)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SlotId(pub u32);

impl From<u32> for SlotId {
    fn from(id: u32) -> Self {
        SlotId(id)
    }
}

impl std::fmt::Display for SlotId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Opaque per-process token identifying a lease holder.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct HolderId(pub Uuid);

impl HolderId {
    /// Generate a fresh holder token.
    pub fn generate() -> Self {
        HolderId(Uuid::new_v4())
    }
}

impl From<Uuid> for HolderId {
    fn from(uuid: Uuid) -> Self {
        HolderId(uuid)
    }
}

impl std::ops::Deref for HolderId {
    type Target = Uuid;
    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl std::fmt::Display for HolderId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", &self.0.to_string()[..8])
    }
}

/// One row of the slot registry.
///
/// A vacant slot has neither holder nor heartbeat. `epoch` counts successful
/// claims of the slot and never decreases, including across releases.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeaseRecord {
    pub slot_id: SlotId,
    pub holder_id: Option<HolderId>,
    pub last_heartbeat_at: Option<DateTime<Utc>>,
    pub epoch: u64,
}

impl LeaseRecord {
    /// A record for a slot nobody has claimed yet.
    pub fn vacant(slot_id: SlotId) -> Self {
        Self {
            slot_id,
            holder_id: None,
            last_heartbeat_at: None,
            epoch: 0,
        }
    }

    /// Stale means `now - last_heartbeat_at > timeout`.
    pub fn is_stale(&self, now: DateTime<Utc>, timeout: Duration) -> bool {
        match self.last_heartbeat_at {
            Some(last) => now - last > timeout,
            None => true,
        }
    }

    /// A slot can be claimed when it has no holder or its holder went stale.
    pub fn is_claimable(&self, now: DateTime<Utc>, timeout: Duration) -> bool {
        self.holder_id.is_none() || self.is_stale(now, timeout)
    }

    /// Whether the stored holder and epoch still match `fence`.
    pub fn matches(&self, fence: &Fence) -> bool {
        self.slot_id == fence.slot_id
            && self.holder_id == Some(fence.holder_id)
            && self.epoch == fence.epoch
    }
}

/// Proof of a lease grant, checked by every lease-gated write.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Fence {
    pub slot_id: SlotId,
    pub holder_id: HolderId,
    pub epoch: u64,
}

/// A lease held by this process, returned by `acquire`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeaseHandle {
    slot_id: SlotId,
    holder_id: HolderId,
    epoch: u64,
    acquired_at: DateTime<Utc>,
}

impl LeaseHandle {
    pub(crate) fn new(
        slot_id: SlotId,
        holder_id: HolderId,
        epoch: u64,
        acquired_at: DateTime<Utc>,
    ) -> Self {
        Self {
            slot_id,
            holder_id,
            epoch,
            acquired_at,
        }
    }

    /// The slot this process was assigned.
    pub fn slot_id(&self) -> SlotId {
        self.slot_id
    }

    pub fn holder_id(&self) -> HolderId {
        self.holder_id
    }

    /// Generation of the grant; strictly greater than any earlier grant of the slot.
    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    pub fn acquired_at(&self) -> DateTime<Utc> {
        self.acquired_at
    }

    /// Fence to attach to lease-gated writes.
    pub fn fence(&self) -> Fence {
        Fence {
            slot_id: self.slot_id,
            holder_id: self.holder_id,
            epoch: self.epoch,
        }
    }
}

/// Result of one heartbeat.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeartbeatOutcome {
    /// The registry still names this holder; heartbeat refreshed.
    Renewed { at: DateTime<Utc> },
    /// Another instance reclaimed the slot (or it was released).
    Lost,
}
