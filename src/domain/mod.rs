//! Core domain types for the ferry coordination core.
//!
//! Types are plain data; the batch state transitions take a storage handle
//! so each step is persisted as it happens.
//!
//! - Slot leases, lease handles and fences
//! - Batches, the batch typestate machine and its wire record
//! - Staging and production object key layout

pub mod batch;
pub mod keys;
pub mod lease;

pub use batch::{
    AnyBatch, Batch, BatchContents, BatchData, BatchId, BatchRecord, BatchState, BatchStatus,
    Done, FileMetadata, Ready, Staged, Tag, TransferRequest,
};
pub use batch::transitions::CommitResult;
pub use keys::StagingKey;
pub use lease::{Fence, HeartbeatOutcome, HolderId, LeaseHandle, LeaseRecord, SlotId};
