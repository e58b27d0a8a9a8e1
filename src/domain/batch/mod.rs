//! Batch types and the batch lifecycle typestate.
//!
//! A batch is the unit of work: a set of staged files plus the metadata to
//! announce once they reach production. Each batch progresses through
//! distinct states, enforced at compile time:
//!
//! ```text
//! Batch<Staged> ──mark_ready()──> Batch<Ready> ──commit()──> Batch<Done>
//! ```
//!
//! Storage hands batches back as [`AnyBatch`]; the wire and document shape is
//! the flat [`BatchRecord`].

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::lease::SlotId;
use crate::error::{FerryError, Result};

pub mod transitions;

/// Unique identifier for a batch.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BatchId(pub String);

impl BatchId {
    /// Generate a fresh random batch id.
    pub fn generate() -> Self {
        BatchId(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for BatchId {
    fn from(id: &str) -> Self {
        BatchId(id.to_string())
    }
}

impl From<String> for BatchId {
    fn from(id: String) -> Self {
        BatchId(id)
    }
}

impl std::fmt::Display for BatchId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Persisted status. Ordered: a batch only ever moves to a greater status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum BatchStatus {
    Staged,
    Ready,
    Done,
}

impl BatchStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            BatchStatus::Staged => "STAGED",
            BatchStatus::Ready => "READY",
            BatchStatus::Done => "DONE",
        }
    }
}

impl std::fmt::Display for BatchStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for BatchStatus {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "STAGED" => Ok(BatchStatus::Staged),
            "READY" => Ok(BatchStatus::Ready),
            "DONE" => Ok(BatchStatus::Done),
            _ => Err(format!("Invalid batch status: {}", s)),
        }
    }
}

/// One file's move from its content-addressed staging key to production.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransferRequest {
    /// `yy/MM/dd/<hash>` in the staging area
    pub staging_key: String,
    /// Id generated for the production path
    pub generated_id: String,
    /// File name under the generated id
    pub target_name: String,
}

impl TransferRequest {
    pub fn new(
        staging_key: impl Into<String>,
        generated_id: impl Into<String>,
        target_name: impl Into<String>,
    ) -> Self {
        Self {
            staging_key: staging_key.into(),
            generated_id: generated_id.into(),
            target_name: target_name.into(),
        }
    }

    /// `<datePath>/<generatedId>/<targetName>`, with the date path taken from the staging key.
    pub fn production_key(&self) -> Result<String> {
        super::keys::StagingKey::parse(&self.staging_key)?
            .production_key(&self.generated_id, &self.target_name)
    }
}

/// Ordered key/value annotation on a file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tag {
    pub key: String,
    pub value: String,
}

/// Downstream metadata for one file. Forwarded as-is, never inspected.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileMetadata {
    pub filename: String,
    #[serde(default)]
    pub batch_id: BatchId,
    #[serde(default)]
    pub size: u64,
    #[serde(default)]
    pub tags: Vec<Tag>,
}

impl FileMetadata {
    pub fn new(filename: impl Into<String>, batch_id: BatchId, size: u64) -> Self {
        Self {
            filename: filename.into(),
            batch_id,
            size,
            tags: Vec::new(),
        }
    }

    pub fn with_tag(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.tags.push(Tag {
            key: key.into(),
            value: value.into(),
        });
        self
    }
}

/// Everything populated atomically with the transition into READY.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchContents {
    pub transfer_requests: Vec<TransferRequest>,
    pub metadata_a: Vec<FileMetadata>,
    pub metadata_b: Vec<FileMetadata>,
}

/// Marker trait for valid batch states.
pub trait BatchState: Send + Sync {}

/// A batch in state `T`.
#[derive(Debug, Clone, PartialEq)]
pub struct Batch<T: BatchState> {
    /// The current state of the batch.
    pub state: T,
    /// Immutable batch data.
    pub data: BatchData,
}

/// Data fixed at creation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchData {
    pub id: BatchId,
    pub created_at: DateTime<Utc>,
    /// Name of the submitting user, if the producer recorded one
    pub submitted_by: Option<String>,
    /// Slot held by the producing instance, if it held one
    pub slot_id: Option<SlotId>,
}

// ============================================================================
// Batch States
// ============================================================================

/// Files are being staged; nothing to move yet.
#[derive(Debug, Clone, PartialEq)]
pub struct Staged {}

impl BatchState for Staged {}

/// Fully staged and announced; waiting for the worker.
#[derive(Debug, Clone, PartialEq)]
pub struct Ready {
    pub ready_at: DateTime<Utc>,
    pub contents: BatchContents,
}

impl BatchState for Ready {}

/// Committed. Terminal and absorbing.
#[derive(Debug, Clone, PartialEq)]
pub struct Done {
    pub ready_at: DateTime<Utc>,
    pub done_at: DateTime<Utc>,
    pub contents: BatchContents,
}

impl BatchState for Done {}

// ============================================================================
// Unified Batch Representation
// ============================================================================

/// A batch in any state, as loaded from storage.
#[derive(Debug, Clone, PartialEq)]
pub enum AnyBatch {
    Staged(Batch<Staged>),
    Ready(Batch<Ready>),
    Done(Batch<Done>),
}

impl AnyBatch {
    pub fn id(&self) -> &BatchId {
        &self.data().id
    }

    pub fn data(&self) -> &BatchData {
        match self {
            AnyBatch::Staged(b) => &b.data,
            AnyBatch::Ready(b) => &b.data,
            AnyBatch::Done(b) => &b.data,
        }
    }

    pub fn status(&self) -> BatchStatus {
        match self {
            AnyBatch::Staged(_) => BatchStatus::Staged,
            AnyBatch::Ready(_) => BatchStatus::Ready,
            AnyBatch::Done(_) => BatchStatus::Done,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, AnyBatch::Done(_))
    }
}

impl From<Batch<Staged>> for AnyBatch {
    fn from(b: Batch<Staged>) -> Self {
        AnyBatch::Staged(b)
    }
}

impl From<Batch<Ready>> for AnyBatch {
    fn from(b: Batch<Ready>) -> Self {
        AnyBatch::Ready(b)
    }
}

impl From<Batch<Done>> for AnyBatch {
    fn from(b: Batch<Done>) -> Self {
        AnyBatch::Done(b)
    }
}

// ============================================================================
// Wire / document shape
// ============================================================================

/// Flat record shape shared by the document store and the ready-event payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchRecord {
    pub id: BatchId,
    pub status: BatchStatus,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ready_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub done_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub submitted_by: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub slot_id: Option<SlotId>,
    #[serde(default)]
    pub transfer_requests: Vec<TransferRequest>,
    #[serde(default)]
    pub metadata_group_a: Vec<FileMetadata>,
    #[serde(default)]
    pub metadata_group_b: Vec<FileMetadata>,
}

impl From<&AnyBatch> for BatchRecord {
    fn from(batch: &AnyBatch) -> Self {
        let data = batch.data().clone();
        let (ready_at, done_at, contents) = match batch {
            AnyBatch::Staged(_) => (None, None, BatchContents::default()),
            AnyBatch::Ready(b) => (Some(b.state.ready_at), None, b.state.contents.clone()),
            AnyBatch::Done(b) => (
                Some(b.state.ready_at),
                Some(b.state.done_at),
                b.state.contents.clone(),
            ),
        };
        BatchRecord {
            id: data.id,
            status: batch.status(),
            created_at: data.created_at,
            ready_at,
            done_at,
            submitted_by: data.submitted_by,
            slot_id: data.slot_id,
            transfer_requests: contents.transfer_requests,
            metadata_group_a: contents.metadata_a,
            metadata_group_b: contents.metadata_b,
        }
    }
}

impl From<&Batch<Ready>> for BatchRecord {
    fn from(batch: &Batch<Ready>) -> Self {
        BatchRecord::from(&AnyBatch::Ready(batch.clone()))
    }
}

impl TryFrom<BatchRecord> for AnyBatch {
    type Error = FerryError;

    fn try_from(record: BatchRecord) -> Result<Self> {
        let data = BatchData {
            id: record.id,
            created_at: record.created_at,
            submitted_by: record.submitted_by,
            slot_id: record.slot_id,
        };
        let contents = BatchContents {
            transfer_requests: record.transfer_requests,
            metadata_a: record.metadata_group_a,
            metadata_b: record.metadata_group_b,
        };
        let missing = |field: &str| {
            FerryError::InvalidState(
                data.id.clone(),
                format!("{} without {}", record.status, field),
                "complete record".to_string(),
            )
        };

        match record.status {
            BatchStatus::Staged => {
                if contents != BatchContents::default() {
                    return Err(FerryError::InvalidState(
                        data.id,
                        "STAGED with populated contents".to_string(),
                        "empty contents before READY".to_string(),
                    ));
                }
                Ok(AnyBatch::Staged(Batch {
                    state: Staged {},
                    data,
                }))
            }
            BatchStatus::Ready => {
                let ready_at = record.ready_at.ok_or_else(|| missing("readyAt"))?;
                Ok(AnyBatch::Ready(Batch {
                    state: Ready { ready_at, contents },
                    data,
                }))
            }
            BatchStatus::Done => {
                let ready_at = record.ready_at.ok_or_else(|| missing("readyAt"))?;
                let done_at = record.done_at.ok_or_else(|| missing("doneAt"))?;
                Ok(AnyBatch::Done(Batch {
                    state: Done {
                        ready_at,
                        done_at,
                        contents,
                    },
                    data,
                }))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ready_record() -> BatchRecord {
        BatchRecord {
            id: BatchId::from("B1"),
            status: BatchStatus::Ready,
            created_at: Utc::now(),
            ready_at: Some(Utc::now()),
            done_at: None,
            submitted_by: Some("alice".to_string()),
            slot_id: Some(SlotId(3)),
            transfer_requests: vec![TransferRequest::new("24/05/01/hash1", "u1", "a.txt")],
            metadata_group_a: vec![FileMetadata::new("a.txt", BatchId::from("B1"), 12)],
            metadata_group_b: vec![],
        }
    }

    #[test]
    fn test_status_order_is_monotonic_lifecycle() {
        assert!(BatchStatus::Staged < BatchStatus::Ready);
        assert!(BatchStatus::Ready < BatchStatus::Done);
        assert_eq!("DONE".parse::<BatchStatus>().unwrap(), BatchStatus::Done);
        assert!("done".parse::<BatchStatus>().is_err());
    }

    #[test]
    fn test_record_uses_camel_case_wire_names() {
        let json = serde_json::to_value(ready_record()).unwrap();
        assert_eq!(json["status"], "READY");
        assert_eq!(json["transferRequests"][0]["stagingKey"], "24/05/01/hash1");
        assert_eq!(json["metadataGroupA"][0]["batchId"], "B1");
        assert!(json.get("doneAt").is_none());
    }

    #[test]
    fn test_ready_record_without_ready_at_is_rejected() {
        let mut record = ready_record();
        record.ready_at = None;
        let err = AnyBatch::try_from(record).unwrap_err();
        assert!(matches!(err, FerryError::InvalidState(..)));
    }

    #[test]
    fn test_staged_record_with_contents_is_rejected() {
        let mut record = ready_record();
        record.status = BatchStatus::Staged;
        record.ready_at = None;
        assert!(AnyBatch::try_from(record).is_err());
    }

    #[test]
    fn test_ready_record_converts_to_typed_batch() {
        let batch = AnyBatch::try_from(ready_record()).unwrap();
        assert_eq!(batch.status(), BatchStatus::Ready);
        assert_eq!(batch.data().slot_id, Some(SlotId(3)));
        match batch {
            AnyBatch::Ready(b) => assert_eq!(b.state.contents.transfer_requests.len(), 1),
            other => panic!("Expected Ready, got {:?}", other.status()),
        }
    }

    #[test]
    fn test_transfer_request_production_key() {
        let req = TransferRequest::new("24/05/01/hash1", "u1", "a.txt");
        assert_eq!(req.production_key().unwrap(), "24/05/01/u1/a.txt");
    }

    #[test]
    fn test_metadata_without_batch_id_still_decodes() {
        let item: FileMetadata = serde_json::from_str(r#"{"filename":"a.txt"}"#).unwrap();
        assert_eq!(item.filename, "a.txt");
        assert_eq!(item.batch_id, BatchId::default());
        assert!(item.tags.is_empty());
    }
}
